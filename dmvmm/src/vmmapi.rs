//! Thin, typed wrappers over the hypervisor ioctl surface plus the per-VM
//! context that owns guest memory.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, error, info};
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref, ioctl_with_val};
use zerocopy::FromZeros;

use crate::hugetlb::{self, GuestMem, MemRegion};
use crate::ioctl_defs::*;
use crate::pm::{self, VmSuspendMode};
use crate::{MB, HIGHRAM_START_ADDR, PCI_EMUL_MEMBASE32};

const VHM_NODE: &str = "/dev/acrn_vhm";
const HSM_NODE: &str = "/dev/acrn_hsm";

const CREATE_VM_RETRIES: u32 = 10;
const CREATE_VM_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum VmmError {
    #[error("undefined operation")]
    OperationNotDefined,
    #[error("obsoleted operation")]
    OperationObsolete,
    #[error("could not open {VHM_NODE}")]
    NoDeviceNode,
    #[error("failed to create VM {0}")]
    CreateVm(String),
    #[error("guest memory is not set up")]
    NoGuestMemory,
    #[error("memory size invalid")]
    BadMemsize,
    #[error(transparent)]
    Hugetlb(#[from] hugetlb::HugetlbError),
    #[error("{0}")]
    Sys(std::io::Error),
}

pub type Result<T> = std::result::Result<T, VmmError>;

fn last_ioctl_error() -> VmmError {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOTTY) => VmmError::OperationNotDefined,
        Some(libc::ENOSYS) => VmmError::OperationObsolete,
        _ => VmmError::Sys(err),
    }
}

/// Options applied at CREATE_VM time, mostly mirroring command-line flags.
#[derive(Clone, Default)]
pub struct VmCreateOpts {
    pub uuid: [u8; 16],
    pub trusty_enabled: bool,
    pub lapic_pt: bool,
    pub is_rtvm: bool,
    pub cpu_affinity: u64,
}

pub struct VmCtx {
    fd: File,
    vmid: u16,
    vcpu_num: u16,
    name: String,
    pub ioreq_client: Mutex<i32>,
    pub lowmem_limit: u32,
    pub highmem_gpa_base: u64,
    pub lowmem: u64,
    pub biosmem: u64,
    pub fbmem: u64,
    pub highmem: u64,
    pub is_rtvm: bool,
    mem: Mutex<Option<GuestMem>>,
}

impl VmCtx {
    /// Open the hypervisor device node (either ABI alias) and create the VM.
    /// CREATE_VM is retried with a bounded back-off; the hypervisor may still
    /// be tearing down a previous incarnation.
    pub fn create(name: &str, ioreq_buf: u64, opts: &VmCreateOpts) -> Result<VmCtx> {
        let node = if Path::new(VHM_NODE).exists() {
            VHM_NODE
        } else if Path::new(HSM_NODE).exists() {
            HSM_NODE
        } else {
            return Err(VmmError::NoDeviceNode);
        };
        let fd = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(node)
            .map_err(|_| VmmError::NoDeviceNode)?;

        let mut create_vm = AcrnVmCreation::new_zeroed();
        create_vm.uuid = opts.uuid;
        if opts.trusty_enabled {
            create_vm.vm_flag |= GUEST_FLAG_SECURE_WORLD_ENABLED;
        }
        if opts.lapic_pt {
            create_vm.vm_flag |= GUEST_FLAG_LAPIC_PASSTHROUGH
                | GUEST_FLAG_RT
                | GUEST_FLAG_IO_COMPLETION_POLLING
                | GUEST_FLAG_PMU_PASSTHROUGH;
        }
        if opts.is_rtvm {
            create_vm.vm_flag |= GUEST_FLAG_RT | GUEST_FLAG_IO_COMPLETION_POLLING;
        }
        create_vm.cpu_affinity = opts.cpu_affinity;
        create_vm.ioreq_buf = ioreq_buf;
        let name_bytes = name.as_bytes();
        let n = name_bytes.len().min(MAX_VM_NAME_LEN - 1);
        create_vm.name[..n].copy_from_slice(&name_bytes[..n]);

        let mut error = 0;
        for retry in 0..CREATE_VM_RETRIES {
            // SAFETY: fd is the hypervisor node, create_vm matches the ioctl.
            error = unsafe { ioctl_with_mut_ref(&fd, ACRN_IOCTL_CREATE_VM(), &mut create_vm) };
            if error == 0 {
                break;
            }
            if retry + 1 < CREATE_VM_RETRIES {
                std::thread::sleep(CREATE_VM_BACKOFF);
            }
        }
        if error != 0 {
            error!("failed to create VM {}, {}", name, last_ioctl_error());
            return Err(VmmError::CreateVm(name.to_string()));
        }

        Ok(VmCtx {
            fd,
            vmid: create_vm.vmid,
            vcpu_num: create_vm.vcpu_num,
            name: name.to_string(),
            ioreq_client: Mutex::new(-1),
            lowmem_limit: PCI_EMUL_MEMBASE32,
            highmem_gpa_base: HIGHRAM_START_ADDR,
            lowmem: 0,
            biosmem: 0,
            fbmem: 0,
            highmem: 0,
            is_rtvm: opts.is_rtvm,
            mem: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vmid(&self) -> u16 {
        self.vmid
    }

    pub fn vcpu_num(&self) -> u16 {
        self.vcpu_num
    }

    fn plain_ioctl(&self, req: libc::c_ulong, what: &str) -> Result<()> {
        // SAFETY: argument-less hypervisor request on our own fd.
        let error = unsafe { ioctl(&self.fd, req) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("{} ioctl() returned an error: {}", what, e);
            return Err(e);
        }
        Ok(())
    }

    pub fn create_ioreq_client(&self) -> Result<i32> {
        // SAFETY: argument-less request returning the client id.
        let client = unsafe { ioctl(&self.fd, ACRN_IOCTL_CREATE_IOREQ_CLIENT()) };
        if client < 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_CREATE_IOREQ_CLIENT ioctl() returned an error: {e}");
            return Err(e);
        }
        *self.ioreq_client.lock().unwrap() = client;
        Ok(client)
    }

    pub fn destroy_ioreq_client(&self) -> Result<()> {
        let client = *self.ioreq_client.lock().unwrap();
        // SAFETY: passes the client id by value.
        let error = unsafe { ioctl_with_val(&self.fd, ACRN_IOCTL_DESTROY_IOREQ_CLIENT(), client as libc::c_ulong) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_DESTROY_IOREQ_CLIENT ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    /// Blocks in the hypervisor until requests are pending for this client.
    pub fn attach_ioreq_client(&self) -> Result<()> {
        let client = *self.ioreq_client.lock().unwrap();
        // SAFETY: passes the client id by value; blocks until work arrives.
        let error = unsafe { ioctl_with_val(&self.fd, ACRN_IOCTL_ATTACH_IOREQ_CLIENT(), client as libc::c_ulong) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_ATTACH_IOREQ_CLIENT ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn notify_request_done(&self, vcpu: u32) -> Result<()> {
        let notify = AcrnIoreqNotify {
            vmid: self.vmid,
            reserved: 0,
            vcpu,
        };
        // SAFETY: notify matches the ioctl layout.
        let error =
            unsafe { ioctl_with_ref(&self.fd, ACRN_IOCTL_NOTIFY_REQUEST_FINISH(), &notify) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_NOTIFY_REQUEST_FINISH ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn clear_ioreq(&self) -> Result<()> {
        self.plain_ioctl(ACRN_IOCTL_CLEAR_VM_IOREQ(), "ACRN_IOCTL_CLEAR_VM_IOREQ")
    }

    pub fn run(&self) -> Result<()> {
        let vmid = self.vmid as i32;
        // SAFETY: the start request takes the vm id by reference.
        let error = unsafe { ioctl_with_ref(&self.fd, ACRN_IOCTL_START_VM(), &vmid) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_START_VM ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn pause(&self) {
        let vmid = self.vmid as i32;
        // SAFETY: as in run().
        if unsafe { ioctl_with_ref(&self.fd, ACRN_IOCTL_PAUSE_VM(), &vmid) } != 0 {
            error!(
                "ACRN_IOCTL_PAUSE_VM ioctl() returned an error: {}",
                last_ioctl_error()
            );
        }
    }

    pub fn reset(&self) {
        let vmid = self.vmid as i32;
        // SAFETY: as in run().
        if unsafe { ioctl_with_ref(&self.fd, ACRN_IOCTL_RESET_VM(), &vmid) } != 0 {
            error!(
                "ACRN_IOCTL_RESET_VM ioctl() returned an error: {}",
                last_ioctl_error()
            );
        }
    }

    pub fn set_vcpu_regs(&self, regs: &AcrnVcpuRegs) -> Result<()> {
        // SAFETY: regs matches the ioctl layout.
        let error = unsafe { ioctl_with_ref(&self.fd, ACRN_IOCTL_SET_VCPU_REGS(), regs) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_SET_VCPU_REGS ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn lapic_msi(&self, addr: u64, msg: u64) -> Result<()> {
        let msi = AcrnMsiEntry {
            msi_addr: addr,
            msi_data: msg,
        };
        // SAFETY: msi matches the ioctl layout.
        let error = unsafe { ioctl_with_ref(&self.fd, ACRN_IOCTL_INJECT_MSI(), &msi) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_INJECT_MSI ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn set_gsi_irq(&self, gsi: u32, operation: u32) -> Result<()> {
        let ops = AcrnIrqlineOps {
            nr_gsi: gsi,
            op: operation,
        };
        // SAFETY: the irqline request takes the packed ops word by value.
        let error = unsafe {
            ioctl_with_val(&self.fd, ACRN_IOCTL_SET_IRQLINE(), ops.into_u64() as libc::c_ulong)
        };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_SET_IRQLINE ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn assign_pcidev(&self, dev: &AcrnPcidev) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_ASSIGN_PCIDEV(), dev, "ACRN_IOCTL_ASSIGN_PCIDEV")
    }

    pub fn deassign_pcidev(&self, dev: &AcrnPcidev) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_DEASSIGN_PCIDEV(), dev, "ACRN_IOCTL_DEASSIGN_PCIDEV")
    }

    pub fn assign_mmiodev(&self, dev: &AcrnMmiodev) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_ASSIGN_MMIODEV(), dev, "ACRN_IOCTL_ASSIGN_MMIODEV")
    }

    pub fn deassign_mmiodev(&self, dev: &AcrnMmiodev) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_DEASSIGN_MMIODEV(), dev, "ACRN_IOCTL_DEASSIGN_MMIODEV")
    }

    pub fn add_hv_vdev(&self, dev: &AcrnVdev) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_CREATE_VDEV(), dev, "ACRN_IOCTL_CREATE_VDEV")
    }

    pub fn remove_hv_vdev(&self, dev: &AcrnVdev) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_DESTROY_VDEV(), dev, "ACRN_IOCTL_DESTROY_VDEV")
    }

    pub fn set_ptdev_intx_info(
        &self,
        virt_bdf: u16,
        phys_bdf: u16,
        virt_pin: u32,
        phys_pin: u32,
        pic_pin: bool,
    ) -> Result<()> {
        let ptirq = AcrnPtdevIrq {
            type_: ACRN_PTDEV_IRQ_INTX,
            virt_bdf,
            phys_bdf,
            intx: AcrnPtdevIrqIntx {
                virt_pin,
                phys_pin,
                is_pic_pin: pic_pin as u32,
            },
        };
        self.ref_ioctl(ACRN_IOCTL_SET_PTDEV_INTR(), &ptirq, "ACRN_IOCTL_SET_PTDEV_INTR")
    }

    pub fn reset_ptdev_intx_info(
        &self,
        virt_bdf: u16,
        phys_bdf: u16,
        virt_pin: u32,
        pic_pin: bool,
    ) -> Result<()> {
        let ptirq = AcrnPtdevIrq {
            type_: ACRN_PTDEV_IRQ_INTX,
            virt_bdf,
            phys_bdf,
            intx: AcrnPtdevIrqIntx {
                virt_pin,
                phys_pin: 0,
                is_pic_pin: pic_pin as u32,
            },
        };
        self.ref_ioctl(
            ACRN_IOCTL_RESET_PTDEV_INTR(),
            &ptirq,
            "ACRN_IOCTL_RESET_PTDEV_INTR",
        )
    }

    pub fn intr_monitor(&self, buf: &mut AcrnIntrMonitor) -> Result<()> {
        // SAFETY: buf matches the ioctl layout and outlives the call.
        let error = unsafe {
            ioctl_with_val(
                &self.fd,
                ACRN_IOCTL_VM_INTR_MONITOR(),
                buf as *mut AcrnIntrMonitor as libc::c_ulong,
            )
        };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_VM_INTR_MONITOR ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn get_cpu_state(&self, state: &mut u64) -> Result<()> {
        // SAFETY: state matches the ioctl layout.
        let error = unsafe { ioctl_with_mut_ref(&self.fd, ACRN_IOCTL_PM_GET_CPU_STATE(), state) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("ACRN_IOCTL_PM_GET_CPU_STATE ioctl() returned an error: {e}");
            return Err(e);
        }
        Ok(())
    }

    pub fn ioeventfd(&self, args: &AcrnIoeventfd) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_IOEVENTFD(), args, "ACRN_IOCTL_IOEVENTFD")
    }

    pub fn irqfd(&self, args: &AcrnIrqfd) -> Result<()> {
        self.ref_ioctl(ACRN_IOCTL_IRQFD(), args, "ACRN_IOCTL_IRQFD")
    }

    pub fn setup_asyncio(&self, base: u64) -> Result<()> {
        self.val_ioctl(
            ACRN_IOCTL_SETUP_ASYNCIO(),
            base as libc::c_ulong,
            "ACRN_IOCTL_SETUP_ASYNCIO",
        )
    }

    /// `sbuf_addr` is the service-VM virtual address of the ring page; the
    /// hypervisor service module reads the ring header through it.
    pub fn setup_vm_event_ring(&self, sbuf_addr: u64) -> Result<()> {
        self.val_ioctl(
            ACRN_IOCTL_SETUP_VM_EVENT_RING(),
            sbuf_addr as libc::c_ulong,
            "ACRN_IOCTL_SETUP_VM_EVENT_RING",
        )
    }

    pub fn setup_vm_event_fd(&self, fd: i32) -> Result<()> {
        self.val_ioctl(
            ACRN_IOCTL_SETUP_VM_EVENT_FD(),
            fd as libc::c_ulong,
            "ACRN_IOCTL_SETUP_VM_EVENT_FD",
        )
    }

    fn val_ioctl(&self, req: libc::c_ulong, arg: libc::c_ulong, what: &str) -> Result<()> {
        // SAFETY: arg carries the value (or user pointer) the request wants.
        let error = unsafe { ioctl_with_val(&self.fd, req, arg) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("{} ioctl() returned an error: {}", what, e);
            return Err(e);
        }
        Ok(())
    }

    fn ref_ioctl<T>(&self, req: libc::c_ulong, arg: &T, what: &str) -> Result<()> {
        // SAFETY: arg matches the layout encoded into req.
        let error = unsafe { ioctl_with_ref(&self.fd, req, arg) };
        if error != 0 {
            let e = last_ioctl_error();
            error!("{} ioctl() returned an error: {}", what, e);
            return Err(e);
        }
        Ok(())
    }

    /// Install a RAM mapping from `gpa` to the service-VM address `vma`.
    pub fn map_memseg_vma(&self, len: u64, gpa: u64, vma: u64, prot: u32) -> Result<()> {
        let memmap = AcrnVmMemmap {
            type_: ACRN_MEMMAP_RAM,
            attr: prot,
            user_vm_pa: gpa,
            vma_or_service_vm_pa: vma,
            len,
        };
        self.ref_ioctl(ACRN_IOCTL_SET_MEMSEG(), &memmap, "ACRN_IOCTL_SET_MEMSEG")
    }

    pub fn map_ptdev_mmio(&self, gpa: u64, len: u64, hpa: u64) -> Result<()> {
        let memmap = AcrnVmMemmap {
            type_: ACRN_MEMMAP_MMIO,
            attr: ACRN_MEM_ACCESS_RWX,
            user_vm_pa: gpa,
            vma_or_service_vm_pa: hpa,
            len,
        };
        self.ref_ioctl(ACRN_IOCTL_SET_MEMSEG(), &memmap, "ACRN_IOCTL_SET_MEMSEG")
    }

    pub fn unmap_ptdev_mmio(&self, gpa: u64, len: u64, hpa: u64) -> Result<()> {
        let memmap = AcrnVmMemmap {
            type_: ACRN_MEMMAP_MMIO,
            attr: ACRN_MEM_ACCESS_RWX,
            user_vm_pa: gpa,
            vma_or_service_vm_pa: hpa,
            len,
        };
        self.ref_ioctl(ACRN_IOCTL_UNSET_MEMSEG(), &memmap, "ACRN_IOCTL_UNSET_MEMSEG")
    }

    /// Split `memsize` into lowmem/highmem and back the whole guest address
    /// space with huge pages.
    pub fn setup_memory(&mut self, memsize: u64, allocator: &mut hugetlb::HugetlbAllocator) -> Result<()> {
        if memsize > self.lowmem_limit as u64 {
            self.lowmem = self.lowmem_limit as u64;
            self.highmem = memsize - self.lowmem_limit as u64;
        } else {
            self.lowmem = memsize;
            self.highmem = 0;
        }
        self.fbmem = 16 * MB;

        let mem = allocator.setup_memory(
            self.lowmem,
            self.biosmem,
            self.fbmem,
            self.highmem,
            self.highmem_gpa_base,
        )?;

        // Install the EPT mappings for the RAM segments.
        self.map_memseg_vma(self.lowmem, 0, mem.base_addr(), ACRN_MEM_ACCESS_RWX)?;
        if self.biosmem > 0 {
            // The high BIOS region behaves as RAM and can be written by the
            // boot firmware itself.
            let gpa = 4 * crate::GB - self.biosmem;
            self.map_memseg_vma(self.biosmem, gpa, mem.base_addr() + gpa, ACRN_MEM_ACCESS_RWX)?;
        }
        if self.highmem > 0 {
            self.map_memseg_vma(
                self.highmem,
                self.highmem_gpa_base,
                mem.base_addr() + self.highmem_gpa_base,
                ACRN_MEM_ACCESS_RWX,
            )?;
        }

        *self.mem.lock().unwrap() = Some(mem);
        Ok(())
    }

    /// Drop the guest memory backing. Non-RT guest RAM is cleared first so a
    /// later guest cannot observe stale secrets through reused huge pages.
    pub fn unsetup_memory(&self) {
        let mut guard = self.mem.lock().unwrap();
        if let Some(mem) = guard.as_mut() {
            if !self.is_rtvm {
                mem.zero_range(0, self.lowmem);
                mem.zero_range(self.highmem_gpa_base, self.highmem);
            }
        }
        *guard = None;
    }

    /// A host pointer for [gaddr, gaddr+len) if it sits entirely inside the
    /// lowmem or highmem regions; MMIO holes return None.
    pub fn map_gpa(&self, gaddr: u64, len: u64) -> Option<*mut u8> {
        let guard = self.mem.lock().unwrap();
        let mem = guard.as_ref()?;

        if self.lowmem > 0
            && gaddr < self.lowmem
            && len <= self.lowmem
            && gaddr + len <= self.lowmem
        {
            return Some(mem.hva(gaddr));
        }
        if self.highmem > 0
            && gaddr >= self.highmem_gpa_base
            && gaddr < self.highmem_gpa_base + self.highmem
            && len <= self.highmem
            && gaddr + len <= self.highmem_gpa_base + self.highmem
        {
            return Some(mem.hva(gaddr));
        }
        debug!("vm_map_gpa: context memory is not valid");
        None
    }

    /// Copy `data` into guest memory at `gaddr`.
    pub fn write_gpa(&self, gaddr: u64, data: &[u8]) -> Result<()> {
        let ptr = self
            .map_gpa(gaddr, data.len() as u64)
            .ok_or(VmmError::NoGuestMemory)?;
        // SAFETY: map_gpa guarantees [ptr, ptr+len) is inside the live
        // guest mapping owned by this context.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
        Ok(())
    }

    /// Copy guest memory at `gaddr` into `data`.
    pub fn read_gpa(&self, gaddr: u64, data: &mut [u8]) -> Result<()> {
        let ptr = self
            .map_gpa(gaddr, data.len() as u64)
            .ok_or(VmmError::NoGuestMemory)?;
        // SAFETY: as in write_gpa.
        unsafe { std::ptr::copy_nonoverlapping(ptr, data.as_mut_ptr(), data.len()) };
        Ok(())
    }

    pub fn find_memfd_region(&self, gpa: u64) -> Option<MemRegion> {
        self.mem.lock().unwrap().as_ref()?.find_region(gpa)
    }

    pub fn allow_dmabuf(&self) -> bool {
        self.mem
            .lock()
            .unwrap()
            .as_ref()
            .map(|m| m.allow_dmabuf(self.lowmem, self.highmem))
            .unwrap_or(false)
    }

    /// Set the suspend mode and kick the event loop so it can observe it.
    pub fn suspend(&self, how: VmSuspendMode, mevent: &dmevent::Mevent) {
        info!("vm_suspend: setting VM state to {}", how.as_str());
        pm::vm_set_suspend_mode(how);
        let _ = mevent.notify();
    }

    pub fn destroy(&self) {
        // SAFETY: argument-less request.
        if unsafe { ioctl(&self.fd, ACRN_IOCTL_DESTROY_VM()) } != 0 {
            error!(
                "ACRN_IOCTL_DESTROY_VM ioctl() returned an error: {}",
                last_ioctl_error()
            );
        }
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }
}

/// Parse a memory size argument with an optional b/k/m/g suffix.
/// Guest RAM below 128 MiB is rejected.
pub fn vm_parse_memsize(arg: &str) -> Result<u64> {
    let arg = arg.trim();
    let (digits, shift) = match arg.char_indices().last() {
        Some((i, c)) if c.eq_ignore_ascii_case(&'g') => (&arg[..i], 30),
        Some((i, c)) if c.eq_ignore_ascii_case(&'m') => (&arg[..i], 20),
        Some((i, c)) if c.eq_ignore_ascii_case(&'k') => (&arg[..i], 10),
        Some((i, c)) if c.eq_ignore_ascii_case(&'b') => (&arg[..i], 0),
        Some(_) => (arg, 0),
        None => return Err(VmmError::BadMemsize),
    };
    let val: u64 = digits.parse().map_err(|_| VmmError::BadMemsize)?;
    let val = val << shift;
    if val < 128 * MB {
        return Err(VmmError::BadMemsize);
    }
    Ok(val)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memsize_suffixes() {
        assert_eq!(vm_parse_memsize("2048m").unwrap(), 2048 * MB);
        assert_eq!(vm_parse_memsize("2G").unwrap(), 2048 * MB);
        assert_eq!(vm_parse_memsize("134217728").unwrap(), 128 * MB);
        assert_eq!(vm_parse_memsize("131072k").unwrap(), 128 * MB);
    }

    #[test]
    fn memsize_lower_bound_and_garbage() {
        assert!(vm_parse_memsize("64m").is_err());
        assert!(vm_parse_memsize("").is_err());
        assert!(vm_parse_memsize("12x").is_err());
        assert!(vm_parse_memsize("m").is_err());
    }
}
