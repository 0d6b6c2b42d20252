//! ioctl surface shared with the hypervisor service module. Layouts must
//! match the kernel ABI bit for bit; every struct is `#[repr(C)]` with
//! explicit widths.

use vmm_sys_util::{ioctl_io_nr, ioctl_iow_nr, ioctl_iowr_nr};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The ioctl type, documented in ioctl-number.rst.
pub const ACRN_IOCTL_TYPE: u32 = 0xA2;

pub const MAX_VM_NAME_LEN: usize = 32;

/* Generic VM flags from the guest OS */
pub const GUEST_FLAG_SECURE_WORLD_ENABLED: u64 = 1 << 0;
pub const GUEST_FLAG_LAPIC_PASSTHROUGH: u64 = 1 << 1;
pub const GUEST_FLAG_IO_COMPLETION_POLLING: u64 = 1 << 2;
pub const GUEST_FLAG_RT: u64 = 1 << 4;
pub const GUEST_FLAG_PMU_PASSTHROUGH: u64 = 1 << 11;

pub const ACRN_MEM_ACCESS_READ: u32 = 0x0000_0001;
pub const ACRN_MEM_ACCESS_WRITE: u32 = 0x0000_0002;
pub const ACRN_MEM_ACCESS_EXEC: u32 = 0x0000_0004;
pub const ACRN_MEM_ACCESS_RWX: u32 =
    ACRN_MEM_ACCESS_READ | ACRN_MEM_ACCESS_WRITE | ACRN_MEM_ACCESS_EXEC;

/* Memory mapping types */
pub const ACRN_MEMMAP_RAM: u32 = 0;
pub const ACRN_MEMMAP_MMIO: u32 = 1;

/* Operation types for setting an IRQ line */
pub const GSI_SET_HIGH: u32 = 0;
pub const GSI_SET_LOW: u32 = 1;
pub const GSI_RAISING_PULSE: u32 = 2;
pub const GSI_FALLING_PULSE: u32 = 3;

/* Type of interrupt of a passthrough device */
pub const ACRN_PTDEV_IRQ_INTX: u32 = 0;
pub const ACRN_PTDEV_IRQ_MSI: u32 = 1;
pub const ACRN_PTDEV_IRQ_MSIX: u32 = 2;

pub const ACRN_IOEVENTFD_FLAG_PIO: u32 = 0x01;
pub const ACRN_IOEVENTFD_FLAG_DATAMATCH: u32 = 0x02;
pub const ACRN_IOEVENTFD_FLAG_DEASSIGN: u32 = 0x04;
pub const ACRN_IOEVENTFD_FLAG_ASYNCIO: u32 = 0x08;

pub const ACRN_IRQFD_FLAG_DEASSIGN: u32 = 0x01;

pub const ACRN_PLATFORM_LAPIC_IDS_MAX: usize = 64;

/// Info to create a VM.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnVmCreation {
    /// created vmid returned by the hypervisor, keep it the first field
    pub vmid: u16,
    pub reserved0: u16,
    /// number of vCPUs the hypervisor created, returned
    pub vcpu_num: u16,
    pub reserved1: u16,
    pub uuid: [u8; 16],
    pub vm_flag: u64,
    /// service VM virtual address of the I/O request buffer page
    pub ioreq_buf: u64,
    /// DM override of the static CPU affinity, must be a subset
    pub cpu_affinity: u64,
    pub name: [u8; MAX_VM_NAME_LEN],
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnGpRegs {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnDescriptorPtr {
    pub limit: u16,
    pub base: u64,
    pub reserved: [u16; 3],
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct AcrnRegs {
    pub gprs: AcrnGpRegs,
    pub gdt: AcrnDescriptorPtr,
    pub idt: AcrnDescriptorPtr,

    pub rip: u64,
    pub cs_base: u64,
    pub cr0: u64,
    pub cr4: u64,
    pub cr3: u64,
    pub ia32_efer: u64,
    pub rflags: u64,
    pub reserved_64: [u64; 4],

    pub cs_ar: u32,
    pub cs_limit: u32,
    pub reserved_32: [u32; 3],

    /* don't change the order of the following selectors */
    pub cs_sel: u16,
    pub ss_sel: u16,
    pub ds_sel: u16,
    pub es_sel: u16,
    pub fs_sel: u16,
    pub gs_sel: u16,
    pub ldt_sel: u16,
    pub tr_sel: u16,

    pub reserved_16: [u16; 4],
}

/// Register-init block applied to the BSP before first run.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct AcrnVcpuRegs {
    pub vcpu_id: u16,
    pub reserved0: [u16; 3],
    pub vcpu_regs: AcrnRegs,
}

/// EPT memory mapping info for the guest.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnVmMemmap {
    pub type_: u32,
    pub attr: u32,
    /// user VM guest-physical start address of the mapping
    pub user_vm_pa: u64,
    /// host physical address (MMIO) or service VM virtual address (RAM)
    pub vma_or_service_vm_pa: u64,
    pub len: u64,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnMsiEntry {
    /// MSI addr[19:12] with dest vCPU id
    pub msi_addr: u64,
    /// MSI data[7:0] with vector
    pub msi_data: u64,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnIrqlineOps {
    pub nr_gsi: u32,
    pub op: u32,
}

impl AcrnIrqlineOps {
    /// The kernel takes this struct by value in a u64.
    pub fn into_u64(self) -> u64 {
        (self.op as u64) << 32 | self.nr_gsi as u64
    }
}

/// Notify the hypervisor that an I/O request is handled.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnIoreqNotify {
    /// VM id to identify the ioreq client
    pub vmid: u16,
    pub reserved: u16,
    /// the vCPU that submitted the request
    pub vcpu: u32,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnPtdevIrqIntx {
    pub virt_pin: u32,
    pub phys_pin: u32,
    pub is_pic_pin: u32,
}

/// Passthrough device IRQ data.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnPtdevIrq {
    pub type_: u32,
    pub virt_bdf: u16,
    pub phys_bdf: u16,
    pub intx: AcrnPtdevIrqIntx,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnPcidev {
    pub type_: u32,
    pub virt_bdf: u16,
    pub phys_bdf: u16,
    pub intr_line: u32,
    pub intr_pin: u32,
    pub bar: [u32; 6],
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnMmiores {
    pub user_vm_pa: u64,
    pub host_pa: u64,
    pub size: u64,
    pub mem_type: u64,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnMmiodev {
    pub name: [u8; 8],
    pub res: [AcrnMmiores; 3],
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnVdev {
    /// composite id: vendor/device or a legacy id
    pub id: u64,
    pub slot: u64,
    pub io_addr: [u32; 6],
    pub io_size: [u32; 6],
    pub args: [u8; 128],
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnIoeventfd {
    pub fd: i32,
    pub flags: u32,
    pub addr: u64,
    pub len: u32,
    pub reserved: u32,
    pub data: u64,
}

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AcrnIrqfd {
    pub fd: i32,
    pub flags: u32,
    pub msi: AcrnMsiEntry,
}

pub const INTR_CMD_GET_DATA: u32 = 0;
pub const INTR_CMD_DELAY_INT: u32 = 1;
pub const MAX_PTDEV_NUM: usize = 24;

/// Buffer for the passthrough interrupt monitor.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, Immutable, KnownLayout)]
pub struct AcrnIntrMonitor {
    pub cmd: u32,
    pub buf_cnt: u32,
    pub buffer: [u64; MAX_PTDEV_NUM * 2],
}

ioctl_iowr_nr!(ACRN_IOCTL_CREATE_VM, ACRN_IOCTL_TYPE, 0x10, AcrnVmCreation);
ioctl_io_nr!(ACRN_IOCTL_DESTROY_VM, ACRN_IOCTL_TYPE, 0x11);
ioctl_io_nr!(ACRN_IOCTL_START_VM, ACRN_IOCTL_TYPE, 0x12);
ioctl_io_nr!(ACRN_IOCTL_PAUSE_VM, ACRN_IOCTL_TYPE, 0x13);
ioctl_io_nr!(ACRN_IOCTL_RESET_VM, ACRN_IOCTL_TYPE, 0x15);
ioctl_iow_nr!(ACRN_IOCTL_SET_VCPU_REGS, ACRN_IOCTL_TYPE, 0x16, AcrnVcpuRegs);

ioctl_iow_nr!(ACRN_IOCTL_INJECT_MSI, ACRN_IOCTL_TYPE, 0x23, AcrnMsiEntry);
ioctl_iow_nr!(ACRN_IOCTL_VM_INTR_MONITOR, ACRN_IOCTL_TYPE, 0x24, u64);
ioctl_iow_nr!(ACRN_IOCTL_SET_IRQLINE, ACRN_IOCTL_TYPE, 0x25, u64);

ioctl_iow_nr!(
    ACRN_IOCTL_NOTIFY_REQUEST_FINISH,
    ACRN_IOCTL_TYPE,
    0x31,
    AcrnIoreqNotify
);
ioctl_io_nr!(ACRN_IOCTL_CREATE_IOREQ_CLIENT, ACRN_IOCTL_TYPE, 0x32);
ioctl_io_nr!(ACRN_IOCTL_ATTACH_IOREQ_CLIENT, ACRN_IOCTL_TYPE, 0x33);
ioctl_io_nr!(ACRN_IOCTL_DESTROY_IOREQ_CLIENT, ACRN_IOCTL_TYPE, 0x34);
ioctl_io_nr!(ACRN_IOCTL_CLEAR_VM_IOREQ, ACRN_IOCTL_TYPE, 0x35);

ioctl_iow_nr!(ACRN_IOCTL_SET_MEMSEG, ACRN_IOCTL_TYPE, 0x41, AcrnVmMemmap);
ioctl_iow_nr!(ACRN_IOCTL_UNSET_MEMSEG, ACRN_IOCTL_TYPE, 0x42, AcrnVmMemmap);

ioctl_iow_nr!(ACRN_IOCTL_SET_PTDEV_INTR, ACRN_IOCTL_TYPE, 0x53, AcrnPtdevIrq);
ioctl_iow_nr!(ACRN_IOCTL_RESET_PTDEV_INTR, ACRN_IOCTL_TYPE, 0x54, AcrnPtdevIrq);
ioctl_iow_nr!(ACRN_IOCTL_ASSIGN_PCIDEV, ACRN_IOCTL_TYPE, 0x55, AcrnPcidev);
ioctl_iow_nr!(ACRN_IOCTL_DEASSIGN_PCIDEV, ACRN_IOCTL_TYPE, 0x56, AcrnPcidev);
ioctl_iow_nr!(ACRN_IOCTL_ASSIGN_MMIODEV, ACRN_IOCTL_TYPE, 0x57, AcrnMmiodev);
ioctl_iow_nr!(ACRN_IOCTL_DEASSIGN_MMIODEV, ACRN_IOCTL_TYPE, 0x58, AcrnMmiodev);
ioctl_iow_nr!(ACRN_IOCTL_CREATE_VDEV, ACRN_IOCTL_TYPE, 0x59, AcrnVdev);
ioctl_iow_nr!(ACRN_IOCTL_DESTROY_VDEV, ACRN_IOCTL_TYPE, 0x5A, AcrnVdev);

ioctl_iowr_nr!(ACRN_IOCTL_PM_GET_CPU_STATE, ACRN_IOCTL_TYPE, 0x60, u64);

ioctl_iow_nr!(ACRN_IOCTL_IOEVENTFD, ACRN_IOCTL_TYPE, 0x70, AcrnIoeventfd);
ioctl_iow_nr!(ACRN_IOCTL_IRQFD, ACRN_IOCTL_TYPE, 0x71, AcrnIrqfd);

ioctl_iow_nr!(ACRN_IOCTL_SETUP_ASYNCIO, ACRN_IOCTL_TYPE, 0x90, u64);
ioctl_iow_nr!(ACRN_IOCTL_SETUP_VM_EVENT_RING, ACRN_IOCTL_TYPE, 0x91, u64);
ioctl_iow_nr!(ACRN_IOCTL_SETUP_VM_EVENT_FD, ACRN_IOCTL_TYPE, 0x92, i32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_struct_sizes() {
        assert_eq!(std::mem::size_of::<AcrnGpRegs>(), 128);
        assert_eq!(std::mem::size_of::<AcrnDescriptorPtr>(), 16);
        assert_eq!(std::mem::size_of::<AcrnVmMemmap>(), 32);
        assert_eq!(std::mem::size_of::<AcrnMsiEntry>(), 16);
        assert_eq!(std::mem::size_of::<AcrnIoreqNotify>(), 8);
        assert_eq!(std::mem::size_of::<AcrnPtdevIrq>(), 20);
        assert_eq!(std::mem::size_of::<AcrnIoeventfd>(), 32);
        assert_eq!(std::mem::size_of::<AcrnIrqfd>(), 24);
    }

    #[test]
    fn irqline_ops_packing() {
        let ops = AcrnIrqlineOps {
            nr_gsi: 2,
            op: GSI_RAISING_PULSE,
        };
        assert_eq!(ops.into_u64(), (2u64) | (2u64 << 32));
    }
}
