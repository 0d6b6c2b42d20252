//! The ioreq dispatch loop: block in the hypervisor until requests are
//! pending, decode each PROCESSING slot assigned to our client, route it
//! through the port/memory buses and publish the completion.

use std::cell::UnsafeCell;
use std::sync::Arc;

use log::{debug, error, info, warn};

use dmvmm::inout::PioBus;
use dmvmm::ioreq::{
    VhmRequest, VhmRequestBuffer, REQUEST_READ, REQ_MMIO, REQ_PCICFG, REQ_PORTIO,
    REQ_STATE_COMPLETE, REQ_STATE_PROCESSING, REQ_WP, VHM_REQUEST_MAX,
};
use dmvmm::mem::{MemBus, MemDir};
use dmvmm::pm::{vm_get_suspend_mode, wait_for_resume, VmSuspendMode};
use dmvmm::vmmapi::VmCtx;

/// The request page is written by the hypervisor and by this loop; slot
/// ownership is arbitrated by the request state machine.
pub struct IoreqRing {
    buf: UnsafeCell<Box<VhmRequestBuffer>>,
}

// SAFETY: the hypervisor owns FREE/COMPLETE slots, this process owns
// PENDING/PROCESSING ones; the state field is accessed atomically.
unsafe impl Sync for IoreqRing {}
unsafe impl Send for IoreqRing {}

impl Default for IoreqRing {
    fn default() -> Self {
        Self::new()
    }
}

impl IoreqRing {
    pub fn new() -> IoreqRing {
        IoreqRing {
            buf: UnsafeCell::new(VhmRequestBuffer::new()),
        }
    }

    pub fn base_address(&self) -> u64 {
        // SAFETY: only taking the page address.
        unsafe { (*self.buf.get()).base_address() }
    }

    /// # Safety
    /// The caller must own the slot per the request state machine.
    #[allow(clippy::mut_from_ref)]
    unsafe fn slot_mut(&self, vcpu: usize) -> &mut VhmRequest {
        &mut (*self.buf.get()).slots[vcpu]
    }
}

fn vmexit_inout(pio: &PioBus, req: &mut VhmRequest) {
    let detail = req.pio();
    let is_in = detail.direction == REQUEST_READ;
    let mut value = detail.value;
    if pio
        .emulate(is_in, detail.address as u16, detail.size as u8, &mut value)
        .is_err()
    {
        debug!(
            "pio {} error @ port {:#x}",
            if is_in { "in" } else { "out" },
            detail.address
        );
    }
    if is_in {
        req.set_pio_value(value);
    }
}

fn vmexit_mmio(mmio: &MemBus, req: &mut VhmRequest) {
    let detail = req.mmio();
    let dir = if detail.direction == REQUEST_READ {
        MemDir::Read
    } else {
        MemDir::Write
    };
    let mut value = detail.value;
    if mmio
        .emulate(dir, detail.address, detail.size as u8, &mut value)
        .is_err()
    {
        debug!("mmio {dir:?} error @ {:#x}", detail.address);
    }
    if dir == MemDir::Read {
        req.set_mmio_value(value);
    }
}

fn vmexit_pci_cfg(req: &mut VhmRequest) {
    /* PCI emulation lives outside this core; reads float high */
    let detail = req.pci();
    if detail.direction == REQUEST_READ {
        req.set_pci_value(-1);
    }
    debug!(
        "pci cfg access {:02x}:{:02x}.{} reg {:#x} dropped",
        detail.bus, detail.dev, detail.func, detail.reg
    );
}

fn handle_vmexit(ctx: &VmCtx, req: &mut VhmRequest, pio: &PioBus, mmio: &MemBus, vcpu: u32) {
    match req.type_ {
        REQ_PORTIO => vmexit_inout(pio, req),
        REQ_MMIO | REQ_WP => vmexit_mmio(mmio, req),
        REQ_PCICFG => vmexit_pci_cfg(req),
        other => {
            warn!("unknown ioreq type {other} from vcpu {vcpu}");
        }
    }

    /* The result bytes are in place; publishing COMPLETE is the last
     * store on the slot before ownership returns to the hypervisor. */
    req.set_state(REQ_STATE_COMPLETE);
    if ctx.notify_request_done(vcpu).is_err() {
        error!("notify request finish failed for vcpu {vcpu}");
    }
}

/// Reset flow initiated by the guest: quiesce ioreqs, reset the devices
/// through the supplied hook, reset the VM and run it again.
fn vm_system_reset(ctx: &VmCtx, reset_devices: &dyn Fn()) {
    ctx.pause();
    ctx.clear_ioreq();
    reset_devices();
    ctx.reset();
    dmvmm::pm::vm_set_suspend_mode(VmSuspendMode::None);
    if ctx.run().is_err() {
        error!("failed to restart the VM after reset");
    }
}

fn vm_suspend_resume(ctx: &VmCtx, reset_devices: &dyn Fn()) {
    ctx.pause();

    wait_for_resume();

    /* a resume runs the same start-over flow as a reset */
    ctx.clear_ioreq();
    reset_devices();
    ctx.reset();
    if ctx.run().is_err() {
        error!("failed to restart the VM after resume");
    }
}

/// Runs until the suspend mode turns terminal or goes SYSTEM_RESET. Reset
/// and suspend are handled in place; terminal modes return to the caller.
pub fn vm_loop(
    ctx: Arc<VmCtx>,
    ring: Arc<IoreqRing>,
    pio: Arc<PioBus>,
    mmio: Arc<MemBus>,
    reset_devices: Box<dyn Fn() + Send>,
) {
    info!("vm loop: client {}", *ctx.ioreq_client.lock().unwrap());
    loop {
        /* blocks in the hypervisor until requests are pending */
        if ctx.attach_ioreq_client().is_err() {
            break;
        }

        let client_id = *ctx.ioreq_client.lock().unwrap();
        for vcpu in 0..VHM_REQUEST_MAX {
            // SAFETY: the state check below gates ownership; only slots in
            // PROCESSING assigned to this client are touched.
            let req = unsafe { ring.slot_mut(vcpu) };
            if req.state() == REQ_STATE_PROCESSING && req.client == client_id {
                handle_vmexit(&ctx, req, &pio, &mmio, vcpu as u32);
            }
        }

        match vm_get_suspend_mode() {
            VmSuspendMode::None => {}
            VmSuspendMode::SystemReset => vm_system_reset(&ctx, reset_devices.as_ref()),
            VmSuspendMode::Suspend => vm_suspend_resume(&ctx, reset_devices.as_ref()),
            mode => {
                info!("vm loop exiting on {}", mode.as_str());
                break;
            }
        }
    }
    info!("vm loop exited");
}
