//! Platform peripheral models: vHPET, vPIT and the TPM-CRB frontend with
//! its software-TPM emulator client.

pub mod hpet;
pub mod pit;
pub mod tpm_crb;
pub mod tpm_emulator;

use std::sync::Arc;

use dmvmm::vmmapi::VmCtx;

/// Interrupt injection seam; the devices stay testable without the
/// hypervisor node behind it.
pub trait IrqOps: Send + Sync {
    fn set_gsi_irq(&self, gsi: u32, op: u32);
    fn inject_msi(&self, addr: u64, data: u64);
}

pub struct VmIrqOps(pub Arc<VmCtx>);

impl IrqOps for VmIrqOps {
    fn set_gsi_irq(&self, gsi: u32, op: u32) {
        let _ = self.0.set_gsi_irq(gsi, op);
    }

    fn inject_msi(&self, addr: u64, data: u64) {
        let _ = self.0.lapic_msi(addr, data);
    }
}
