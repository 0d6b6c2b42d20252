//! The shared I/O-request ring: one 256-byte slot per vCPU in a 4 KiB page
//! shared with the hypervisor.
//!
//! Slot ownership follows the request state: the hypervisor owns slots in
//! FREE/COMPLETE, userspace owns PENDING/PROCESSING. The transitions to
//! PENDING (hypervisor) and COMPLETE (here) are the last writes before the
//! hand-off and are release stores; the state reads on the scan path are
//! acquire loads.

use std::sync::atomic::{AtomicI32, Ordering};

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const VHM_REQUEST_MAX: usize = 16;

pub const REQ_STATE_PENDING: i32 = 0;
pub const REQ_STATE_COMPLETE: i32 = 1;
pub const REQ_STATE_PROCESSING: i32 = 2;
pub const REQ_STATE_FREE: i32 = 3;

pub const REQ_PORTIO: u32 = 0;
pub const REQ_MMIO: u32 = 1;
pub const REQ_PCICFG: u32 = 2;
pub const REQ_WP: u32 = 3;

pub const REQUEST_READ: u32 = 0;
pub const REQUEST_WRITE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MmioRequest {
    pub direction: u32,
    pub reserved: u32,
    pub address: u64,
    pub size: u64,
    pub value: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PioRequest {
    pub direction: u32,
    pub reserved: u32,
    pub address: u64,
    pub size: u64,
    pub value: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PciRequest {
    pub direction: u32,
    /// keeps the same header fields as pio_request
    pub reserved: [u32; 3],
    pub size: i64,
    pub value: i32,
    pub bus: i32,
    pub dev: i32,
    pub func: i32,
    pub reg: i32,
    pub pad: u32,
}

/// One 256-byte request slot. The detail union is kept as raw bytes and
/// viewed through the typed overlays above.
#[repr(C, align(256))]
pub struct VhmRequest {
    pub type_: u32,
    /// hypervisor polls for completion when set
    pub completion_polling: u32,
    reserved0: [u32; 14],
    detail: [u8; 64],
    reserved1: u32,
    /// the client this request is distributed to
    pub client: i32,
    processed: AtomicI32,
    pad: [u8; 116],
}

impl VhmRequest {
    pub fn state(&self) -> i32 {
        self.processed.load(Ordering::Acquire)
    }

    /// Publish a new state. COMPLETE must be the last store on the slot.
    pub fn set_state(&self, state: i32) {
        self.processed.store(state, Ordering::Release);
    }

    pub fn mmio(&self) -> MmioRequest {
        MmioRequest::read_from_bytes(&self.detail[..std::mem::size_of::<MmioRequest>()])
            .expect("slot detail is large enough")
    }

    pub fn pio(&self) -> PioRequest {
        PioRequest::read_from_bytes(&self.detail[..std::mem::size_of::<PioRequest>()])
            .expect("slot detail is large enough")
    }

    pub fn pci(&self) -> PciRequest {
        PciRequest::read_from_bytes(&self.detail[..std::mem::size_of::<PciRequest>()])
            .expect("slot detail is large enough")
    }

    pub fn set_mmio_value(&mut self, value: u64) {
        let mut req = self.mmio();
        req.value = value;
        self.detail[..std::mem::size_of::<MmioRequest>()].copy_from_slice(req.as_bytes());
    }

    pub fn set_pio_value(&mut self, value: u32) {
        let mut req = self.pio();
        req.value = value;
        self.detail[..std::mem::size_of::<PioRequest>()].copy_from_slice(req.as_bytes());
    }

    pub fn set_pci_value(&mut self, value: i32) {
        let mut req = self.pci();
        req.value = value;
        self.detail[..std::mem::size_of::<PciRequest>()].copy_from_slice(req.as_bytes());
    }

    #[cfg(test)]
    pub fn set_mmio(&mut self, req: MmioRequest) {
        self.type_ = REQ_MMIO;
        self.detail[..std::mem::size_of::<MmioRequest>()].copy_from_slice(req.as_bytes());
    }

    #[cfg(test)]
    pub fn set_pio(&mut self, req: PioRequest) {
        self.type_ = REQ_PORTIO;
        self.detail[..std::mem::size_of::<PioRequest>()].copy_from_slice(req.as_bytes());
    }
}

/// The 4 KiB shared request page.
#[repr(C, align(4096))]
pub struct VhmRequestBuffer {
    pub slots: [VhmRequest; VHM_REQUEST_MAX],
}

impl VhmRequestBuffer {
    /// A fresh page with every slot FREE (hypervisor-owned).
    pub fn new() -> Box<VhmRequestBuffer> {
        // SAFETY: the buffer is plain integers/bytes; an all-zero page is a
        // valid state (PENDING == 0 is immediately corrected below).
        let mut buf: Box<VhmRequestBuffer> = unsafe {
            Box::new(std::mem::zeroed())
        };
        for slot in buf.slots.iter_mut() {
            slot.processed = AtomicI32::new(REQ_STATE_FREE);
        }
        buf
    }

    pub fn base_address(&self) -> u64 {
        self as *const VhmRequestBuffer as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_layout_is_256_bytes_page_is_4k() {
        assert_eq!(std::mem::size_of::<VhmRequest>(), 256);
        assert_eq!(std::mem::size_of::<VhmRequestBuffer>(), 4096);
        // client/processed sit at the architectural offsets
        let buf = VhmRequestBuffer::new();
        let base = &buf.slots[0] as *const VhmRequest as usize;
        let client = &buf.slots[0].client as *const i32 as usize;
        assert_eq!(client - base, 132);
        assert_eq!(&buf.slots[0].processed as *const AtomicI32 as usize - base, 136);
    }

    #[test]
    fn detail_roundtrip() {
        let mut buf = VhmRequestBuffer::new();
        let slot = &mut buf.slots[0];
        slot.set_mmio(MmioRequest {
            direction: REQUEST_READ,
            reserved: 0,
            address: 0xFED0_0000,
            size: 4,
            value: 0,
        });
        slot.set_mmio_value(0xdead_beef);
        let req = slot.mmio();
        assert_eq!(req.address, 0xFED0_0000);
        assert_eq!(req.value, 0xdead_beef);
    }

    #[test]
    fn fresh_slots_are_hypervisor_owned() {
        let buf = VhmRequestBuffer::new();
        for slot in buf.slots.iter() {
            assert_eq!(slot.state(), REQ_STATE_FREE);
        }
    }
}
