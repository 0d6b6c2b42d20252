//! Shared ring buffer: a 64-byte header followed by a power-of-two number
//! of fixed-size elements. One side of each ring lives in the hypervisor,
//! so the head/tail words are accessed atomically.

use std::sync::atomic::{AtomicU32, Ordering};

pub const SBUF_MAGIC: u64 = 0x5aa5_7aa7_1aa1_3aa3;
pub const SBUF_HEAD_SIZE: u32 = 64;

#[repr(C)]
pub struct SbufHeader {
    pub magic: u64,
    pub ele_num: u32,
    pub ele_size: u32,
    head: AtomicU32,
    tail: AtomicU32,
    pub flags: u32,
    pub reserved: u32,
    pub overrun_cnt: AtomicU32,
    pub size: u32,
    padding: [u32; 6],
}

/// View over a shared page laid out as header + ring storage.
pub struct SharedBuf {
    base: *mut u8,
}

// SAFETY: all mutation goes through atomics or under the owner's tunnel
// mutex; the backing page outlives the view.
unsafe impl Send for SharedBuf {}
unsafe impl Sync for SharedBuf {}

fn prev_pow2(n: u32) -> u32 {
    if n == 0 {
        0
    } else {
        1 << (31 - n.leading_zeros())
    }
}

impl SharedBuf {
    /// Initialize the header in `base` for a `total_size`-byte area holding
    /// `ele_size`-byte elements.
    ///
    /// # Safety
    /// `base` must point to at least `total_size` writable bytes that
    /// outlive the returned view.
    pub unsafe fn init(base: *mut u8, total_size: u32, ele_size: u32) -> SharedBuf {
        let hdr = &mut *(base as *mut SbufHeader);
        hdr.magic = SBUF_MAGIC;
        hdr.ele_size = ele_size;
        hdr.ele_num = prev_pow2((total_size - SBUF_HEAD_SIZE) / ele_size);
        hdr.size = hdr.ele_size * hdr.ele_num;
        hdr.flags = 0;
        hdr.reserved = 0;
        hdr.overrun_cnt = AtomicU32::new(0);
        hdr.head = AtomicU32::new(0);
        hdr.tail = AtomicU32::new(0);
        hdr.padding = [0; 6];
        SharedBuf { base }
    }

    fn hdr(&self) -> &SbufHeader {
        // SAFETY: base points at an initialized header for our lifetime.
        unsafe { &*(self.base as *const SbufHeader) }
    }

    fn data(&self, off: u32) -> *mut u8 {
        // SAFETY: off < size, inside the area handed to init().
        unsafe { self.base.add(SBUF_HEAD_SIZE as usize + off as usize) }
    }

    fn next_ptr(&self, off: u32) -> u32 {
        let next = off + self.hdr().ele_size;
        if next >= self.hdr().size {
            0
        } else {
            next
        }
    }

    pub fn base_address(&self) -> u64 {
        self.base as u64
    }

    pub fn ele_size(&self) -> u32 {
        self.hdr().ele_size
    }

    pub fn is_empty(&self) -> bool {
        let hdr = self.hdr();
        hdr.head.load(Ordering::Acquire) == hdr.tail.load(Ordering::Acquire)
    }

    /// Pop one element into `out`; returns the bytes copied (0 if empty).
    pub fn get(&self, out: &mut [u8]) -> u32 {
        let hdr = self.hdr();
        let head = hdr.head.load(Ordering::Acquire);
        if head == hdr.tail.load(Ordering::Acquire) {
            return 0;
        }
        let n = (hdr.ele_size as usize).min(out.len());
        // SAFETY: head indexes a live element within the ring storage.
        unsafe { std::ptr::copy_nonoverlapping(self.data(head), out.as_mut_ptr(), n) };
        hdr.head.store(self.next_ptr(head), Ordering::Release);
        hdr.ele_size
    }

    /// Push one element; full rings drop the element and count the overrun.
    pub fn put(&self, data: &[u8]) -> u32 {
        let hdr = self.hdr();
        let tail = hdr.tail.load(Ordering::Acquire);
        let next_tail = self.next_ptr(tail);
        if next_tail == hdr.head.load(Ordering::Acquire) {
            hdr.overrun_cnt.fetch_add(1, Ordering::AcqRel);
            return 0;
        }
        let n = (hdr.ele_size as usize).min(data.len());
        // SAFETY: tail indexes a free element within the ring storage.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.data(tail), n) };
        hdr.tail.store(next_tail, Ordering::Release);
        hdr.ele_size
    }
}

/// An owned, page-aligned backing area for a shared ring.
#[repr(C, align(4096))]
pub struct SbufPage {
    pub bytes: [u8; 4096],
}

impl SbufPage {
    pub fn new() -> Box<SbufPage> {
        Box::new(SbufPage { bytes: [0; 4096] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ele_num_rounds_down_to_pow2() {
        let mut page = SbufPage::new();
        // SAFETY: page outlives buf in this test.
        let buf = unsafe { SharedBuf::init(page.bytes.as_mut_ptr(), 4096, 32) };
        // (4096 - 64) / 32 = 126 -> 64 elements
        assert_eq!(buf.hdr().ele_num, 64);
        assert_eq!(buf.hdr().size, 64 * 32);
        assert_eq!(buf.hdr().magic, SBUF_MAGIC);
    }

    #[test]
    fn put_get_fifo() {
        let mut page = SbufPage::new();
        // SAFETY: page outlives buf.
        let buf = unsafe { SharedBuf::init(page.bytes.as_mut_ptr(), 4096, 32) };
        assert!(buf.is_empty());

        let mut ele = [0u8; 32];
        ele[0] = 7;
        assert_eq!(buf.put(&ele), 32);
        ele[0] = 9;
        assert_eq!(buf.put(&ele), 32);

        let mut out = [0u8; 32];
        assert_eq!(buf.get(&mut out), 32);
        assert_eq!(out[0], 7);
        assert_eq!(buf.get(&mut out), 32);
        assert_eq!(out[0], 9);
        assert_eq!(buf.get(&mut out), 0);
    }

    #[test]
    fn full_ring_counts_overrun() {
        let mut page = SbufPage::new();
        // SAFETY: page outlives buf.
        let buf = unsafe { SharedBuf::init(page.bytes.as_mut_ptr(), 4096, 32) };
        let ele = [1u8; 32];
        // capacity is ele_num - 1 with one slot kept open
        for _ in 0..63 {
            assert_eq!(buf.put(&ele), 32);
        }
        assert_eq!(buf.put(&ele), 0);
        assert_eq!(buf.hdr().overrun_cnt.load(Ordering::SeqCst), 1);
    }
}
