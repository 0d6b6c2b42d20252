//! MMIO range registry. Device models register named GPA ranges; the ioreq
//! dispatcher routes MMIO and write-protect requests through here.

use std::sync::{Arc, RwLock};

use log::warn;

pub const MEM_F_READ: u32 = 0x1;
pub const MEM_F_WRITE: u32 = 0x2;
pub const MEM_F_RW: u32 = MEM_F_READ | MEM_F_WRITE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemDir {
    Read,
    Write,
}

#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("memory range overlaps an existing registration")]
    Overlap,
    #[error("no range registered for address {0:#x}")]
    Unclaimed(u64),
    #[error("handler failure")]
    Handler,
}

pub type Result<T> = std::result::Result<T, MemError>;

/// dir, address, size, value in/out. Returning an error drops the access.
pub type MemHandler = Arc<dyn Fn(MemDir, u64, u8, &mut u64) -> Result<()> + Send + Sync>;

pub struct MemRange {
    pub name: &'static str,
    pub base: u64,
    pub size: u64,
    pub flags: u32,
    pub handler: MemHandler,
}

#[derive(Default)]
pub struct MemBus {
    ranges: RwLock<Vec<MemRange>>,
}

impl MemBus {
    pub fn new() -> MemBus {
        MemBus::default()
    }

    pub fn register(&self, range: MemRange) -> Result<()> {
        let mut ranges = self.ranges.write().unwrap();
        for r in ranges.iter() {
            if range.base < r.base + r.size && r.base < range.base + range.size {
                return Err(MemError::Overlap);
            }
        }
        ranges.push(range);
        Ok(())
    }

    pub fn unregister(&self, base: u64) {
        self.ranges.write().unwrap().retain(|r| r.base != base);
    }

    /// Route one MMIO access. Reads of unclaimed addresses return zero, the
    /// instruction-emulation path depends on that.
    pub fn emulate(&self, dir: MemDir, addr: u64, size: u8, val: &mut u64) -> Result<()> {
        let handler = {
            let ranges = self.ranges.read().unwrap();
            ranges
                .iter()
                .find(|r| addr >= r.base && addr < r.base + r.size)
                .map(|r| (r.handler.clone(), r.flags))
        };
        match handler {
            Some((h, flags)) => {
                if (dir == MemDir::Read && flags & MEM_F_READ == 0)
                    || (dir == MemDir::Write && flags & MEM_F_WRITE == 0)
                {
                    if dir == MemDir::Read {
                        *val = 0;
                    }
                    return Ok(());
                }
                h(dir, addr, size, val)
            }
            None => {
                warn!("unhandled {dir:?} mmio access @ {addr:#x} size {size}");
                if dir == MemDir::Read {
                    *val = 0;
                }
                Err(MemError::Unclaimed(addr))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn routes_to_registered_range() {
        let bus = MemBus::new();
        let cell = Arc::new(AtomicU64::new(0x1234));
        let cell2 = cell.clone();
        bus.register(MemRange {
            name: "cell",
            base: 0x1000,
            size: 0x100,
            flags: MEM_F_RW,
            handler: Arc::new(move |dir, _addr, _size, val| {
                match dir {
                    MemDir::Read => *val = cell2.load(Ordering::SeqCst),
                    MemDir::Write => cell2.store(*val, Ordering::SeqCst),
                }
                Ok(())
            }),
        })
        .unwrap();

        let mut val = 0u64;
        bus.emulate(MemDir::Read, 0x1010, 4, &mut val).unwrap();
        assert_eq!(val, 0x1234);
        val = 0x5678;
        bus.emulate(MemDir::Write, 0x1010, 4, &mut val).unwrap();
        assert_eq!(cell.load(Ordering::SeqCst), 0x5678);
    }

    #[test]
    fn unclaimed_read_returns_zero() {
        let bus = MemBus::new();
        let mut val = 0xffu64;
        assert!(bus.emulate(MemDir::Read, 0x9000, 4, &mut val).is_err());
        assert_eq!(val, 0);
    }

    #[test]
    fn overlap_rejected() {
        let bus = MemBus::new();
        let nop: MemHandler = Arc::new(|_, _, _, _| Ok(()));
        bus.register(MemRange {
            name: "a",
            base: 0x1000,
            size: 0x1000,
            flags: MEM_F_RW,
            handler: nop.clone(),
        })
        .unwrap();
        assert!(bus
            .register(MemRange {
                name: "b",
                base: 0x1800,
                size: 0x1000,
                flags: MEM_F_RW,
                handler: nop,
            })
            .is_err());
    }
}
