//! I/O-port registry for PIO requests.

use std::sync::{Arc, RwLock};

use log::warn;

pub const IOPORT_F_IN: u32 = 0x1;
pub const IOPORT_F_OUT: u32 = 0x2;
pub const IOPORT_F_INOUT: u32 = IOPORT_F_IN | IOPORT_F_OUT;

const MAX_IOPORTS: usize = 0x10000;

#[derive(Debug, thiserror::Error)]
pub enum InoutError {
    #[error("port out of range")]
    BadPort,
    #[error("port already registered")]
    Busy,
    #[error("no handler for port {0:#x}")]
    Unclaimed(u16),
    #[error("handler failure")]
    Handler,
}

pub type Result<T> = std::result::Result<T, InoutError>;

/// in?, port, bytes, value in/out.
pub type InoutHandler = Arc<dyn Fn(bool, u16, u8, &mut u32) -> Result<()> + Send + Sync>;

struct PortEntry {
    name: &'static str,
    flags: u32,
    handler: InoutHandler,
}

pub struct PioBus {
    ports: RwLock<Vec<Option<PortEntry>>>,
}

impl Default for PioBus {
    fn default() -> Self {
        Self::new()
    }
}

impl PioBus {
    pub fn new() -> PioBus {
        let mut ports = Vec::new();
        ports.resize_with(MAX_IOPORTS, || None);
        PioBus {
            ports: RwLock::new(ports),
        }
    }

    pub fn register(
        &self,
        name: &'static str,
        port: u16,
        len: u16,
        flags: u32,
        handler: InoutHandler,
    ) -> Result<()> {
        let mut ports = self.ports.write().unwrap();
        let start = port as usize;
        let end = start + len as usize;
        if end > MAX_IOPORTS {
            return Err(InoutError::BadPort);
        }
        if ports[start..end].iter().any(|e| e.is_some()) {
            return Err(InoutError::Busy);
        }
        for slot in &mut ports[start..end] {
            *slot = Some(PortEntry {
                name,
                flags,
                handler: handler.clone(),
            });
        }
        Ok(())
    }

    pub fn unregister(&self, port: u16, len: u16) {
        let mut ports = self.ports.write().unwrap();
        let start = port as usize;
        let end = (start + len as usize).min(MAX_IOPORTS);
        for slot in &mut ports[start..end] {
            *slot = None;
        }
    }

    /// Route one port access. IN from an unclaimed port reads as zero.
    pub fn emulate(&self, is_in: bool, port: u16, bytes: u8, val: &mut u32) -> Result<()> {
        let handler = {
            let ports = self.ports.read().unwrap();
            ports[port as usize]
                .as_ref()
                .map(|e| (e.handler.clone(), e.flags, e.name))
        };
        match handler {
            Some((h, flags, _name)) => {
                if (is_in && flags & IOPORT_F_IN == 0) || (!is_in && flags & IOPORT_F_OUT == 0) {
                    if is_in {
                        *val = 0;
                    }
                    return Ok(());
                }
                h(is_in, port, bytes, val)
            }
            None => {
                warn!(
                    "unhandled {} io port access @ {:#x}",
                    if is_in { "in" } else { "out" },
                    port
                );
                if is_in {
                    *val = 0;
                }
                Err(InoutError::Unclaimed(port))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn in_out_roundtrip() {
        let bus = PioBus::new();
        let latch = Arc::new(AtomicU32::new(0));
        let latch2 = latch.clone();
        bus.register(
            "latch",
            0x40,
            4,
            IOPORT_F_INOUT,
            Arc::new(move |is_in, _port, _bytes, val| {
                if is_in {
                    *val = latch2.load(Ordering::SeqCst);
                } else {
                    latch2.store(*val, Ordering::SeqCst);
                }
                Ok(())
            }),
        )
        .unwrap();

        let mut v = 0x34u32;
        bus.emulate(false, 0x43, 1, &mut v).unwrap();
        assert_eq!(latch.load(Ordering::SeqCst), 0x34);
        let mut r = 0u32;
        bus.emulate(true, 0x40, 1, &mut r).unwrap();
        assert_eq!(r, 0x34);
    }

    #[test]
    fn double_register_rejected() {
        let bus = PioBus::new();
        let nop: InoutHandler = Arc::new(|_, _, _, _| Ok(()));
        bus.register("a", 0x60, 1, IOPORT_F_INOUT, nop.clone()).unwrap();
        assert!(bus.register("b", 0x60, 1, IOPORT_F_INOUT, nop).is_err());
    }

    #[test]
    fn unclaimed_in_reads_zero() {
        let bus = PioBus::new();
        let mut v = 0xffffu32;
        assert!(bus.emulate(true, 0x80, 1, &mut v).is_err());
        assert_eq!(v, 0);
    }
}
