//! Carrier-Board Communication protocol stack and the IOC mediator device
//! that carries the VM's lifecycle and wakeup signalling.

pub mod cbc;
pub mod ioc;

pub use ioc::{IocDev, IocEventType, VmRequestType};
