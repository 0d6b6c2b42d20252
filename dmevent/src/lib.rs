//! Event plumbing for the device model: the `mevent` epoll dispatcher that
//! owns nearly all fd activity, a timerfd wrapper riding on it, and the
//! iothread worker pool used to offload device I/O from the dispatch thread.

pub mod iothread;
pub mod mevent;
pub mod timer;

pub use mevent::{EvType, EventHandle, Mevent, MeventError};
pub use timer::{AcrnTimer, TimerClock};
