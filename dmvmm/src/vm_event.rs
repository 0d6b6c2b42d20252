//! VM-event tunnels: two shared rings (hypervisor-originated and
//! DM-originated), eventfd-kicked, drained by one thread that throttles
//! per event type and hands a JSON message to the monitor.

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use dmevent::{AcrnTimer, Mevent, TimerClock};

use crate::sbuf::{SbufPage, SharedBuf};
use crate::vmmapi::VmCtx;

pub const VM_EVENT_RTC_CHG: u32 = 0;
pub const VM_EVENT_POWEROFF: u32 = 1;
pub const VM_EVENT_TRIPLE_FAULT: u32 = 2;
pub const VM_EVENT_COUNT: usize = 3;

/// time window for the throttle counters, in seconds
const THROTTLE_WINDOW: u64 = 1;

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VmEvent {
    pub type_: u32,
    pub event_data: [u8; 28],
}

pub const VM_EVENT_ELE_SIZE: u32 = std::mem::size_of::<VmEvent>() as u32;

#[derive(Debug, thiserror::Error)]
pub enum VmEventError {
    #[error("epoll: {0}")]
    Epoll(std::io::Error),
    #[error("eventfd: {0}")]
    EventFd(std::io::Error),
    #[error("tunnel ioctl: {0}")]
    Setup(#[from] crate::vmmapi::VmmError),
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
    #[error("tunnel disabled")]
    Disabled,
    #[error("ring full")]
    RingFull,
}

pub type Result<T> = std::result::Result<T, VmEventError>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum SourceType {
    Hv,
    Dm,
}

struct Tunnel {
    type_: SourceType,
    sbuf: SharedBuf,
    kick: EventFd,
    mtx: Mutex<()>,
    enabled: AtomicBool,
}

struct Throttle {
    /// events allowed per window
    rate: u32,
    counter: AtomicU32,
    dropped: AtomicU32,
}

impl Throttle {
    fn admit(&self) -> bool {
        if self.counter.load(Ordering::Acquire) / THROTTLE_WINDOW as u32 >= self.rate {
            let n = self.dropped.fetch_add(1, Ordering::AcqRel) + 1;
            info!("vm event throttle: {n} dropped");
            false
        } else {
            self.counter.fetch_add(1, Ordering::AcqRel);
            true
        }
    }
}

pub type MonitorSink = Arc<dyn Fn(&str) + Send + Sync>;

pub struct VmEventCtx {
    _hv_page: Box<SbufPage>,
    _dm_page: Box<SbufPage>,
    tunnels: [Arc<Tunnel>; 2],
    started: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    _throttle_timers: Vec<AcrnTimer>,
}

fn emit_vm_event(throttle: &[Arc<Throttle>], sink: &MonitorSink, event: &VmEvent) {
    let Some(ctl) = throttle.get(event.type_ as usize) else {
        warn!("unhandled vm event type {}", event.type_);
        return;
    };
    if !ctl.admit() {
        return;
    }
    let msg = serde_json::json!({ "vm_event": event.type_ }).to_string();
    sink(&msg);
}

impl VmEventCtx {
    pub fn init(ctx: &Arc<VmCtx>, mevent: &Arc<Mevent>, sink: MonitorSink) -> Result<VmEventCtx> {
        let mut hv_page = SbufPage::new();
        let mut dm_page = SbufPage::new();

        // SAFETY: the pages are owned by the returned struct and outlive
        // both ring views.
        let hv_sbuf = unsafe { SharedBuf::init(hv_page.bytes.as_mut_ptr(), 4096, VM_EVENT_ELE_SIZE) };
        let dm_sbuf = unsafe { SharedBuf::init(dm_page.bytes.as_mut_ptr(), 4096, VM_EVENT_ELE_SIZE) };

        let epoll = Epoll::new().map_err(VmEventError::Epoll)?;

        let mk_tunnel = |type_: SourceType, sbuf: SharedBuf| -> Result<Arc<Tunnel>> {
            let kick = EventFd::new(EFD_NONBLOCK).map_err(VmEventError::EventFd)?;
            if type_ == SourceType::Hv {
                ctx.setup_vm_event_ring(sbuf.base_address())?;
                ctx.setup_vm_event_fd(kick.as_raw_fd())?;
            }
            Ok(Arc::new(Tunnel {
                type_,
                sbuf,
                kick,
                mtx: Mutex::new(()),
                enabled: AtomicBool::new(true),
            }))
        };

        let hv_tunnel = mk_tunnel(SourceType::Hv, hv_sbuf)?;
        let dm_tunnel = mk_tunnel(SourceType::Dm, dm_sbuf)?;

        for (i, t) in [&hv_tunnel, &dm_tunnel].iter().enumerate() {
            epoll
                .ctl(
                    ControlOperation::Add,
                    t.kick.as_raw_fd(),
                    EpollEvent::new(EventSet::IN, i as u64),
                )
                .map_err(VmEventError::Epoll)?;
        }

        let throttle: Vec<Arc<Throttle>> = (0..VM_EVENT_COUNT)
            .map(|_| {
                Arc::new(Throttle {
                    rate: 1,
                    counter: AtomicU32::new(0),
                    dropped: AtomicU32::new(0),
                })
            })
            .collect();

        // One window timer per event type resets its counter.
        let mut timers = Vec::new();
        for ctl in &throttle {
            let ctl2 = ctl.clone();
            match AcrnTimer::new(mevent, TimerClock::Monotonic, move |_| {
                ctl2.counter.store(0, Ordering::Release);
            }) {
                Ok(timer) => {
                    let mut its = dmevent::timer::ZERO_ITIMERSPEC;
                    its.it_value.tv_sec = THROTTLE_WINDOW as libc::time_t;
                    its.it_interval.tv_sec = THROTTLE_WINDOW as libc::time_t;
                    if timer.settime(&its).is_err() {
                        warn!("failed to set vm_event throttle timer, throttle disabled");
                    }
                    timers.push(timer);
                }
                Err(_) => warn!("failed to create vm_event throttle timer, throttle disabled"),
            }
        }

        let started = Arc::new(AtomicBool::new(true));
        let tunnels = [hv_tunnel, dm_tunnel];

        let thr_tunnels = tunnels.clone();
        let thr_started = started.clone();
        let thr_throttle = throttle.clone();
        let thread = std::thread::Builder::new()
            .name("vm_event".into())
            .spawn(move || {
                let mut eventlist = vec![EpollEvent::default(); 2];
                while thr_started.load(Ordering::Acquire) {
                    let n = match epoll.wait(-1, &mut eventlist) {
                        Ok(n) => n,
                        Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                        Err(e) => {
                            error!("vm_event: epoll failed {e}");
                            continue;
                        }
                    };
                    for ev in &eventlist[..n] {
                        let Some(tunnel) = thr_tunnels.get(ev.data() as usize) else {
                            continue;
                        };
                        let _ = tunnel.kick.read();
                        if !tunnel.enabled.load(Ordering::Acquire) {
                            continue;
                        }
                        let mut raw = [0u8; VM_EVENT_ELE_SIZE as usize];
                        while tunnel.sbuf.get(&mut raw) > 0 {
                            let event = VmEvent::read_from_bytes(&raw[..])
                                .expect("element size matches");
                            debug!(
                                "vm event from {} type {}",
                                if tunnel.type_ == SourceType::Hv { "hv" } else { "dm" },
                                event.type_
                            );
                            emit_vm_event(&thr_throttle, &sink, &event);
                        }
                    }
                }
            })
            .map_err(VmEventError::Spawn)?;

        Ok(VmEventCtx {
            _hv_page: hv_page,
            _dm_page: dm_page,
            tunnels,
            started,
            thread: Some(thread),
            _throttle_timers: timers,
        })
    }

    /// Publish a DM-originated event. Dropped when the ring is full; the
    /// receive thread may throttle it further.
    pub fn send(&self, event: &VmEvent) -> Result<()> {
        let tunnel = &self.tunnels[1];
        if !tunnel.enabled.load(Ordering::Acquire) {
            return Err(VmEventError::Disabled);
        }
        let sent = {
            let _guard = tunnel.mtx.lock().unwrap();
            tunnel.sbuf.put(event.as_bytes())
        };
        if sent != VM_EVENT_ELE_SIZE {
            return Err(VmEventError::RingFull);
        }
        let _ = tunnel.kick.write(1);
        Ok(())
    }

    pub fn deinit(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.started.store(false, Ordering::Release);
            for t in &self.tunnels {
                t.enabled.store(false, Ordering::Release);
            }
            // Wake the drain thread out of its epoll_wait.
            let _ = self.tunnels[1].kick.write(1);
            let _ = thread.join();
        }
    }
}

impl Drop for VmEventCtx {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_admits_up_to_rate() {
        let ctl = Throttle {
            rate: 2,
            counter: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        };
        assert!(ctl.admit());
        assert!(ctl.admit());
        assert!(!ctl.admit());
        assert_eq!(ctl.dropped.load(Ordering::SeqCst), 1);
        // window reset
        ctl.counter.store(0, Ordering::SeqCst);
        assert!(ctl.admit());
    }

    #[test]
    fn event_layout() {
        assert_eq!(std::mem::size_of::<VmEvent>(), 32);
    }
}
