//! Timerfd-backed timers dispatched through mevent.
//!
//! timerfd + epoll avoids the resource races of async sigevent threads when
//! emulating PIT/HPET/WDT style timers in the device model.

use std::os::fd::RawFd;
use std::sync::Arc;

use log::error;

use crate::mevent::{EvType, EventHandle, Mevent};

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("unsupported clock")]
    UnsupportedClock,
    #[error("timerfd_create: {0}")]
    Create(std::io::Error),
    #[error("timerfd_settime: {0}")]
    SetTime(std::io::Error),
    #[error("timerfd_gettime: {0}")]
    GetTime(std::io::Error),
    #[error("mevent: {0}")]
    Mevent(#[from] crate::mevent::MeventError),
}

pub type Result<T> = std::result::Result<T, TimerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerClock {
    Realtime,
    Monotonic,
}

impl TimerClock {
    fn raw(self) -> libc::clockid_t {
        match self {
            TimerClock::Realtime => libc::CLOCK_REALTIME,
            TimerClock::Monotonic => libc::CLOCK_MONOTONIC,
        }
    }
}

pub const ZERO_ITIMERSPEC: libc::itimerspec = libc::itimerspec {
    it_interval: libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    },
    it_value: libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    },
};

/// A nonblocking CLOEXEC timerfd registered read-ready on an [`Mevent`].
/// The stored callback receives the expiration count whenever it is > 0.
pub struct AcrnTimer {
    fd: RawFd,
    mevent: Arc<Mevent>,
    handle: Option<EventHandle>,
}

impl AcrnTimer {
    pub fn new<F>(mevent: &Arc<Mevent>, clock: TimerClock, callback: F) -> Result<AcrnTimer>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        // SAFETY: plain syscall, fd validity checked below.
        let fd = unsafe {
            libc::timerfd_create(clock.raw(), libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(TimerError::Create(std::io::Error::last_os_error()));
        }

        let handle = match mevent.add(fd, EvType::Read, move |tfd, _| {
            let mut nexp: u64 = 0;
            // SAFETY: reading 8 bytes from our own nonblocking timerfd.
            let size = unsafe {
                libc::read(tfd, (&mut nexp as *mut u64).cast(), std::mem::size_of::<u64>())
            };
            if size < 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EAGAIN) {
                    error!("timer: read timerfd error: {err}");
                }
                return;
            }
            if size == 0 || nexp == 0 {
                return;
            }
            callback(nexp);
        }) {
            Ok(h) => h,
            Err(e) => {
                // SAFETY: closing the fd we just created.
                unsafe { libc::close(fd) };
                return Err(e.into());
            }
        };

        Ok(AcrnTimer {
            fd,
            mevent: mevent.clone(),
            handle: Some(handle),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn settime(&self, value: &libc::itimerspec) -> Result<()> {
        // SAFETY: fd is a live timerfd, value points to a valid itimerspec.
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, value, std::ptr::null_mut()) };
        if rc < 0 {
            return Err(TimerError::SetTime(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn settime_abs(&self, value: &libc::itimerspec) -> Result<()> {
        // SAFETY: as above.
        let rc = unsafe {
            libc::timerfd_settime(self.fd, libc::TFD_TIMER_ABSTIME, value, std::ptr::null_mut())
        };
        if rc < 0 {
            return Err(TimerError::SetTime(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    pub fn gettime(&self) -> Result<libc::itimerspec> {
        let mut cur = ZERO_ITIMERSPEC;
        // SAFETY: fd is a live timerfd, cur is writable.
        let rc = unsafe { libc::timerfd_gettime(self.fd, &mut cur) };
        if rc < 0 {
            return Err(TimerError::GetTime(std::io::Error::last_os_error()));
        }
        Ok(cur)
    }

    pub fn stop(&self) -> Result<()> {
        self.settime(&ZERO_ITIMERSPEC)
    }

    /// Unregister from the event loop and close the fd.
    pub fn deinit(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.mevent.delete_close(handle);
        }
        self.fd = -1;
    }
}

impl Drop for AcrnTimer {
    fn drop(&mut self) {
        self.deinit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn timer_fires_with_expiration_count() {
        let mev = Mevent::new().unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        let fired2 = fired.clone();
        let timer = AcrnTimer::new(&mev, TimerClock::Monotonic, move |nexp| {
            fired2.fetch_add(nexp, Ordering::SeqCst);
        })
        .unwrap();

        let mut its = ZERO_ITIMERSPEC;
        its.it_value.tv_nsec = 5_000_000;
        timer.settime(&its).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let mev2 = mev.clone();
        let t = std::thread::spawn(move || {
            mev2.dispatch(|| stop2.load(Ordering::SeqCst));
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            std::thread::sleep(Duration::from_millis(5));
        }

        stop.store(true, Ordering::SeqCst);
        mev.notify().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn gettime_reflects_interval() {
        let mev = Mevent::new().unwrap();
        let timer = AcrnTimer::new(&mev, TimerClock::Monotonic, |_| {}).unwrap();
        let mut its = ZERO_ITIMERSPEC;
        its.it_value.tv_sec = 5;
        its.it_interval.tv_sec = 3;
        timer.settime(&its).unwrap();
        let cur = timer.gettime().unwrap();
        assert_eq!(cur.it_interval.tv_sec, 3);
        assert!(cur.it_value.tv_sec <= 5);
        timer.stop().unwrap();
        let cur = timer.gettime().unwrap();
        assert_eq!(cur.it_value.tv_sec, 0);
        assert_eq!(cur.it_value.tv_nsec, 0);
    }
}
