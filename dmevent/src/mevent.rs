//! Micro event library for a single i/o thread, built on epoll with
//! persistent (level-triggered) events by default.
//!
//! One thread calls [`Mevent::dispatch`] and becomes the dispatch thread; all
//! callbacks run there. Other threads may add, disable or delete events at
//! any time. Deletes from outside the dispatch thread are deferred onto a
//! pending-delete list and the loop is woken through the notify eventfd, so a
//! callback is never freed while the dispatcher might still be about to run
//! it.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use log::{error, warn};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

const MEVENT_MAX: usize = 64;

const MEV_ENABLED: i32 = 1;
const MEV_DISABLED: i32 = 2;
const MEV_DEL_PENDING: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvType {
    Read,
    Write,
    ReadEt,
    WriteEt,
    /// Not dispatched here, see the timer module.
    Timer,
    /// Not supported.
    Signal,
}

#[derive(Debug, thiserror::Error)]
pub enum MeventError {
    #[error("invalid fd")]
    InvalidFd,
    #[error("invalid argument")]
    InvalidArg,
    #[error("epoll: {0}")]
    Epoll(std::io::Error),
    #[error("notify: {0}")]
    Notify(std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeventError>;

type EvCallback = Box<dyn Fn(RawFd, EvType) + Send + Sync>;
type EvTeardown = Box<dyn FnOnce() + Send>;

struct Entry {
    id: u64,
    fd: RawFd,
    kind: EvType,
    func: EvCallback,
    teardown: Mutex<Option<EvTeardown>>,
    state: AtomicI32,
    closefd: AtomicBool,
    closed: AtomicBool,
}

impl Entry {
    fn finalize(&self) {
        if let Some(teardown) = self.teardown.lock().unwrap().take() {
            teardown();
        }
        if self.closefd.load(Ordering::Acquire) && !self.closed.swap(true, Ordering::AcqRel) {
            // SAFETY: the entry owns the fd once delete_close was requested;
            // the `closed` swap guarantees a single close.
            unsafe { libc::close(self.fd) };
        }
    }
}

/// Opaque handle returned by [`Mevent::add`].
#[derive(Clone)]
pub struct EventHandle {
    entry: Arc<Entry>,
}

impl EventHandle {
    pub fn fd(&self) -> RawFd {
        self.entry.fd
    }

    pub fn same_entry(&self, other: &EventHandle) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

struct Inner {
    live: Vec<Arc<Entry>>,
    del: Vec<Arc<Entry>>,
    next_id: u64,
}

pub struct Mevent {
    epoll: Epoll,
    notify_fd: EventFd,
    inner: Mutex<Inner>,
    dispatch_tid: Mutex<Option<ThreadId>>,
}

fn event_set(kind: EvType) -> EventSet {
    match kind {
        EvType::Read => EventSet::IN,
        EvType::ReadEt => EventSet::IN | EventSet::EDGE_TRIGGERED,
        EvType::Write => EventSet::OUT,
        EvType::WriteEt => EventSet::OUT | EventSet::EDGE_TRIGGERED,
        EvType::Timer | EvType::Signal => EventSet::empty(),
    }
}

impl Mevent {
    pub fn new() -> Result<Arc<Self>> {
        let epoll = Epoll::new().map_err(MeventError::Epoll)?;
        let notify_fd = EventFd::new(EFD_NONBLOCK).map_err(MeventError::Epoll)?;

        let mev = Arc::new(Mevent {
            epoll,
            notify_fd,
            inner: Mutex::new(Inner {
                live: Vec::new(),
                del: Vec::new(),
                next_id: 1,
            }),
            dispatch_tid: Mutex::new(None),
        });

        // Internal event draining the notify eventfd; other threads write it
        // to force the blocking epoll call to return.
        let drain = mev.notify_fd.try_clone().map_err(MeventError::Epoll)?;
        mev.add(mev.notify_fd.as_raw_fd(), EvType::Read, move |_, _| {
            let _ = drain.read();
        })?;

        Ok(mev)
    }

    fn is_dispatch_thread(&self) -> bool {
        *self.dispatch_tid.lock().unwrap() == Some(std::thread::current().id())
    }

    /// Wake the dispatch loop. A no-op when called from the dispatch thread.
    pub fn notify(&self) -> Result<()> {
        if self.is_dispatch_thread() {
            return Ok(());
        }
        self.notify_fd.write(1).map_err(MeventError::Notify)
    }

    /// Register `func` to run whenever `fd` is ready for `kind`. Adding the
    /// same `(fd, kind)` pair again returns the existing registration.
    pub fn add<F>(&self, fd: RawFd, kind: EvType, func: F) -> Result<EventHandle>
    where
        F: Fn(RawFd, EvType) + Send + Sync + 'static,
    {
        self.add_entry(fd, kind, Box::new(func), None)
    }

    /// Like [`Mevent::add`], with a teardown hook run once when the entry
    /// is finally freed.
    pub fn add_with_teardown<F, T>(
        &self,
        fd: RawFd,
        kind: EvType,
        func: F,
        teardown: T,
    ) -> Result<EventHandle>
    where
        F: Fn(RawFd, EvType) + Send + Sync + 'static,
        T: FnOnce() + Send + 'static,
    {
        self.add_entry(fd, kind, Box::new(func), Some(Box::new(teardown)))
    }

    fn add_entry(
        &self,
        fd: RawFd,
        kind: EvType,
        func: EvCallback,
        teardown: Option<EvTeardown>,
    ) -> Result<EventHandle> {
        if fd < 0 {
            return Err(MeventError::InvalidFd);
        }
        if matches!(kind, EvType::Timer | EvType::Signal) {
            return Err(MeventError::InvalidArg);
        }

        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner
            .live
            .iter()
            .find(|e| e.fd == fd && e.kind == kind)
        {
            return Ok(EventHandle {
                entry: existing.clone(),
            });
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let entry = Arc::new(Entry {
            id,
            fd,
            kind,
            func,
            teardown: Mutex::new(teardown),
            state: AtomicI32::new(MEV_ENABLED),
            closefd: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        self.epoll
            .ctl(
                ControlOperation::Add,
                fd,
                EpollEvent::new(event_set(kind), id),
            )
            .map_err(MeventError::Epoll)?;
        inner.live.push(entry.clone());

        Ok(EventHandle { entry })
    }

    /// Re-arm a disabled event.
    pub fn enable(&self, handle: &EventHandle) -> Result<()> {
        let entry = {
            let inner = self.inner.lock().unwrap();
            match inner.live.iter().find(|e| e.id == handle.entry.id) {
                Some(e) => e.clone(),
                None => return Err(MeventError::InvalidArg),
            }
        };

        match self.epoll.ctl(
            ControlOperation::Add,
            entry.fd,
            EpollEvent::new(event_set(entry.kind), entry.id),
        ) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {}
            Err(e) => return Err(MeventError::Epoll(e)),
        }
        entry.state.store(MEV_ENABLED, Ordering::Release);
        Ok(())
    }

    /// Mask an event without unregistering it.
    pub fn disable(&self, handle: &EventHandle) -> Result<()> {
        match self.epoll.ctl(
            ControlOperation::Delete,
            handle.entry.fd,
            EpollEvent::default(),
        ) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {}
            Err(e) => return Err(MeventError::Epoll(e)),
        }
        handle.entry.state.store(MEV_DISABLED, Ordering::Release);
        Ok(())
    }

    fn delete_event(&self, handle: EventHandle, closefd: bool) -> Result<()> {
        let entry = handle.entry;
        let defer = {
            let mut inner = self.inner.lock().unwrap();
            inner.live.retain(|e| e.id != entry.id);
            entry.state.store(MEV_DEL_PENDING, Ordering::Release);
            entry.closefd.store(closefd, Ordering::Release);
            let _ = self
                .epoll
                .ctl(ControlOperation::Delete, entry.fd, EpollEvent::default());
            /* With no dispatcher running, nobody can be mid-callback and
             * the entry can be freed on the spot. */
            let dispatcher = *self.dispatch_tid.lock().unwrap();
            if dispatcher.is_none() || dispatcher == Some(std::thread::current().id()) {
                false
            } else {
                inner.del.push(entry.clone());
                true
            }
        };

        if defer {
            let _ = self.notify();
        } else {
            entry.finalize();
        }
        Ok(())
    }

    pub fn delete(&self, handle: EventHandle) -> Result<()> {
        self.delete_event(handle, false)
    }

    /// Delete the event and close its fd (exactly once).
    pub fn delete_close(&self, handle: EventHandle) -> Result<()> {
        self.delete_event(handle, true)
    }

    fn drain_del_list(&self) {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.del)
        };
        for entry in pending {
            entry.finalize();
        }
    }

    /// Run the dispatch loop on the calling thread until `should_exit`
    /// reports true after a full pass over the ready set.
    pub fn dispatch<F: Fn() -> bool>(&self, should_exit: F) {
        *self.dispatch_tid.lock().unwrap() = Some(std::thread::current().id());

        let mut eventlist = vec![EpollEvent::default(); MEVENT_MAX];
        loop {
            let nev = match self.epoll.wait(-1, &mut eventlist) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => 0,
                Err(e) => {
                    error!("mevent: error return from epoll_wait: {e}");
                    break;
                }
            };

            for ev in &eventlist[..nev] {
                let entry = {
                    let inner = self.inner.lock().unwrap();
                    inner.live.iter().find(|e| e.id == ev.data()).cloned()
                };
                if let Some(entry) = entry {
                    if entry.state.load(Ordering::Acquire) == MEV_ENABLED {
                        (entry.func)(entry.fd, entry.kind);
                    }
                }
            }

            self.drain_del_list();

            if should_exit() {
                break;
            }
        }
    }

    /// Tear down every registration, closing I/O fds (stdin excepted).
    pub fn deinit(&self) {
        let (live, del) = {
            let mut inner = self.inner.lock().unwrap();
            (
                std::mem::take(&mut inner.live),
                std::mem::take(&mut inner.del),
            )
        };
        for entry in live {
            let _ = self
                .epoll
                .ctl(ControlOperation::Delete, entry.fd, EpollEvent::default());
            if entry.fd != libc::STDIN_FILENO && entry.fd != self.notify_fd.as_raw_fd() {
                entry.closefd.store(true, Ordering::Release);
            }
            entry.finalize();
        }
        // Entries on the delete list were removed from epoll already.
        for entry in del {
            entry.finalize();
        }
    }
}

impl Drop for Mevent {
    fn drop(&mut self) {
        if !self.inner.lock().map(|i| i.live.is_empty()).unwrap_or(true) {
            warn!("mevent dropped with live events");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn new_eventfd() -> EventFd {
        EventFd::new(EFD_NONBLOCK).unwrap()
    }

    #[test]
    fn add_rejects_bad_args() {
        let mev = Mevent::new().unwrap();
        assert!(matches!(
            mev.add(-1, EvType::Read, |_, _| {}),
            Err(MeventError::InvalidFd)
        ));
        let efd = new_eventfd();
        assert!(matches!(
            mev.add(efd.as_raw_fd(), EvType::Timer, |_, _| {}),
            Err(MeventError::InvalidArg)
        ));
    }

    #[test]
    fn add_is_idempotent_per_fd_kind() {
        let mev = Mevent::new().unwrap();
        let efd = new_eventfd();
        let h1 = mev.add(efd.as_raw_fd(), EvType::Read, |_, _| {}).unwrap();
        let h2 = mev.add(efd.as_raw_fd(), EvType::Read, |_, _| {}).unwrap();
        assert!(h1.same_entry(&h2));
        mev.delete(h1).unwrap();
    }

    #[test]
    fn dispatch_runs_callback_and_exits() {
        let mev = Mevent::new().unwrap();
        let efd = new_eventfd();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _h = mev
            .add(efd.as_raw_fd(), EvType::Read, move |fd, _| {
                let mut buf = 0u64.to_ne_bytes();
                // SAFETY: reading our own nonblocking eventfd.
                unsafe { libc::read(fd, buf.as_mut_ptr().cast(), 8) };
                hits2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let mev2 = mev.clone();
        let t = std::thread::spawn(move || {
            mev2.dispatch(|| stop2.load(Ordering::SeqCst));
        });

        efd.write(1).unwrap();
        while hits.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.store(true, Ordering::SeqCst);
        mev.notify().unwrap();
        t.join().unwrap();
    }

    #[test]
    fn teardown_runs_once_on_delete() {
        let mev = Mevent::new().unwrap();
        let efd = new_eventfd();
        let torn = Arc::new(AtomicUsize::new(0));
        let torn2 = torn.clone();
        let h = mev
            .add_with_teardown(efd.as_raw_fd(), EvType::Read, |_, _| {}, move || {
                torn2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        mev.delete(h.clone()).unwrap();
        mev.delete(h).unwrap();
        assert_eq!(torn.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delete_close_from_worker_closes_fd_once() {
        let mev = Mevent::new().unwrap();
        let efd = new_eventfd();
        let raw = efd.as_raw_fd();
        // Hand the fd over to the event entry.
        std::mem::forget(efd);
        let h = mev.add(raw, EvType::Read, |_, _| {}).unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let mev2 = mev.clone();
        let t = std::thread::spawn(move || {
            mev2.dispatch(|| stop2.load(Ordering::SeqCst));
        });
        // Give the dispatcher a moment to block in epoll.
        std::thread::sleep(Duration::from_millis(20));

        // This runs on a non-dispatch thread: the delete must be deferred and
        // the fd closed by the dispatcher, exactly once.
        mev.delete_close(h.clone()).unwrap();
        // A second delete of the same handle must not close again.
        mev.delete_close(h).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            // SAFETY: probing fd validity only.
            let r = unsafe { libc::fcntl(raw, libc::F_GETFD) };
            if r == -1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "fd was not closed");
            std::thread::sleep(Duration::from_millis(5));
        }

        stop.store(true, Ordering::SeqCst);
        mev.notify().unwrap();
        t.join().unwrap();
    }
}
