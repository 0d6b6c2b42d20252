//! Dedicated I/O worker threads, each owning its own epoll set so that
//! device queue handling can be taken off the mevent dispatch thread.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{error, info};
use nix::sched::CpuSet;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::{EventFd, EFD_NONBLOCK};

pub const IOTHREAD_NUM: usize = 40;

const MEVENT_MAX: usize = 64;
const IOTHREAD_NICE: libc::c_int = -10;

#[derive(Debug, thiserror::Error)]
pub enum IothreadError {
    #[error("invalid iothread option: {0}")]
    InvalidOption(String),
    #[error("iothread pool exhausted, max number of instances is {IOTHREAD_NUM}")]
    PoolExhausted,
    #[error("epoll: {0}")]
    Epoll(std::io::Error),
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, IothreadError>;

/// Options parsed from `N[@set0[/set1...]]`, where each set is a
/// `:`-separated pcpu list and `*` skips the affinity of one instance.
pub struct IothreadsOption {
    pub num: usize,
    pub tag: String,
    pub cpusets: Vec<Option<CpuSet>>,
}

pub fn iothread_parse_options(opt: Option<&str>, tag: &str) -> Result<IothreadsOption> {
    // An 'iothread' option with no value means one instance.
    let Some(opt) = opt else {
        return Ok(IothreadsOption {
            num: 1,
            tag: tag.to_string(),
            cpusets: vec![None],
        });
    };

    let (num_str, sets_str) = match opt.split_once('@') {
        Some((n, s)) => (n, Some(s)),
        None => (opt, None),
    };

    let num: usize = num_str
        .parse()
        .map_err(|_| IothreadError::InvalidOption(format!("bad iothread number {num_str:?}")))?;
    if num == 0 || num > IOTHREAD_NUM {
        return Err(IothreadError::InvalidOption(format!(
            "iothread number {num} out of range"
        )));
    }

    let mut cpusets: Vec<Option<CpuSet>> = vec![None; num];
    if let Some(sets) = sets_str {
        for (idx, one) in sets.split('/').enumerate() {
            if idx >= num {
                break;
            }
            let mut set = CpuSet::new();
            let mut any = false;
            for cpu in one.split(':') {
                if cpu == "*" {
                    any = false;
                    break;
                }
                if cpu.is_empty() {
                    continue;
                }
                let id: usize = cpu.parse().map_err(|_| {
                    IothreadError::InvalidOption(format!("bad cpu affinity {cpu:?}"))
                })?;
                set.set(id).map_err(|_| {
                    IothreadError::InvalidOption(format!("cpu id {id} out of range"))
                })?;
                any = true;
            }
            if any {
                cpusets[idx] = Some(set);
            }
        }
    }

    Ok(IothreadsOption {
        num,
        tag: tag.to_string(),
        cpusets,
    })
}

pub struct IothreadHandler {
    pub run: Box<dyn Fn() + Send + Sync>,
    pub fd: RawFd,
}

const KICK_TOKEN: u64 = 0;

pub struct IothreadCtx {
    idx: usize,
    name: String,
    epoll: Epoll,
    kick: EventFd,
    cpuset: Option<CpuSet>,
    started: AtomicBool,
    stop: AtomicBool,
    tid: Mutex<Option<JoinHandle<()>>>,
    handlers: Mutex<HashMap<u64, Arc<IothreadHandler>>>,
    next_token: AtomicU64,
}

impl IothreadCtx {
    fn worker(self: Arc<Self>) {
        // SAFETY: renicing the calling thread only.
        if unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, IOTHREAD_NICE) } != 0 {
            info!("{}: setpriority failed", self.name);
        }
        if let Some(set) = &self.cpuset {
            if nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), set).is_err() {
                error!("{}: sched_setaffinity failed", self.name);
            }
        }

        let mut eventlist = vec![EpollEvent::default(); MEVENT_MAX];
        while !self.stop.load(Ordering::Acquire) {
            let n = match self.epoll.wait(-1, &mut eventlist) {
                Ok(n) => n,
                // EINTR may happen when an io_uring fd is monitored, harmless.
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    error!("{}: return from epoll wait: {e}", self.name);
                    break;
                }
            };
            for ev in &eventlist[..n] {
                if ev.data() == KICK_TOKEN {
                    let _ = self.kick.read();
                    continue;
                }
                let handler = {
                    let map = self.handlers.lock().unwrap();
                    map.get(&ev.data()).cloned()
                };
                if let Some(h) = handler {
                    (h.run)();
                }
            }
        }
    }

    fn start(self: &Arc<Self>) -> Result<()> {
        let mut tid = self.tid.lock().unwrap();
        if self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        let me = self.clone();
        let handle = std::thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || me.worker())
            .map_err(IothreadError::Spawn)?;
        *tid = Some(handle);
        self.started.store(true, Ordering::Release);
        info!("{} started", self.name);
        Ok(())
    }

    /// Register a read-armed handler; the worker starts on the first add.
    pub fn add(self: &Arc<Self>, fd: RawFd, handler: IothreadHandler) -> Result<()> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().unwrap().insert(token, Arc::new(handler));
        self.epoll
            .ctl(ControlOperation::Add, fd, EpollEvent::new(EventSet::IN, token))
            .map_err(IothreadError::Epoll)?;
        self.start()
    }

    pub fn del(&self, fd: RawFd) -> Result<()> {
        self.epoll
            .ctl(ControlOperation::Delete, fd, EpollEvent::default())
            .map_err(IothreadError::Epoll)?;
        self.handlers.lock().unwrap().retain(|_, h| h.fd != fd);
        Ok(())
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Fixed-capacity pool of iothread contexts.
pub struct IothreadPool {
    ctxs: Mutex<Vec<Arc<IothreadCtx>>>,
}

impl Default for IothreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl IothreadPool {
    pub fn new() -> Self {
        IothreadPool {
            ctxs: Mutex::new(Vec::new()),
        }
    }

    /// Allocate `opt.num` contexts as a contiguous run, each with its own
    /// epoll fd. Workers are started lazily by the first `add`.
    pub fn create(&self, opt: &IothreadsOption) -> Result<Vec<Arc<IothreadCtx>>> {
        let mut ctxs = self.ctxs.lock().unwrap();
        let base = ctxs.len();
        if base + opt.num > IOTHREAD_NUM {
            return Err(IothreadError::PoolExhausted);
        }

        let mut new_ctxs = Vec::with_capacity(opt.num);
        for i in 0..opt.num {
            let idx = base + i;
            let ctx = Arc::new(IothreadCtx {
                idx,
                name: format!("iothr-{}-{}", idx, opt.tag),
                epoll: Epoll::new().map_err(IothreadError::Epoll)?,
                kick: EventFd::new(EFD_NONBLOCK).map_err(IothreadError::Epoll)?,
                cpuset: opt.cpusets.get(i).cloned().flatten(),
                started: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                tid: Mutex::new(None),
                handlers: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            });
            ctx.epoll
                .ctl(
                    ControlOperation::Add,
                    ctx.kick.as_raw_fd(),
                    EpollEvent::new(EventSet::IN, KICK_TOKEN),
                )
                .map_err(IothreadError::Epoll)?;
            new_ctxs.push(ctx);
        }
        ctxs.extend(new_ctxs.iter().cloned());
        Ok(new_ctxs)
    }

    /// Signal every started worker, wake it out of epoll_wait and join it.
    pub fn deinit(&self) {
        let ctxs = {
            let mut guard = self.ctxs.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for ctx in ctxs {
            if !ctx.started.load(Ordering::Acquire) {
                continue;
            }
            ctx.stop.store(true, Ordering::Release);
            let handle = ctx.tid.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = ctx.kick.write(1);
                // SAFETY: waking the worker out of its blocking epoll_wait.
                unsafe { libc::pthread_kill(handle.as_pthread_t(), libc::SIGCONT) };
                let _ = handle.join();
            }
            ctx.started.store(false, Ordering::Release);
            info!("{} stop", ctx.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn parse_defaults_to_one() {
        let opt = iothread_parse_options(None, "blk").unwrap();
        assert_eq!(opt.num, 1);
        assert!(opt.cpusets[0].is_none());
    }

    #[test]
    fn parse_number_and_affinity() {
        let opt = iothread_parse_options(Some("3@0:1:2/0:1"), "blk").unwrap();
        assert_eq!(opt.num, 3);
        let s0 = opt.cpusets[0].as_ref().unwrap();
        assert!(s0.is_set(0).unwrap() && s0.is_set(1).unwrap() && s0.is_set(2).unwrap());
        let s1 = opt.cpusets[1].as_ref().unwrap();
        assert!(s1.is_set(0).unwrap() && s1.is_set(1).unwrap());
        assert!(!s1.is_set(2).unwrap());
        assert!(opt.cpusets[2].is_none());
    }

    #[test]
    fn parse_star_skips_instance() {
        let opt = iothread_parse_options(Some("2@*/3"), "net").unwrap();
        assert_eq!(opt.num, 2);
        assert!(opt.cpusets[0].is_none());
        assert!(opt.cpusets[1].as_ref().unwrap().is_set(3).unwrap());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(iothread_parse_options(Some("zero"), "x").is_err());
        assert!(iothread_parse_options(Some("0"), "x").is_err());
        assert!(iothread_parse_options(Some("9999"), "x").is_err());
    }

    #[test]
    fn handler_runs_on_ready_fd() {
        let pool = IothreadPool::new();
        let opt = iothread_parse_options(Some("1"), "test").unwrap();
        let ctxs = pool.create(&opt).unwrap();
        let efd = EventFd::new(EFD_NONBLOCK).unwrap();
        let raw = efd.as_raw_fd();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let drain = efd.try_clone().unwrap();
        ctxs[0]
            .add(
                raw,
                IothreadHandler {
                    run: Box::new(move || {
                        let _ = drain.read();
                        hits2.fetch_add(1, Ordering::SeqCst);
                    }),
                    fd: raw,
                },
            )
            .unwrap();

        efd.write(1).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "handler never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        pool.deinit();
    }
}
