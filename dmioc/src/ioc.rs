//! IOC mediator device: bridges the native CBC character devices and the
//! guest's virtual UART, runs the rx/tx protocol threads and the lifecycle
//! state machine.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, info, warn};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};

use crate::cbc::*;

pub const IOC_MAX_REQUESTS: usize = 200;
const IOC_MAX_EVENTS: usize = 32;
const IOC_INIT_FD: RawFd = -1;

/* native CBC character device nodes */
const IOC_NP_PMT: &str = "/dev/cbc-pmt";
const IOC_NP_LF: &str = "/dev/cbc-lifecycle";
const IOC_NP_SIG: &str = "/dev/cbc-signals";
const IOC_NP_ESIG: &str = "/dev/cbc-early-signals";
const IOC_NP_DIAG: &str = "/dev/cbc-diagnosis";
const IOC_NP_DLT: &str = "/dev/cbc-dlt";
const IOC_NP_LIND: &str = "/dev/cbc-linda";
const IOC_NP_FLF: &str = "/tmp/ioc_fake_lifecycle";
const IOC_NP_FSIG: &str = "/tmp/ioc_fake_signal";
const IOC_NP_FRAW: &str = "/tmp/ioc_fake_raw11";

/* The signal channel needs an open-channel command before it produces
 * data; sending close would deactivate it for every guest, so only open
 * is ever sent. */
const CBC_OPEN_CHANNEL_COMMAND: [u8; 4] = [0xFD, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IocEventType {
    Invalid = 0,
    HbActive = 1,
    RamRefresh = 2,
    HbInactive = 3,
    Shutdown = 4,
    Resume = 5,
    /// only used to wake the core thread
    Knock = 6,
}

impl IocEventType {
    fn from_u8(v: u8) -> IocEventType {
        match v {
            1 => IocEventType::HbActive,
            2 => IocEventType::RamRefresh,
            3 => IocEventType::HbInactive,
            4 => IocEventType::Shutdown,
            5 => IocEventType::Resume,
            6 => IocEventType::Knock,
            _ => IocEventType::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmRequestType {
    #[default]
    None,
    Stop,
    Suspend,
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IocStateType {
    Init,
    Active,
    Suspending,
    Suspended,
}

/// The lifecycle transition table; any (state, event) pair outside it is an
/// error and is ignored.
pub const IOC_STATE_TBL: [(IocStateType, IocStateType, IocEventType); 5] = [
    (IocStateType::Init, IocStateType::Active, IocEventType::HbActive),
    (IocStateType::Active, IocStateType::Suspending, IocEventType::RamRefresh),
    (IocStateType::Active, IocStateType::Suspending, IocEventType::HbInactive),
    (IocStateType::Suspending, IocStateType::Suspended, IocEventType::Shutdown),
    (IocStateType::Suspended, IocStateType::Init, IocEventType::Resume),
];

pub fn ioc_next_state(cur: IocStateType, evt: IocEventType) -> Option<IocStateType> {
    IOC_STATE_TBL
        .iter()
        .find(|(from, _, e)| *from == cur && *e == evt)
        .map(|(_, to, _)| *to)
}

#[derive(Debug, thiserror::Error)]
pub enum IocError {
    #[error("ioc platform not supported")]
    PlatformNotSupported,
    #[error("critical channel open failed: {0}")]
    CriticalChannel(String),
    #[error("epoll: {0}")]
    Epoll(std::io::Error),
    #[error("pipe: {0}")]
    Pipe(std::io::Error),
    #[error("pty: {0}")]
    Pty(std::io::Error),
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
    #[error("invalid ioc option")]
    BadOption,
}

pub type Result<T> = std::result::Result<T, IocError>;

/// Parsed `--ioc <uart path>[,<reason>]` option. Bit 24 of the reason is
/// not part of the protocol mask; it enables the debug channels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IocParams {
    pub uart_path: String,
    pub boot_reason: u32,
    pub debug_enable: bool,
}

pub fn ioc_parse(opts: &str) -> Result<IocParams> {
    let mut parts = opts.splitn(2, ',');
    let uart_path = parts.next().filter(|s| !s.is_empty()).ok_or(IocError::BadOption)?;
    let mut boot_reason = 0u32;
    if let Some(reason) = parts.next() {
        let reason = reason.trim();
        boot_reason = if let Some(hex) = reason.strip_prefix("0x").or_else(|| reason.strip_prefix("0X")) {
            u32::from_str_radix(hex, 16).map_err(|_| IocError::BadOption)?
        } else {
            reason.parse().map_err(|_| IocError::BadOption)?
        };
    }
    let debug_enable = boot_reason & CBC_WK_RSN_DGB != 0;
    Ok(IocParams {
        uart_path: uart_path.to_string(),
        boot_reason: boot_reason & CBC_WK_RSN_ALL,
        debug_enable,
    })
}

struct ChInfo {
    fd: RawFd,
    name: String,
    on: bool,
}

struct CbcQueue {
    q: Mutex<VecDeque<Box<CbcRequest>>>,
    cond: Condvar,
}

impl CbcQueue {
    fn new() -> CbcQueue {
        CbcQueue {
            q: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, req: Box<CbcRequest>, to_head: bool) {
        let mut q = self.q.lock().unwrap();
        if to_head {
            q.push_front(req);
        } else {
            q.push_back(req);
        }
        self.cond.notify_one();
    }

    fn try_pop(&self) -> Option<Box<CbcRequest>> {
        self.q.lock().unwrap().pop_front()
    }

    fn wait_pop(&self, closing: &AtomicBool) -> Option<Box<CbcRequest>> {
        let mut q = self.q.lock().unwrap();
        loop {
            if closing.load(Ordering::Acquire) {
                return None;
            }
            if let Some(req) = q.pop_front() {
                return Some(req);
            }
            q = self.cond.wait(q).unwrap();
        }
    }

    fn notify(&self) {
        drop(self.q.lock().unwrap());
        self.cond.notify_all();
    }
}

struct IocShared {
    epoll: Epoll,
    channels: Mutex<Vec<ChInfo>>,
    cbc_enable: AtomicBool,
    closing: AtomicBool,
    boot_reason: AtomicU32,
    vm_req: Mutex<VmRequestType>,
    state: Mutex<IocStateType>,
    evt_wr: Mutex<Option<File>>,
    free_q: CbcQueue,
    rx_q: CbcQueue,
    tx_q: CbcQueue,
    wakeup_timer_cb: Box<dyn Fn(u64) + Send + Sync>,
    debug_enable: bool,
}

impl CbcIo for IocShared {
    fn ch_xmit(&self, id: usize, data: &[u8]) -> std::io::Result<usize> {
        let fd = {
            let channels = self.channels.lock().unwrap();
            match channels.get(id) {
                Some(ch) if ch.fd >= 0 => ch.fd,
                _ => return Err(std::io::ErrorKind::NotConnected.into()),
            }
        };
        let mut count = 0;
        while count < data.len() {
            // SAFETY: fd is one of our open channel fds.
            let rc = unsafe {
                libc::write(fd, data[count..].as_ptr().cast(), data.len() - count)
            };
            if rc < 0 {
                debug!("ioc write error:{}", std::io::Error::last_os_error());
                break;
            }
            count += rc as usize;
        }
        Ok(count)
    }

    fn update_event(&self, evt: IocEventType) {
        let guard = self.evt_wr.lock().unwrap();
        if let Some(mut f) = guard.as_ref() {
            if f.write_all(&[evt as u8]).is_err() {
                debug!("ioc update event failed");
            }
        }
    }

    fn set_wakeup_timer(&self, due_seconds: u64) {
        (self.wakeup_timer_cb)(due_seconds);
    }

    fn boot_reason(&self) -> u32 {
        self.boot_reason.load(Ordering::Acquire)
    }

    fn vm_req(&self) -> VmRequestType {
        *self.vm_req.lock().unwrap()
    }

    fn cbc_enabled(&self) -> bool {
        self.cbc_enable.load(Ordering::Acquire)
    }
}

fn open_native_ch(dev_name: &str) -> RawFd {
    let cpath = std::ffi::CString::new(dev_name).unwrap_or_default();
    // SAFETY: plain open(2) on a device path.
    let fd = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
        )
    };
    if fd < 0 {
        debug!(
            "ioc open {dev_name} failed:{}",
            std::io::Error::last_os_error()
        );
    }
    fd
}

/// Open a PTY master and publish the slave side under `link_path` so the
/// virtual UART can attach to it.
pub fn pty_open_virtual_uart(link_path: &str) -> std::io::Result<RawFd> {
    let cpath = c"/dev/ptmx";
    // SAFETY: opening the PTY multiplexer.
    let master = unsafe {
        libc::open(
            cpath.as_ptr(),
            libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
        )
    };
    if master < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: master is a valid ptmx fd.
    unsafe {
        if libc::grantpt(master) < 0 || libc::unlockpt(master) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(master);
            return Err(err);
        }
    }
    let mut name = [0i8; 128];
    // SAFETY: name buffer is large enough for any pts path.
    if unsafe { libc::ptsname_r(master, name.as_mut_ptr(), name.len()) } != 0 {
        let err = std::io::Error::last_os_error();
        // SAFETY: closing the fd opened above.
        unsafe { libc::close(master) };
        return Err(err);
    }
    let slave = unsafe { std::ffi::CStr::from_ptr(name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    let _ = std::fs::remove_file(link_path);
    std::os::unix::fs::symlink(&slave, link_path)?;
    Ok(master)
}

fn channel_table(debug_enable: bool) -> Vec<ChInfo> {
    let mut tbl = Vec::with_capacity(IOC_CH_MAX);
    let mut add = |name: &str, on: bool| {
        tbl.push(ChInfo {
            fd: IOC_INIT_FD,
            name: name.to_string(),
            on,
        })
    };
    add(IOC_NP_PMT, false);
    add(IOC_NP_LF, true);
    add(IOC_NP_SIG, true);
    add(IOC_NP_ESIG, false);
    add(IOC_NP_DIAG, false);
    add(IOC_NP_DLT, false);
    add(IOC_NP_LIND, false);
    for i in 0..12 {
        add(&format!("/dev/cbc-raw{i}"), true);
    }
    add("", true); /* virtual UART */
    add("", true); /* local event pipe */
    add(IOC_NP_FLF, debug_enable);
    add(IOC_NP_FSIG, debug_enable);
    add(IOC_NP_FRAW, debug_enable);
    tbl
}

pub struct IocDev {
    shared: Arc<IocShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl IocDev {
    /// Bring the mediator up: open the channels, pre-fill the free queue
    /// and start the core/rx/tx threads.
    pub fn init(
        params: &IocParams,
        wakeup_timer_cb: Box<dyn Fn(u64) + Send + Sync>,
    ) -> Result<IocDev> {
        /* The early-signal node appears once the cbc driver attached; its
         * absence means the platform has no IOC. */
        if !std::path::Path::new(IOC_NP_ESIG).exists() {
            return Err(IocError::PlatformNotSupported);
        }

        let boot_reason = if params.boot_reason == 0 {
            /* default to ignition button */
            CBC_WK_RSN_BTN
        } else {
            params.boot_reason
        };

        let shared = Arc::new(IocShared {
            epoll: Epoll::new().map_err(IocError::Epoll)?,
            channels: Mutex::new(channel_table(params.debug_enable)),
            cbc_enable: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            boot_reason: AtomicU32::new(boot_reason),
            vm_req: Mutex::new(VmRequestType::None),
            state: Mutex::new(IocStateType::Init),
            evt_wr: Mutex::new(None),
            free_q: CbcQueue::new(),
            rx_q: CbcQueue::new(),
            tx_q: CbcQueue::new(),
            wakeup_timer_cb,
            debug_enable: params.debug_enable,
        });

        for _ in 0..IOC_MAX_REQUESTS {
            shared.free_q.push(Box::new(CbcRequest::default()), false);
        }

        let evt_rd = shared.ch_init(&params.uart_path)?;

        /* Activate the signal channel; old firmware does it by itself. */
        if shared
            .ch_xmit(IOC_NATIVE_SIGNAL, &CBC_OPEN_CHANNEL_COMMAND)
            .map(|n| n == 0)
            .unwrap_or(true)
        {
            debug!("ioc sends CBC open channel command failed");
        }

        let core_shared = shared.clone();
        let core = std::thread::Builder::new()
            .name("ioc_core".into())
            .spawn(move || core_shared.core_thread(evt_rd))
            .map_err(IocError::Spawn)?;

        let rx_shared = shared.clone();
        let rx = std::thread::Builder::new()
            .name("ioc_rx".into())
            .spawn(move || rx_shared.rx_thread())
            .map_err(IocError::Spawn)?;

        let tx_shared = shared.clone();
        let tx = std::thread::Builder::new()
            .name("ioc_tx".into())
            .spawn(move || tx_shared.tx_thread())
            .map_err(IocError::Spawn)?;

        Ok(IocDev {
            shared,
            threads: Mutex::new(vec![core, rx, tx]),
        })
    }

    /// VM-manager stop request: emulate an ignition-off wakeup reason with
    /// force-S5 set.
    pub fn vm_stop_request(&self) {
        *self.shared.vm_req.lock().unwrap() = VmRequestType::Stop;
    }

    pub fn vm_suspend_request(&self) {
        *self.shared.vm_req.lock().unwrap() = VmRequestType::Suspend;
    }

    /// VM-manager resume: adopt the wakeup reason and kick the RESUME
    /// transition.
    pub fn vm_resume_request(&self, wakeup_reason: u32) -> std::result::Result<(), ()> {
        if wakeup_reason == 0 {
            debug!("ioc vm resume gets invalid wakeup reason");
            return Err(());
        }
        *self.shared.vm_req.lock().unwrap() = VmRequestType::Resume;
        self.shared
            .boot_reason
            .store(wakeup_reason, Ordering::Release);
        self.shared.update_event(IocEventType::Resume);
        Ok(())
    }

    pub fn deinit(&self) {
        let threads: Vec<JoinHandle<()>> = {
            let mut guard = self.threads.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if threads.is_empty() {
            return;
        }
        self.shared.closing.store(true, Ordering::Release);
        self.shared.update_event(IocEventType::Knock);
        self.shared.rx_q.notify();
        self.shared.tx_q.notify();
        for t in threads {
            let _ = t.join();
        }
        self.shared.ch_deinit();
    }
}

impl Drop for IocDev {
    fn drop(&mut self) {
        self.deinit();
    }
}

impl IocShared {
    /// Open the native cdevs, the virtual UART PTY and the event pipe, and
    /// arm them all on the epoll set. Returns the event-pipe read end.
    fn ch_init(&self, uart_path: &str) -> Result<File> {
        let mut evt_rd_out = None;
        let mut channels = self.channels.lock().unwrap();
        for (id, ch) in channels.iter_mut().enumerate() {
            if !ch.on {
                continue;
            }
            let fd = match id {
                IOC_NATIVE_LFCC | IOC_NATIVE_SIGNAL => open_native_ch(&ch.name),
                id if (IOC_NATIVE_RAW0..=IOC_NATIVE_RAW11).contains(&id) => {
                    open_native_ch(&ch.name)
                }
                IOC_VIRTUAL_UART => {
                    pty_open_virtual_uart(uart_path).map_err(IocError::Pty)?
                }
                IOC_LOCAL_EVENT => {
                    let mut fds = [0i32; 2];
                    // SAFETY: creating the event self-pipe.
                    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                        return Err(IocError::Pipe(std::io::Error::last_os_error()));
                    }
                    // SAFETY: taking ownership of both fresh pipe fds.
                    unsafe {
                        evt_rd_out = Some(File::from_raw_fd(fds[0]));
                        *self.evt_wr.lock().unwrap() = Some(File::from_raw_fd(fds[1]));
                    }
                    fds[0]
                }
                IOC_NATIVE_DUMMY0 | IOC_NATIVE_DUMMY1 | IOC_NATIVE_DUMMY2
                    if self.debug_enable =>
                {
                    pty_open_virtual_uart(&ch.name).unwrap_or(IOC_INIT_FD)
                }
                _ => IOC_INIT_FD,
            };

            /* lifecycle, the UART and the event pipe are critical */
            if fd < 0
                && (id == IOC_NATIVE_LFCC || id == IOC_VIRTUAL_UART || id == IOC_LOCAL_EVENT)
            {
                return Err(IocError::CriticalChannel(ch.name.clone()));
            }
            ch.fd = fd;

            if fd >= 0 {
                self.epoll
                    .ctl(
                        ControlOperation::Add,
                        fd,
                        EpollEvent::new(EventSet::IN, id as u64),
                    )
                    .map_err(IocError::Epoll)?;
            }
        }
        evt_rd_out.ok_or_else(|| IocError::Pipe(std::io::ErrorKind::NotFound.into()))
    }

    fn ch_deinit(&self) {
        let mut channels = self.channels.lock().unwrap();
        for (id, ch) in channels.iter_mut().enumerate() {
            if ch.fd >= 0 {
                /* the event-pipe read end is owned by the core thread */
                if id != IOC_LOCAL_EVENT {
                    // SAFETY: closing our own channel fd; the epoll set is
                    // already quiesced because the core thread has exited.
                    unsafe { libc::close(ch.fd) };
                }
                ch.fd = IOC_INIT_FD;
            }
        }
        *self.evt_wr.lock().unwrap() = None;
    }

    fn ch_recv(&self, id: usize, buf: &mut [u8]) -> std::io::Result<usize> {
        let fd = {
            let channels = self.channels.lock().unwrap();
            match channels.get(id) {
                Some(ch) if ch.fd >= 0 => ch.fd,
                _ => return Err(std::io::ErrorKind::NotConnected.into()),
            }
        };
        // SAFETY: reading into a caller-provided buffer from our fd.
        let rc = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if rc < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    fn send_tx_request(&self, rtype: CbcRequestType) -> std::result::Result<(), ()> {
        match self.free_q.try_pop() {
            Some(mut req) => {
                req.rtype = rtype;
                self.tx_q.push(req, true);
                Ok(())
            }
            None => {
                debug!("ioc sends a tx request failed");
                Err(())
            }
        }
    }

    fn process_shutdown_event(&self) {
        /* The native CBC driver buffers fill up if the cdevs stay open
         * without a reader, so they are closed while suspended. */
        let mut channels = self.channels.lock().unwrap();
        for (id, ch) in channels.iter_mut().enumerate() {
            if id > IOC_NATIVE_RAW11 || !ch.on || ch.fd < 0 {
                continue;
            }
            let _ = self
                .epoll
                .ctl(ControlOperation::Delete, ch.fd, EpollEvent::default());
            // SAFETY: closing our own channel fd after removing it from
            // the epoll set.
            unsafe { libc::close(ch.fd) };
            ch.fd = IOC_INIT_FD;
        }
    }

    fn process_resume_event(&self) {
        self.cbc_enable.store(true, Ordering::Release);
        let mut channels = self.channels.lock().unwrap();
        for (id, ch) in channels.iter_mut().enumerate() {
            if id > IOC_NATIVE_RAW11 || !ch.on || ch.fd != IOC_INIT_FD {
                continue;
            }
            let fd = open_native_ch(&ch.name);
            if fd >= 0 {
                ch.fd = fd;
                let _ = self.epoll.ctl(
                    ControlOperation::Add,
                    fd,
                    EpollEvent::new(EventSet::IN, id as u64),
                );
            } else {
                debug!("ioc open failed, channel:{}", ch.name);
            }
        }
        drop(channels);

        /* The signal channel comes back inactive after a resume; activate
         * it again. The guest's own S3 entry/exit is unaffected. */
        if self
            .ch_xmit(IOC_NATIVE_SIGNAL, &CBC_OPEN_CHANNEL_COMMAND)
            .map(|n| n == 0)
            .unwrap_or(true)
        {
            debug!("ioc reopen signal channel failed");
        }
    }

    fn process_events(&self, evt_rd: &mut File) {
        let mut evt = [0u8; 1];
        if evt_rd.read_exact(&mut evt).is_err() {
            debug!("ioc state gets event failed");
            return;
        }
        let evt = IocEventType::from_u8(evt[0]);
        if evt == IocEventType::Knock {
            return;
        }

        let cur = *self.state.lock().unwrap();
        let Some(next) = ioc_next_state(cur, evt) else {
            warn!("ioc state transition rejected: {cur:?} on {evt:?}");
            return;
        };

        let ok = match evt {
            IocEventType::HbActive => self.send_tx_request(CbcRequestType::UosActive).is_ok(),
            IocEventType::RamRefresh | IocEventType::HbInactive => {
                /* rx and tx stop handling protocol packets */
                self.cbc_enable.store(false, Ordering::Release);
                self.send_tx_request(CbcRequestType::UosInactive).is_ok()
            }
            IocEventType::Shutdown => {
                self.process_shutdown_event();
                true
            }
            IocEventType::Resume => {
                self.process_resume_event();
                true
            }
            _ => false,
        };

        if ok {
            *self.state.lock().unwrap() = next;
            info!("ioc state {cur:?} -> {next:?}");
        } else {
            debug!("ioc state switching failed, {cur:?} -> {next:?}");
        }
    }

    fn process_rx(&self, ring: &mut CbcRing, unpacker: &mut CbcUnpacker) {
        /* the virtual UART delivers bytes one at a time */
        let mut c = [0u8; 1];
        match self.ch_recv(IOC_VIRTUAL_UART, &mut c) {
            Ok(1) => {}
            _ => return,
        }
        if ring.copy_to_ring(&c).is_err() {
            return;
        }
        let mut frames: Vec<([u8; CBC_MAX_FRAME_SIZE], usize, usize)> = Vec::new();
        unpacker.unpack(ring, |frame, srv_len| {
            let mut buf = [0u8; CBC_MAX_FRAME_SIZE];
            buf[..frame.len()].copy_from_slice(frame);
            frames.push((buf, frame.len(), srv_len));
        });
        for (buf, link_len, srv_len) in frames {
            match self.free_q.try_pop() {
                Some(mut req) => {
                    req.buf = buf;
                    req.link_len = link_len;
                    req.srv_len = srv_len;
                    req.rtype = CbcRequestType::Prot;
                    self.rx_q.push(req, false);
                }
                None => warn!("ioc queue is full!!, drop the data"),
            }
        }
    }

    fn process_tx(&self, id: usize) {
        let Some(mut req) = self.free_q.try_pop() else {
            warn!("ioc free queue is full!!, drop the data");
            return;
        };

        /* a native cdev read returns one whole CBC service frame */
        let count = {
            let start = CBC_SRV_POS;
            let end = start + CBC_MAX_SERVICE_SIZE;
            match self.ch_recv(id, &mut req.buf[start..end]) {
                Ok(n) if n > 0 => n,
                _ => {
                    self.free_q.push(req, false);
                    debug!("ioc channel={id},recv error");
                    return;
                }
            }
        };

        req.srv_len = count;
        req.link_len = 0;
        req.rtype = CbcRequestType::Prot;
        req.id = match id {
            IOC_NATIVE_DUMMY0 => IOC_NATIVE_LFCC,
            IOC_NATIVE_DUMMY1 => IOC_NATIVE_SIGNAL,
            IOC_NATIVE_DUMMY2 => IOC_NATIVE_RAW11,
            _ => id,
        };
        self.tx_q.push(req, false);
    }

    fn core_thread(self: Arc<Self>, mut evt_rd: File) {
        let mut ring = CbcRing::default();
        let mut unpacker = CbcUnpacker::default();
        let mut eventlist = vec![EpollEvent::default(); IOC_MAX_EVENTS];

        while !self.closing.load(Ordering::Acquire) {
            let n = match self.epoll.wait(-1, &mut eventlist) {
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    debug!("ioc epoll wait error:{e}, exit ioc core");
                    return;
                }
            };
            for ev in &eventlist[..n] {
                let id = ev.data() as usize;
                match id {
                    IOC_VIRTUAL_UART => self.process_rx(&mut ring, &mut unpacker),
                    IOC_LOCAL_EVENT => self.process_events(&mut evt_rd),
                    IOC_NATIVE_LFCC
                    | IOC_NATIVE_SIGNAL
                    | IOC_NATIVE_RAW0..=IOC_NATIVE_RAW11
                    | IOC_NATIVE_DUMMY0..=IOC_NATIVE_DUMMY2 => self.process_tx(id),
                    _ => debug!("ioc dispatch got wrong channel:{id}"),
                }
            }
        }
    }

    fn rx_thread(self: Arc<Self>) {
        let mut ctx = CbcPktCtx::default();
        let mut cfg = default_rx_config();
        while let Some(mut req) = self.rx_q.wait_pop(&self.closing) {
            let route = cbc_rx_handler(&mut ctx, &mut req, &mut cfg, &*self);
            match route {
                CbcQueueType::Tx => self.tx_q.push(req, true),
                _ => self.free_q.push(req, false),
            }
        }
    }

    fn tx_thread(self: Arc<Self>) {
        let mut ctx = CbcPktCtx::default();
        let mut cfg = default_tx_config();
        while let Some(mut req) = self.tx_q.wait_pop(&self.closing) {
            let route = cbc_tx_handler(&mut ctx, &mut req, &mut cfg, &*self);
            match route {
                CbcQueueType::Rx => self.rx_q.push(req, true),
                _ => self.free_q.push(req, false),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_listed_transitions_are_valid() {
        use IocEventType::*;
        use IocStateType::*;
        assert_eq!(ioc_next_state(Init, HbActive), Some(Active));
        assert_eq!(ioc_next_state(Active, RamRefresh), Some(Suspending));
        assert_eq!(ioc_next_state(Active, HbInactive), Some(Suspending));
        assert_eq!(ioc_next_state(Suspending, Shutdown), Some(Suspended));
        assert_eq!(ioc_next_state(Suspended, Resume), Some(Init));

        assert_eq!(ioc_next_state(Init, Shutdown), None);
        assert_eq!(ioc_next_state(Active, Resume), None);
        assert_eq!(ioc_next_state(Suspended, HbActive), None);
        assert_eq!(ioc_next_state(Suspending, RamRefresh), None);
    }

    #[test]
    fn parse_uart_path_and_reason() {
        let p = ioc_parse("/run/acrn/ioc_vm1,0x20").unwrap();
        assert_eq!(p.uart_path, "/run/acrn/ioc_vm1");
        assert_eq!(p.boot_reason, 0x20);
        assert!(!p.debug_enable);

        let p = ioc_parse("/run/acrn/ioc_vm1").unwrap();
        assert_eq!(p.boot_reason, 0);

        /* the debug bit is split off and masked from the reason */
        let p = ioc_parse("/run/acrn/ioc_vm1,0x1000020").unwrap();
        assert!(p.debug_enable);
        assert_eq!(p.boot_reason, 0x20);

        assert!(ioc_parse("").is_err());
        assert!(ioc_parse("/x,notanumber").is_err());
    }

    #[test]
    fn queue_fifo_and_head_insert() {
        let q = CbcQueue::new();
        let mut a = Box::new(CbcRequest::default());
        a.srv_len = 1;
        let mut b = Box::new(CbcRequest::default());
        b.srv_len = 2;
        let mut c = Box::new(CbcRequest::default());
        c.srv_len = 3;
        q.push(a, false);
        q.push(b, false);
        q.push(c, true);
        assert_eq!(q.try_pop().unwrap().srv_len, 3);
        assert_eq!(q.try_pop().unwrap().srv_len, 1);
        assert_eq!(q.try_pop().unwrap().srv_len, 2);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn wait_pop_returns_none_on_close() {
        let q = Arc::new(CbcQueue::new());
        let closing = Arc::new(AtomicBool::new(false));
        let q2 = q.clone();
        let closing2 = closing.clone();
        let t = std::thread::spawn(move || q2.wait_pop(&closing2));
        std::thread::sleep(std::time::Duration::from_millis(20));
        closing.store(true, Ordering::Release);
        q.notify();
        assert!(t.join().unwrap().is_none());
    }

    #[test]
    fn channel_table_shape() {
        let tbl = channel_table(false);
        assert_eq!(tbl.len(), IOC_CH_MAX);
        assert!(tbl[IOC_NATIVE_LFCC].on);
        assert!(tbl[IOC_NATIVE_SIGNAL].on);
        assert!(!tbl[IOC_NATIVE_PMT].on);
        assert!(!tbl[IOC_NATIVE_DUMMY0].on);
        assert_eq!(tbl[IOC_NATIVE_RAW0].name, "/dev/cbc-raw0");
        assert_eq!(tbl[IOC_NATIVE_RAW11].name, "/dev/cbc-raw11");
        let tbl = channel_table(true);
        assert!(tbl[IOC_NATIVE_DUMMY0].on);
    }
}
