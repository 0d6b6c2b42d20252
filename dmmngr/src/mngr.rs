//! Management IPC plumbing: a per-process server socket under
//! `/run/acrn/mngr/<name>.<pid>.socket` with a listener thread and a
//! select()-based poller, and a client that connects to the first socket
//! matching a name.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, info, warn};
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use zerocopy::{FromBytes, IntoBytes};

use crate::msg::{MngrMsg, MNGR_MSG_SIZE};
use crate::ACRN_DM_SOCK_PATH;

const MNGR_MAX_CLIENT: usize = 4;
const CLIENT_BUF_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum MngrError {
    #[error("socket dir: {0}")]
    SockDir(std::io::Error),
    #[error("bind/listen: {0}")]
    Bind(std::io::Error),
    #[error("no server socket found for {0}")]
    NotFound(String),
    #[error("connect: {0}")]
    Connect(std::io::Error),
    #[error("send: {0}")]
    Send(std::io::Error),
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, MngrError>;

/// Message handler; a returned message is written back to the requesting
/// client as the ack.
pub type Handler = Box<dyn Fn(&MngrMsg) -> Option<MngrMsg> + Send + Sync>;

struct ServerInner {
    listener: UnixListener,
    clients: Mutex<Vec<UnixStream>>,
    handlers: Mutex<HashMap<u32, Handler>>,
    running: AtomicBool,
    path: PathBuf,
}

pub struct MngrServer {
    inner: Arc<ServerInner>,
    listen_thread: Option<JoinHandle<()>>,
    poll_thread: Option<JoinHandle<()>>,
}

fn check_dir(path: &Path) -> std::io::Result<()> {
    match std::fs::metadata(path) {
        Ok(md) if md.is_dir() => Ok(()),
        Ok(_) => Err(std::io::ErrorKind::AlreadyExists.into()),
        Err(_) => std::fs::create_dir_all(path),
    }
}

fn parse_records(
    buf: &[u8],
    handlers: &Mutex<HashMap<u32, Handler>>,
    client: &mut UnixStream,
) {
    let mut handled = false;
    let mut last_id = 0;
    for rec in buf.chunks_exact(MNGR_MSG_SIZE) {
        let Ok(msg) = MngrMsg::read_from_bytes(rec) else {
            continue;
        };
        if !msg.is_valid() {
            return;
        }
        last_id = msg.msgid;
        let ack = {
            let handlers = handlers.lock().unwrap();
            handlers.get(&msg.msgid).map(|h| h(&msg))
        };
        match ack {
            Some(Some(ack)) => {
                if client.write_all(ack.as_bytes()).is_err() {
                    debug!("mngr: ack write failed");
                }
                handled = true;
            }
            Some(None) => handled = true,
            None => {}
        }
    }
    if !handled {
        warn!("Unknown message id: {last_id}");
    }
}

impl MngrServer {
    /// Create `<dir>/<name>.<pid>.socket` and start the listener and
    /// poller threads.
    pub fn open_at(dir: &Path, name: &str) -> Result<MngrServer> {
        check_dir(dir).map_err(MngrError::SockDir)?;

        let path = dir.join(format!("{}.{}.socket", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path).map_err(MngrError::Bind)?;

        let inner = Arc::new(ServerInner {
            listener,
            clients: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
            path,
        });

        let l_inner = inner.clone();
        let listen_thread = std::thread::Builder::new()
            .name("mngr_listen".into())
            .spawn(move || {
                info!("Listening {}...", l_inner.path.display());
                while l_inner.running.load(Ordering::Acquire) {
                    if l_inner.clients.lock().unwrap().len() >= MNGR_MAX_CLIENT {
                        std::thread::sleep(Duration::from_millis(500));
                        continue;
                    }
                    match l_inner.listener.accept() {
                        Ok((stream, _)) => {
                            debug!("Connected:{}", stream.as_raw_fd());
                            l_inner.clients.lock().unwrap().push(stream);
                        }
                        Err(_) => {
                            if l_inner.running.load(Ordering::Acquire) {
                                std::thread::sleep(Duration::from_millis(500));
                            }
                        }
                    }
                }
                info!("Stop listening {}...", l_inner.path.display());
            })
            .map_err(MngrError::Spawn)?;

        let p_inner = inner.clone();
        let poll_thread = std::thread::Builder::new()
            .name("mngr_poll".into())
            .spawn(move || {
                let mut buf = vec![0u8; CLIENT_BUF_LEN];
                while p_inner.running.load(Ordering::Acquire) {
                    let fds: Vec<i32> = {
                        let clients = p_inner.clients.lock().unwrap();
                        clients.iter().map(|c| c.as_raw_fd()).collect()
                    };

                    let mut rfd = FdSet::new();
                    // SAFETY: the fds stay open while they are in the
                    // clients list; the poller is the only remover.
                    let borrowed: Vec<BorrowedFd> = fds
                        .iter()
                        .map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) })
                        .collect();
                    for fd in &borrowed {
                        rfd.insert(*fd);
                    }
                    let mut timeout = TimeVal::new(0, 10000);
                    let _ = select(None, Some(&mut rfd), None, None, Some(&mut timeout));

                    let ready: Vec<i32> = borrowed
                        .iter()
                        .filter(|fd| rfd.contains(**fd))
                        .map(|fd| fd.as_raw_fd())
                        .collect();

                    for fd in ready {
                        let stream = {
                            let clients = p_inner.clients.lock().unwrap();
                            clients
                                .iter()
                                .find(|c| c.as_raw_fd() == fd)
                                .and_then(|c| c.try_clone().ok())
                        };
                        let Some(mut stream) = stream else { continue };
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => {
                                debug!("Disconnect({fd})!");
                                p_inner
                                    .clients
                                    .lock()
                                    .unwrap()
                                    .retain(|c| c.as_raw_fd() != fd);
                            }
                            Ok(len) => {
                                if len == CLIENT_BUF_LEN {
                                    warn!("mngr: client buffer overflow");
                                    continue;
                                }
                                if len % MNGR_MSG_SIZE != 0 {
                                    debug!("mngr: short read of {len} bytes");
                                }
                                parse_records(&buf[..len], &p_inner.handlers, &mut stream);
                            }
                        }
                    }
                }
            })
            .map_err(MngrError::Spawn)?;

        Ok(MngrServer {
            inner,
            listen_thread: Some(listen_thread),
            poll_thread: Some(poll_thread),
        })
    }

    pub fn open(name: &str) -> Result<MngrServer> {
        Self::open_at(Path::new(ACRN_DM_SOCK_PATH), name)
    }

    pub fn add_handler<F>(&self, msgid: u32, handler: F)
    where
        F: Fn(&MngrMsg) -> Option<MngrMsg> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(msgid, Box::new(handler));
    }

    pub fn close(&mut self) {
        self.inner.running.store(false, Ordering::Release);
        // Unblock accept(2).
        // SAFETY: shutting down our own listener fd.
        unsafe { libc::shutdown(self.inner.listener.as_raw_fd(), libc::SHUT_RDWR) };
        if let Some(t) = self.listen_thread.take() {
            let _ = t.join();
        }
        if let Some(t) = self.poll_thread.take() {
            let _ = t.join();
        }
        self.inner.clients.lock().unwrap().clear();
        let _ = std::fs::remove_file(&self.inner.path);
    }
}

impl Drop for MngrServer {
    fn drop(&mut self) {
        if self.listen_thread.is_some() {
            self.close();
        }
    }
}

pub struct MngrClient {
    stream: UnixStream,
}

impl MngrClient {
    /// Scan `dir` for `<name>.*.socket` and connect to the first match.
    pub fn open_at(dir: &Path, name: &str) -> Result<MngrClient> {
        let entries = std::fs::read_dir(dir).map_err(MngrError::SockDir)?;
        let prefix = format!("{name}.");
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            if fname.starts_with(&prefix) && fname.ends_with(".socket") {
                let stream =
                    UnixStream::connect(entry.path()).map_err(MngrError::Connect)?;
                return Ok(MngrClient { stream });
            }
        }
        Err(MngrError::NotFound(name.to_string()))
    }

    pub fn open(name: &str) -> Result<MngrClient> {
        Self::open_at(Path::new(ACRN_DM_SOCK_PATH), name)
    }

    fn wait_fd(&self, for_read: bool, timeout_secs: u32) -> bool {
        let fd = self.stream.as_raw_fd();
        // SAFETY: our own connected stream fd.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut set = FdSet::new();
        set.insert(borrowed);
        let mut timeout = TimeVal::new(timeout_secs as i64, 0);
        let r = if for_read {
            if timeout_secs != 0 {
                select(None, Some(&mut set), None, None, Some(&mut timeout))
            } else {
                select(None, Some(&mut set), None, None, None)
            }
        } else if timeout_secs != 0 {
            select(None, None, Some(&mut set), None, Some(&mut timeout))
        } else {
            select(None, None, Some(&mut set), None, None)
        };
        r.is_ok() && set.contains(borrowed)
    }

    /// Write one full record; with `ack` given, wait up to `timeout_secs`
    /// (0 blocks) for a single reply record. Returns the ack length, 0 on a
    /// clean timeout.
    pub fn send_msg(
        &mut self,
        req: &MngrMsg,
        ack: Option<&mut MngrMsg>,
        timeout_secs: u32,
    ) -> Result<usize> {
        if !self.wait_fd(false, timeout_secs) {
            return Err(MngrError::Send(std::io::ErrorKind::TimedOut.into()));
        }
        self.stream
            .write_all(req.as_bytes())
            .map_err(MngrError::Send)?;

        let Some(ack) = ack else {
            return Ok(0);
        };

        if !self.wait_fd(true, timeout_secs) {
            return Ok(0);
        }
        let mut buf = [0u8; MNGR_MSG_SIZE];
        self.stream.read_exact(&mut buf).map_err(MngrError::Send)?;
        *ack = MngrMsg::read_from_bytes(&buf[..]).expect("record size matches");
        Ok(MNGR_MSG_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{DM_QUERY, DM_STOP};

    #[test]
    fn round_trip_request_ack() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = MngrServer::open_at(dir.path(), "vm1.monitor").unwrap();
        server.add_handler(DM_QUERY, |req| {
            let mut ack = MngrMsg::ack_of(req);
            ack.set_state(0);
            Some(ack)
        });

        let mut client = MngrClient::open_at(dir.path(), "vm1").unwrap();
        let req = MngrMsg::new(DM_QUERY);
        let mut ack = MngrMsg::new(0);
        let n = client.send_msg(&req, Some(&mut ack), 2).unwrap();
        assert_eq!(n, MNGR_MSG_SIZE);
        assert_eq!(ack.msgid, DM_QUERY);
        assert_eq!(ack.state(), 0);

        server.close();
    }

    #[test]
    fn unknown_id_times_out_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = MngrServer::open_at(dir.path(), "vm2.monitor").unwrap();
        server.add_handler(DM_QUERY, |req| Some(MngrMsg::ack_of(req)));

        let mut client = MngrClient::open_at(dir.path(), "vm2").unwrap();
        let req = MngrMsg::new(DM_STOP);
        let mut ack = MngrMsg::new(0);
        /* no handler: the caller gets 0 bytes, never a late ack */
        let n = client.send_msg(&req, Some(&mut ack), 1).unwrap();
        assert_eq!(n, 0);

        server.close();
    }

    #[test]
    fn client_scan_requires_matching_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let _server = MngrServer::open_at(dir.path(), "alpha.monitor").unwrap();
        assert!(MngrClient::open_at(dir.path(), "alpha").is_ok());
        assert!(matches!(
            MngrClient::open_at(dir.path(), "beta"),
            Err(MngrError::NotFound(_))
        ));
    }
}
