//! Power-management vuart: a PTY or raw TTY node toward the guest used to
//! signal power-off, optionally bridged to the service-VM lifecycle manager
//! socket for S5 coordination.

use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, info};
use nix::sys::select::{select, FdSet};

use crate::monitor::MonitorVmOps;
use dmioc::ioc::pty_open_virtual_uart;

const SHUTDOWN_CMD: &[u8] = b"shutdown\0";
const CMD_LEN: usize = 16;
const SERVICE_VM_SOCKET_PORT: u16 = 0x2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Pty,
    Tty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmVuartParams {
    pub node_type: NodeType,
    pub path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PmVuartError {
    #[error("invalid pm_vuart option")]
    BadOption,
    #[error("open node: {0}")]
    Open(std::io::Error),
    #[error("tty attributes: {0}")]
    Termios(std::io::Error),
    #[error("lifecycle socket: {0}")]
    Socket(std::io::Error),
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, PmVuartError>;

/// `--pm_vuart pty,/run/acrn/vuart-vm1` or `--pm_vuart tty,/dev/ttyS1`.
pub fn parse_pm_by_vuart(opts: &str) -> Result<PmVuartParams> {
    let (ty, path) = opts.split_once(',').ok_or(PmVuartError::BadOption)?;
    let node_type = match ty.to_ascii_lowercase().as_str() {
        "pty" => NodeType::Pty,
        "tty" => NodeType::Tty,
        _ => return Err(PmVuartError::BadOption),
    };
    if path.is_empty() {
        return Err(PmVuartError::BadOption);
    }
    Ok(PmVuartParams {
        node_type,
        path: path.to_string(),
    })
}

/// 115200 8N1 raw mode; one byte at a time with a short inter-byte timeout.
fn set_tty_attr(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: tcgetattr/tcsetattr on our open tty fd.
    unsafe {
        let mut tty: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut tty) < 0 {
            return Err(std::io::Error::last_os_error());
        }
        libc::cfsetospeed(&mut tty, libc::B115200);
        libc::cfsetispeed(&mut tty, libc::B115200);

        tty.c_iflag &= !(libc::IGNBRK
            | libc::BRKINT
            | libc::PARMRK
            | libc::ISTRIP
            | libc::INLCR
            | libc::IGNCR
            | libc::ICRNL
            | libc::IXON);
        tty.c_oflag &= !libc::OPOST;
        tty.c_cflag |= libc::CLOCAL | libc::CREAD | libc::CS8;
        tty.c_cflag &= !(libc::CSIZE | libc::PARENB | libc::CSTOPB | libc::CRTSCTS);
        tty.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
        tty.c_cc[libc::VMIN] = 1;
        tty.c_cc[libc::VTIME] = 1;

        libc::tcflush(fd, libc::TCIOFLUSH);
        if libc::tcsetattr(fd, libc::TCSANOW, &tty) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

struct PmVuartInner {
    node_fd: RawFd,
    write_lock: Mutex<()>,
    stop_monitor: AtomicBool,
}

pub struct PmVuart {
    inner: Arc<PmVuartInner>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    allow_trigger_s5: bool,
}

/// Accumulate bytes until a terminator or a full buffer; mirrors the
/// line-oriented command exchange with the lifecycle manager.
fn read_bytes(fd: RawFd, buf: &mut [u8], count: &mut usize, eof: &mut bool) -> bool {
    *eof = false;
    if buf.len() <= *count {
        *count = buf.len();
        return true;
    }
    loop {
        // SAFETY: reading into the remaining buffer space from our fd.
        let rc = unsafe {
            libc::read(
                fd,
                buf[*count..].as_mut_ptr().cast(),
                buf.len() - *count,
            )
        };
        if rc > 0 {
            *count += rc as usize;
            if buf[*count - 1] == 0 || buf[*count - 1] == b'\n' || *count == buf.len() {
                return true;
            }
            continue;
        }
        *eof = rc == 0;
        return false;
    }
}

fn pm_setup_socket() -> std::io::Result<std::net::TcpStream> {
    std::net::TcpStream::connect(("127.0.0.1", SERVICE_VM_SOCKET_PORT))
}

fn pm_monitor_loop(inner: Arc<PmVuartInner>, socket: std::net::TcpStream) {
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;

    let mut socket = socket;
    let sock_fd = socket.as_raw_fd();
    let node_fd = inner.node_fd;

    let mut buf_node = [0u8; CMD_LEN];
    let mut buf_sock = [0u8; CMD_LEN];
    let mut count_node = 0usize;
    let mut count_sock = 0usize;

    while !inner.stop_monitor.load(Ordering::Acquire) {
        let mut rfd = FdSet::new();
        // SAFETY: both fds outlive the loop.
        let b_node = unsafe { BorrowedFd::borrow_raw(node_fd) };
        let b_sock = unsafe { BorrowedFd::borrow_raw(sock_fd) };
        rfd.insert(b_node);
        rfd.insert(b_sock);
        let mut timeout = nix::sys::time::TimeVal::new(1, 0);
        if select(None, Some(&mut rfd), None, None, Some(&mut timeout)).is_err() {
            continue;
        }

        if rfd.contains(b_node) {
            let mut eof = false;
            if read_bytes(node_fd, &mut buf_node, &mut count_node, &mut eof) {
                info!(
                    "Received msg[{}] from User VM, count={}",
                    String::from_utf8_lossy(&buf_node[..count_node]),
                    count_node
                );
                if socket.write_all(&buf_node[..count_node]).is_err() {
                    error!("pm_monitor: write to lifecycle socket failed");
                    break;
                }
                count_node = 0;
            }
        }

        if rfd.contains(b_sock) {
            match socket.read(&mut buf_sock[count_sock..]) {
                Ok(0) => {
                    error!("socket connection to life-cycle manager closed");
                    break;
                }
                Ok(n) => {
                    count_sock += n;
                    let done = buf_sock[count_sock - 1] == 0
                        || buf_sock[count_sock - 1] == b'\n'
                        || count_sock == CMD_LEN;
                    if done {
                        info!(
                            "Received msg[{}] from life_mngr on Service VM, count={}",
                            String::from_utf8_lossy(&buf_sock[..count_sock]),
                            count_sock
                        );
                        let _guard = inner.write_lock.lock().unwrap();
                        // SAFETY: writing a short buffer to our node fd.
                        let rc = unsafe {
                            libc::write(
                                node_fd,
                                buf_sock.as_ptr().cast(),
                                count_sock,
                            )
                        };
                        if rc != count_sock as isize {
                            error!("pm_monitor: write error ret_val = {rc}");
                            break;
                        }
                        count_sock = 0;
                    }
                }
                Err(_) => {}
            }
        }
    }

    /* power off this VM if we get here */
    // SAFETY: raising a signal in our own process.
    unsafe { libc::raise(libc::SIGHUP) };
}

impl PmVuart {
    pub fn init(params: &PmVuartParams, trigger_s5: bool) -> Result<PmVuart> {
        info!(
            "pm-vuart: allow_trigger_s5: {}, type: {:?}, path: {}",
            trigger_s5, params.node_type, params.path
        );

        let node_fd = match params.node_type {
            NodeType::Pty => pty_open_virtual_uart(&params.path).map_err(PmVuartError::Open)?,
            NodeType::Tty => {
                let cpath =
                    std::ffi::CString::new(params.path.as_str()).map_err(|_| PmVuartError::BadOption)?;
                // SAFETY: plain open(2) of the configured tty node.
                let fd = unsafe {
                    libc::open(
                        cpath.as_ptr(),
                        libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
                    )
                };
                if fd < 0 {
                    return Err(PmVuartError::Open(std::io::Error::last_os_error()));
                }
                set_tty_attr(fd).map_err(PmVuartError::Termios)?;
                fd
            }
        };

        let inner = Arc::new(PmVuartInner {
            node_fd,
            write_lock: Mutex::new(()),
            stop_monitor: AtomicBool::new(false),
        });

        let monitor_thread = if trigger_s5 {
            let socket = pm_setup_socket().map_err(PmVuartError::Socket)?;
            let t_inner = inner.clone();
            Some(
                std::thread::Builder::new()
                    .name("pm_monitor".into())
                    .spawn(move || pm_monitor_loop(t_inner, socket))
                    .map_err(PmVuartError::Spawn)?,
            )
        } else {
            None
        };

        Ok(PmVuart {
            inner,
            monitor_thread: Mutex::new(monitor_thread),
            allow_trigger_s5: trigger_s5,
        })
    }

    pub fn deinit(&self) {
        if self.allow_trigger_s5 {
            self.inner.stop_monitor.store(true, Ordering::Release);
            if let Some(t) = self.monitor_thread.lock().unwrap().take() {
                let _ = t.join();
            }
        }
        // SAFETY: closing the node fd we opened.
        unsafe { libc::close(self.inner.node_fd) };
    }
}

impl MonitorVmOps for PmVuart {
    /// A stop request writes "shutdown" into the node so the guest powers
    /// itself off.
    fn stop(&self, _force: bool) -> i32 {
        info!("pm-vuart stop handler called");
        if self.inner.node_fd < 0 {
            error!("no vuart node opened!");
            return -1;
        }
        let _guard = self.inner.write_lock.lock().unwrap();
        // SAFETY: writing a constant buffer to our node fd.
        let rc = unsafe {
            libc::write(
                self.inner.node_fd,
                SHUTDOWN_CMD.as_ptr().cast(),
                SHUTDOWN_CMD.len(),
            )
        };
        if rc != SHUTDOWN_CMD.len() as isize {
            /* the monitor thread will resend on the next exchange */
            debug!("send shutdown command to User VM failed");
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_variants() {
        let p = parse_pm_by_vuart("pty,/run/acrn/vuart-vm1").unwrap();
        assert_eq!(p.node_type, NodeType::Pty);
        assert_eq!(p.path, "/run/acrn/vuart-vm1");
        let p = parse_pm_by_vuart("TTY,/dev/ttyS1").unwrap();
        assert_eq!(p.node_type, NodeType::Tty);
        assert!(parse_pm_by_vuart("serial,/dev/ttyS1").is_err());
        assert!(parse_pm_by_vuart("pty").is_err());
        assert!(parse_pm_by_vuart("pty,").is_err());
    }
}
