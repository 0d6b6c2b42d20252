//! Client for an external software TPM (swtpm): a control channel on a unix
//! stream socket, and a data channel created from a socketpair whose far end
//! is handed to the emulator with SCM_RIGHTS.

use std::io::{IoSlice, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Mutex;

use byteorder::{BigEndian, ByteOrder};
use log::error;
use nix::sys::socket::{sendmsg, socketpair, AddressFamily, ControlMessage, MsgFlags, SockFlag, SockType};

/* TPM2 definitions */
const TPM_ORD_CONTINUE_SELFTEST: u32 = 0x53;
const TPM_TAG_RSP_COMMAND: u16 = 0xc4;
const TPM_FAIL: u32 = 9;
const PTM_INIT_FLAG_DELETE_VOLATILE: u32 = 1 << 0;

pub const TPM_CMD_HDR_SIZE: usize = 10;

/* control channel command ids, aligned with the swtpm definition */
const CMD_INIT: u32 = 0x02;
const CMD_SHUTDOWN: u32 = 0x03;
const CMD_GET_TPMESTABLISHED: u32 = 0x04;
const CMD_SET_LOCALITY: u32 = 0x05;
const CMD_CANCEL_TPM_CMD: u32 = 0x09;
const CMD_RESET_TPMESTABLISHED: u32 = 0x0b;
const CMD_STOP: u32 = 0x0e;
const CMD_SET_DATAFD: u32 = 0x10;
const CMD_SET_BUFFERSIZE: u32 = 0x11;

#[derive(Debug, thiserror::Error)]
pub enum SwtpmError {
    #[error("ctrl channel: {0}")]
    Ctrl(std::io::Error),
    #[error("cmd channel: {0}")]
    Cmd(std::io::Error),
    #[error("socketpair: {0}")]
    SocketPair(nix::Error),
    #[error("swtpm returned 0x{0:x} for control command {1:#x}")]
    TpmResult(u32, u32),
    #[error("response larger than the output buffer")]
    OversizedResponse,
    #[error("short control response")]
    ShortResponse,
}

pub type Result<T> = std::result::Result<T, SwtpmError>;

pub fn tpm_cmd_get_size(b: &[u8]) -> u32 {
    BigEndian::read_u32(&b[2..6])
}

pub fn tpm_cmd_get_ordinal(b: &[u8]) -> u32 {
    BigEndian::read_u32(&b[6..10])
}

pub fn tpm_cmd_get_errcode(b: &[u8]) -> u32 {
    BigEndian::read_u32(&b[6..10])
}

fn tpm_is_selftest(input: &[u8]) -> bool {
    input.len() >= TPM_CMD_HDR_SIZE && tpm_cmd_get_ordinal(input) == TPM_ORD_CONTINUE_SELFTEST
}

/// A minimal failure reply for when the emulator channel is gone.
pub fn write_fatal_error_response(out: &mut [u8]) {
    if out.len() >= TPM_CMD_HDR_SIZE {
        BigEndian::write_u16(&mut out[0..2], TPM_TAG_RSP_COMMAND);
        BigEndian::write_u32(&mut out[2..6], TPM_CMD_HDR_SIZE as u32);
        BigEndian::write_u32(&mut out[6..10], TPM_FAIL);
    }
}

/// What the CRB frontend needs from a TPM backend.
pub trait TpmEmulator: Send + Sync {
    /// Deliver one command; the response lands in `out`. A failure here is
    /// a device-fatal condition for the frontend.
    fn handle_request(&self, locty: u8, input: &[u8], out: &mut [u8]) -> Result<usize>;
    fn cancel_cmd(&self);
    fn get_tpm_established_flag(&self) -> bool;
    fn reset_tpm_established_flag(&self) -> Result<()>;
    /// stop -> set buffer size -> init; that order is part of the contract.
    fn startup(&self, buffersize: u32, is_resume: bool) -> Result<()>;
}

struct Cached {
    established: bool,
    valid: bool,
}

pub struct SwtpmClient {
    ctrl: Mutex<UnixStream>,
    cmd: Mutex<UnixStream>,
    cur_locty: Mutex<u8>,
    established: Mutex<Cached>,
}

fn read_exact_stream(stream: &mut UnixStream, buf: &mut [u8]) -> std::io::Result<()> {
    stream.read_exact(buf)
}

fn write_all_stream(stream: &mut UnixStream, buf: &[u8]) -> std::io::Result<()> {
    stream.write_all(buf)
}

impl SwtpmClient {
    /// Connect the control channel and negotiate the command channel.
    pub fn connect(sock_path: &str) -> Result<SwtpmClient> {
        let ctrl = UnixStream::connect(sock_path).map_err(SwtpmError::Ctrl)?;

        let client = SwtpmClient {
            ctrl: Mutex::new(ctrl),
            /* placeholder until SET_DATAFD completes */
            cmd: Mutex::new(UnixStream::pair().map_err(SwtpmError::Cmd)?.0),
            cur_locty: Mutex::new(255),
            established: Mutex::new(Cached {
                established: false,
                valid: false,
            }),
        };

        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(SwtpmError::SocketPair)?;

        let mut resp = [0u8; 4];
        client.ctrlcmd(CMD_SET_DATAFD, &[], &mut resp, Some(&theirs))?;
        let res = BigEndian::read_u32(&resp);
        if res != 0 {
            return Err(SwtpmError::TpmResult(res, CMD_SET_DATAFD));
        }
        drop(theirs);
        *client.cmd.lock().unwrap() = UnixStream::from(ours);

        Ok(client)
    }

    /// One control transaction: 32-bit big-endian command id, request
    /// payload, then read the full response payload.
    fn ctrlcmd(
        &self,
        cmd: u32,
        msg_in: &[u8],
        msg_out: &mut [u8],
        pass_fd: Option<&OwnedFd>,
    ) -> Result<()> {
        let mut ctrl = self.ctrl.lock().unwrap();

        let mut buf = Vec::with_capacity(4 + msg_in.len());
        buf.extend_from_slice(&cmd.to_be_bytes());
        buf.extend_from_slice(msg_in);

        match pass_fd {
            Some(fd) => {
                let fds = [fd.as_raw_fd()];
                let cmsg = [ControlMessage::ScmRights(&fds)];
                let iov = [IoSlice::new(&buf)];
                sendmsg::<()>(ctrl.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                    .map_err(|e| SwtpmError::Ctrl(std::io::Error::from(e)))?;
            }
            None => write_all_stream(&mut ctrl, &buf).map_err(SwtpmError::Ctrl)?,
        }

        if !msg_out.is_empty() {
            read_exact_stream(&mut ctrl, msg_out).map_err(SwtpmError::Ctrl)?;
        }
        Ok(())
    }

    fn ctrlcmd_simple(&self, cmd: u32, msg_in: &[u8]) -> Result<()> {
        let mut resp = [0u8; 4];
        self.ctrlcmd(cmd, msg_in, &mut resp, None)?;
        let res = BigEndian::read_u32(&resp);
        if res != 0 {
            return Err(SwtpmError::TpmResult(res, cmd));
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.ctrlcmd_simple(CMD_STOP, &[])
    }

    pub fn shutdown(&self) {
        if let Err(e) = self.ctrlcmd_simple(CMD_SHUTDOWN, &[]) {
            error!("swtpm: could not cleanly shutdown the TPM: {e}");
        }
    }

    fn set_buffer_size(&self, wanted_size: u32) -> Result<u32> {
        let req = wanted_size.to_be_bytes();
        let mut resp = [0u8; 16];
        self.ctrlcmd(CMD_SET_BUFFERSIZE, &req, &mut resp, None)?;
        let res = BigEndian::read_u32(&resp[0..4]);
        if res != 0 {
            return Err(SwtpmError::TpmResult(res, CMD_SET_BUFFERSIZE));
        }
        Ok(BigEndian::read_u32(&resp[4..8]))
    }

    fn set_locality(&self, locty: u8) -> Result<()> {
        let mut cur = self.cur_locty.lock().unwrap();
        if *cur == locty {
            return Ok(());
        }
        let req = [locty, 0, 0, 0];
        self.ctrlcmd_simple(CMD_SET_LOCALITY, &req)?;
        *cur = locty;
        Ok(())
    }

    /// Data-plane exchange: write the whole command, read the reply header,
    /// then the remaining bytes; partial transfers are looped over.
    fn cmdcmd(&self, input: &[u8], out: &mut [u8]) -> Result<usize> {
        let selftest = tpm_is_selftest(input);
        let mut cmd = self.cmd.lock().unwrap();

        write_all_stream(&mut cmd, input).map_err(SwtpmError::Cmd)?;

        read_exact_stream(&mut cmd, &mut out[..TPM_CMD_HDR_SIZE]).map_err(SwtpmError::Cmd)?;
        let size = tpm_cmd_get_size(out) as usize;
        if size > out.len() {
            error!("swtpm response size {size} is larger than the output buffer");
            return Err(SwtpmError::OversizedResponse);
        }
        if size < TPM_CMD_HDR_SIZE {
            return Err(SwtpmError::ShortResponse);
        }
        read_exact_stream(&mut cmd, &mut out[TPM_CMD_HDR_SIZE..size]).map_err(SwtpmError::Cmd)?;

        if selftest {
            let _selftest_done = tpm_cmd_get_errcode(out) == 0;
        }
        Ok(size)
    }
}

impl TpmEmulator for SwtpmClient {
    fn handle_request(&self, locty: u8, input: &[u8], out: &mut [u8]) -> Result<usize> {
        self.set_locality(locty)?;
        self.cmdcmd(input, out)
    }

    fn cancel_cmd(&self) {
        if let Err(e) = self.ctrlcmd_simple(CMD_CANCEL_TPM_CMD, &[]) {
            error!("swtpm: could not cancel command: {e}");
        }
    }

    fn get_tpm_established_flag(&self) -> bool {
        {
            let cached = self.established.lock().unwrap();
            if cached.valid {
                return cached.established;
            }
        }
        let mut resp = [0u8; 8];
        if let Err(e) = self.ctrlcmd(CMD_GET_TPMESTABLISHED, &[], &mut resp, None) {
            error!("swtpm: could not get the TPM established flag: {e}");
            return false;
        }
        let flag = resp[4] != 0;
        let mut cached = self.established.lock().unwrap();
        cached.established = flag;
        cached.valid = true;
        flag
    }

    fn reset_tpm_established_flag(&self) -> Result<()> {
        let loc = *self.cur_locty.lock().unwrap();
        let req = [loc, 0, 0, 0];
        self.ctrlcmd_simple(CMD_RESET_TPMESTABLISHED, &req)?;
        self.established.lock().unwrap().valid = false;
        Ok(())
    }

    fn startup(&self, buffersize: u32, is_resume: bool) -> Result<()> {
        /* swtpm only accepts a buffer size while stopped */
        self.stop()?;
        if buffersize != 0 {
            self.set_buffer_size(buffersize)?;
        }
        let flags: u32 = if is_resume {
            PTM_INIT_FLAG_DELETE_VOLATILE
        } else {
            0
        };
        self.ctrlcmd_simple(CMD_INIT, &flags.to_be_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{recvmsg, ControlMessageOwned};
    use std::io::IoSliceMut;
    use std::os::fd::RawFd;
    use std::os::unix::io::FromRawFd;
    use std::os::unix::net::UnixListener;

    #[test]
    fn fatal_response_is_a_minimal_fail_reply() {
        let mut out = [0u8; 16];
        write_fatal_error_response(&mut out);
        assert_eq!(BigEndian::read_u16(&out[0..2]), TPM_TAG_RSP_COMMAND);
        assert_eq!(tpm_cmd_get_size(&out), TPM_CMD_HDR_SIZE as u32);
        assert_eq!(tpm_cmd_get_errcode(&out), TPM_FAIL);
    }

    #[test]
    fn header_parsers_are_big_endian() {
        let mut b = [0u8; 10];
        b[0] = 0x80;
        b[1] = 0x01;
        BigEndian::write_u32(&mut b[2..6], 0x123);
        BigEndian::write_u32(&mut b[6..10], TPM_ORD_CONTINUE_SELFTEST);
        assert_eq!(tpm_cmd_get_size(&b), 0x123);
        assert!(tpm_is_selftest(&b));
    }

    /// Enough of swtpm to exercise the connect/startup/request flows.
    fn mock_swtpm(listener: UnixListener) -> std::thread::JoinHandle<Vec<u32>> {
        std::thread::spawn(move || {
            let (mut ctrl, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            let mut datafd: Option<RawFd> = None;
            loop {
                let mut hdr = [0u8; 4];
                // SET_DATAFD arrives with an fd in ancillary data
                let mut space = nix::cmsg_space!([RawFd; 1]);
                let mut iov = [IoSliceMut::new(&mut hdr)];
                let msg = match recvmsg::<()>(
                    ctrl.as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::empty(),
                ) {
                    Ok(m) => m,
                    Err(_) => break,
                };
                if msg.bytes == 0 {
                    break;
                }
                for c in msg.cmsgs().unwrap() {
                    if let ControlMessageOwned::ScmRights(fds) = c {
                        datafd = fds.first().copied();
                    }
                }
                let cmd = u32::from_be_bytes(hdr);
                seen.push(cmd);
                let req_len = match cmd {
                    CMD_INIT | CMD_SET_BUFFERSIZE | CMD_SET_LOCALITY
                    | CMD_RESET_TPMESTABLISHED => 4,
                    _ => 0,
                };
                let mut req = vec![0u8; req_len];
                if req_len > 0 {
                    ctrl.read_exact(&mut req).unwrap();
                }
                match cmd {
                    CMD_SET_BUFFERSIZE => {
                        let mut resp = [0u8; 16];
                        resp[4..8].copy_from_slice(&req[..4]);
                        ctrl.write_all(&resp).unwrap();
                    }
                    CMD_GET_TPMESTABLISHED => {
                        let mut resp = [0u8; 8];
                        resp[4] = 1;
                        ctrl.write_all(&resp).unwrap();
                    }
                    CMD_SHUTDOWN => {
                        ctrl.write_all(&[0u8; 4]).unwrap();
                        break;
                    }
                    _ => ctrl.write_all(&[0u8; 4]).unwrap(),
                }
                /* serve the data plane concurrently once the TPM is up */
                if cmd == CMD_INIT {
                    if let Some(fd) = datafd.take() {
                        std::thread::spawn(move || {
                            // SAFETY: the mock owns the received fd.
                            let mut data: UnixStream = unsafe { UnixStream::from_raw_fd(fd) };
                            let mut h = [0u8; TPM_CMD_HDR_SIZE];
                            data.read_exact(&mut h).unwrap();
                            let sz = tpm_cmd_get_size(&h) as usize;
                            let mut rest = vec![0u8; sz - TPM_CMD_HDR_SIZE];
                            data.read_exact(&mut rest).unwrap();
                            let mut resp = vec![0u8; 12];
                            BigEndian::write_u16(&mut resp[0..2], 0x8001);
                            BigEndian::write_u32(&mut resp[2..6], 12);
                            resp[10] = 0xaa;
                            resp[11] = 0xbb;
                            data.write_all(&resp).unwrap();
                        });
                    }
                }
            }
            seen
        })
    }

    #[test]
    fn connect_startup_and_request_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swtpm-sock");
        let listener = UnixListener::bind(&path).unwrap();
        let mock = mock_swtpm(listener);

        let client = SwtpmClient::connect(path.to_str().unwrap()).unwrap();
        client.startup(0x1000, false).unwrap();
        assert!(client.get_tpm_established_flag());
        /* second call served from the cache */
        assert!(client.get_tpm_established_flag());

        let mut cmdbuf = [0u8; 16];
        cmdbuf[0] = 0x80;
        cmdbuf[1] = 0x01;
        BigEndian::write_u32(&mut cmdbuf[2..6], 16);
        let mut out = [0u8; 64];
        let n = client.handle_request(0, &cmdbuf, &mut out).unwrap();
        assert_eq!(n, 12);
        assert_eq!(out[10], 0xaa);
        assert_eq!(out[11], 0xbb);

        client.shutdown();
        let seen = mock.join().unwrap();
        assert_eq!(
            seen,
            vec![
                CMD_SET_DATAFD,
                CMD_STOP,
                CMD_SET_BUFFERSIZE,
                CMD_INIT,
                CMD_GET_TPMESTABLISHED,
                CMD_SET_LOCALITY,
                CMD_SHUTDOWN
            ]
        );
    }
}
