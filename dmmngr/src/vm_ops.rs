//! VM inventory and lifecycle requests used by the manager tools. The
//! inventory merges launch scripts under the configuration directory with
//! the live per-VM monitor sockets.

use std::path::Path;

use log::debug;

use crate::mngr::{MngrClient, MngrError};
use crate::msg::{
    MngrMsg, DM_BLKRESCAN, DM_CONTINUE, DM_PAUSE, DM_QUERY, DM_RESUME, DM_STOP, DM_SUSPEND,
};
use crate::{ACRN_CONF_PATH_ADD, ACRN_DM_SOCK_PATH};

/* DM_QUERY ack values mirror the DM's suspend mode */
const VM_SUSPEND_NONE: i32 = 0;
const VM_SUSPEND_HALT: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Unknown,
    /// created / awaiting start
    Created,
    Started,
    Paused,
    Untracked,
}

impl VmState {
    pub fn as_str(self) -> &'static str {
        match self {
            VmState::Unknown => "unknown",
            VmState::Created => "stopped",
            VmState::Started => "started",
            VmState::Paused => "paused",
            VmState::Untracked => "untracked",
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmEntry {
    pub name: String,
    pub state: VmState,
}

fn send_dm_msg(
    sock_dir: &Path,
    vmname: &str,
    req: &MngrMsg,
) -> std::result::Result<MngrMsg, MngrError> {
    let mut client = MngrClient::open_at(sock_dir, vmname)?;
    let mut ack = MngrMsg::new(0);
    let n = client.send_msg(req, Some(&mut ack), 1)?;
    if n == 0 {
        return Err(MngrError::Send(std::io::ErrorKind::TimedOut.into()));
    }
    Ok(ack)
}

fn query_state(sock_dir: &Path, vmname: &str) -> Option<i32> {
    let req = MngrMsg::new(DM_QUERY);
    send_dm_msg(sock_dir, vmname, &req).ok().map(|a| a.state())
}

/// Scan launch scripts (`<conf>/add/<name>.sh` -> CREATED) and live monitor
/// sockets (state via DM_QUERY) into one list.
pub fn vmmngr_scan(conf_add_dir: &Path, sock_dir: &Path) -> Vec<VmEntry> {
    let mut list: Vec<VmEntry> = Vec::new();

    if let Ok(entries) = std::fs::read_dir(conf_add_dir) {
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            if let Some(name) = fname.strip_suffix(".sh") {
                if !list.iter().any(|v| v.name == name) {
                    list.push(VmEntry {
                        name: name.to_string(),
                        state: VmState::Created,
                    });
                }
            }
        }
    }

    if let Ok(entries) = std::fs::read_dir(sock_dir) {
        for entry in entries.flatten() {
            let fname = entry.file_name();
            let fname = fname.to_string_lossy();
            /* <name>.monitor.<pid>.socket */
            let Some(rest) = fname.strip_suffix(".socket") else {
                continue;
            };
            let Some(dot) = rest.find(".monitor.") else {
                continue;
            };
            let name = &rest[..dot];
            if name.is_empty() {
                continue;
            }
            let state = match query_state(sock_dir, name) {
                /* a DM without query support is simply running */
                None => VmState::Started,
                Some(VM_SUSPEND_NONE) => VmState::Started,
                Some(VM_SUSPEND_HALT) => VmState::Paused,
                Some(_) => VmState::Unknown,
            };
            match list.iter_mut().find(|v| v.name == name) {
                Some(v) => v.state = state,
                None => list.push(VmEntry {
                    name: name.to_string(),
                    state,
                }),
            }
        }
    }

    list
}

pub fn vmmngr_update() -> Vec<VmEntry> {
    vmmngr_scan(Path::new(ACRN_CONF_PATH_ADD), Path::new(ACRN_DM_SOCK_PATH))
}

pub fn find_vm(list: &[VmEntry], name: &str) -> Option<VmEntry> {
    list.iter().find(|v| v.name == name).cloned()
}

/// Launch a VM through its stored script and argument file.
pub fn start_vm(vmname: &str) -> std::io::Result<std::process::ExitStatus> {
    let cmd = format!(
        "bash {dir}/{vm}.sh $(cat {dir}/{vm}.args)",
        dir = ACRN_CONF_PATH_ADD,
        vm = vmname
    );
    std::process::Command::new("sh").arg("-c").arg(cmd).status()
}

fn simple_dm_request(vmname: &str, msgid: u32, what: &str) -> i32 {
    let req = MngrMsg::new(msgid);
    match send_dm_msg(Path::new(ACRN_DM_SOCK_PATH), vmname, &req) {
        Ok(ack) => {
            if ack.err() != 0 {
                debug!("{what} {vmname} failed, errno({})", ack.err());
            }
            ack.err()
        }
        Err(e) => {
            debug!("{what} {vmname}: {e}");
            -1
        }
    }
}

pub fn stop_vm(vmname: &str) -> i32 {
    simple_dm_request(vmname, DM_STOP, "stop")
}

pub fn pause_vm(vmname: &str) -> i32 {
    simple_dm_request(vmname, DM_PAUSE, "pause")
}

pub fn continue_vm(vmname: &str) -> i32 {
    simple_dm_request(vmname, DM_CONTINUE, "continue")
}

pub fn suspend_vm(vmname: &str) -> i32 {
    simple_dm_request(vmname, DM_SUSPEND, "suspend")
}

pub fn resume_vm(vmname: &str) -> i32 {
    simple_dm_request(vmname, DM_RESUME, "resume")
}

/// Ask the DM to rescan a virtio-blk device for size/media changes.
pub fn blkrescan_vm(vmname: &str, devargs: &str) -> i32 {
    let mut req = MngrMsg::new(DM_BLKRESCAN);
    req.set_devargs(devargs);
    match send_dm_msg(Path::new(ACRN_DM_SOCK_PATH), vmname, &req) {
        Ok(ack) => {
            if ack.err() != 0 {
                debug!("blkrescan {vmname} failed, errno({})", ack.err());
            }
            ack.err()
        }
        Err(e) => {
            debug!("blkrescan {vmname}: {e}");
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_merges_scripts_and_sockets() {
        let conf = tempfile::tempdir().unwrap();
        let sock = tempfile::tempdir().unwrap();
        std::fs::write(conf.path().join("vm1.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(conf.path().join("vm2.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(conf.path().join("notes.txt"), "x").unwrap();

        let list = vmmngr_scan(conf.path(), sock.path());
        assert_eq!(list.len(), 2);
        assert!(list
            .iter()
            .all(|v| v.state == VmState::Created && (v.name == "vm1" || v.name == "vm2")));
    }

    #[test]
    fn scan_sees_live_monitor_sockets() {
        let conf = tempfile::tempdir().unwrap();
        let sock = tempfile::tempdir().unwrap();
        let mut server =
            crate::mngr::MngrServer::open_at(sock.path(), "vm9.monitor").unwrap();
        server.add_handler(DM_QUERY, |req| {
            let mut ack = MngrMsg::ack_of(req);
            ack.set_state(VM_SUSPEND_NONE);
            Some(ack)
        });

        let list = vmmngr_scan(conf.path(), sock.path());
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "vm9");
        assert_eq!(list[0].state, VmState::Started);
        server.close();
    }
}
