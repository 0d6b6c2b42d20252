//! Per-VM management server: `<name>.monitor.<pid>.socket` under the
//! manager directory, dispatching supervisor requests to registered
//! per-device ops, plus the client calls toward acrnd / the lifecycle
//! service.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use dmmngr::mngr::{MngrClient, MngrServer};
use dmmngr::msg::{
    MngrMsg, ACRND_TIMER, DM_BLKRESCAN, DM_CONTINUE, DM_PAUSE, DM_QUERY, DM_RESUME, DM_STOP,
    DM_SUSPEND, WAKEUP_REASON,
};
use dmvmm::pm::{vm_get_suspend_mode, VmSuspendMode};

const SOS_LCS_SOCK: &str = "sos-lcs";
const ACRND_SOCK: &str = "acrnd";

/// Hooks a device registers to take part in supervisor flows. Unimplemented
/// operations report "not handled".
pub trait MonitorVmOps: Send + Sync {
    fn stop(&self, force: bool) -> i32 {
        let _ = force;
        -1
    }
    fn suspend(&self) -> i32 {
        -1
    }
    fn resume(&self, wakeup_reason: u32) -> i32 {
        let _ = wakeup_reason;
        -1
    }
    fn pause(&self) -> i32 {
        -1
    }
    fn unpause(&self) -> i32 {
        -1
    }
}

fn mode_to_wire(mode: VmSuspendMode) -> i32 {
    match mode {
        VmSuspendMode::None => 0,
        VmSuspendMode::SystemReset => 1,
        VmSuspendMode::FullReset => 2,
        VmSuspendMode::Poweroff => 3,
        VmSuspendMode::Suspend => 4,
        VmSuspendMode::Halt => 5,
        VmSuspendMode::TripleFault => 6,
    }
}

type OpsList = Arc<Mutex<Vec<(String, Arc<dyn MonitorVmOps>)>>>;

pub struct Monitor {
    server: MngrServer,
    ops: OpsList,
    vmname: String,
}

impl Monitor {
    pub fn run(vmname: &str) -> Result<Monitor, dmmngr::mngr::MngrError> {
        let server = MngrServer::open(&format!("{vmname}.monitor"))?;
        let ops: OpsList = Arc::new(Mutex::new(Vec::new()));

        let for_each = |ops: &OpsList, f: &dyn Fn(&dyn MonitorVmOps) -> i32| -> i32 {
            let mut err = 0;
            let mut handled = false;
            for (name, op) in ops.lock().unwrap().iter() {
                let rc = f(op.as_ref());
                if rc >= 0 {
                    handled = true;
                }
                if rc > 0 {
                    warn!("monitor op {name} returned {rc}");
                    err = rc;
                }
            }
            if handled {
                err
            } else {
                -1
            }
        };

        let h_ops = ops.clone();
        server.add_handler(DM_STOP, move |req| {
            let mut ack = MngrMsg::ack_of(req);
            ack.set_err(for_each(&h_ops, &|op| op.stop(false)));
            Some(ack)
        });

        let h_ops = ops.clone();
        server.add_handler(DM_SUSPEND, move |req| {
            let mut ack = MngrMsg::ack_of(req);
            ack.set_err(for_each(&h_ops, &|op| op.suspend()));
            Some(ack)
        });

        let h_ops = ops.clone();
        server.add_handler(DM_RESUME, move |req| {
            let mut ack = MngrMsg::ack_of(req);
            let reason = req.reason();
            ack.set_err(for_each(&h_ops, &|op| op.resume(reason)));
            Some(ack)
        });

        let h_ops = ops.clone();
        server.add_handler(DM_PAUSE, move |req| {
            let mut ack = MngrMsg::ack_of(req);
            ack.set_err(for_each(&h_ops, &|op| op.pause()));
            Some(ack)
        });

        let h_ops = ops.clone();
        server.add_handler(DM_CONTINUE, move |req| {
            let mut ack = MngrMsg::ack_of(req);
            ack.set_err(for_each(&h_ops, &|op| op.unpause()));
            Some(ack)
        });

        server.add_handler(DM_QUERY, |req| {
            let mut ack = MngrMsg::ack_of(req);
            ack.set_state(mode_to_wire(vm_get_suspend_mode()));
            Some(ack)
        });

        server.add_handler(DM_BLKRESCAN, |req| {
            let mut ack = MngrMsg::ack_of(req);
            /* no block backend in this device model */
            warn!("blkrescan request ignored: {}", req.devargs());
            ack.set_err(-1);
            Some(ack)
        });

        Ok(Monitor {
            server,
            ops,
            vmname: vmname.to_string(),
        })
    }

    pub fn register_vm_ops(&self, ops: Arc<dyn MonitorVmOps>, name: &str) {
        info!("monitor: registered vm ops {name}");
        self.ops.lock().unwrap().push((name.to_string(), ops));
    }

    pub fn close(&mut self) {
        self.server.close();
    }

    pub fn vmname(&self) -> &str {
        &self.vmname
    }
}

/// Ask the lifecycle service why the platform woke up.
pub fn get_wakeup_reason() -> u32 {
    let Ok(mut client) = MngrClient::open(SOS_LCS_SOCK) else {
        warn!("failed to open the {SOS_LCS_SOCK} socket");
        return 0;
    };
    let req = MngrMsg::new(WAKEUP_REASON);
    let mut ack = MngrMsg::new(0);
    match client.send_msg(&req, Some(&mut ack), 2) {
        Ok(n) if n > 0 => ack.reason(),
        _ => 0,
    }
}

/// Ask acrnd to schedule a wakeup for this VM `due_seconds` from now.
pub fn set_wakeup_timer(vmname: &str, due_seconds: u64) -> i32 {
    let Ok(mut client) = MngrClient::open(ACRND_SOCK) else {
        warn!("failed to open the {ACRND_SOCK} socket");
        return -1;
    };
    let mut req = MngrMsg::new(ACRND_TIMER);
    req.set_timer_req(vmname, due_seconds as i64);
    let mut ack = MngrMsg::new(0);
    match client.send_msg(&req, Some(&mut ack), 2) {
        Ok(n) if n > 0 => ack.err(),
        _ => -1,
    }
}
