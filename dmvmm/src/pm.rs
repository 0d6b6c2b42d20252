//! Process-wide VM power state. One VM per device-model process.

use std::sync::{Condvar, Mutex};

use log::{info, warn};
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmSuspendMode {
    None,
    SystemReset,
    FullReset,
    Poweroff,
    Suspend,
    Halt,
    TripleFault,
}

impl VmSuspendMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VmSuspendMode::None => "RUNNING",
            VmSuspendMode::SystemReset => "SYSTEM_RESET",
            VmSuspendMode::FullReset => "FULL_RESET",
            VmSuspendMode::Poweroff => "POWEROFF",
            VmSuspendMode::Suspend => "SUSPEND",
            VmSuspendMode::Halt => "HALT",
            VmSuspendMode::TripleFault => "TRIPLEFAULT",
        }
    }

    /// Modes that terminate the event loop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            VmSuspendMode::Poweroff
                | VmSuspendMode::FullReset
                | VmSuspendMode::Halt
                | VmSuspendMode::TripleFault
        )
    }
}

static SUSPEND: Lazy<(Mutex<VmSuspendMode>, Condvar)> =
    Lazy::new(|| (Mutex::new(VmSuspendMode::None), Condvar::new()));

fn transition_allowed(from: VmSuspendMode, to: VmSuspendMode) -> bool {
    match (from, to) {
        (VmSuspendMode::None, _) => true,
        (VmSuspendMode::Suspend, VmSuspendMode::None) => true,
        (x, y) if x == y => true,
        _ => false,
    }
}

pub fn vm_set_suspend_mode(how: VmSuspendMode) {
    let (lock, _) = &*SUSPEND;
    let mut mode = lock.lock().unwrap();
    if !transition_allowed(*mode, how) {
        warn!(
            "VM state transition [ {} ] to [ {} ] is not expected",
            mode.as_str(),
            how.as_str()
        );
    }
    info!(
        "VM state changed from [ {} ] to [ {} ]",
        mode.as_str(),
        how.as_str()
    );
    *mode = how;
}

pub fn vm_get_suspend_mode() -> VmSuspendMode {
    let (lock, _) = &*SUSPEND;
    *lock.lock().unwrap()
}

/// Block until the VM leaves SUSPEND.
pub fn wait_for_resume() {
    let (lock, cvar) = &*SUSPEND;
    let mut mode = lock.lock().unwrap();
    while *mode == VmSuspendMode::Suspend {
        mode = cvar.wait(mode).unwrap();
    }
}

/// Leave SUSPEND and wake everyone in [`wait_for_resume`].
pub fn vm_resume() {
    let (lock, cvar) = &*SUSPEND;
    let mut mode = lock.lock().unwrap();
    info!(
        "VM state changed from [ {} ] to [ {} ]",
        mode.as_str(),
        VmSuspendMode::None.as_str()
    );
    *mode = VmSuspendMode::None;
    cvar.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn resume_wakes_waiter() {
        vm_set_suspend_mode(VmSuspendMode::None);
        vm_set_suspend_mode(VmSuspendMode::Suspend);
        let resumed = Arc::new(AtomicBool::new(false));
        let resumed2 = resumed.clone();
        let t = std::thread::spawn(move || {
            wait_for_resume();
            resumed2.store(true, Ordering::SeqCst);
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!resumed.load(Ordering::SeqCst));
        vm_resume();
        t.join().unwrap();
        assert!(resumed.load(Ordering::SeqCst));
        assert_eq!(vm_get_suspend_mode(), VmSuspendMode::None);
    }
}
