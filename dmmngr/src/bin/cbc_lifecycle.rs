//! Service-VM lifecycle service (sos-lcs): listens on the CBC lifecycle
//! port for wakeup reasons, keeps the carrier board fed with heartbeats and
//! mediates shutdown/suspend/reboot between acrnd and the board.
//!
//! CBC lifecycle state machine transition flow:
//!
//! ```text
//!                  .-------------------------------------------
//!     -------------+--------------                            |
//!     |     IOC    V     IOC     |                            |
//! (default) ==> (Active) ==> (shutdown) ==> (shutdown delay) (Off)
//!                  |_____________|__________________|
//!         _________|________   (acrnd select)                 ^
//!   acrnd/    acrnd|   acrnd\                                 |
//!  (reboot) (suspend) (shutdown)                              |
//!        |         |      |                                   |
//!        ------------------------------------------------------
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};

use dmmngr::mngr::{MngrClient, MngrServer};
use dmmngr::msg::{
    MngrMsg, ACRND_RESUME, ACRND_STOP, REBOOT, RTC_TIMER, SHUTDOWN, SUSPEND, WAKEUP_REASON,
};

const CBCD_NAME: &str = "sos-lcs";
const ACRND_NAME: &str = "acrnd";
const CBC_LIFECYCLE_DEV: &str = "/dev/cbc-lifecycle";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
enum State {
    /// not receiving any status yet
    Default = 0,
    /// wakeup reason with any of bits 0..22 set
    Alive = 1,
    /// wakeup reason with only the SoC bit left
    Shutdown = 2,
    /// waiting for acrnd to confirm the off request
    ShutdownDelay = 3,
    /// acrnd confirmed the board may power off
    AcrndShutdown = 4,
    /// wakeup reason fully cleared
    IocShutdown = 5,
    /// acrnd requested a reboot
    AcrndReboot = 6,
    /// acrnd requested S3
    AcrndSuspend = 7,
}

const S_MAX: usize = 8;

/// valid transition table, indexed [from][to]
const VALID_MAP: [[u8; S_MAX]; S_MAX] = [
    [1, 1, 1, 0, 0, 0, 0, 0], /* default can go alive or shutdown */
    [0, 1, 1, 0, 1, 0, 1, 1], /* alive can go to the acrnd states */
    [0, 0, 1, 1, 1, 1, 1, 1], /* shutdown can go upward */
    [0, 0, 0, 1, 1, 1, 1, 1], /* delay can go upward */
    [0, 0, 0, 0, 1, 1, 0, 0], /* acrnd shutdown only to ioc shutdown */
    [0, 1, 0, 0, 0, 1, 0, 0], /* ioc shutdown back to alive (S3 case) */
    [0, 0, 0, 0, 0, 1, 1, 0], /* acrnd reboot only to ioc shutdown */
    [0, 1, 0, 0, 0, 1, 0, 1], /* acrnd suspend to alive/ioc shutdown */
];

const STATE_NAME: [&str; S_MAX] = [
    "default",
    "keep_alive",
    "shutdown",
    "shutdown_delay",
    "acrnd_shutdown",
    "ioc_shutdown",
    "acrnd_reboot",
    "acrnd_suspend",
];

/* raw heartbeat payloads for the lifecycle port */
const CBC_HEARTBEAT_SHUTDOWN: [u8; 4] = [0x02, 0x00, 0x01, 0x00];
const CBC_HEARTBEAT_REBOOT: [u8; 4] = [0x02, 0x00, 0x02, 0x00];
const CBC_HEARTBEAT_S3: [u8; 4] = [0x02, 0x00, 0x07, 0x00];
const CBC_HEARTBEAT_ACTIVE: [u8; 4] = [0x02, 0x01, 0x00, 0x00];
const CBC_HEARTBEAT_SHUTDOWN_DELAY: [u8; 4] = [0x02, 0x02, 0x00, 0x00];
const CBC_HEARTBEAT_INIT: [u8; 4] = [0x02, 0x03, 0x00, 0x00];

struct Lifecycle {
    state: Mutex<State>,
    wakeup_reason: AtomicU32,
    dev: Mutex<File>,
}

impl Lifecycle {
    fn get_state(&self) -> State {
        *self.state.lock().unwrap()
    }

    /// Apply a transition if the validity table allows it; returns the
    /// previous state either way.
    fn state_transit(&self, new: State) -> State {
        let mut state = self.state.lock().unwrap();
        let old = *state;
        if VALID_MAP[old as usize][new as usize] != 0 {
            *state = new;
            if old != new {
                info!(
                    "transit ({} to {})",
                    STATE_NAME[old as usize], STATE_NAME[new as usize]
                );
            }
        }
        old
    }

    fn send_heartbeat(&self, payload: &[u8; 4]) {
        let mut dev = self.dev.lock().unwrap();
        if let Err(e) = dev.write_all(payload) {
            warn!("heartbeat write failed: {e}");
        }
    }
}

fn wait_for_device(dev_name: &str) {
    /* up to 180 seconds */
    for _ in 0..360 {
        if std::path::Path::new(dev_name).exists() {
            return;
        }
        warn!("waiting for {dev_name}");
        std::thread::sleep(Duration::from_millis(500));
    }
}

fn send_acrnd_request(req: MngrMsg) -> i32 {
    let Ok(mut client) = MngrClient::open(ACRND_NAME) else {
        error!("cannot open {ACRND_NAME} socket");
        return -1;
    };
    let mut ack = MngrMsg::new(0);
    match client.send_msg(&req, Some(&mut ack), 2) {
        Ok(n) if n > 0 => {
            info!("result {}", ack.err());
            ack.err()
        }
        _ => -1,
    }
}

fn send_acrnd_start() -> i32 {
    send_acrnd_request(MngrMsg::new(ACRND_RESUME))
}

fn send_acrnd_stop() -> i32 {
    let mut req = MngrMsg::new(ACRND_STOP);
    req.set_stop_req(0, 20);
    send_acrnd_request(req)
}

/// Reader side of the lifecycle port: 1-byte header plus a 24-bit wakeup
/// reason that drives the state machine.
fn wakeup_reason_thread(lc: Arc<Lifecycle>) {
    loop {
        let mut data = [0u8; 4];
        let n = {
            let mut dev = match lc.dev.lock().unwrap().try_clone() {
                Ok(f) => f,
                Err(_) => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
            };
            match dev.read(&mut data) {
                Ok(n) => n,
                Err(e) => {
                    warn!("wakeup reason read: {e}");
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
            }
        };
        if n == 0 {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        if data[0] != 1 {
            warn!("received wrong wakeup reason");
            continue;
        }
        let reason = data[1] as u32 | (data[2] as u32) << 8 | (data[3] as u32) << 16;
        lc.wakeup_reason.store(reason, Ordering::Release);
        if reason == 0 {
            lc.state_transit(State::IocShutdown);
        } else if reason & !(1 << 23) == 0 {
            lc.state_transit(State::Shutdown);
        } else {
            lc.state_transit(State::Alive);
        }
    }
}

/// Heartbeat pacing plus the state-driven actions; one tick per second.
fn heartbeat_loop(lc: Arc<Lifecycle>) -> ! {
    lc.send_heartbeat(&CBC_HEARTBEAT_INIT);
    info!("send heartbeat init");

    let mut last_state = State::Default;
    loop {
        let mut cur_state = lc.get_state();
        let heartbeat = match cur_state {
            State::Default => None,
            State::Alive => {
                if last_state != State::Alive {
                    send_acrnd_start();
                }
                Some(&CBC_HEARTBEAT_ACTIVE)
            }
            State::Shutdown | State::ShutdownDelay => {
                if cur_state == State::Shutdown {
                    /* acrnd must confirm that the guests accepted the off
                     * request; stall the board with shutdown delay */
                    send_acrnd_stop();
                    lc.state_transit(State::ShutdownDelay);
                    cur_state = State::ShutdownDelay;
                }
                Some(&CBC_HEARTBEAT_SHUTDOWN_DELAY)
            }
            State::AcrndShutdown => Some(&CBC_HEARTBEAT_SHUTDOWN),
            State::AcrndReboot => Some(&CBC_HEARTBEAT_REBOOT),
            State::AcrndSuspend => Some(&CBC_HEARTBEAT_S3),
            State::IocShutdown => {
                let cmd = match last_state {
                    State::AcrndShutdown => Some("shutdown 0"),
                    State::AcrndReboot => Some("reboot"),
                    State::AcrndSuspend => Some("echo mem > /sys/power/state"),
                    _ => None,
                };
                if let Some(cmd) = cmd {
                    let _ = std::process::Command::new("sh").arg("-c").arg(cmd).status();
                }
                /* no heartbeat from now on */
                None
            }
        };
        if let Some(hb) = heartbeat {
            lc.send_heartbeat(hb);
        }
        last_state = cur_state;
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn main() {
    env_logger::init();

    wait_for_device(CBC_LIFECYCLE_DEV);
    let dev = match OpenOptions::new()
        .read(true)
        .write(true)
        .open(CBC_LIFECYCLE_DEV)
    {
        Ok(f) => f,
        Err(e) => {
            error!("failed to open {CBC_LIFECYCLE_DEV}: {e}");
            std::process::exit(1);
        }
    };

    /* a client may close its fd before reading the ack */
    // SAFETY: installing a disposition, no handler is run.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

    let lc = Arc::new(Lifecycle {
        state: Mutex::new(State::Default),
        wakeup_reason: AtomicU32::new(0),
        dev: Mutex::new(dev),
    });

    let server = match MngrServer::open(CBCD_NAME) {
        Ok(s) => s,
        Err(e) => {
            error!("cannot open {CBCD_NAME} socket: {e}");
            std::process::exit(1);
        }
    };

    let h_lc = lc.clone();
    server.add_handler(WAKEUP_REASON, move |req| {
        let mut ack = MngrMsg::ack_of(req);
        ack.set_reason(h_lc.wakeup_reason.load(Ordering::Acquire));
        Some(ack)
    });

    server.add_handler(RTC_TIMER, |req| {
        let mut ack = MngrMsg::ack_of(req);
        let (vmname, t) = req.timer_req();
        /* the carrier board firmware has no RTC service yet */
        ack.set_err(-1);
        info!("{vmname} request rtc timer at {t}, result will be {}", ack.err());
        Some(ack)
    });

    let h_lc = lc.clone();
    server.add_handler(SHUTDOWN, move |req| {
        let mut ack = MngrMsg::ack_of(req);
        ack.set_err(0);
        info!("acrnd agreed to shutdown");
        h_lc.state_transit(State::AcrndShutdown);
        Some(ack)
    });

    let h_lc = lc.clone();
    server.add_handler(SUSPEND, move |req| {
        let mut ack = MngrMsg::ack_of(req);
        ack.set_err(0);
        h_lc.state_transit(State::AcrndSuspend);
        Some(ack)
    });

    let h_lc = lc.clone();
    server.add_handler(REBOOT, move |req| {
        let mut ack = MngrMsg::ack_of(req);
        ack.set_err(0);
        h_lc.state_transit(State::AcrndReboot);
        Some(ack)
    });

    let r_lc = lc.clone();
    std::thread::Builder::new()
        .name("cbc_wakeup".into())
        .spawn(move || wakeup_reason_thread(r_lc))
        .expect("spawn wakeup reason thread");

    heartbeat_loop(lc);
}
