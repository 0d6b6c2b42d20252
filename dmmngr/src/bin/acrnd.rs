//! VM manager daemon: schedules deferred VM starts/resumes, persists its
//! timer list across a service-VM power cycle and mediates stop/resume
//! requests from the lifecycle service.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};

use dmmngr::mngr::{MngrClient, MngrServer};
use dmmngr::msg::{
    MngrMsg, ACRND_RESUME, ACRND_STOP, ACRND_TIMER, RTC_TIMER, WAKEUP_REASON,
};
use dmmngr::vm_ops::{self, VmState};
use dmmngr::ACRN_CONF_TIMER_LIST;

const ACRND_NAME: &str = "acrnd";
const SOS_LCS_SOCK: &str = "sos-lcs";
const DEFAULT_TIMEOUT: u32 = 2;
/* wake the service VM this many seconds ahead of the first timer */
const SOS_ADVANCE_WKUP: i64 = 10;

const CBC_WK_RSN_RTC: u32 = 1 << 9;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[derive(Clone)]
struct Work {
    name: String,
    /// absolute time to run the work
    expire: i64,
}

#[derive(Default)]
struct WorkList {
    works: Mutex<Vec<Work>>,
}

impl WorkList {
    fn add(&self, name: &str, seconds_from_now: i64) {
        self.works.lock().unwrap().push(Work {
            name: name.to_string(),
            expire: now_secs() + seconds_from_now,
        });
    }

    /// Run and drop every expired work item.
    fn try_do_works(&self) {
        let current = now_secs();
        let due: Vec<Work> = {
            let mut works = self.works.lock().unwrap();
            let (due, keep): (Vec<Work>, Vec<Work>) =
                works.drain(..).partition(|w| current > w.expire);
            *works = keep;
            due
        };
        for work in due {
            vm_timer_func(&work.name);
        }
    }

    fn snapshot(&self) -> Vec<Work> {
        self.works.lock().unwrap().clone()
    }
}

/// Time to run or resume a VM.
fn vm_timer_func(name: &str) {
    let list = vm_ops::vmmngr_update();
    let Some(vm) = vm_ops::find_vm(&list, name) else {
        debug!("work expired for unknown vm {name}");
        return;
    };
    match vm.state {
        VmState::Created => {
            if let Err(e) = vm_ops::start_vm(name) {
                error!("failed to start {name}: {e}");
            }
        }
        VmState::Paused => {
            vm_ops::resume_vm(name);
        }
        _ => debug!("{name} is in no state for a timer wakeup"),
    }
}

fn get_sos_wakeup_reason() -> u32 {
    let Ok(mut client) = MngrClient::open(SOS_LCS_SOCK) else {
        warn!("Failed to open the socket({SOS_LCS_SOCK}) to query the wakeup reason");
        return 0;
    };
    let req = MngrMsg::new(WAKEUP_REASON);
    let mut ack = MngrMsg::new(0);
    match client.send_msg(&req, Some(&mut ack), DEFAULT_TIMEOUT) {
        Ok(n) if n > 0 => ack.reason(),
        _ => {
            warn!("Failed to get wakeup_reason from the lifecycle service");
            0
        }
    }
}

fn set_sos_timer(due_time: i64) -> i32 {
    let Ok(mut client) = MngrClient::open(SOS_LCS_SOCK) else {
        warn!("Failed to open sock to request an RTC timer");
        return -1;
    };
    let mut req = MngrMsg::new(RTC_TIMER);
    req.set_timer_req("", due_time);
    let mut ack = MngrMsg::new(0);
    let mut retry = 1;
    loop {
        match client.send_msg(&req, Some(&mut ack), DEFAULT_TIMEOUT) {
            Ok(n) if n > 0 => return ack.err(),
            _ if retry < 5 => {
                info!("Fail to set sos wakeup timer, retry {retry}...");
                retry += 1;
            }
            _ => return -1,
        }
    }
}

/// One record per pending timer: `<vmname>\t<expire>\t<record-time>`.
fn store_timer_list(works: &WorkList, path: &Path) -> std::io::Result<()> {
    let current = now_secs();
    let snapshot = works.snapshot();

    let mut sys_wakeup: i64 = 0;
    let mut file = std::fs::File::create(path)?;
    for w in &snapshot {
        if sys_wakeup == 0 || w.expire < sys_wakeup {
            sys_wakeup = w.expire;
        }
        writeln!(file, "{}\t{}\t{}", w.name, w.expire, current)?;
    }

    if sys_wakeup != 0 {
        /* the service VM must be up again before the first timer */
        let due = if sys_wakeup > SOS_ADVANCE_WKUP {
            sys_wakeup - SOS_ADVANCE_WKUP
        } else {
            sys_wakeup
        };
        set_sos_timer(due);
    } else {
        drop(file);
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

fn load_timer_list(works: &WorkList, path: &Path) -> std::io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    let current = now_secs();
    for line in content.lines() {
        let mut fields = line.split('\t');
        let (Some(name), Some(expire), Some(record)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!("Invalid record in timer list file");
            continue;
        };
        if name.is_empty() || name.len() > 32 {
            warn!("Invalid vmname from timer list file");
            continue;
        }
        let Ok(expire) = expire.parse::<i64>() else {
            warn!("Invalid expire from timer list file");
            continue;
        };
        if record.parse::<i64>().is_err() {
            warn!("Invalid record time from timer list file");
            continue;
        }
        let delta = if expire > current { expire - current } else { 1 };
        works.add(name, delta);
    }
    Ok(())
}

fn active_all_vms() -> i32 {
    let mut rc = 0;
    for vm in vm_ops::vmmngr_update() {
        match vm.state {
            VmState::Created => {
                if vm_ops::start_vm(&vm.name).is_err() {
                    rc = -1;
                }
            }
            VmState::Paused => {
                if vm_ops::resume_vm(&vm.name) != 0 {
                    rc = -1;
                }
            }
            _ => {}
        }
    }
    rc
}

fn check_vms_stopped() -> bool {
    vm_ops::vmmngr_update()
        .iter()
        .all(|vm| vm.state == VmState::Created)
}

fn handle_acrnd_stop(timeout: u32) -> i32 {
    /* the lifecycle service is stopping the guests; poll until they are */
    let mut t = timeout as i64;
    loop {
        if check_vms_stopped() {
            return 0;
        }
        std::thread::sleep(Duration::from_secs(1));
        t -= 1;
        if t < 0 {
            return -1;
        }
    }
}

fn init_vm(works: &Arc<WorkList>) -> i32 {
    let timer_list = Path::new(ACRN_CONF_TIMER_LIST);
    if timer_list.is_file() {
        return match load_timer_list(works, timer_list) {
            Ok(()) => 0,
            Err(_) => -1,
        };
    }

    let wakeup_reason = get_sos_wakeup_reason();
    if wakeup_reason & CBC_WK_RSN_RTC != 0 {
        match load_timer_list(works, timer_list) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    } else {
        active_all_vms()
    }
}

fn main() {
    env_logger::init();

    let works = Arc::new(WorkList::default());

    let mut server = match MngrServer::open(ACRND_NAME) {
        Ok(s) => s,
        Err(e) => {
            error!("acrnd: cannot open management socket: {e}");
            std::process::exit(1);
        }
    };

    if init_vm(&works) != 0 {
        error!("acrnd: VM initialization failed");
        std::process::exit(1);
    }
    let _ = std::fs::remove_file(ACRN_CONF_TIMER_LIST);

    let t_works = works.clone();
    server.add_handler(ACRND_TIMER, move |req| {
        let mut ack = MngrMsg::ack_of(req);
        let (name, t) = req.timer_req();
        let list = vm_ops::vmmngr_update();
        if vm_ops::find_vm(&list, &name).is_none() {
            ack.set_err(-1);
            return Some(ack);
        }
        t_works.add(&name, t);
        ack.set_err(0);
        Some(ack)
    });

    let s_works = works.clone();
    server.add_handler(ACRND_STOP, move |req| {
        let mut ack = MngrMsg::ack_of(req);
        let (_force, timeout) = req.stop_req();
        ack.set_err(handle_acrnd_stop(timeout));
        let _ = store_timer_list(&s_works, Path::new(ACRN_CONF_TIMER_LIST));
        Some(ack)
    });

    let r_works = works.clone();
    server.add_handler(ACRND_RESUME, move |req| {
        let mut ack = MngrMsg::ack_of(req);
        ack.set_err(0);

        let timer_list = Path::new(ACRN_CONF_TIMER_LIST);
        if timer_list.is_file() {
            if load_timer_list(&r_works, timer_list).is_err() {
                ack.set_err(-1);
            }
        } else {
            let wakeup_reason = get_sos_wakeup_reason();
            if wakeup_reason & CBC_WK_RSN_RTC == 0 {
                ack.set_err(active_all_vms());
            }
            /* an RTC wake just waits for the pending works to expire */
        }
        let _ = std::fs::remove_file(timer_list);
        Some(ack)
    });

    /* run the timer works */
    loop {
        works.try_do_works();
        std::thread::sleep(Duration::from_secs(1));
    }
}
