//! Virtual High-Precision Event Timer.
//!
//! One 32-bit main counter at 2^24 Hz plus eight timers, each backed by
//! three rotating timerfd slots. Rotating the slot on stop means a dangling
//! callback can only observe `running == false` (or a stale slot index) and
//! never interferes with a newly armed schedule.

use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, warn};

use dmevent::{AcrnTimer, Mevent, TimerClock};
use dmevent::timer::ZERO_ITIMERSPEC;
use dmvmm::ioctl_defs::{GSI_RAISING_PULSE, GSI_SET_HIGH, GSI_SET_LOW};
use dmvmm::mem::{MemBus, MemDir, MemError, MemRange, MEM_F_RW};

use crate::IrqOps;

pub const VHPET_BASE: u64 = 0xFED0_0000;
pub const VHPET_SIZE: u64 = 1024;

const HPET_FREQ: u64 = 16_777_216; /* 16.7 (2^24) MHz */
const FS_PER_S: u64 = 1_000_000_000_000_000;

const VHPET_NUM_TIMERS: usize = 8;
const VIOAPIC_RTE_NUM: u32 = 48;

/* register offsets */
const HPET_CAPABILITIES: u64 = 0x0;
const HPET_CONFIG: u64 = 0x10;
const HPET_ISR: u64 = 0x20;
const HPET_MAIN_COUNTER: u64 = 0xF0;

const HPET_CAP_COUNT_SIZE: u64 = 0x0000_2000;

const HPET_CNF_ENABLE: u64 = 0x1;

/* Timer N configuration and capabilities */
const HPET_TCNF_INT_TYPE: u64 = 0x0002;
const HPET_TCNF_INT_ENB: u64 = 0x0004;
const HPET_TCNF_TYPE: u64 = 0x0008;
const HPET_TCAP_PER_INT: u64 = 0x0010;
const HPET_TCAP_SIZE: u64 = 0x0020;
const HPET_TCNF_VAL_SET: u64 = 0x0040;
const HPET_TCNF_32MODE: u64 = 0x0100;
const HPET_TCNF_INT_ROUTE: u64 = 0x3E00;
const HPET_TCNF_FSB_EN: u64 = 0x4000;
const HPET_TCAP_FSB_INT_DEL: u64 = 0x8000;
const HPET_TCAP_INT_ROUTE: u64 = 0xFFFF_FFFF_0000_0000;

const HPET_TCAP_RO_MASK: u64 =
    HPET_TCAP_INT_ROUTE | HPET_TCAP_FSB_INT_DEL | HPET_TCAP_SIZE | HPET_TCAP_PER_INT;

fn tcap_cnf_off(n: usize) -> u64 {
    0x100 + (n as u64) * 0x20
}
fn tcomp_off(n: usize) -> u64 {
    0x108 + (n as u64) * 0x20
}
fn tfsb_val_off(n: usize) -> u64 {
    0x110 + (n as u64) * 0x20
}
fn tfsb_addr_off(n: usize) -> u64 {
    0x114 + (n as u64) * 0x20
}

#[derive(Debug, thiserror::Error)]
pub enum HpetError {
    #[error("hpet already initialized")]
    AlreadyInited,
    #[error("timer: {0}")]
    Timer(#[from] dmevent::timer::TimerError),
    #[error("mem bus: {0}")]
    Mem(#[from] MemError),
}

pub type Result<T> = std::result::Result<T, HpetError>;

/* The virtualised HPET has no recoverable fault model: a clock or timerfd
 * failure leaves the device untrustworthy. */
fn hpet_fatal(what: &str, err: std::io::Error) -> ! {
    error!("vhpet: {what} returned: {err}");
    std::process::abort();
}

fn clock_now() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: writing a timespec out-param.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
        hpet_fatal("clock_gettime", std::io::Error::last_os_error());
    }
    ts
}

fn ts_is_zero(ts: &libc::timespec) -> bool {
    ts.tv_sec == 0 && ts.tv_nsec == 0
}

const TS_ZERO: libc::timespec = libc::timespec {
    tv_sec: 0,
    tv_nsec: 0,
};

pub(crate) fn ts_cmp(a: &libc::timespec, b: &libc::timespec) -> std::cmp::Ordering {
    (a.tv_sec, a.tv_nsec).cmp(&(b.tv_sec, b.tv_nsec))
}

fn ts_add(a: &libc::timespec, b: &libc::timespec) -> libc::timespec {
    let mut sec = a.tv_sec + b.tv_sec;
    let mut nsec = a.tv_nsec + b.tv_nsec;
    if nsec >= 1_000_000_000 {
        sec += 1;
        nsec -= 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

pub(crate) fn ts_sub(a: &libc::timespec, b: &libc::timespec) -> libc::timespec {
    let mut sec = a.tv_sec - b.tv_sec;
    let mut nsec = a.tv_nsec - b.tv_nsec;
    if nsec < 0 {
        sec -= 1;
        nsec += 1_000_000_000;
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}

pub(crate) fn ts_to_ticks(freq: u64, ts: &libc::timespec) -> u64 {
    ts.tv_sec as u64 * freq + (ts.tv_nsec as u64 * freq) / 1_000_000_000
}

pub(crate) fn ticks_to_ts(freq: u64, ticks: u64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ticks / freq) as libc::time_t,
        tv_nsec: ((ticks % freq) * 1_000_000_000 / freq) as libc::c_long,
    }
}

pub const fn vhpet_capabilities() -> u64 {
    let mut cap: u64 = 0;
    cap |= 0x8086 << 16; /* vendor id */
    cap |= ((VHPET_NUM_TIMERS as u64) - 1) << 8; /* number of timers */
    cap |= 1; /* revision */
    cap &= !HPET_CAP_COUNT_SIZE; /* 32-bit timer */
    cap &= 0xffffffff;
    cap | ((FS_PER_S / HPET_FREQ) << 32) /* tick period in fs */
}

struct TimerSlot {
    timer: AcrnTimer,
    running: bool,
}

struct VhpetTimer {
    cap_config: u64,
    msireg: u64,
    compval: u32,
    comprate: u32,
    /* time when counter == compval */
    expts: libc::timespec,
    slots: [Option<TimerSlot>; 3],
    tmridx: usize,
}

impl VhpetTimer {
    fn slot(&self) -> &TimerSlot {
        self.slots[self.tmridx]
            .as_ref()
            .expect("vhpet timer slots exist after init")
    }

    fn slot_mut(&mut self) -> &mut TimerSlot {
        self.slots[self.tmridx]
            .as_mut()
            .expect("vhpet timer slots exist after init")
    }
}

struct VhpetState {
    irq: Arc<dyn IrqOps>,
    inited: bool,
    config: u64,
    isr: u64,
    countbase: u32,
    countbase_ts: libc::timespec,
    timers: Vec<VhpetTimer>,
}

pub struct Vhpet {
    state: Arc<Mutex<VhpetState>>,
}

impl VhpetState {
    fn counter_enabled(&self) -> bool {
        self.config & HPET_CNF_ENABLE != 0
    }

    fn timer_msi_enabled(&self, n: usize) -> bool {
        let msi_enable = HPET_TCAP_FSB_INT_DEL | HPET_TCNF_FSB_EN;
        self.timers[n].cap_config & msi_enable == msi_enable
    }

    /// An MSI timer is treated as not connected to the ioapic.
    fn timer_ioapic_pin(&self, n: usize) -> u32 {
        if self.timer_msi_enabled(n) {
            return 0;
        }
        ((self.timers[n].cap_config & HPET_TCNF_INT_ROUTE) >> 9) as u32
    }

    fn periodic_timer(&self, n: usize) -> bool {
        self.timers[n].cap_config & HPET_TCNF_TYPE != 0
    }

    fn timer_interrupt_enabled(&self, n: usize) -> bool {
        self.timers[n].cap_config & HPET_TCNF_INT_ENB != 0
    }

    /// The timer is enabled when at least one of the two bits is set.
    fn timer_enabled(&self, n: usize) -> bool {
        self.timer_interrupt_enabled(n) || self.periodic_timer(n)
    }

    fn timer_running(&self, n: usize) -> bool {
        self.timers[n].slot().running
    }

    fn timer_edge_trig(&self, n: usize) -> bool {
        !self.timer_msi_enabled(n) && self.timers[n].cap_config & HPET_TCNF_INT_TYPE == 0
    }

    /// Current main counter; with the counter enabled `nowptr` receives the
    /// timestamp the value corresponds to.
    fn counter(&mut self, nowptr: Option<&mut libc::timespec>) -> u32 {
        let mut val = self.countbase;

        if self.counter_enabled() {
            let now = clock_now();
            if ts_cmp(&now, &self.countbase_ts) == std::cmp::Ordering::Less {
                warn!("vhpet counter going backwards");
                self.countbase_ts = now;
            }
            let delta = ts_sub(&now, &self.countbase_ts);
            val = val.wrapping_add(ts_to_ticks(HPET_FREQ, &delta) as u32);
            if let Some(p) = nowptr {
                *p = now;
            }
        } else if let Some(p) = nowptr {
            /* countbase_ts is meaningless while the counter is off */
            warn!("vhpet unexpected nowptr");
            *p = clock_now();
        }

        val
    }

    fn timer_clear_isr(&mut self, n: usize) {
        if self.isr & (1 << n) != 0 {
            let pin = self.timer_ioapic_pin(n);
            if pin != 0 {
                self.irq.set_gsi_irq(pin, GSI_SET_LOW);
            } else {
                warn!("vhpet t{n} intr asserted without a valid intr route");
            }
            self.isr &= !(1 << n);
        }
    }

    fn timer_interrupt(&mut self, n: usize) {
        if !self.timer_interrupt_enabled(n) {
            return;
        }

        if self.isr & (1 << n) != 0 {
            if !self.timer_msi_enabled(n) && !self.timer_edge_trig(n) {
                debug!("hpet t{n} intr is already asserted");
                return;
            }
            warn!(
                "vhpet t{n} intr asserted in {} mode",
                if self.timer_msi_enabled(n) {
                    "msi"
                } else {
                    "edge-triggered"
                }
            );
            self.isr &= !(1 << n);
        }

        if self.timer_msi_enabled(n) {
            self.irq.inject_msi(
                self.timers[n].msireg >> 32,
                self.timers[n].msireg & 0xffff_ffff,
            );
            return;
        }

        let pin = self.timer_ioapic_pin(n);
        if pin == 0 {
            debug!("hpet t{n} intr is not routed to ioapic");
            return;
        }

        if self.timer_edge_trig(n) {
            self.irq.set_gsi_irq(pin, GSI_RAISING_PULSE);
        } else {
            self.isr |= 1 << n;
            self.irq.set_gsi_irq(pin, GSI_SET_HIGH);
        }
    }

    /// Roll the comparator forward so it stays ahead of the counter after a
    /// missed periodic expiration.
    fn adjust_compval(&mut self, n: usize, now: &libc::timespec) {
        let compval = self.timers[n].compval;
        let comprate = self.timers[n].comprate;

        if comprate == 0 || ts_cmp(&self.timers[n].expts, now) != std::cmp::Ordering::Less {
            return;
        }

        let delta = ts_sub(now, &self.timers[n].expts);
        let delta_ticks = ts_to_ticks(HPET_FREQ, &delta);
        let compnext =
            compval.wrapping_add(((delta_ticks / comprate as u64 + 1) as u32).wrapping_mul(comprate));
        self.timers[n].compval = compnext;
    }

    fn stop_timer(&mut self, n: usize, now: &libc::timespec, adj_compval: bool) {
        if !self.timer_running(n) {
            return;
        }

        if ts_is_zero(&self.timers[n].expts) {
            warn!("vhpet t{n} is running without an expiration time");
        }

        debug!("hpet t{n} stopped");

        self.timers[n].slot_mut().running = false;
        if let Err(e) = self.timers[n].slot().timer.settime(&ZERO_ITIMERSPEC) {
            hpet_fatal("timer_settime", std::io::Error::other(e));
        }

        self.timers[n].tmridx = (self.timers[n].tmridx + 1) % 3;
        if self.timer_running(n) {
            warn!("vhpet t{} timer {} is still running", n, self.timers[n].tmridx);
            self.timers[n].slot_mut().running = false;
        }

        /* A past expiration that never got to run still owes the guest one
         * interrupt; one-shot mode would otherwise wait a full wrap. */
        if !ts_is_zero(&self.timers[n].expts) {
            if ts_cmp(&self.timers[n].expts, now) == std::cmp::Ordering::Less {
                debug!("hpet t{n} interrupt triggered after stopping timer");
                if adj_compval {
                    self.adjust_compval(n, now);
                }
                self.timer_interrupt(n);
            }
            self.timers[n].expts = TS_ZERO;
        }
    }

    fn start_timer(&mut self, n: usize, counter: u32, now: &libc::timespec, adj_compval: bool) {
        self.stop_timer(n, now, adj_compval);

        debug!("hpet t{n} started");

        /* It is the guest's responsibility to keep the comparator out of
         * the "past"; the hardware has no belt-and-suspenders either. */
        let delta = self.timers[n].compval.wrapping_sub(counter);
        let mut its = ZERO_ITIMERSPEC;
        let value = ts_add(&ticks_to_ts(HPET_FREQ, delta as u64), now);
        its.it_value = value;
        its.it_interval = if self.timers[n].comprate != 0 {
            ticks_to_ts(HPET_FREQ, self.timers[n].comprate as u64)
        } else {
            /* it takes 2^32 ticks to wrap around */
            ticks_to_ts(HPET_FREQ, 1u64 << 32)
        };

        self.timers[n].slot_mut().running = true;
        if let Err(e) = self.timers[n].slot().timer.settime_abs(&its) {
            hpet_fatal("timer_settime_abs", std::io::Error::other(e));
        }
        self.timers[n].expts = value;
    }

    fn restart_timer(&mut self, n: usize, adj_compval: bool) {
        let mut now = TS_ZERO;
        let counter = self.counter(Some(&mut now));
        self.start_timer(n, counter, &now, adj_compval);
    }

    fn start_counting(&mut self) {
        self.countbase_ts = clock_now();

        /* restart the timers relative to the counter base value */
        for i in 0..VHPET_NUM_TIMERS {
            if self.timer_enabled(i) {
                let countbase = self.countbase;
                let ts = self.countbase_ts;
                self.start_timer(i, countbase, &ts, true);
            } else if self.timer_running(i) {
                warn!("vhpet t{i}'s timer is disabled but running");
                self.stop_timer(i, &TS_ZERO, false);
            }
        }
    }

    fn stop_counting(&mut self, counter: u32, now: &libc::timespec) {
        self.countbase = counter;
        for i in 0..VHPET_NUM_TIMERS {
            if self.timer_enabled(i) {
                self.stop_timer(i, now, true);
            } else if self.timer_running(i) {
                warn!("vhpet t{i}'s timer is disabled but running");
                self.stop_timer(i, &TS_ZERO, false);
            }
        }
    }

    fn timer_update_config(&mut self, n: usize, data: u64, mask: u64) {
        if self.timer_msi_enabled(n) || self.timer_edge_trig(n) {
            if self.isr & (1 << n) != 0 {
                warn!(
                    "vhpet t{n} intr asserted in {} mode",
                    if self.timer_msi_enabled(n) {
                        "msi"
                    } else {
                        "edge-triggered"
                    }
                );
                self.isr &= !(1 << n);
            }
        }

        let old_pin = self.timer_ioapic_pin(n);
        let oldval = self.timers[n].cap_config;

        let mut newval = oldval;
        update_register(&mut newval, data, mask);
        newval &= !(HPET_TCAP_RO_MASK | HPET_TCNF_32MODE);
        newval |= oldval & HPET_TCAP_RO_MASK;

        if newval == oldval {
            return;
        }

        self.timers[n].cap_config = newval;
        debug!("hpet t{n} cap_config set to 0x{newval:016x}");

        if (oldval ^ newval) & (HPET_TCNF_TYPE | HPET_TCNF_INT_ENB) != 0 {
            if !self.periodic_timer(n) {
                self.timers[n].comprate = 0;
            }

            if self.counter_enabled() {
                /* stop when both bits cleared; restart when the timer was
                 * stopped or TYPE toggled; a periodic timer staying
                 * periodic is left alone */
                if !self.timer_enabled(n) {
                    let now = clock_now();
                    self.stop_timer(n, &now, true);
                } else if oldval & (HPET_TCNF_TYPE | HPET_TCNF_INT_ENB) == 0
                    || (oldval ^ newval) & HPET_TCNF_TYPE != 0
                {
                    self.restart_timer(n, true);
                }
            }
        }

        /* An INT_ROUTE outside the allowed mask reverts to pin 0. */
        let allowed_irqs = (self.timers[n].cap_config >> 32) as u32;
        let mut new_pin = self.timer_ioapic_pin(n);
        if new_pin != 0 && allowed_irqs & (1 << new_pin) == 0 {
            warn!(
                "hpet t{n} configured invalid irq {new_pin}, allowed_irqs 0x{allowed_irqs:08x}"
            );
            new_pin = 0;
            self.timers[n].cap_config &= !HPET_TCNF_INT_ROUTE;
        }

        /* Clear a stuck level-triggered ISR bit when the interrupt is
         * disabled, switched to edge/fsb, or rerouted. */
        if self.isr & (1 << n) != 0 {
            if old_pin == 0 {
                warn!("vhpet t{n} intr asserted without a valid intr route");
                self.isr &= !(1 << n);
            } else if !self.timer_interrupt_enabled(n)
                || self.timer_msi_enabled(n)
                || self.timer_edge_trig(n)
                || new_pin != old_pin
            {
                debug!("hpet t{n} isr cleared due to configuration change");
                self.irq.set_gsi_irq(old_pin, GSI_SET_LOW);
                self.isr &= !(1 << n);
            }
        }
    }

    fn mmio_write(&mut self, gpa: u64, wval: u64, size: u8) {
        let offset = gpa - VHPET_BASE;

        /* Accesses must be 4 or 8 bytes wide and naturally aligned. */
        let (mut data, mut mask) = match size {
            8 => (wval, u64::MAX),
            4 => (wval, 0xffff_ffffu64),
            _ => {
                warn!("hpet invalid mmio write: offset 0x{offset:08x}, size {size}");
                return;
            }
        };
        if offset & (size as u64 - 1) != 0 {
            warn!("hpet invalid mmio write: offset 0x{offset:08x}, size {size}");
            return;
        }
        let reg = offset & !0x7;
        if size == 4 && offset & 0x4 != 0 {
            mask <<= 32;
            data <<= 32;
        }

        if reg == HPET_CONFIG {
            /* latch the counter before the config changes; disabling needs
             * countbase updated with the final value */
            let mut now = TS_ZERO;
            let counter = if self.counter_enabled() {
                self.counter(Some(&mut now))
            } else {
                self.counter(None)
            };
            let oldval = self.config;
            let mut config = self.config;
            update_register(&mut config, data, mask);
            /* LegacyReplacement routing is not supported */
            config &= HPET_CNF_ENABLE;
            self.config = config;

            if (oldval ^ self.config) & HPET_CNF_ENABLE != 0 {
                if self.counter_enabled() {
                    self.start_counting();
                    debug!("hpet enabled");
                } else {
                    self.stop_counting(counter, &now);
                    debug!("hpet disabled");
                }
            }
            return;
        }

        if reg == HPET_ISR {
            let isr_clear_mask = self.isr & data;
            for i in 0..VHPET_NUM_TIMERS {
                if isr_clear_mask & (1 << i) != 0 {
                    debug!("hpet t{i} isr cleared");
                    self.timer_clear_isr(i);
                }
            }
            return;
        }

        if reg == HPET_MAIN_COUNTER {
            /* zero-extend the counter to 64 bits before updating */
            let mut val64 = self.counter(None) as u64;
            update_register(&mut val64, data, mask);
            self.countbase = val64 as u32;
            if self.counter_enabled() {
                self.start_counting();
            }
            return;
        }

        for i in 0..VHPET_NUM_TIMERS {
            if reg == tcap_cnf_off(i) {
                self.timer_update_config(i, data, mask);
                return;
            }

            if reg == tcomp_off(i) {
                let old_compval = self.timers[i].compval;
                let old_comprate = self.timers[i].comprate;

                if self.periodic_timer(i) {
                    /* In periodic mode a comparator write changes compval
                     * only when VAL_SET is armed; the rate always updates. */
                    let mut val64 = self.timers[i].comprate as u64;
                    update_register(&mut val64, data, mask);
                    self.timers[i].comprate = val64 as u32;
                    if self.timers[i].cap_config & HPET_TCNF_VAL_SET != 0 {
                        self.timers[i].compval = val64 as u32;
                    }
                } else {
                    if self.timers[i].comprate != 0 {
                        warn!(
                            "vhpet t{i}'s comprate is {} in non-periodic mode - should be 0",
                            self.timers[i].comprate
                        );
                        self.timers[i].comprate = 0;
                    }
                    let mut val64 = self.timers[i].compval as u64;
                    update_register(&mut val64, data, mask);
                    self.timers[i].compval = val64 as u32;
                }

                self.timers[i].cap_config &= !HPET_TCNF_VAL_SET;

                if self.timers[i].compval != old_compval
                    || self.timers[i].comprate != old_comprate
                {
                    if self.counter_enabled() && self.timer_enabled(i) {
                        self.restart_timer(i, false);
                    }
                }
                return;
            }

            if offset == tfsb_val_off(i) || offset == tfsb_addr_off(i) {
                let mut msireg = self.timers[i].msireg;
                update_register(&mut msireg, data, mask);
                self.timers[i].msireg = msireg;
                return;
            }
        }

        warn!("hpet invalid mmio write: offset 0x{offset:08x}, size {size}");
    }

    fn mmio_read(&mut self, gpa: u64, size: u8) -> u64 {
        let offset = gpa - VHPET_BASE;

        if (size != 4 && size != 8) || offset & (size as u64 - 1) != 0 {
            warn!("hpet invalid mmio read: offset 0x{offset:08x}, size {size}");
            return 0;
        }
        let reg = offset & !0x7;

        let mut data = if reg == HPET_CAPABILITIES {
            vhpet_capabilities()
        } else if reg == HPET_CONFIG {
            self.config
        } else if reg == HPET_ISR {
            self.isr
        } else if reg == HPET_MAIN_COUNTER {
            self.counter(None) as u64
        } else {
            let mut found = None;
            for i in 0..VHPET_NUM_TIMERS {
                if reg == tcap_cnf_off(i) {
                    found = Some(self.timers[i].cap_config);
                    break;
                }
                if reg == tcomp_off(i) {
                    found = Some(self.timers[i].compval as u64);
                    break;
                }
                if offset == tfsb_val_off(i) || offset == tfsb_addr_off(i) {
                    found = Some(self.timers[i].msireg);
                    break;
                }
            }
            match found {
                Some(v) => v,
                None => {
                    warn!("hpet invalid mmio read: offset 0x{offset:08x}, size {size}");
                    0
                }
            }
        };

        if size == 4 && offset & 0x4 != 0 {
            data >>= 32;
        }
        data
    }
}

fn update_register(reg: &mut u64, data: u64, mask: u64) {
    *reg &= !mask;
    *reg |= data & mask;
}

fn timer_handler(state: &Weak<Mutex<VhpetState>>, n: usize, slot_idx: usize, nexp: u64) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut vhpet = state.lock().unwrap();

    debug!("hpet t{n} (slot {slot_idx}) fired");

    if !vhpet.inited {
        return;
    }

    let slot_running = vhpet.timers[n].slots[slot_idx]
        .as_ref()
        .map(|s| s.running)
        .unwrap_or(false);
    if !slot_running {
        debug!("hpet t{n} (slot {slot_idx}) already stopped");
        if slot_idx == vhpet.timers[n].tmridx && !ts_is_zero(&vhpet.timers[n].expts) {
            warn!("vhpet t{n} stopped with an expiration time");
            vhpet.timers[n].expts = TS_ZERO;
        }
        return;
    }
    if slot_idx != vhpet.timers[n].tmridx {
        warn!("vhpet t{n} observes a stale timer arg");
        return;
    }

    vhpet.timer_interrupt(n);

    let now = clock_now();
    let tmrts = match vhpet.timers[n].slot().timer.gettime() {
        Ok(ts) => ts,
        Err(e) => hpet_fatal("timer_gettime", std::io::Error::other(e)),
    };

    /* one-shot mode still carries a 2^32-tick periodicity */
    if ts_is_zero(&tmrts.it_interval) {
        warn!("vhpet t{n} has no periodicity");
    }

    /* The real expiration lands slightly after expts; a spurious interrupt
     * on stop is preferable to a lost one. */
    vhpet.timers[n].expts = ts_add(&tmrts.it_value, &now);

    /* catch expirations delivered after the dispatch thread last read */
    let mut nexp = nexp;
    let mut extra: u64 = 0;
    // SAFETY: reading our own nonblocking timerfd.
    let size = unsafe {
        libc::read(
            vhpet.timers[n].slot().timer.fd(),
            (&mut extra as *mut u64).cast(),
            8,
        )
    };
    if size == 8 {
        nexp += extra;
    }

    /* periodic timers keep compval as current as possible */
    let comprate = vhpet.timers[n].comprate;
    vhpet.timers[n].compval = vhpet.timers[n]
        .compval
        .wrapping_add((nexp as u32).wrapping_mul(comprate));
}

impl Vhpet {
    pub fn new(mevent: &Arc<Mevent>, irq: Arc<dyn IrqOps>) -> Result<Vhpet> {
        let mut init_err: Option<dmevent::timer::TimerError> = None;

        let state = Arc::new_cyclic(|weak: &Weak<Mutex<VhpetState>>| {
            let pincount = VIOAPIC_RTE_NUM;
            let allowed_irqs: u64 = if pincount >= 32 {
                0xff00_0000 /* irqs 24..31 */
            } else if pincount >= 20 {
                0xfu64 << (pincount - 4)
            } else {
                0
            };

            let mut timers = Vec::with_capacity(VHPET_NUM_TIMERS);
            for n in 0..VHPET_NUM_TIMERS {
                let mut slots: [Option<TimerSlot>; 3] = [None, None, None];
                for (j, slot) in slots.iter_mut().enumerate() {
                    let weak = weak.clone();
                    match AcrnTimer::new(mevent, TimerClock::Realtime, move |nexp| {
                        timer_handler(&weak, n, j, nexp)
                    }) {
                        Ok(timer) => {
                            *slot = Some(TimerSlot {
                                timer,
                                running: false,
                            })
                        }
                        Err(e) => init_err = Some(e),
                    }
                }
                timers.push(VhpetTimer {
                    cap_config: (allowed_irqs << 32)
                        | HPET_TCAP_PER_INT
                        | HPET_TCAP_FSB_INT_DEL,
                    msireg: 0,
                    compval: 0xffff_ffff,
                    comprate: 0,
                    expts: TS_ZERO,
                    slots,
                    tmridx: 0,
                });
            }

            Mutex::new(VhpetState {
                irq,
                inited: true,
                config: 0,
                isr: 0,
                countbase: 0,
                countbase_ts: TS_ZERO,
                timers,
            })
        });

        if let Some(e) = init_err {
            state.lock().unwrap().inited = false;
            return Err(e.into());
        }

        Ok(Vhpet { state })
    }

    /// Put the register window on the MMIO bus.
    pub fn register(&self, bus: &MemBus) -> Result<()> {
        let state = self.state.clone();
        bus.register(MemRange {
            name: "vhpet",
            base: VHPET_BASE,
            size: VHPET_SIZE,
            flags: MEM_F_RW,
            handler: Arc::new(move |dir, addr, size, val| {
                let mut vhpet = state.lock().unwrap();
                if !vhpet.inited {
                    return Err(MemError::Handler);
                }
                match dir {
                    MemDir::Read => *val = vhpet.mmio_read(addr, size),
                    MemDir::Write => vhpet.mmio_write(addr, *val, size),
                }
                Ok(())
            }),
        })?;
        Ok(())
    }

    pub fn deinit(&self, bus: &MemBus) {
        bus.unregister(VHPET_BASE);
        let mut vhpet = self.state.lock().unwrap();
        vhpet.inited = false;
        for n in 0..VHPET_NUM_TIMERS {
            for slot in vhpet.timers[n].slots.iter_mut().flatten() {
                slot.running = false;
                slot.timer.deinit();
            }
        }
    }

    #[cfg(test)]
    fn lock(&self) -> std::sync::MutexGuard<'_, VhpetState> {
        self.state.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingIrq {
        gsi_ops: StdMutex<Vec<(u32, u32)>>,
        msis: StdMutex<Vec<(u64, u64)>>,
    }

    impl IrqOps for RecordingIrq {
        fn set_gsi_irq(&self, gsi: u32, op: u32) {
            self.gsi_ops.lock().unwrap().push((gsi, op));
        }
        fn inject_msi(&self, addr: u64, data: u64) {
            self.msis.lock().unwrap().push((addr, data));
        }
    }

    fn new_vhpet() -> (Vhpet, Arc<RecordingIrq>, Arc<Mevent>) {
        let mevent = Mevent::new().unwrap();
        let irq = Arc::new(RecordingIrq::default());
        let vhpet = Vhpet::new(&mevent, irq.clone()).unwrap();
        (vhpet, irq, mevent)
    }

    #[test]
    fn capabilities_encode_freq_and_timers() {
        let cap = vhpet_capabilities();
        assert_eq!(cap & 0xff, 1);
        assert_eq!((cap >> 8) & 0x1f, 7);
        assert_eq!((cap >> 16) & 0xffff, 0x8086);
        assert_eq!(cap >> 32, FS_PER_S / HPET_FREQ);
        assert_eq!(cap & HPET_CAP_COUNT_SIZE, 0);
    }

    #[test]
    fn tick_algebra_truncates() {
        let ts = libc::timespec {
            tv_sec: 1,
            tv_nsec: 0,
        };
        assert_eq!(ts_to_ticks(HPET_FREQ, &ts), HPET_FREQ);
        let ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 500_000_000,
        };
        assert_eq!(ts_to_ticks(HPET_FREQ, &ts), HPET_FREQ / 2);
        let back = ticks_to_ts(HPET_FREQ, HPET_FREQ / 2);
        assert_eq!(back.tv_sec, 0);
        assert_eq!(back.tv_nsec, 500_000_000);
    }

    #[test]
    fn counter_advances_when_enabled() {
        let (vhpet, _irq, _mev) = new_vhpet();
        {
            let mut st = vhpet.lock();
            st.mmio_write(VHPET_BASE + HPET_CONFIG, HPET_CNF_ENABLE, 4);
        }
        let r1 = vhpet.lock().mmio_read(VHPET_BASE + HPET_MAIN_COUNTER, 4) as u32;
        std::thread::sleep(std::time::Duration::from_millis(30));
        let r2 = vhpet.lock().mmio_read(VHPET_BASE + HPET_MAIN_COUNTER, 4) as u32;
        let elapsed = r2.wrapping_sub(r1) as u64;
        // 30 ms at 2^24 Hz is ~503k ticks; allow generous scheduling slack
        assert!(elapsed >= HPET_FREQ * 25 / 1000, "elapsed {elapsed}");
        assert!(elapsed < HPET_FREQ, "elapsed {elapsed}");
    }

    #[test]
    fn misaligned_access_reads_zero_writes_dropped() {
        let (vhpet, _irq, _mev) = new_vhpet();
        let mut st = vhpet.lock();
        assert_eq!(st.mmio_read(VHPET_BASE + 0x2, 4), 0);
        assert_eq!(st.mmio_read(VHPET_BASE + HPET_CONFIG, 2), 0);
        st.mmio_write(VHPET_BASE + HPET_CONFIG + 1, 1, 4);
        assert_eq!(st.config, 0);
    }

    #[test]
    fn periodic_comparator_write_honors_val_set() {
        let (vhpet, _irq, _mev) = new_vhpet();
        let mut st = vhpet.lock();
        // periodic mode, counter disabled, no VAL_SET
        st.timers[0].cap_config |= HPET_TCNF_TYPE;
        st.timers[0].compval = 111;
        st.mmio_write(VHPET_BASE + tcomp_off(0), 5000, 4);
        assert_eq!(st.timers[0].comprate, 5000);
        assert_eq!(st.timers[0].compval, 111);

        // with VAL_SET both the rate and the live comparator move
        st.timers[0].cap_config |= HPET_TCNF_VAL_SET;
        st.mmio_write(VHPET_BASE + tcomp_off(0), 7000, 4);
        assert_eq!(st.timers[0].comprate, 7000);
        assert_eq!(st.timers[0].compval, 7000);
        // and the bit self-clears
        assert_eq!(st.timers[0].cap_config & HPET_TCNF_VAL_SET, 0);
    }

    #[test]
    fn isr_write_drops_level_line() {
        let (vhpet, irq, _mev) = new_vhpet();
        let mut st = vhpet.lock();
        // level-triggered, routed to pin 25 (allowed for 48-pin ioapic)
        st.timers[0].cap_config |= HPET_TCNF_INT_TYPE | HPET_TCNF_INT_ENB;
        st.timers[0].cap_config |= 25 << 9;
        st.isr |= 1;
        st.mmio_write(VHPET_BASE + HPET_ISR, 1, 4);
        assert_eq!(st.isr, 0);
        assert_eq!(irq.gsi_ops.lock().unwrap().as_slice(), &[(25, GSI_SET_LOW)]);
    }

    #[test]
    fn invalid_route_reverts_to_zero() {
        let (vhpet, _irq, _mev) = new_vhpet();
        let mut st = vhpet.lock();
        // pin 3 is not in the allowed 24..31 window
        st.timer_update_config(0, 3 << 9, HPET_TCNF_INT_ROUTE);
        assert_eq!(st.timer_ioapic_pin(0), 0);
        // pin 24 is allowed and sticks
        st.timer_update_config(0, 24 << 9, HPET_TCNF_INT_ROUTE);
        assert_eq!(st.timer_ioapic_pin(0), 24);
    }

    #[test]
    fn msi_timer_fires_through_msi() {
        let (vhpet, irq, _mev) = new_vhpet();
        let mut st = vhpet.lock();
        st.timers[2].cap_config |= HPET_TCNF_FSB_EN | HPET_TCNF_INT_ENB;
        st.timers[2].msireg = 0xFEE0_0000_0000_00A0;
        st.timer_interrupt(2);
        assert_eq!(
            irq.msis.lock().unwrap().as_slice(),
            &[(0xFEE0_0000, 0xA0)]
        );
    }
}
