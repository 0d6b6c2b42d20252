//! Virtual 8254 programmable interval timer.
//!
//! Three channels behind ports 0x40-0x43 plus the NMI status port 0x61.
//! Channel 0 drives a real timer through the same rotating-slot scheme as
//! the vHPET, so a callback racing a reprogram only ever sees an inactive
//! slot.

use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};

use dmevent::timer::ZERO_ITIMERSPEC;
use dmevent::{AcrnTimer, Mevent, TimerClock};
use dmvmm::inout::{InoutError, PioBus, IOPORT_F_INOUT, IOPORT_F_OUT};
use dmvmm::ioctl_defs::GSI_RAISING_PULSE;

use crate::hpet::{ticks_to_ts, ts_cmp, ts_sub, ts_to_ticks};
use crate::IrqOps;

pub const TIMER_CNTR0: u16 = 0x40;
pub const TIMER_CNTR1: u16 = 0x41;
pub const TIMER_CNTR2: u16 = 0x42;
pub const TIMER_MODE: u16 = 0x43;
pub const NMISC_PORT: u16 = 0x61;

const TMR2_OUT_STS: u32 = 0x20;

const PIT_8254_FREQ: u64 = 1_193_182;
const PIT_IOAPIC_IRQ: u32 = 2;

fn pit_hz_to_ticks(hz: u64) -> u32 {
    ((PIT_8254_FREQ + hz / 2) / hz) as u32
}

/* control word fields */
const TIMER_SEL_MASK: u8 = 0xc0;
const TIMER_SEL_READBACK: u8 = 0xc0;
const TIMER_RW_MASK: u8 = 0x30;
const TIMER_LATCH: u8 = 0x00;
const TIMER_16BIT: u8 = 0x30;
const TIMER_MODE_MASK: u8 = 0x0e;
const TIMER_MODE_DONT_CARE_MASK: u8 = 0x08;

const TIMER_INTTC: u8 = 0x00;
const TIMER_RATEGEN: u8 = 0x04;
const TIMER_SQWAVE: u8 = 0x06;
const TIMER_SWSTROBE: u8 = 0x08;

/* readback command fields, latch-select bits are active-low */
const TIMER_RB_LCTR: u8 = 0x20;
const TIMER_RB_LSTATUS: u8 = 0x10;
const TIMER_RB_CTR_0: u8 = 0x02;
const TIMER_RB_CTR_1: u8 = 0x04;
const TIMER_RB_CTR_2: u8 = 0x08;

/* status byte */
const TIMER_STS_OUT: u8 = 0x80;
const TIMER_STS_NULLCNT: u8 = 0x40;

fn periodic_mode(mode: u8) -> bool {
    mode == TIMER_RATEGEN || mode == TIMER_SQWAVE
}

#[derive(Debug, thiserror::Error)]
pub enum PitError {
    #[error("timer: {0}")]
    Timer(#[from] dmevent::timer::TimerError),
    #[error("pio bus: {0}")]
    Inout(#[from] InoutError),
}

pub type Result<T> = std::result::Result<T, PitError>;

fn pit_fatal(what: &str, err: impl std::fmt::Display) -> ! {
    log::error!("vpit: {what} returned: {err}");
    std::process::abort();
}

fn clock_now() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: writing a timespec out-param.
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
        pit_fatal("clock_gettime", std::io::Error::last_os_error());
    }
    ts
}

#[derive(Clone, Copy)]
struct Channel {
    mode: u8,
    /// initial counter value
    initial: u32,
    /// uptime when the counter was loaded
    start_ts: libc::timespec,
    cr: [u8; 2],
    ol: [u8; 2],
    nullcnt: bool,
    /// status latched
    slatched: bool,
    status: u8,
    crbyte: usize,
    olbyte: usize,
    frbyte: u8,
}

impl Default for Channel {
    fn default() -> Channel {
        Channel {
            mode: TIMER_INTTC,
            initial: 0,
            start_ts: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            cr: [0; 2],
            ol: [0; 2],
            nullcnt: false,
            slatched: false,
            status: 0,
            crbyte: 0,
            olbyte: 0,
            frbyte: 0,
        }
    }
}

struct PitSlot {
    timer: AcrnTimer,
    active: bool,
}

struct VpitState {
    irq: Arc<dyn IrqOps>,
    channels: [Channel; 3],
    /* rotating timer slots, only counter 0 uses them */
    slots: [Option<PitSlot>; 3],
    timer_idx: usize,
}

pub struct Vpit {
    state: Arc<Mutex<VpitState>>,
}

fn pit_cr_val(cr: [u8; 2]) -> u32 {
    let val = cr[0] as u32 | (cr[1] as u32) << 8;
    /* CR == 0 means 2^16 for binary counting */
    if val == 0 {
        0x10000
    } else {
        val
    }
}

impl VpitState {
    fn ticks_elapsed_since(&self, since: &libc::timespec) -> u64 {
        let now = clock_now();
        if ts_cmp(&now, since) != std::cmp::Ordering::Greater {
            return 0;
        }
        ts_to_ticks(PIT_8254_FREQ, &ts_sub(&now, since))
    }

    fn cntr0_timer_running(&self) -> bool {
        self.slots[self.timer_idx]
            .as_ref()
            .map(|s| s.active)
            .unwrap_or(false)
    }

    fn get_out(&self, channel: usize, delta_ticks: u64) -> bool {
        let c = &self.channels[channel];
        let mut initval = c.nullcnt;

        /* only channel 0 emulates delayed CE loading */
        if channel == 0 && periodic_mode(c.mode) {
            initval = initval && !self.cntr0_timer_running();
        }

        let initial = c.initial as u64;
        match c.mode {
            /* mode 0: OUT goes high once the count expires */
            TIMER_INTTC => !initval && delta_ticks >= initial,
            TIMER_RATEGEN => initval || delta_ticks % initial != initial - 1,
            TIMER_SQWAVE => initval || delta_ticks % initial < (initial + 1) / 2,
            TIMER_SWSTROBE => initval || delta_ticks != initial,
            _ => pit_fatal("invalid timer mode", c.mode),
        }
    }

    fn load_ce(&mut self, channel: usize) {
        let c = &mut self.channels[channel];
        /* no CR update in progress */
        if c.nullcnt && c.crbyte == 2 {
            c.initial = pit_cr_val(c.cr);
            c.nullcnt = false;
            c.crbyte = 0;
            c.start_ts = clock_now();

            if c.initial == 0 || c.initial > 0x10000 {
                warn!("vpit invalid initial count: 0x{:x} - use 0x10000", c.initial);
                c.initial = 0x10000;
            }
        }
    }

    fn timer_stop_cntr0(&mut self, rem: Option<&mut libc::itimerspec>) -> bool {
        let active = self.cntr0_timer_running();
        if active {
            let slot = self.slots[self.timer_idx]
                .as_mut()
                .expect("vpit timer slots exist after init");
            slot.active = false;
            if let Some(rem) = rem {
                match slot.timer.gettime() {
                    Ok(ts) => *rem = ts,
                    Err(e) => pit_fatal("timer_gettime", e),
                }
            }
            if let Err(e) = slot.timer.settime(&ZERO_ITIMERSPEC) {
                pit_fatal("timer_settime", e);
            }

            self.timer_idx = (self.timer_idx + 1) % 3;
            if self.cntr0_timer_running() {
                warn!("vpit timer {} is still active", self.timer_idx);
                self.slots[self.timer_idx]
                    .as_mut()
                    .expect("vpit timer slots exist after init")
                    .active = false;
            }
        }
        active
    }

    fn timer_start_cntr0(&mut self) {
        let mut ts = ZERO_ITIMERSPEC;
        let was_running = self.timer_stop_cntr0(Some(&mut ts));
        let mode = self.channels[0].mode;

        if was_running && periodic_mode(mode) {
            /* Counter is updated mid-flight in periodic mode: CE changes at
             * the end of the current counting cycle, so keep the remaining
             * it_value and only swap the period. */
            if ts.it_interval.tv_sec == 0 && ts.it_interval.tv_nsec == 0 {
                warn!("vpit is in periodic mode but with a one-shot timer");
            }
            ts.it_interval = ticks_to_ts(PIT_8254_FREQ, pit_cr_val(self.channels[0].cr) as u64);
        } else {
            /* aperiodic, or no running periodic counter: load CE now */
            self.load_ce(0);
            let c = &self.channels[0];
            let timer_ticks = if c.mode == TIMER_SWSTROBE {
                c.initial as u64 + 1
            } else {
                c.initial as u64
            };
            ts.it_value = ticks_to_ts(PIT_8254_FREQ, timer_ticks);
            if periodic_mode(c.mode) {
                ts.it_interval = ts.it_value;
            } else if ts.it_interval.tv_sec != 0 || ts.it_interval.tv_nsec != 0 {
                warn!("vpit is in aperiodic mode but with a periodic timer");
                ts.it_interval.tv_sec = 0;
                ts.it_interval.tv_nsec = 0;
            }
        }

        let slot = self.slots[self.timer_idx]
            .as_mut()
            .expect("vpit timer slots exist after init");
        slot.active = true;
        if let Err(e) = slot.timer.settime(&ts) {
            pit_fatal("timer_settime", e);
        }
    }

    fn update_counter(&mut self, channel: usize, latch: bool) -> (u16, u64) {
        let delta_ticks;
        {
            let initial = self.channels[channel].initial;
            if initial == 0 {
                /* Reading the counter without programming it first is most
                 * likely an OS bug; historical practice is to run it at
                 * 100 Hz in that case. */
                info!("vpit reading uninitialized counter value");
                self.channels[channel].initial = pit_hz_to_ticks(100);
                self.channels[channel].start_ts = clock_now();
                delta_ticks = 0;
            } else {
                let start_ts = self.channels[channel].start_ts;
                delta_ticks = self.ticks_elapsed_since(&start_ts);
            }
        }

        let c = &mut self.channels[channel];
        let initial = c.initial as u64;
        let lval: u16 = match c.mode {
            TIMER_INTTC | TIMER_SWSTROBE => (initial.wrapping_sub(delta_ticks)) as u16,
            TIMER_RATEGEN => (initial - delta_ticks % initial) as u16,
            TIMER_SQWAVE => {
                let mut t = delta_ticks % initial;
                if t >= (initial + 1) / 2 {
                    t -= (initial + 1) / 2;
                }
                ((initial & !0x1) - t * 2) as u16
            }
            _ => pit_fatal("invalid timer mode", c.mode),
        };

        /* cannot latch a new value until the old one has been consumed */
        if latch && c.olbyte == 0 {
            c.olbyte = 2;
            c.ol[1] = lval as u8; /* LSB */
            c.ol[0] = (lval >> 8) as u8; /* MSB */
        }

        (lval, delta_ticks)
    }

    fn readback1(&mut self, channel: usize, cmd: u8) {
        let (_, delta_ticks) = self.update_counter(channel, cmd & TIMER_RB_LCTR == 0);

        if cmd & TIMER_RB_LSTATUS == 0 && !self.channels[channel].slatched {
            self.channels[channel].slatched = true;
            /* the status byte is only refreshed on latching */
            let mut status = TIMER_16BIT | self.channels[channel].mode;
            if self.channels[channel].nullcnt {
                status |= TIMER_STS_NULLCNT;
            }
            if self.get_out(channel, delta_ticks) {
                status |= TIMER_STS_OUT;
            }
            self.channels[channel].status = status;
        }
    }

    fn readback(&mut self, cmd: u8) {
        if cmd & TIMER_RB_CTR_0 != 0 {
            self.readback1(0, cmd);
        }
        if cmd & TIMER_RB_CTR_1 != 0 {
            self.readback1(1, cmd);
        }
        if cmd & TIMER_RB_CTR_2 != 0 {
            self.readback1(2, cmd);
        }
    }

    fn update_mode(&mut self, val: u8) -> std::result::Result<(), ()> {
        let sel = val & TIMER_SEL_MASK;
        let rw = val & TIMER_RW_MASK;
        let mut mode = val & TIMER_MODE_MASK;

        if sel == TIMER_SEL_READBACK {
            self.readback(val);
            return Ok(());
        }

        if rw != TIMER_LATCH {
            if rw != TIMER_16BIT {
                warn!("vpit unsupported rw: 0x{rw:x}");
                return Err(());
            }
            /* a latch command never affects the counter mode */
            if mode != TIMER_INTTC
                && !periodic_mode(mode & !TIMER_MODE_DONT_CARE_MASK)
                && mode != TIMER_SWSTROBE
            {
                warn!("vpit unsupported mode: 0x{mode:x}");
                return Err(());
            }
        }

        let channel = (sel >> 6) as usize;

        if rw == TIMER_LATCH {
            self.update_counter(channel, true);
        } else {
            if mode == TIMER_MODE_DONT_CARE_MASK | TIMER_RATEGEN
                || mode == TIMER_MODE_DONT_CARE_MASK | TIMER_SQWAVE
            {
                mode &= !TIMER_MODE_DONT_CARE_MASK;
            }

            let c = &mut self.channels[channel];
            c.mode = mode;
            c.nullcnt = true;
            c.crbyte = 0; /* the control word must be written first */
            c.olbyte = 0; /* reset the latch after reprogramming */

            if channel == 0 {
                self.timer_stop_cntr0(None);
            }
        }

        Ok(())
    }

    fn counter_io(&mut self, is_in: bool, port: u16, eax: &mut u32) -> std::result::Result<(), ()> {
        let channel = (port - TIMER_CNTR0) as usize;

        if is_in {
            if self.channels[channel].slatched {
                /* return the latched status byte */
                *eax = self.channels[channel].status as u32;
                self.channels[channel].slatched = false;
            } else if self.channels[channel].olbyte == 0 {
                /* Once the output latch has been fully read, the port
                 * "follows" the free-running counter again, toggling
                 * MSB/LSB on each read (Linux TSC calibration). */
                let (tmp, _) = self.update_counter(channel, false);
                let mut tmp = tmp;
                if self.channels[channel].frbyte != 0 {
                    tmp >>= 8;
                }
                *eax = (tmp & 0xff) as u32;
                self.channels[channel].frbyte ^= 1;
            } else {
                let c = &mut self.channels[channel];
                c.olbyte -= 1;
                *eax = c.ol[c.olbyte] as u32;
            }
            return Ok(());
        }

        /* out: assemble the 16-bit CR from two successive byte writes */
        {
            let c = &mut self.channels[channel];
            if c.crbyte == 2 {
                /* keep nullcnt */
                c.crbyte = 0;
            }
            c.cr[c.crbyte] = *eax as u8;
            c.crbyte += 1;
        }

        if self.channels[channel].crbyte == 2 {
            let c = &mut self.channels[channel];
            if periodic_mode(c.mode) && pit_cr_val(c.cr) == 1 {
                /* illegal rate */
                c.cr[0] = 0;
                c.crbyte = 0;
                return Err(());
            }
            c.frbyte = 0;
            c.nullcnt = true;

            if port == TIMER_CNTR0 {
                /* start an interval timer for channel 0 */
                self.timer_start_cntr0();
            } else {
                /* channels 1 & 2 load CE immediately */
                self.load_ce(channel);
            }
        }

        Ok(())
    }
}

fn vpit_timer_handler(state: &Weak<Mutex<VpitState>>, slot_idx: usize) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let mut vpit = state.lock().unwrap();

    /* skip if this slot is no longer active */
    if !vpit.slots[slot_idx].as_ref().map(|s| s.active).unwrap_or(false) {
        return;
    }

    /* a rising edge on OUT */
    vpit.irq.set_gsi_irq(PIT_IOAPIC_IRQ, GSI_RAISING_PULSE);

    /* CR -> CE if necessary */
    vpit.load_ce(0);
}

impl Vpit {
    pub fn new(mevent: &Arc<Mevent>, irq: Arc<dyn IrqOps>) -> Result<Vpit> {
        let mut init_err: Option<dmevent::timer::TimerError> = None;

        let state = Arc::new_cyclic(|weak: &Weak<Mutex<VpitState>>| {
            let mut slots: [Option<PitSlot>; 3] = [None, None, None];
            for (j, slot) in slots.iter_mut().enumerate() {
                let weak = weak.clone();
                match AcrnTimer::new(mevent, TimerClock::Realtime, move |_| {
                    vpit_timer_handler(&weak, j)
                }) {
                    Ok(timer) => {
                        *slot = Some(PitSlot {
                            timer,
                            active: false,
                        })
                    }
                    Err(e) => init_err = Some(e),
                }
            }

            Mutex::new(VpitState {
                irq,
                channels: [Channel::default(); 3],
                slots,
                timer_idx: 0,
            })
        });

        if let Some(e) = init_err {
            return Err(e.into());
        }

        Ok(Vpit { state })
    }

    /// Register the counter, control-word and NMI status ports.
    pub fn register(&self, bus: &PioBus) -> Result<()> {
        let st = self.state.clone();
        let counters = move |is_in: bool, port: u16, bytes: u8, eax: &mut u32| {
            if bytes != 1 {
                warn!("vpit invalid operation size: {bytes} bytes");
                return Err(InoutError::Handler);
            }
            let mut vpit = st.lock().unwrap();
            if port == TIMER_MODE {
                if is_in {
                    warn!("invalid in op @ io port 0x{port:x}");
                    return Err(InoutError::Handler);
                }
                return vpit.update_mode(*eax as u8).map_err(|_| InoutError::Handler);
            }
            vpit.counter_io(is_in, port, eax)
                .map_err(|_| InoutError::Handler)
        };
        let h = Arc::new(counters);
        bus.register("vpit_counter", TIMER_CNTR0, 3, IOPORT_F_INOUT, h.clone())?;
        bus.register("vpit_cwr", TIMER_MODE, 1, IOPORT_F_OUT, h)?;

        let st = self.state.clone();
        bus.register(
            "nmi",
            NMISC_PORT,
            1,
            IOPORT_F_INOUT,
            Arc::new(move |is_in, _port, _bytes, eax: &mut u32| {
                /* GATE2 control is not emulated */
                if is_in {
                    let mut vpit = st.lock().unwrap();
                    let start_ts = vpit.channels[2].start_ts;
                    let ticks = vpit.ticks_elapsed_since(&start_ts);
                    *eax = if vpit.get_out(2, ticks) { TMR2_OUT_STS } else { 0 };
                } else {
                    info!("out instr on NMI port (0x{NMISC_PORT:x}) not supported");
                }
                Ok(())
            }),
        )?;
        Ok(())
    }

    pub fn deinit(&self, bus: &PioBus) {
        bus.unregister(TIMER_CNTR0, 3);
        bus.unregister(TIMER_MODE, 1);
        bus.unregister(NMISC_PORT, 1);
        let mut vpit = self.state.lock().unwrap();
        vpit.timer_stop_cntr0(None);
        for slot in vpit.slots.iter_mut().flatten() {
            slot.active = false;
            slot.timer.deinit();
        }
    }

    #[cfg(test)]
    fn lock(&self) -> std::sync::MutexGuard<'_, VpitState> {
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
    }

    impl IrqOps for RecordingIrq {
        fn set_gsi_irq(&self, gsi: u32, op: u32) {
            self.gsi_ops.lock().unwrap().push((gsi, op));
        }
        fn inject_msi(&self, _addr: u64, _data: u64) {}
    }

    fn new_vpit() -> (Vpit, Arc<RecordingIrq>, Arc<Mevent>) {
        let mevent = Mevent::new().unwrap();
        let irq = Arc::new(RecordingIrq::default());
        let vpit = Vpit::new(&mevent, irq.clone()).unwrap();
        (vpit, irq, mevent)
    }

    #[test]
    fn cr_zero_means_64k() {
        assert_eq!(pit_cr_val([0, 0]), 0x10000);
        assert_eq!(pit_cr_val([0x9b, 0x2e]), 0x2e9b);
    }

    #[test]
    fn mode2_programming_loads_counter() {
        let (vpit, _irq, _mev) = new_vpit();
        let mut st = vpit.lock();
        /* sel=CH0, rw=16BIT, mode=RATEGEN, binary */
        assert!(st.update_mode(0x34).is_ok());
        assert!(st.channels[0].nullcnt);
        assert_eq!(st.channels[0].mode, TIMER_RATEGEN);

        let mut eax = 0x9bu32;
        st.counter_io(false, TIMER_CNTR0, &mut eax).unwrap();
        let mut eax = 0x2eu32;
        st.counter_io(false, TIMER_CNTR0, &mut eax).unwrap();
        /* CR = 0x2E9B = 11931, roughly 100 Hz */
        assert_eq!(st.channels[0].initial, 11931);
        assert!(!st.channels[0].nullcnt);
        assert!(st.cntr0_timer_running());
        st.timer_stop_cntr0(None);
    }

    #[test]
    fn unsupported_mode_leaves_channel_untouched() {
        let (vpit, _irq, _mev) = new_vpit();
        let mut st = vpit.lock();
        st.update_mode(0x34).unwrap();
        let before_mode = st.channels[0].mode;
        let before_null = st.channels[0].nullcnt;
        /* mode 1 (hardware one-shot) is not supported */
        assert!(st.update_mode(0x32).is_err());
        assert_eq!(st.channels[0].mode, before_mode);
        assert_eq!(st.channels[0].nullcnt, before_null);
    }

    #[test]
    fn rate_one_rejected_in_periodic_mode() {
        let (vpit, _irq, _mev) = new_vpit();
        let mut st = vpit.lock();
        st.update_mode(0x34).unwrap();
        let mut eax = 1u32;
        st.counter_io(false, TIMER_CNTR0, &mut eax).unwrap();
        let mut eax = 0u32;
        assert!(st.counter_io(false, TIMER_CNTR0, &mut eax).is_err());
        assert_eq!(st.channels[0].crbyte, 0);
        assert!(!st.cntr0_timer_running());
    }

    #[test]
    fn dont_care_mode_bit_normalized() {
        let (vpit, _irq, _mev) = new_vpit();
        let mut st = vpit.lock();
        /* mode bits 0b110x: sqwave with the don't-care bit set */
        assert!(st.update_mode(0x3e).is_ok());
        assert_eq!(st.channels[0].mode, TIMER_SQWAVE);
    }

    #[test]
    fn latch_then_read_returns_both_bytes() {
        let (vpit, _irq, _mev) = new_vpit();
        let mut st = vpit.lock();
        st.update_mode(0x74).unwrap(); /* ch1, rategen */
        let mut b = 0x40u32;
        st.counter_io(false, TIMER_CNTR1, &mut b).unwrap();
        let mut b = 0x00u32;
        st.counter_io(false, TIMER_CNTR1, &mut b).unwrap();

        /* latch ch1 */
        st.update_mode(0x40).unwrap();
        assert_eq!(st.channels[1].olbyte, 2);
        let mut lo = 0u32;
        st.counter_io(true, TIMER_CNTR1, &mut lo).unwrap();
        let mut hi = 0u32;
        st.counter_io(true, TIMER_CNTR1, &mut hi).unwrap();
        let val = (hi << 8) | lo;
        assert!(val <= 0x40, "latched {val:#x}");
        assert_eq!(st.channels[1].olbyte, 0);
    }

    #[test]
    fn readback_latches_status() {
        let (vpit, _irq, _mev) = new_vpit();
        let mut st = vpit.lock();
        st.update_mode(0x34).unwrap();
        /* readback status of counter 0 (latch-count bit high = skip) */
        st.update_mode(TIMER_SEL_READBACK | TIMER_RB_LCTR | TIMER_RB_CTR_0)
            .unwrap();
        assert!(st.channels[0].slatched);
        assert_eq!(
            st.channels[0].status & (TIMER_16BIT | TIMER_MODE_MASK),
            TIMER_16BIT | TIMER_RATEGEN
        );
        assert!(st.channels[0].status & TIMER_STS_NULLCNT != 0);

        /* the next counter read returns the status byte */
        let mut eax = 0u32;
        st.counter_io(true, TIMER_CNTR0, &mut eax).unwrap();
        assert_eq!(eax as u8, st.channels[0].status);
        assert!(!st.channels[0].slatched);
    }

    #[test]
    fn timer_fires_pulse_on_gsi2() {
        let (vpit, irq, mev) = new_vpit();
        {
            let mut st = vpit.lock();
            st.update_mode(0x34).unwrap();
            /* ~1 kHz */
            let cr = pit_hz_to_ticks(1000);
            let mut b = (cr & 0xff) as u32;
            st.counter_io(false, TIMER_CNTR0, &mut b).unwrap();
            let mut b = (cr >> 8) as u32;
            st.counter_io(false, TIMER_CNTR0, &mut b).unwrap();
        }

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop2 = stop.clone();
        let mev2 = mev.clone();
        let t = std::thread::spawn(move || {
            mev2.dispatch(|| stop2.load(std::sync::atomic::Ordering::SeqCst));
        });

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if irq
                .gsi_ops
                .lock()
                .unwrap()
                .iter()
                .any(|&(gsi, op)| gsi == PIT_IOAPIC_IRQ && op == GSI_RAISING_PULSE)
            {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no PIT pulse seen");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        stop.store(true, std::sync::atomic::Ordering::SeqCst);
        mev.notify().unwrap();
        t.join().unwrap();
        vpit.lock().timer_stop_cntr0(None);
    }

    #[test]
    fn port61_reflects_ch2_out() {
        let (vpit, _irq, _mev) = new_vpit();
        let mut st = vpit.lock();
        /* ch2 mode 0, small count that expires immediately */
        st.update_mode(0xb0).unwrap();
        let mut b = 2u32;
        st.counter_io(false, TIMER_CNTR2, &mut b).unwrap();
        let mut b = 0u32;
        st.counter_io(false, TIMER_CNTR2, &mut b).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let start_ts = st.channels[2].start_ts;
        let ticks = st.ticks_elapsed_since(&start_ts);
        assert!(st.get_out(2, ticks));
    }
}
