//! TPM 2.0 Command/Response Buffer frontend.
//!
//! Emulates the PC Client CRB register interface in the fixed window at
//! 0xFED40000 and forwards commands to the software TPM through a worker
//! thread woken by a condvar.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, error, warn};

use dmvmm::mem::{MemBus, MemDir, MemError, MemRange, MEM_F_RW};

use crate::tpm_emulator::{tpm_cmd_get_size, write_fatal_error_response, TpmEmulator};

pub const TPM_CRB_MMIO_ADDR: u64 = 0xFED4_0000;
pub const TPM_CRB_MMIO_SIZE: u64 = 0x5000;

/* register window offsets */
const CRB_REGS_LOC_STATE: u64 = 0x00;
const CRB_REGS_LOC_CTRL: u64 = 0x08;
const CRB_REGS_LOC_STS: u64 = 0x0C;
const CRB_REGS_INTF_ID_LO: u64 = 0x30;
const CRB_REGS_INTF_ID_HI: u64 = 0x34;
const CRB_REGS_CTRL_REQ: u64 = 0x40;
const CRB_REGS_CTRL_STS: u64 = 0x44;
const CRB_REGS_CTRL_CANCEL: u64 = 0x48;
const CRB_REGS_CTRL_START: u64 = 0x4C;
const CRB_REGS_CTRL_CMD_SIZE: u64 = 0x58;
const CRB_REGS_CTRL_CMD_PA_LO: u64 = 0x5C;
const CRB_REGS_CTRL_RSP_SIZE: u64 = 0x64;
const CRB_REGS_CTRL_RSP_PA: u64 = 0x68;
const CRB_DATA_BUFFER: u64 = 0x80;

pub const TPM_CRB_REG_SIZE: u64 = CRB_DATA_BUFFER;
pub const TPM_CRB_DATA_BUFFER_SIZE: usize = (TPM_CRB_MMIO_SIZE - TPM_CRB_REG_SIZE) as usize;

/* locality state bits */
const LOC_STATE_ASSIGNED: u32 = 1 << 1;
const LOC_STATE_ACTIVE_SHIFT: u32 = 2;
const LOC_STATE_ACTIVE_MASK: u32 = 0b111 << LOC_STATE_ACTIVE_SHIFT;
const LOC_STATE_REG_VALID_STS: u32 = 1 << 7;

/* locality status bits */
const LOC_STS_GRANTED: u32 = 1 << 0;
const LOC_STS_BEEN_SEIZED: u32 = 1 << 1;

/* control status bits */
const CTRL_STS_TPM_STS: u32 = 1 << 0;
const CTRL_STS_TPM_IDLE: u32 = 1 << 1;

const CRB_LOC_CTRL_REQUEST_ACCESS: u32 = 1 << 0;
const CRB_LOC_CTRL_RELINQUISH: u32 = 1 << 1;
const CRB_LOC_CTRL_SEIZE: u32 = 1 << 2;
const CRB_LOC_CTRL_RESET_ESTABLISHMENT: u32 = 1 << 3;

const CRB_CTRL_REQ_CMD_READY: u32 = 1 << 0;
const CRB_CTRL_REQ_CMD_IDLE: u32 = 1 << 1;

const CRB_CTRL_CANCEL_CMD: u32 = 0x0000_0001;

const CRB_CTRL_START_CMD: u32 = 0x0000_0001;
const CRB_CTRL_CMD_COMPLETED: u32 = 0x0000_0000;

/* interface identifier, hard-wired per the TCG CRB interface definition */
const CRB_INTF_ID_LO: u32 = 0x1        /* interface type: CRB active */
    | 0x1 << 4                         /* interface version */
    | 0b11 << 11                       /* data transfer size: 64 B */
    | 0x1 << 14                        /* CRB supported */
    | 0b01 << 17; /* interface selector: CRB */
const CRB_INTF_ID_HI: u32 = 0x8086; /* VID, DID 0 */

#[derive(Debug, thiserror::Error)]
pub enum TpmCrbError {
    #[error("mem bus: {0}")]
    Mem(#[from] MemError),
    #[error("emulator startup failed: {0}")]
    Startup(#[from] crate::tpm_emulator::SwtpmError),
    #[error("spawn: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, TpmCrbError>;

struct CrbState {
    regs: [u8; TPM_CRB_REG_SIZE as usize],
    data_buffer: Box<[u8; TPM_CRB_DATA_BUFFER_SIZE]>,
}

impl CrbState {
    fn reg_read32(&self, off: u64) -> u32 {
        LittleEndian::read_u32(&self.regs[off as usize..off as usize + 4])
    }

    fn reg_write32(&mut self, off: u64, val: u32) {
        LittleEndian::write_u32(&mut self.regs[off as usize..off as usize + 4], val);
    }

    fn reg_set_bits(&mut self, off: u64, bits: u32) {
        let v = self.reg_read32(off);
        self.reg_write32(off, v | bits);
    }

    fn reg_clear_bits(&mut self, off: u64, bits: u32) {
        let v = self.reg_read32(off);
        self.reg_write32(off, v & !bits);
    }

    fn tpm_idle(&self) -> bool {
        self.reg_read32(CRB_REGS_CTRL_STS) & CTRL_STS_TPM_IDLE != 0
    }

    fn cmd_in_flight(&self) -> bool {
        self.reg_read32(CRB_REGS_CTRL_START) == CRB_CTRL_START_CMD
    }

    fn active_locality(&self) -> u8 {
        let loc_state = self.reg_read32(CRB_REGS_LOC_STATE);
        if loc_state & LOC_STATE_ASSIGNED == 0 {
            return 0xFF;
        }
        ((loc_state & LOC_STATE_ACTIVE_MASK) >> LOC_STATE_ACTIVE_SHIFT) as u8
    }

    fn clear_data_buffer(&mut self) {
        self.data_buffer.fill(0);
    }

    fn reset(&mut self) {
        self.regs.fill(0);
        self.reg_set_bits(CRB_REGS_LOC_STATE, LOC_STATE_REG_VALID_STS);
        self.reg_set_bits(CRB_REGS_CTRL_STS, CTRL_STS_TPM_IDLE);
        self.reg_write32(CRB_REGS_INTF_ID_LO, CRB_INTF_ID_LO);
        self.reg_write32(CRB_REGS_INTF_ID_HI, CRB_INTF_ID_HI);
        self.reg_write32(CRB_REGS_CTRL_CMD_SIZE, TPM_CRB_DATA_BUFFER_SIZE as u32);
        self.reg_write32(CRB_REGS_CTRL_CMD_PA_LO, CRB_DATA_BUFFER as u32);
        self.reg_write32(CRB_REGS_CTRL_RSP_SIZE, TPM_CRB_DATA_BUFFER_SIZE as u32);
        self.reg_write32(CRB_REGS_CTRL_RSP_PA, CRB_DATA_BUFFER as u32);
        /* CTRL_RSP_PA is 64 bits wide, the upper half stays zero */
    }
}

/// The command in flight, handed to the worker under the signal mutex.
struct TpmCommand {
    locty: u8,
    in_len: usize,
}

struct Signal {
    cmd: Mutex<(Option<TpmCommand>, bool /* shutting down */)>,
    cond: Condvar,
}

pub struct TpmCrb {
    state: Arc<Mutex<CrbState>>,
    signal: Arc<Signal>,
    emulator: Arc<dyn TpmEmulator>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

fn mmio_read_bytes(bytes: &[u8], off: usize, size: u8) -> u64 {
    match size {
        1 => bytes[off] as u64,
        2 => LittleEndian::read_u16(&bytes[off..off + 2]) as u64,
        4 => LittleEndian::read_u32(&bytes[off..off + 4]) as u64,
        8 => LittleEndian::read_u64(&bytes[off..off + 8]),
        _ => 0,
    }
}

fn mmio_write_bytes(bytes: &mut [u8], off: usize, size: u8, val: u64) {
    match size {
        1 => bytes[off] = val as u8,
        2 => LittleEndian::write_u16(&mut bytes[off..off + 2], val as u16),
        4 => LittleEndian::write_u32(&mut bytes[off..off + 4], val as u32),
        8 => LittleEndian::write_u64(&mut bytes[off..off + 8], val),
        _ => {}
    }
}

impl TpmCrb {
    pub fn new(emulator: Arc<dyn TpmEmulator>) -> Result<TpmCrb> {
        let mut state = CrbState {
            regs: [0; TPM_CRB_REG_SIZE as usize],
            data_buffer: Box::new([0; TPM_CRB_DATA_BUFFER_SIZE]),
        };
        state.reset();

        /* Emulator startup; the stop -> buffersize -> init order matters. */
        emulator.startup(TPM_CRB_DATA_BUFFER_SIZE as u32, false)?;

        let state = Arc::new(Mutex::new(state));
        let signal = Arc::new(Signal {
            cmd: Mutex::new((None, false)),
            cond: Condvar::new(),
        });

        let w_state = state.clone();
        let w_signal = signal.clone();
        let w_emulator = emulator.clone();
        let worker = std::thread::Builder::new()
            .name("tpm_crb".into())
            .spawn(move || loop {
                let cmd = {
                    let mut guard = w_signal.cmd.lock().unwrap();
                    loop {
                        if guard.1 {
                            return;
                        }
                        if let Some(cmd) = guard.0.take() {
                            break cmd;
                        }
                        guard = w_signal.cond.wait(guard).unwrap();
                    }
                };

                let input = {
                    let st = w_state.lock().unwrap();
                    st.data_buffer[..cmd.in_len].to_vec()
                };

                let mut out = vec![0u8; TPM_CRB_DATA_BUFFER_SIZE];
                let (err, out_len) =
                    match w_emulator.handle_request(cmd.locty, &input, &mut out) {
                        Ok(n) => (false, n),
                        Err(e) => {
                            error!("tpm_crb: request failed: {e}");
                            write_fatal_error_response(&mut out);
                            (true, tpm_cmd_get_size(&out) as usize)
                        }
                    };

                let mut st = w_state.lock().unwrap();
                st.data_buffer[..out_len].copy_from_slice(&out[..out_len]);
                st.reg_write32(CRB_REGS_CTRL_START, CRB_CTRL_CMD_COMPLETED);
                if err {
                    /* fatal for the device */
                    st.reg_set_bits(CRB_REGS_CTRL_STS, CTRL_STS_TPM_STS);
                }
            })
            .map_err(TpmCrbError::Spawn)?;

        Ok(TpmCrb {
            state,
            signal,
            emulator,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn reg_read(&self, addr: u64, size: u8) -> u64 {
        let st = self.state.lock().unwrap();
        let off = ((addr & !3) - TPM_CRB_MMIO_ADDR) as usize;
        if off + size as usize > TPM_CRB_REG_SIZE as usize {
            warn!("tpm_crb: register read out of range @ {addr:#x} size {size}");
            return 0;
        }
        let mut val = mmio_read_bytes(&st.regs, off, size);
        if addr == TPM_CRB_MMIO_ADDR + CRB_REGS_LOC_STATE {
            val |= !self.emulator.get_tpm_established_flag() as u64;
        }
        val
    }

    fn reg_write(&self, addr: u64, size: u8, val: u64) {
        /* locality is encoded in address bits 12..14 */
        let target_loc = ((addr >> 12) & 0b111) as u8;
        let off = addr - TPM_CRB_MMIO_ADDR;
        let val32 = val as u32;
        let _ = size;

        let mut st = self.state.lock().unwrap();
        match off {
            CRB_REGS_CTRL_REQ => {
                if st.cmd_in_flight() {
                    return;
                }
                if val32 == CRB_CTRL_REQ_CMD_READY {
                    st.reg_clear_bits(CRB_REGS_CTRL_STS, CTRL_STS_TPM_IDLE);
                } else if val32 == CRB_CTRL_REQ_CMD_IDLE {
                    st.clear_data_buffer();
                    st.reg_set_bits(CRB_REGS_CTRL_STS, CTRL_STS_TPM_IDLE);
                }
            }
            CRB_REGS_CTRL_CANCEL => {
                if val32 == CRB_CTRL_CANCEL_CMD && !st.tpm_idle() && st.cmd_in_flight() {
                    self.emulator.cancel_cmd();
                }
            }
            CRB_REGS_CTRL_START => {
                if val32 == CRB_CTRL_START_CMD
                    && !st.cmd_in_flight()
                    && !st.tpm_idle()
                    && st.active_locality() == target_loc
                {
                    st.reg_write32(CRB_REGS_CTRL_START, CRB_CTRL_START_CMD);
                    let cmd_size = (BigEndian::read_u32(&st.data_buffer[2..6]) as usize)
                        .min(TPM_CRB_DATA_BUFFER_SIZE);

                    let mut guard = self.signal.cmd.lock().unwrap();
                    guard.0 = Some(TpmCommand {
                        locty: 0,
                        in_len: cmd_size,
                    });
                    self.signal.cond.notify_one();
                }
            }
            CRB_REGS_LOC_CTRL => match val32 {
                CRB_LOC_CTRL_RESET_ESTABLISHMENT => {}
                CRB_LOC_CTRL_RELINQUISH => {
                    st.reg_clear_bits(CRB_REGS_LOC_STATE, LOC_STATE_ASSIGNED);
                    st.reg_clear_bits(CRB_REGS_LOC_STS, LOC_STS_GRANTED);
                }
                CRB_LOC_CTRL_REQUEST_ACCESS | CRB_LOC_CTRL_SEIZE => {
                    st.reg_set_bits(CRB_REGS_LOC_STS, LOC_STS_GRANTED);
                    st.reg_clear_bits(CRB_REGS_LOC_STS, LOC_STS_BEEN_SEIZED);
                    st.reg_set_bits(CRB_REGS_LOC_STATE, LOC_STATE_ASSIGNED);
                }
                _ => {}
            },
            _ => {
                debug!("tpm_crb: dropping write to register 0x{off:x}");
            }
        }
    }

    fn data_buffer_access(&self, dir: MemDir, addr: u64, size: u8, val: &mut u64) {
        let mut st = self.state.lock().unwrap();
        if st.tpm_idle() {
            if dir == MemDir::Read {
                *val = 0;
            }
            return;
        }
        let off = (addr - (TPM_CRB_MMIO_ADDR + CRB_DATA_BUFFER)) as usize;
        if off + size as usize > TPM_CRB_DATA_BUFFER_SIZE {
            warn!("tpm_crb: data buffer access out of range @ 0x{addr:x}");
            if dir == MemDir::Read {
                *val = 0;
            }
            return;
        }
        match dir {
            MemDir::Read => *val = mmio_read_bytes(&st.data_buffer[..], off, size),
            MemDir::Write => mmio_write_bytes(&mut st.data_buffer[..], off, size, *val),
        }
    }

    /// Register both memory ranges: the CRB registers and the data buffer.
    pub fn register(self: &Arc<Self>, bus: &MemBus) -> Result<()> {
        let me = self.clone();
        bus.register(MemRange {
            name: "tpm_crb_reg",
            base: TPM_CRB_MMIO_ADDR,
            size: TPM_CRB_REG_SIZE,
            flags: MEM_F_RW,
            handler: Arc::new(move |dir, addr, size, val| {
                match dir {
                    MemDir::Read => *val = me.reg_read(addr, size),
                    MemDir::Write => me.reg_write(addr, size, *val),
                }
                Ok(())
            }),
        })?;

        let me = self.clone();
        bus.register(MemRange {
            name: "tpm_crb_buffer",
            base: TPM_CRB_MMIO_ADDR + CRB_DATA_BUFFER,
            size: TPM_CRB_DATA_BUFFER_SIZE as u64,
            flags: MEM_F_RW,
            handler: Arc::new(move |dir, addr, size, val| {
                me.data_buffer_access(dir, addr, size, val);
                Ok(())
            }),
        })?;
        Ok(())
    }

    pub fn deinit(&self, bus: &MemBus) {
        bus.unregister(TPM_CRB_MMIO_ADDR);
        bus.unregister(TPM_CRB_MMIO_ADDR + CRB_DATA_BUFFER);
        self.stop_worker();
    }

    fn stop_worker(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            {
                let mut guard = self.signal.cmd.lock().unwrap();
                guard.1 = true;
                self.signal.cond.notify_all();
            }
            let _ = worker.join();
        }
    }

    /// Reboot path: wipe the register file and re-init the emulator with
    /// its volatile state dropped.
    pub fn reset_for_reboot(&self) {
        let mut st = self.state.lock().unwrap();
        st.clear_data_buffer();
        st.reset();
        if let Err(e) = self.emulator.startup(TPM_CRB_DATA_BUFFER_SIZE as u32, true) {
            error!("tpm_crb: reboot startup failed: {e}");
            st.reg_set_bits(CRB_REGS_CTRL_STS, CTRL_STS_TPM_STS);
        }
    }

    #[cfg(test)]
    fn lock(&self) -> std::sync::MutexGuard<'_, CrbState> {
        self.state.lock().unwrap()
    }
}

impl Drop for TpmCrb {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tpm_emulator::SwtpmError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockTpm {
        requests: AtomicUsize,
        cancels: AtomicUsize,
        established: bool,
    }

    impl TpmEmulator for MockTpm {
        fn handle_request(
            &self,
            _locty: u8,
            input: &[u8],
            out: &mut [u8],
        ) -> std::result::Result<usize, SwtpmError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            /* echo a 12-byte response carrying the first input byte */
            BigEndian::write_u16(&mut out[0..2], 0x8001);
            BigEndian::write_u32(&mut out[2..6], 12);
            out[10] = input.first().copied().unwrap_or(0);
            out[11] = 0x5a;
            Ok(12)
        }
        fn cancel_cmd(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
        fn get_tpm_established_flag(&self) -> bool {
            self.established
        }
        fn reset_tpm_established_flag(&self) -> std::result::Result<(), SwtpmError> {
            Ok(())
        }
        fn startup(&self, _buffersize: u32, _is_resume: bool) -> std::result::Result<(), SwtpmError> {
            Ok(())
        }
    }

    fn new_crb() -> (Arc<TpmCrb>, Arc<MockTpm>) {
        let mock = Arc::new(MockTpm::default());
        let crb = Arc::new(TpmCrb::new(mock.clone()).unwrap());
        (crb, mock)
    }

    fn wait_completed(crb: &TpmCrb) {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if !crb.lock().cmd_in_flight() {
                return;
            }
            assert!(std::time::Instant::now() < deadline, "command never completed");
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
    }

    #[test]
    fn reset_state_matches_the_crb_interface() {
        let (crb, _mock) = new_crb();
        let st = crb.lock();
        /* valid-status flag at its architectural position */
        assert_eq!(st.reg_read32(CRB_REGS_LOC_STATE), LOC_STATE_REG_VALID_STS);
        assert_eq!(st.reg_read32(CRB_REGS_CTRL_STS), CTRL_STS_TPM_IDLE);
        assert_eq!(st.reg_read32(CRB_REGS_INTF_ID_LO), 0x25811);
        assert_eq!(st.reg_read32(CRB_REGS_INTF_ID_HI), 0x8086);
        assert_eq!(st.reg_read32(CRB_REGS_CTRL_CMD_PA_LO), 0x80);
        assert_eq!(
            st.reg_read32(CRB_REGS_CTRL_CMD_SIZE) as usize,
            TPM_CRB_DATA_BUFFER_SIZE
        );
    }

    #[test]
    fn loc_state_read_carries_established_flag() {
        let (crb, _mock) = new_crb();
        /* mock reports not-established, the read ORs the inverse in */
        let v = crb.reg_read(TPM_CRB_MMIO_ADDR + CRB_REGS_LOC_STATE, 4);
        assert_eq!(v as u32, LOC_STATE_REG_VALID_STS | 1);
    }

    #[test]
    fn locality_request_and_relinquish() {
        let (crb, _mock) = new_crb();
        crb.reg_write(
            TPM_CRB_MMIO_ADDR + CRB_REGS_LOC_CTRL,
            4,
            CRB_LOC_CTRL_REQUEST_ACCESS as u64,
        );
        {
            let st = crb.lock();
            assert_eq!(st.active_locality(), 0);
            assert!(st.reg_read32(CRB_REGS_LOC_STS) & LOC_STS_GRANTED != 0);
        }
        crb.reg_write(
            TPM_CRB_MMIO_ADDR + CRB_REGS_LOC_CTRL,
            4,
            CRB_LOC_CTRL_RELINQUISH as u64,
        );
        {
            let st = crb.lock();
            assert_eq!(st.active_locality(), 0xFF);
            assert_eq!(st.reg_read32(CRB_REGS_LOC_STS) & LOC_STS_GRANTED, 0);
        }
    }

    #[test]
    fn cmd_ready_clears_idle_and_idle_wipes_buffer() {
        let (crb, _mock) = new_crb();
        crb.reg_write(
            TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_REQ,
            4,
            CRB_CTRL_REQ_CMD_READY as u64,
        );
        assert!(!crb.lock().tpm_idle());

        crb.lock().data_buffer[0] = 0xAB;
        crb.reg_write(
            TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_REQ,
            4,
            CRB_CTRL_REQ_CMD_IDLE as u64,
        );
        let st = crb.lock();
        assert!(st.tpm_idle());
        assert_eq!(st.data_buffer[0], 0);
    }

    #[test]
    fn start_is_gated_on_idle_and_locality() {
        let (crb, mock) = new_crb();

        /* idle: start must be ignored */
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_START, 4, 1);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(mock.requests.load(Ordering::SeqCst), 0);

        /* ready, but no locality assigned: target 0 != 0xFF */
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_REQ, 4, 1);
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_START, 4, 1);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(mock.requests.load(Ordering::SeqCst), 0);

        /* grant locality 0, stage a command, then start */
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_LOC_CTRL, 4, 1);
        {
            let mut st = crb.lock();
            st.data_buffer[0] = 0x80;
            st.data_buffer[1] = 0x01;
            BigEndian::write_u32(&mut st.data_buffer[2..6], 16);
        }
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_START, 4, 1);
        wait_completed(&crb);
        assert_eq!(mock.requests.load(Ordering::SeqCst), 1);
        let st = crb.lock();
        /* the worker stored the response and completed the command */
        assert_eq!(st.data_buffer[10], 0x80);
        assert_eq!(st.data_buffer[11], 0x5a);
        assert_eq!(st.reg_read32(CRB_REGS_CTRL_START), CRB_CTRL_CMD_COMPLETED);
    }

    #[test]
    fn cancel_only_forwards_while_in_flight() {
        let (crb, mock) = new_crb();
        /* idle, nothing in flight: not forwarded */
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_CANCEL, 4, 1);
        assert_eq!(mock.cancels.load(Ordering::SeqCst), 0);
        /* ready but still nothing in flight */
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_REQ, 4, 1);
        crb.reg_write(TPM_CRB_MMIO_ADDR + CRB_REGS_CTRL_CANCEL, 4, 1);
        assert_eq!(mock.cancels.load(Ordering::SeqCst), 0);
    }
}
