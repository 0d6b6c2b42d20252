//! The management-socket wire format: a fixed header and a 256-byte
//! payload area viewed through typed accessors.

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

/// char[8] "mngr msg" read as a little-endian u64
pub const MNGR_MSG_MAGIC: u64 = 0x0067_736d_206d_6d76;

pub const PARAM_LEN: usize = 256;
pub const MAX_VM_OS_NAME_LEN: usize = 32;

/* message-id blocks */
pub const MSG_STR: u32 = 1;
pub const MSG_MAX: u32 = 2;

/* handled by the per-VM device-model server */
pub const DM_STOP: u32 = MSG_MAX + 1;
pub const DM_SUSPEND: u32 = MSG_MAX + 2;
pub const DM_RESUME: u32 = MSG_MAX + 3;
pub const DM_PAUSE: u32 = MSG_MAX + 4;
pub const DM_CONTINUE: u32 = MSG_MAX + 5;
pub const DM_QUERY: u32 = MSG_MAX + 6;
pub const DM_BLKRESCAN: u32 = MSG_MAX + 7;
pub const DM_MAX: u32 = MSG_MAX + 8;

/* handled by acrnd */
pub const ACRND_TIMER: u32 = DM_MAX + 1;
pub const ACRND_REASON: u32 = DM_MAX + 2;
pub const DM_NOTIFY: u32 = DM_MAX + 3;
pub const ACRND_STOP: u32 = DM_MAX + 4;
pub const ACRND_RESUME: u32 = DM_MAX + 5;
pub const ACRND_SUSPEND: u32 = DM_MAX + 6;
pub const ACRND_MAX: u32 = DM_MAX + 7;

/* handled by the service-VM lifecycle service */
pub const WAKEUP_REASON: u32 = ACRND_MAX + 1;
pub const RTC_TIMER: u32 = ACRND_MAX + 2;
pub const SUSPEND: u32 = ACRND_MAX + 3;
pub const SHUTDOWN: u32 = ACRND_MAX + 4;
pub const REBOOT: u32 = ACRND_MAX + 5;

#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MngrMsg {
    pub magic: u64,
    pub msgid: u32,
    reserved: u32,
    pub timestamp: u64,
    pub data: [u8; PARAM_LEN],
}

pub const MNGR_MSG_SIZE: usize = std::mem::size_of::<MngrMsg>();

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl MngrMsg {
    pub fn new(msgid: u32) -> MngrMsg {
        let mut msg = MngrMsg::new_zeroed();
        msg.magic = MNGR_MSG_MAGIC;
        msg.msgid = msgid;
        msg.timestamp = now();
        msg
    }

    /// An ack mirrors the request id and timestamp.
    pub fn ack_of(req: &MngrMsg) -> MngrMsg {
        let mut msg = MngrMsg::new_zeroed();
        msg.magic = MNGR_MSG_MAGIC;
        msg.msgid = req.msgid;
        msg.timestamp = req.timestamp;
        msg
    }

    pub fn is_valid(&self) -> bool {
        self.magic == MNGR_MSG_MAGIC
    }

    pub fn err(&self) -> i32 {
        i32::from_ne_bytes(self.data[0..4].try_into().unwrap())
    }

    pub fn set_err(&mut self, err: i32) {
        self.data[0..4].copy_from_slice(&err.to_ne_bytes());
    }

    pub fn reason(&self) -> u32 {
        u32::from_ne_bytes(self.data[0..4].try_into().unwrap())
    }

    pub fn set_reason(&mut self, reason: u32) {
        self.data[0..4].copy_from_slice(&reason.to_ne_bytes());
    }

    pub fn state(&self) -> i32 {
        self.err()
    }

    pub fn set_state(&mut self, state: i32) {
        self.set_err(state);
    }

    pub fn devargs(&self) -> String {
        let end = self.data.iter().position(|&b| b == 0).unwrap_or(PARAM_LEN);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }

    pub fn set_devargs(&mut self, args: &str) {
        let bytes = args.as_bytes();
        let n = bytes.len().min(PARAM_LEN - 1);
        self.data[..n].copy_from_slice(&bytes[..n]);
        self.data[n] = 0;
    }

    fn name_field(&self) -> String {
        let end = self.data[..MAX_VM_OS_NAME_LEN]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_VM_OS_NAME_LEN);
        String::from_utf8_lossy(&self.data[..end]).into_owned()
    }

    fn set_name_field(&mut self, name: &str) {
        let bytes = name.as_bytes();
        let n = bytes.len().min(MAX_VM_OS_NAME_LEN - 1);
        self.data[..MAX_VM_OS_NAME_LEN].fill(0);
        self.data[..n].copy_from_slice(&bytes[..n]);
    }

    /// ACRND_TIMER / RTC_TIMER requests: a vm name and an expiry time.
    pub fn timer_req(&self) -> (String, i64) {
        let t = i64::from_ne_bytes(
            self.data[MAX_VM_OS_NAME_LEN..MAX_VM_OS_NAME_LEN + 8]
                .try_into()
                .unwrap(),
        );
        (self.name_field(), t)
    }

    pub fn set_timer_req(&mut self, name: &str, t: i64) {
        self.set_name_field(name);
        self.data[MAX_VM_OS_NAME_LEN..MAX_VM_OS_NAME_LEN + 8]
            .copy_from_slice(&t.to_ne_bytes());
    }

    /// ACRND_STOP/SUSPEND/RESUME requests: a force flag and a timeout.
    pub fn stop_req(&self) -> (i32, u32) {
        let force = i32::from_ne_bytes(self.data[0..4].try_into().unwrap());
        let timeout = u32::from_ne_bytes(self.data[4..8].try_into().unwrap());
        (force, timeout)
    }

    pub fn set_stop_req(&mut self, force: i32, timeout: u32) {
        self.data[0..4].copy_from_slice(&force.to_ne_bytes());
        self.data[4..8].copy_from_slice(&timeout.to_ne_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_layout() {
        assert_eq!(MNGR_MSG_SIZE, 8 + 4 + 4 + 8 + PARAM_LEN);
        let msg = MngrMsg::new(DM_STOP);
        assert!(msg.is_valid());
        let bytes = msg.as_bytes();
        assert_eq!(&bytes[0..8], &MNGR_MSG_MAGIC.to_le_bytes());
    }

    #[test]
    fn magic_bytes_on_the_wire() {
        assert_eq!(&MNGR_MSG_MAGIC.to_le_bytes(), b"vmm msg\x00");
    }

    #[test]
    fn typed_payload_roundtrip() {
        let mut msg = MngrMsg::new(ACRND_TIMER);
        msg.set_timer_req("vm1", 12345);
        let (name, t) = msg.timer_req();
        assert_eq!(name, "vm1");
        assert_eq!(t, 12345);

        let mut msg = MngrMsg::new(ACRND_STOP);
        msg.set_stop_req(1, 30);
        assert_eq!(msg.stop_req(), (1, 30));

        let mut msg = MngrMsg::new(DM_BLKRESCAN);
        msg.set_devargs("blk,4,/dev/sdb");
        assert_eq!(msg.devargs(), "blk,4,/dev/sdb");

        let mut ack = MngrMsg::ack_of(&msg);
        ack.set_err(-22);
        assert_eq!(ack.err(), -22);
        assert_eq!(ack.msgid, DM_BLKRESCAN);
    }
}
