//! Carrier Board Communication protocol: link-layer framing over a byte
//! ring, address/service packing, and the lifecycle/wakeup/signal service
//! handlers.

use log::{debug, warn};

use crate::ioc::{IocEventType, VmRequestType};

pub const CBC_SOF_VALUE: u8 = 0x05; /* start of frame */
pub const CBC_EXT_VALUE: u8 = 0x00; /* extension bit value */

pub const CBC_PRIO_MASK: u8 = 0x07;
pub const CBC_MUX_MASK: u8 = 0x1F;
pub const CBC_LEN_MASK: u8 = 0x1F;
pub const CBC_SEQ_MASK: u8 = 0x03;
pub const CBC_EXT_MASK: u8 = 0x01;
pub const CBC_MUX_OFFSET: u8 = 3;
pub const CBC_SEQ_OFFSET: u8 = 0;
pub const CBC_LEN_OFFSET: u8 = 2;
pub const CBC_EXT_OFFSET: u8 = 7;
pub const CBC_LEN_UNIT: usize = 4; /* frame content block length */
pub const CBC_PRIO_OFFSET: u8 = 0;
pub const CBC_CHKSUM_SIZE: usize = 1;
pub const CBC_GRANULARITY: usize = 4; /* frame alignment */
pub const CBC_LINK_HDR_SIZE: usize = 3; /* SOF + ELS + checksum */
pub const CBC_ADDR_HDR_SIZE: usize = 1;
pub const CBC_SRV_HDR_SIZE: usize = 1;
pub const CBC_MAX_FRAME_SIZE: usize = 96;
pub const CBC_MIN_FRAME_SIZE: usize = 8;
pub const CBC_MAX_SERVICE_SIZE: usize = 64;

pub const CBC_SOF_POS: usize = 0;
pub const CBC_ELS_POS: usize = CBC_SOF_POS + 1;
pub const CBC_ADDR_POS: usize = CBC_SOF_POS + CBC_LINK_HDR_SIZE - CBC_CHKSUM_SIZE;
pub const CBC_SRV_POS: usize = CBC_ADDR_POS + CBC_ADDR_HDR_SIZE;
pub const CBC_PAYLOAD_POS: usize = CBC_SRV_POS + CBC_SRV_HDR_SIZE;

/* wakeup reason bits */
pub const CBC_WK_RSN_BTN: u32 = 1 << 5; /* ignition button */
pub const CBC_WK_RSN_RTC: u32 = 1 << 9;
pub const CBC_WK_RSN_DOR: u32 = 1 << 11; /* car door */
pub const CBC_WK_RSN_FS5: u32 = 1 << 22; /* force S5 */
pub const CBC_WK_RSN_SOC: u32 = 1 << 23;
/* bit 24 enables the mediator debug channels, outside the protocol mask */
pub const CBC_WK_RSN_DGB: u32 = 1 << 24;
pub const CBC_WK_RSN_SHUTDOWN: u32 = 0;
pub const CBC_WK_RSN_ALL: u32 =
    CBC_WK_RSN_BTN | CBC_WK_RSN_RTC | CBC_WK_RSN_DOR | CBC_WK_RSN_FS5 | CBC_WK_RSN_SOC;

pub const CBC_RING_BUFFER_SIZE: usize = 256;

/* IOC channel ids; the low 5 bits double as the CBC mux value */
pub const IOC_NATIVE_PMT: usize = 0;
pub const IOC_NATIVE_LFCC: usize = 1;
pub const IOC_NATIVE_SIGNAL: usize = 2;
pub const IOC_NATIVE_ESIG: usize = 3;
pub const IOC_NATIVE_DIAG: usize = 4;
pub const IOC_NATIVE_DLT: usize = 5;
pub const IOC_NATIVE_LINDA: usize = 6;
pub const IOC_NATIVE_RAW0: usize = 7;
pub const IOC_NATIVE_RAW11: usize = 18;
pub const IOC_VIRTUAL_UART: usize = 19;
pub const IOC_LOCAL_EVENT: usize = 20;
pub const IOC_NATIVE_DUMMY0: usize = 21;
pub const IOC_NATIVE_DUMMY1: usize = 22;
pub const IOC_NATIVE_DUMMY2: usize = 23;
pub const IOC_CH_MAX: usize = 24;

/* CBC address-layer priorities */
pub const CBC_PRIO_LOW: u8 = 2;
pub const CBC_PRIO_MEDIUM: u8 = 3;
pub const CBC_PRIO_HIGH: u8 = 6;

/* signal-data service commands */
pub const CBC_SD_SINGLE_SIGNAL: u8 = 1;
pub const CBC_SD_MULTI_SIGNAL: u8 = 2;
pub const CBC_SD_GROUP_SIGNAL: u8 = 3;
pub const CBC_SD_INVAL_SSIG: u8 = 6;
pub const CBC_SD_INVAL_MSIG: u8 = 7;
pub const CBC_SD_INVAL_SGRP: u8 = 8;
pub const CBC_SD_INVAL_MGRP: u8 = 9;
pub const CBC_SD_OPEN_CHANNEL: u8 = 253;
pub const CBC_SD_CLOSE_CHANNEL: u8 = 254;
pub const CBC_SD_RESET_CHANNEL: u8 = 255;

/* system-control service commands */
pub const CBC_SC_WK_RSN: u8 = 1;
pub const CBC_SC_HB: u8 = 2;
pub const CBC_SC_RTC: u8 = 5;

/* heartbeat commands */
pub const CBC_HB_SD_PREP: u8 = 0;
pub const CBC_HB_ACTIVE: u8 = 1;
pub const CBC_HB_SD_DLY: u8 = 2;
pub const CBC_HB_INITIAL: u8 = 3;
pub const CBC_HB_STANDBY: u8 = 4;

/* SUS_STAT actions */
pub const CBC_SS_REFRESH: u8 = 7; /* ram refresh, S3 */

/* RTC timer units */
pub const CBC_RTC_TIMER_U_SEC: u8 = 0;
pub const CBC_RTC_TIMER_U_MIN: u8 = 1;
pub const CBC_RTC_TIMER_U_HOUR: u8 = 2;
pub const CBC_RTC_TIMER_U_DAY: u8 = 3;
pub const CBC_RTC_TIMER_U_WEEK: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbcQueueType {
    Rx,
    Tx,
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbcRequestType {
    Prot,
    Suspend,
    Shutdown,
    HbInit,
    UosActive,
    UosInactive,
}

/// One CBC request moving between the core, rx and tx threads.
#[derive(Clone)]
pub struct CbcRequest {
    pub srv_len: usize,
    pub link_len: usize,
    pub id: usize,
    pub rtype: CbcRequestType,
    pub buf: [u8; CBC_MAX_FRAME_SIZE],
}

impl Default for CbcRequest {
    fn default() -> CbcRequest {
        CbcRequest {
            srv_len: 0,
            link_len: 0,
            id: IOC_NATIVE_PMT,
            rtype: CbcRequestType::Prot,
            buf: [0; CBC_MAX_FRAME_SIZE],
        }
    }
}

/// Byte ring between the virtual UART and the link-layer unpacker.
pub struct CbcRing {
    head: usize,
    tail: usize,
    buf: [u8; CBC_RING_BUFFER_SIZE],
}

impl Default for CbcRing {
    fn default() -> Self {
        CbcRing {
            head: 0,
            tail: 0,
            buf: [0; CBC_RING_BUFFER_SIZE],
        }
    }
}

impl CbcRing {
    /// Buffer incoming bytes; they may not yet form a complete frame.
    pub fn copy_to_ring(&mut self, data: &[u8]) -> Result<(), ()> {
        for &b in data {
            let pos = (self.tail + 1) & (CBC_RING_BUFFER_SIZE - 1);
            if pos == self.head {
                warn!("ioc cbc ring buffer is full!!");
                return Err(());
            }
            self.buf[self.tail] = b;
            self.tail = pos;
        }
        Ok(())
    }

    fn avail(&self) -> usize {
        (self.tail + CBC_RING_BUFFER_SIZE - self.head) & (CBC_RING_BUFFER_SIZE - 1)
    }

    fn at(&self, i: usize) -> u8 {
        self.buf[(self.head + i) & (CBC_RING_BUFFER_SIZE - 1)]
    }

    fn skip(&mut self, bytes: usize) {
        self.head = (self.head + bytes) & (CBC_RING_BUFFER_SIZE - 1);
    }
}

pub fn cbc_cal_chksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| {
        acc.wrapping_add(0x100u16.wrapping_sub(b as u16))
    })
}

fn ring_chksum_ok(ring: &CbcRing, len: usize, checksum: u8) -> bool {
    let mut value: u16 = 0;
    for i in 0..len {
        value = value.wrapping_add(0x100u16.wrapping_sub(ring.at(i) as u16));
    }
    (value & 0xFF) as u8 == checksum
}

/// Link-layer frame detector. Bad SOF, oversize or checksum failures skip a
/// single byte and rescan; sequence mismatches are logged but the frame is
/// kept.
#[derive(Default)]
pub struct CbcUnpacker {
    /// length of a partially received frame, 0 when scanning
    remains: usize,
    rx_seq: u8,
}

impl CbcUnpacker {
    /// Pull every complete frame out of the ring; `emit` receives the raw
    /// link frame and its service length.
    pub fn unpack(&mut self, ring: &mut CbcRing, mut emit: impl FnMut(&[u8], usize)) {
        loop {
            let avail = ring.avail();
            if avail < CBC_MIN_FRAME_SIZE || avail < self.remains {
                break;
            }
            self.remains = 0;

            if ring.at(CBC_SOF_POS) != CBC_SOF_VALUE {
                ring.skip(1);
                continue;
            }

            let els = ring.at(CBC_ELS_POS);
            let _ext = (els >> CBC_EXT_OFFSET) & CBC_EXT_MASK;
            let len = (els >> CBC_LEN_OFFSET) & CBC_LEN_MASK;
            let seq = (els >> CBC_SEQ_OFFSET) & CBC_SEQ_MASK;

            /* length is counted in 4-byte blocks, zero meaning one block */
            let srv_len = (len as usize + 1) * CBC_LEN_UNIT;
            let frame_len = srv_len + CBC_LINK_HDR_SIZE + CBC_ADDR_HDR_SIZE;

            if frame_len > CBC_MAX_FRAME_SIZE {
                ring.skip(1);
                continue;
            }

            if avail < frame_len {
                /* wait for the rest of this frame */
                self.remains = frame_len;
                continue;
            }

            let checksum = ring.at(frame_len - 1);
            if !ring_chksum_ok(ring, frame_len - 1, checksum) {
                ring.skip(1);
                continue;
            }

            self.rx_seq = (self.rx_seq + 1) & CBC_SEQ_MASK;
            if self.rx_seq != seq {
                warn!("ioc rx sequence check failed");
                self.rx_seq = seq;
            }

            let mut frame = [0u8; CBC_MAX_FRAME_SIZE];
            for (i, b) in frame.iter_mut().enumerate().take(frame_len) {
                *b = ring.at(i);
            }
            emit(&frame[..frame_len], srv_len);

            ring.skip(frame_len);
        }
    }
}

/// Align the frame to the CBC granularity, padding with 0xFF.
fn cbc_fill_padding(buf: &mut [u8], size: usize, unit: usize) -> usize {
    let left = size % unit;
    if left == 0 {
        return size;
    }
    let padded = size + unit - left;
    for b in buf.iter_mut().take(padded).skip(size - CBC_CHKSUM_SIZE) {
        *b = 0xFF;
    }
    padded
}

/// Address header: channel mux plus a priority derived from the channel
/// class.
pub fn cbc_pack_address(req: &mut CbcRequest) {
    let mux = req.id as u8;
    let prio = match req.id {
        IOC_NATIVE_PMT | IOC_NATIVE_LFCC | IOC_NATIVE_SIGNAL | IOC_NATIVE_DLT => CBC_PRIO_HIGH,
        IOC_NATIVE_DIAG => CBC_PRIO_LOW,
        _ => CBC_PRIO_MEDIUM,
    };
    req.buf[CBC_ADDR_POS] =
        ((mux & CBC_MUX_MASK) << CBC_MUX_OFFSET) | ((prio & CBC_PRIO_MASK) << CBC_PRIO_OFFSET);
}

/// Link header: SOF, the ext/len/seq byte, alignment padding and the
/// trailing checksum. The tx sequence is monotonic mod 4.
pub fn cbc_pack_link(req: &mut CbcRequest, tx_seq: &mut u8) {
    if req.srv_len > CBC_MAX_SERVICE_SIZE {
        debug!("ioc pack req with wrong service length:{}", req.srv_len);
        return;
    }

    let len = req.srv_len + CBC_ADDR_HDR_SIZE + CBC_LINK_HDR_SIZE;
    let len = cbc_fill_padding(&mut req.buf, len, CBC_GRANULARITY);

    req.buf[CBC_SOF_POS] = CBC_SOF_VALUE;
    req.buf[CBC_ELS_POS] = (CBC_EXT_VALUE & CBC_EXT_MASK) << CBC_EXT_OFFSET;
    req.buf[CBC_ELS_POS] |=
        ((((req.srv_len - 1) / CBC_LEN_UNIT) as u8) & CBC_LEN_MASK) << CBC_LEN_OFFSET;
    req.buf[CBC_ELS_POS] |= (*tx_seq & CBC_SEQ_MASK) << CBC_SEQ_OFFSET;

    let checksum = cbc_cal_chksum(&req.buf[..len - 1]);
    req.buf[len - 1] = (checksum & 0xFF) as u8;

    req.link_len = len;
    *tx_seq = (*tx_seq + 1) & CBC_SEQ_MASK;
}

#[derive(Clone, Copy)]
pub struct CbcSignal {
    pub id: u16,
    /// length in bits, not bytes
    pub len: u16,
    pub active: bool,
}

#[derive(Clone, Copy)]
pub struct CbcGroup {
    pub id: u16,
    pub active: bool,
}

/// Signal/group tables plus the forwarding whitelists for one direction.
pub struct CbcConfig {
    pub sig_tbl: Vec<CbcSignal>,
    pub grp_tbl: Vec<CbcGroup>,
    pub wlist_sig: Vec<u16>,
    pub wlist_grp: Vec<u16>,
}

impl CbcConfig {
    fn find_signal(&self, id: u16) -> Option<&CbcSignal> {
        self.sig_tbl.iter().find(|s| s.id == id)
    }

    fn signal_len_bytes(&self, id: u16) -> usize {
        self.find_signal(id)
            .map(|s| (s.len as usize + 7) / 8)
            .unwrap_or(0)
    }

    fn disable_signal(&mut self, id: u16) {
        if let Some(s) = self.sig_tbl.iter_mut().find(|s| s.id == id) {
            s.active = false;
        }
    }

    fn disable_group(&mut self, id: u16) {
        if let Some(g) = self.grp_tbl.iter_mut().find(|g| g.id == id) {
            g.active = false;
        }
    }

    fn wlist_verify_signal(&self, id: u16) -> bool {
        self.wlist_sig.contains(&id)
            && self.find_signal(id).map(|s| s.active).unwrap_or(false)
    }

    fn wlist_verify_group(&self, id: u16) -> bool {
        self.wlist_grp.contains(&id)
            && self
                .grp_tbl
                .iter()
                .find(|g| g.id == id)
                .map(|g| g.active)
                .unwrap_or(false)
    }
}

/// What the protocol handlers need from the mediator device.
pub trait CbcIo {
    fn ch_xmit(&self, id: usize, data: &[u8]) -> std::io::Result<usize>;
    fn update_event(&self, evt: IocEventType);
    fn set_wakeup_timer(&self, due_seconds: u64);
    fn boot_reason(&self) -> u32;
    fn vm_req(&self) -> VmRequestType;
    fn cbc_enabled(&self) -> bool;
}

/// Per-thread protocol context; rx and tx each own one, so no state is
/// shared between the directions.
pub struct CbcPktCtx {
    pub uos_active: bool,
    pub reason: u32,
    pub evt: IocEventType,
    pub sig_active: bool,
    pub tx_seq: u8,
}

impl Default for CbcPktCtx {
    fn default() -> CbcPktCtx {
        CbcPktCtx {
            uos_active: false,
            reason: 0,
            evt: IocEventType::Invalid,
            sig_active: false,
            tx_seq: 0,
        }
    }
}

/// Send the request either out the virtual UART (packing the address and
/// link layers first) or to the owning native channel.
fn cbc_send_pkt(ctx: &mut CbcPktCtx, req: &mut CbcRequest, io: &dyn CbcIo) {
    let (id, range) = if req.link_len == 0 {
        cbc_pack_address(req);
        cbc_pack_link(req, &mut ctx.tx_seq);
        (IOC_VIRTUAL_UART, 0..req.link_len)
    } else {
        (req.id, CBC_SRV_POS..CBC_SRV_POS + req.srv_len)
    };
    if io.ch_xmit(id, &req.buf[range]).is_err() {
        debug!("ioc xmit failed on channel id={id}");
    }
}

fn cbc_update_heartbeat(
    ctx: &mut CbcPktCtx,
    req: &mut CbcRequest,
    io: &dyn CbcIo,
    cmd: u8,
    sus_action: u8,
) -> CbcQueueType {
    let evt = match cmd {
        CBC_HB_INITIAL | CBC_HB_ACTIVE | CBC_HB_STANDBY | CBC_HB_SD_DLY => IocEventType::HbActive,
        CBC_HB_SD_PREP => {
            if sus_action == CBC_SS_REFRESH {
                IocEventType::RamRefresh
            } else {
                IocEventType::HbInactive
            }
        }
        _ => return CbcQueueType::Free,
    };

    if evt != ctx.evt {
        io.update_event(evt);
        ctx.evt = evt;
    }

    /* the first heartbeat wants a wakeup reason right away */
    if cmd == CBC_HB_INITIAL {
        req.rtype = CbcRequestType::HbInit;
        return CbcQueueType::Tx;
    }
    CbcQueueType::Free
}

/// Rewrite the request as a wakeup-reason frame bound for the guest.
fn cbc_update_wakeup_reason(req: &mut CbcRequest, reason: u32) {
    /* only ignition button, car door, RTC, SoC and force S5 may pass */
    let reason = reason & CBC_WK_RSN_ALL;

    req.buf[CBC_PAYLOAD_POS] = reason as u8;
    req.buf[CBC_PAYLOAD_POS + 1] = (reason >> 8) as u8;
    req.buf[CBC_PAYLOAD_POS + 2] = (reason >> 16) as u8;

    req.id = IOC_NATIVE_LFCC;
    req.buf[CBC_SRV_POS] = CBC_SC_WK_RSN;
    req.srv_len = 4;
    req.link_len = 0;
}

/// Periodic wakeup-reason service, the tx-side entry of the lifecycle flow.
fn cbc_process_wakeup_reason(ctx: &mut CbcPktCtx, req: &mut CbcRequest, io: &dyn CbcIo) {
    let cmd = req.buf[CBC_SRV_POS];
    if cmd != CBC_SC_WK_RSN {
        debug!("only handle wakeup reason cmd, the cmd:{cmd}");
        return;
    }
    let mut reason = req.buf[CBC_PAYLOAD_POS] as u32
        | (req.buf[CBC_PAYLOAD_POS + 1] as u32) << 8
        | (req.buf[CBC_PAYLOAD_POS + 2] as u32) << 16;

    /* keep the raw reason for the inactive->active transition */
    ctx.reason = reason;

    if ctx.uos_active {
        reason |= CBC_WK_RSN_SOC;
        /* the RTC bit drops once the guest heartbeats actively */
        reason &= !CBC_WK_RSN_RTC;
    } else {
        reason = io.boot_reason();
        reason &= !CBC_WK_RSN_SOC;
    }

    cbc_update_wakeup_reason(req, reason);
    cbc_send_pkt(ctx, req, io);
}

fn cbc_update_rtc_timer(io: &dyn CbcIo, value: u16, unit: u8) {
    if value == 0 {
        debug!("ioc sets RTC timer failure, timer is 0");
        return;
    }
    let seconds = match unit {
        CBC_RTC_TIMER_U_SEC => value as u64,
        CBC_RTC_TIMER_U_MIN => value as u64 * 60,
        CBC_RTC_TIMER_U_HOUR => value as u64 * 60 * 60,
        CBC_RTC_TIMER_U_DAY => value as u64 * 60 * 60 * 24,
        CBC_RTC_TIMER_U_WEEK => value as u64 * 60 * 60 * 24 * 7,
        _ => {
            debug!("ioc sets RTC timer failure, invalid timer unit:{unit}");
            return;
        }
    };
    io.set_wakeup_timer(seconds);
}

/// Heartbeat service, the rx-side entry of the lifecycle flow.
fn cbc_process_heartbeat(
    ctx: &mut CbcPktCtx,
    req: &mut CbcRequest,
    io: &dyn CbcIo,
) -> CbcQueueType {
    let cmd = req.buf[CBC_SRV_POS];
    if cmd == CBC_SC_HB {
        let hb = req.buf[CBC_PAYLOAD_POS];
        let sus = req.buf[CBC_PAYLOAD_POS + 1];
        return cbc_update_heartbeat(ctx, req, io, hb, sus);
    }
    if cmd == CBC_SC_RTC {
        let timer = req.buf[CBC_PAYLOAD_POS] as u16 | (req.buf[CBC_PAYLOAD_POS + 1] as u16) << 8;
        cbc_update_rtc_timer(io, timer, req.buf[CBC_PAYLOAD_POS + 2]);
        return CbcQueueType::Free;
    }
    debug!("ioc discards the lifecycle rx cmd: {cmd}");
    CbcQueueType::Free
}

fn cbc_set_invalidation(cfg: &mut CbcConfig, req: &CbcRequest, group: bool) {
    let payload = &req.buf[CBC_PAYLOAD_POS..];
    let num = payload[1] as usize;

    /* each id is 2 bytes behind a 2-byte service header */
    if num * 2 + 2 >= CBC_MAX_SERVICE_SIZE {
        debug!("ioc cbc group number is invalid, number is {num}");
        return;
    }
    for i in 0..num {
        let id = payload[i * 2 + 2] as u16 | (payload[i * 2 + 3] as u16) << 8;
        if group {
            cfg.disable_group(id);
        } else {
            cfg.disable_signal(id);
        }
    }
}

/// Multi-signal forwarding: compact the payload down to whitelisted
/// signals and send it on if any survive.
fn cbc_forward_signals(
    ctx: &mut CbcPktCtx,
    req: &mut CbcRequest,
    cfg: &CbcConfig,
    io: &dyn CbcIo,
) {
    let mut offset = 1usize;
    let mut valids = 1usize;
    let mut num = 0u8;
    let total = req.buf[CBC_PAYLOAD_POS] as usize;

    for _ in 0..total {
        let base = CBC_PAYLOAD_POS;
        let id = req.buf[base + offset] as u16 | (req.buf[base + offset + 1] as u16) << 8;
        /* two bytes of signal id plus the value bytes */
        let signal_len = cfg.signal_len_bytes(id) + 2;

        if cfg.wlist_verify_signal(id) {
            num += 1;
            if valids < offset {
                for j in 0..signal_len {
                    req.buf[base + valids] = req.buf[base + offset + j];
                    valids += 1;
                }
            } else {
                valids += signal_len;
            }
        }
        offset += signal_len;

        if offset + 1 > CBC_MAX_SERVICE_SIZE {
            debug!("ioc offset={offset} is error in forward signal");
            return;
        }
    }

    if num > 0 {
        req.buf[CBC_PAYLOAD_POS] = num;
        req.buf[CBC_SRV_POS] = CBC_SD_MULTI_SIGNAL;
        req.srv_len = valids + CBC_SRV_HDR_SIZE;
        cbc_send_pkt(ctx, req, io);
    }
}

/// Signal-data service, shared by both directions; the channel-active flag
/// lives in the per-direction context.
fn cbc_process_signal(
    ctx: &mut CbcPktCtx,
    req: &mut CbcRequest,
    cfg: &mut CbcConfig,
    io: &dyn CbcIo,
) {
    let cmd = req.buf[CBC_SRV_POS];

    /* Packets headed for the virtual UART are dropped while the guest's
     * signal channel is closed; native cdevs always get forwards. */
    if req.link_len == 0
        && !ctx.sig_active
        && matches!(cmd, CBC_SD_SINGLE_SIGNAL | CBC_SD_MULTI_SIGNAL | CBC_SD_GROUP_SIGNAL)
    {
        return;
    }

    let id16 =
        |req: &CbcRequest| req.buf[CBC_PAYLOAD_POS] as u16 | (req.buf[CBC_PAYLOAD_POS + 1] as u16) << 8;

    match cmd {
        CBC_SD_SINGLE_SIGNAL => {
            let id = id16(req);
            if cfg.wlist_verify_signal(id) {
                cbc_send_pkt(ctx, req, io);
            }
        }
        CBC_SD_MULTI_SIGNAL => cbc_forward_signals(ctx, req, cfg, io),
        CBC_SD_GROUP_SIGNAL => {
            let id = id16(req);
            if cfg.wlist_verify_group(id) {
                cbc_send_pkt(ctx, req, io);
            }
        }
        CBC_SD_INVAL_SSIG => {
            let id = id16(req);
            cfg.disable_signal(id);
        }
        CBC_SD_INVAL_MSIG => cbc_set_invalidation(cfg, req, false),
        CBC_SD_INVAL_SGRP => {
            let id = id16(req);
            cfg.disable_group(id);
        }
        CBC_SD_INVAL_MGRP => cbc_set_invalidation(cfg, req, true),
        /* open/reset/close only arrive on the rx side */
        CBC_SD_OPEN_CHANNEL | CBC_SD_RESET_CHANNEL => ctx.sig_active = true,
        CBC_SD_CLOSE_CHANNEL => ctx.sig_active = false,
        _ => debug!("ioc got a new operation of signal channel={cmd}"),
    }
}

/// Rx direction: virtual UART -> native CBC cdevs.
pub fn cbc_rx_handler(
    ctx: &mut CbcPktCtx,
    req: &mut CbcRequest,
    cfg: &mut CbcConfig,
    io: &dyn CbcIo,
) -> CbcQueueType {
    if req.rtype != CbcRequestType::Prot || !io.cbc_enabled() {
        debug!("ioc rx discard the packet, type:{:?}", req.rtype);
        return CbcQueueType::Free;
    }

    let mux = ((req.buf[CBC_ADDR_POS] >> CBC_MUX_OFFSET) & CBC_MUX_MASK) as usize;
    req.id = mux;
    match mux {
        IOC_NATIVE_LFCC => cbc_process_heartbeat(ctx, req, io),
        IOC_NATIVE_SIGNAL => {
            cbc_process_signal(ctx, req, cfg, io);
            CbcQueueType::Free
        }
        IOC_NATIVE_RAW0..=IOC_NATIVE_RAW11 => {
            cbc_send_pkt(ctx, req, io);
            CbcQueueType::Free
        }
        _ => {
            debug!("ioc unpack wrong channel={mux}");
            CbcQueueType::Free
        }
    }
}

/// Emulate a wakeup reason for a pending VM-manager stop/suspend request.
fn send_wakeup_reason_of_vm_request(
    ctx: &mut CbcPktCtx,
    req: &mut CbcRequest,
    io: &dyn CbcIo,
) -> bool {
    let reason = match io.vm_req() {
        VmRequestType::Stop => CBC_WK_RSN_FS5 | CBC_WK_RSN_SOC,
        VmRequestType::Suspend => CBC_WK_RSN_SOC,
        _ => return false,
    };
    cbc_update_wakeup_reason(req, reason);
    cbc_send_pkt(ctx, req, io);
    true
}

/// Tx direction: native CBC cdevs -> virtual UART.
pub fn cbc_tx_handler(
    ctx: &mut CbcPktCtx,
    req: &mut CbcRequest,
    cfg: &mut CbcConfig,
    io: &dyn CbcIo,
) -> CbcQueueType {
    if req.rtype == CbcRequestType::Prot && io.cbc_enabled() {
        match req.id {
            IOC_NATIVE_LFCC => {
                if !send_wakeup_reason_of_vm_request(ctx, req, io) {
                    cbc_process_wakeup_reason(ctx, req, io);
                }
            }
            IOC_NATIVE_SIGNAL => cbc_process_signal(ctx, req, cfg, io),
            IOC_NATIVE_RAW0..=IOC_NATIVE_RAW11 => cbc_send_pkt(ctx, req, io),
            _ => debug!("ioc cbc tx handler got invalid channel={}", req.id),
        }
        return CbcQueueType::Free;
    }

    match req.rtype {
        CbcRequestType::HbInit => {
            cbc_update_wakeup_reason(req, io.boot_reason() | CBC_WK_RSN_SOC);
            cbc_send_pkt(ctx, req, io);
            /* heartbeat init also means the guest went active */
            ctx.uos_active = true;
        }
        CbcRequestType::UosActive => {
            cbc_update_wakeup_reason(req, io.boot_reason() | CBC_WK_RSN_SOC);
            cbc_send_pkt(ctx, req, io);
            ctx.uos_active = true;
        }
        CbcRequestType::UosInactive => {
            cbc_update_wakeup_reason(req, CBC_WK_RSN_SHUTDOWN);
            cbc_send_pkt(ctx, req, io);
            ctx.uos_active = false;
            /* with the shutdown reason out, the mediator may suspend */
            io.update_event(IocEventType::Shutdown);
        }
        _ => debug!("ioc tx discard the packet, type:{:?}", req.rtype),
    }
    CbcQueueType::Free
}

pub fn default_rx_config() -> CbcConfig {
    let ids: [(u16, u16); 10] = [
        (20000, 16), /* SetTunerFrequency */
        (20001, 1),  /* EnableGyro */
        (20002, 8),  /* WriteAmplifierConfigurationSequence */
        (20003, 8),  /* RequestIocFblChecksum */
        (20004, 8),  /* RequestIocWfChecksum */
        (20005, 8),  /* RequestIocAppChecksum */
        (20006, 8),  /* RequestIocVersion */
        (20007, 8),  /* RequestRuntimeMeasurement */
        (20008, 1),  /* MuteAmplifier */
        (20009, 2),  /* ParkingBrakeSetting */
    ];
    CbcConfig {
        sig_tbl: ids
            .iter()
            .map(|&(id, len)| CbcSignal {
                id,
                len,
                active: true,
            })
            .collect(),
        grp_tbl: vec![CbcGroup { id: 0, active: true }],
        wlist_sig: ids.iter().map(|&(id, _)| id).collect(),
        wlist_grp: vec![0],
    }
}

pub fn default_tx_config() -> CbcConfig {
    let ids: [(u16, u16); 14] = [
        (501, 16), /* MainBatteryVoltage */
        (502, 16), /* TemperatureSensorAmplifier */
        (503, 16), /* TemperatureSensorEnvironment */
        (701, 16), /* VehicleSteeringWheelAngle */
        (702, 16), /* VehicleSpeed */
        (703, 16), /* VehicleEngineSpeed */
        (704, 8),  /* VehicleEngineCoolantTemp */
        (705, 2),  /* VehicleReverseGear */
        (706, 3),  /* VehiclePowerStatus */
        (707, 3),  /* VehiclePowerMode */
        (708, 3),  /* VehicleMode */
        (709, 2),  /* VehicleImmobilizerState */
        (710, 4),  /* VehicleGearshiftPosition */
        (711, 4),  /* VehicleActualGear */
    ];
    let grps: [u16; 8] = [874, 883, 891, 899, 909, 913, 917, 922];
    CbcConfig {
        sig_tbl: ids
            .iter()
            .map(|&(id, len)| CbcSignal {
                id,
                len,
                active: true,
            })
            .collect(),
        grp_tbl: grps
            .iter()
            .map(|&id| CbcGroup { id, active: true })
            .collect(),
        wlist_sig: ids.iter().map(|&(id, _)| id).collect(),
        wlist_grp: grps.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct MockIo {
        sent: RefCell<Vec<(usize, Vec<u8>)>>,
        events: RefCell<Vec<IocEventType>>,
        timers: RefCell<Vec<u64>>,
        boot_reason: u32,
        vm_req: VmRequestType,
        enabled: bool,
    }

    impl CbcIo for MockIo {
        fn ch_xmit(&self, id: usize, data: &[u8]) -> std::io::Result<usize> {
            self.sent.borrow_mut().push((id, data.to_vec()));
            Ok(data.len())
        }
        fn update_event(&self, evt: IocEventType) {
            self.events.borrow_mut().push(evt);
        }
        fn set_wakeup_timer(&self, due_seconds: u64) {
            self.timers.borrow_mut().push(due_seconds);
        }
        fn boot_reason(&self) -> u32 {
            self.boot_reason
        }
        fn vm_req(&self) -> VmRequestType {
            self.vm_req
        }
        fn cbc_enabled(&self) -> bool {
            self.enabled
        }
    }

    fn enabled_io() -> MockIo {
        MockIo {
            boot_reason: CBC_WK_RSN_BTN,
            enabled: true,
            ..MockIo::default()
        }
    }

    fn build_frame(mux: u8, seq: u8, service: &[u8]) -> Vec<u8> {
        let srv_blocks = service.len().div_ceil(CBC_LEN_UNIT).max(1);
        let srv_len = srv_blocks * CBC_LEN_UNIT;
        let frame_len = srv_len + CBC_LINK_HDR_SIZE + CBC_ADDR_HDR_SIZE;
        let mut f = vec![0xFFu8; frame_len];
        f[CBC_SOF_POS] = CBC_SOF_VALUE;
        f[CBC_ELS_POS] = (((srv_blocks - 1) as u8) & CBC_LEN_MASK) << CBC_LEN_OFFSET
            | (seq & CBC_SEQ_MASK) << CBC_SEQ_OFFSET;
        f[CBC_ADDR_POS] = (mux & CBC_MUX_MASK) << CBC_MUX_OFFSET;
        f[CBC_ADDR_POS] |= CBC_PRIO_HIGH << CBC_PRIO_OFFSET;
        f[CBC_SRV_POS..CBC_SRV_POS + service.len()].copy_from_slice(service);
        let ck = cbc_cal_chksum(&f[..frame_len - 1]);
        f[frame_len - 1] = (ck & 0xFF) as u8;
        f
    }

    #[test]
    fn unpack_single_frame() {
        let mut ring = CbcRing::default();
        let mut unpacker = CbcUnpacker::default();
        let frame = build_frame(IOC_NATIVE_RAW0 as u8, 1, &[0x01, 0x42]);
        ring.copy_to_ring(&frame).unwrap();

        let mut got = Vec::new();
        unpacker.unpack(&mut ring, |f, srv_len| got.push((f.to_vec(), srv_len)));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, frame);
        assert_eq!(got[0].1, 4);
        assert_eq!(ring.avail(), 0);
    }

    #[test]
    fn garbage_before_sof_is_skipped() {
        let mut ring = CbcRing::default();
        let mut unpacker = CbcUnpacker::default();
        let frame = build_frame(IOC_NATIVE_SIGNAL as u8, 1, &[9, 9, 9, 9]);
        let mut stream = vec![0xAA, 0x00, 0x13];
        stream.extend_from_slice(&frame);
        ring.copy_to_ring(&stream).unwrap();

        let mut got = 0;
        unpacker.unpack(&mut ring, |_, _| got += 1);
        assert_eq!(got, 1);
    }

    #[test]
    fn corrupt_checksum_advances_one_byte() {
        let mut ring = CbcRing::default();
        let mut unpacker = CbcUnpacker::default();
        let mut frame = build_frame(IOC_NATIVE_RAW0 as u8, 1, &[1, 2, 3, 4]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        ring.copy_to_ring(&frame).unwrap();

        let mut got = 0;
        unpacker.unpack(&mut ring, |_, _| got += 1);
        assert_eq!(got, 0);
        /* the framer slid one byte past the bogus SOF and drained */
        assert!(ring.avail() < frame.len());
    }

    #[test]
    fn sequence_mismatch_keeps_the_frame() {
        let mut ring = CbcRing::default();
        let mut unpacker = CbcUnpacker::default();
        /* expected sequence is 1, deliver 3 */
        let frame = build_frame(IOC_NATIVE_RAW0 as u8, 3, &[1, 2, 3, 4]);
        ring.copy_to_ring(&frame).unwrap();
        let mut got = 0;
        unpacker.unpack(&mut ring, |_, _| got += 1);
        assert_eq!(got, 1);
        /* and the detector resynchronized to it */
        assert_eq!(unpacker.rx_seq, 3);
    }

    #[test]
    fn framer_never_reads_past_declared_length() {
        /* arbitrary byte soup must neither panic nor emit bad frames */
        let mut ring = CbcRing::default();
        let mut unpacker = CbcUnpacker::default();
        let noise: Vec<u8> = (0..200u16).map(|i| (i * 7 + 3) as u8).collect();
        ring.copy_to_ring(&noise).unwrap();
        unpacker.unpack(&mut ring, |f, _| {
            let ck = f[f.len() - 1];
            let sum = cbc_cal_chksum(&f[..f.len() - 1]);
            assert_eq!((sum & 0xFF) as u8, ck);
        });
    }

    #[test]
    fn pack_then_unpack_is_identity() {
        let mut req = CbcRequest {
            id: IOC_NATIVE_LFCC,
            srv_len: 4,
            ..CbcRequest::default()
        };
        req.buf[CBC_SRV_POS] = CBC_SC_WK_RSN;
        req.buf[CBC_PAYLOAD_POS] = 0x20;
        let mut seq = 1u8; /* first frame the peer expects */
        cbc_pack_address(&mut req);
        cbc_pack_link(&mut req, &mut seq);
        let packed = req.buf[..req.link_len].to_vec();

        let mut ring = CbcRing::default();
        ring.copy_to_ring(&packed).unwrap();
        let mut unpacker = CbcUnpacker::default();
        let mut got = Vec::new();
        unpacker.unpack(&mut ring, |f, srv| got.push((f.to_vec(), srv)));
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, packed);
        assert_eq!(got[0].1, 4);
    }

    #[test]
    fn tx_sequence_is_monotonic_mod_4() {
        let mut seq = 0u8;
        for expect in [0u8, 1, 2, 3, 0, 1] {
            let mut req = CbcRequest {
                id: IOC_NATIVE_LFCC,
                srv_len: 4,
                ..CbcRequest::default()
            };
            cbc_pack_address(&mut req);
            cbc_pack_link(&mut req, &mut seq);
            assert_eq!((req.buf[CBC_ELS_POS] >> CBC_SEQ_OFFSET) & CBC_SEQ_MASK, expect);
        }
    }

    #[test]
    fn heartbeat_initial_routes_to_tx_and_raises_active() {
        let io = enabled_io();
        let mut ctx = CbcPktCtx::default();
        let frame = build_frame(
            IOC_NATIVE_LFCC as u8,
            1,
            &[CBC_SC_HB, CBC_HB_INITIAL, 0, 0],
        );
        let mut req = CbcRequest::default();
        req.buf[..frame.len()].copy_from_slice(&frame);
        req.link_len = frame.len();
        req.srv_len = 4;

        let mut cfg = default_rx_config();
        let q = cbc_rx_handler(&mut ctx, &mut req, &mut cfg, &io);
        assert_eq!(q, CbcQueueType::Tx);
        assert_eq!(req.rtype, CbcRequestType::HbInit);
        assert_eq!(io.events.borrow().as_slice(), &[IocEventType::HbActive]);
    }

    #[test]
    fn shutdown_prep_refresh_raises_ram_refresh() {
        let io = enabled_io();
        let mut ctx = CbcPktCtx::default();
        let frame = build_frame(
            IOC_NATIVE_LFCC as u8,
            1,
            &[CBC_SC_HB, CBC_HB_SD_PREP, CBC_SS_REFRESH, 0],
        );
        let mut req = CbcRequest::default();
        req.buf[..frame.len()].copy_from_slice(&frame);
        req.link_len = frame.len();
        req.srv_len = 4;
        let mut cfg = default_rx_config();
        cbc_rx_handler(&mut ctx, &mut req, &mut cfg, &io);
        assert_eq!(io.events.borrow().as_slice(), &[IocEventType::RamRefresh]);
    }

    #[test]
    fn rtc_service_sets_wakeup_timer() {
        let io = enabled_io();
        let mut ctx = CbcPktCtx::default();
        let frame = build_frame(
            IOC_NATIVE_LFCC as u8,
            1,
            &[CBC_SC_RTC, 10, 0, CBC_RTC_TIMER_U_MIN],
        );
        let mut req = CbcRequest::default();
        req.buf[..frame.len()].copy_from_slice(&frame);
        req.link_len = frame.len();
        req.srv_len = 4;
        let mut cfg = default_rx_config();
        cbc_rx_handler(&mut ctx, &mut req, &mut cfg, &io);
        assert_eq!(io.timers.borrow().as_slice(), &[600]);
    }

    #[test]
    fn uos_inactive_sends_shutdown_reason_and_event() {
        let io = enabled_io();
        let mut ctx = CbcPktCtx {
            uos_active: true,
            ..CbcPktCtx::default()
        };
        let mut req = CbcRequest {
            rtype: CbcRequestType::UosInactive,
            ..CbcRequest::default()
        };
        let mut cfg = default_tx_config();
        cbc_tx_handler(&mut ctx, &mut req, &mut cfg, &io);
        assert!(!ctx.uos_active);
        assert_eq!(io.events.borrow().as_slice(), &[IocEventType::Shutdown]);
        let sent = io.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, IOC_VIRTUAL_UART);
        /* wakeup reason payload must be all-zero (shutdown) */
        assert_eq!(&sent[0].1[CBC_PAYLOAD_POS..CBC_PAYLOAD_POS + 3], &[0, 0, 0]);
    }

    #[test]
    fn signal_forward_respects_channel_state_and_whitelist() {
        let io = enabled_io();
        let mut ctx = CbcPktCtx::default();
        let mut cfg = default_tx_config();

        /* single signal 701 toward the guest while the channel is closed */
        let mut req = CbcRequest {
            id: IOC_NATIVE_SIGNAL,
            srv_len: 4,
            link_len: 0,
            ..CbcRequest::default()
        };
        req.buf[CBC_SRV_POS] = CBC_SD_SINGLE_SIGNAL;
        req.buf[CBC_PAYLOAD_POS] = (701u16 & 0xff) as u8;
        req.buf[CBC_PAYLOAD_POS + 1] = (701u16 >> 8) as u8;
        cbc_process_signal(&mut ctx, &mut req.clone(), &mut cfg, &io);
        assert!(io.sent.borrow().is_empty());

        /* open the channel; the same signal now passes */
        ctx.sig_active = true;
        cbc_process_signal(&mut ctx, &mut req.clone(), &mut cfg, &io);
        assert_eq!(io.sent.borrow().len(), 1);

        /* invalidate it; the forward stops again */
        cfg.disable_signal(701);
        cbc_process_signal(&mut ctx, &mut req, &mut cfg, &io);
        assert_eq!(io.sent.borrow().len(), 1);
    }

    #[test]
    fn vm_stop_request_emulates_force_s5() {
        let io = MockIo {
            vm_req: VmRequestType::Stop,
            enabled: true,
            ..MockIo::default()
        };
        let mut ctx = CbcPktCtx::default();
        let mut req = CbcRequest {
            id: IOC_NATIVE_LFCC,
            srv_len: 4,
            link_len: 0,
            ..CbcRequest::default()
        };
        req.buf[CBC_SRV_POS] = CBC_SC_WK_RSN;
        let mut cfg = default_tx_config();
        cbc_tx_handler(&mut ctx, &mut req, &mut cfg, &io);
        let sent = io.sent.borrow();
        assert_eq!(sent.len(), 1);
        let payload = &sent[0].1[CBC_PAYLOAD_POS..CBC_PAYLOAD_POS + 3];
        let reason = payload[0] as u32 | (payload[1] as u32) << 8 | (payload[2] as u32) << 16;
        assert_eq!(reason, CBC_WK_RSN_FS5 | CBC_WK_RSN_SOC);
    }
}
