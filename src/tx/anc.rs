//! Transmit ancillary sessions (ST 2110-40).
//!
//! One RTP packet per frame interval, carrying the application's
//! pre-packed ancillary data words behind the RFC 8331 payload header.
//! The marker closes every frame (or field).

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::BytesMut;
use codec::{anc, rtp::RtpHeader};
use parking_lot::Mutex;
use service::{
    Error, MediaMeta, SessionFlags, TxMediaHandler,
    fmt::{Fps, NS_PER_S},
    frame::{TxFrameGuard, TxFramePool},
};

use crate::{
    net::{Clock, Packet, PortDevice},
    ptp::PtpClock,
    sched::{Poll, Tasklet},
    statistics::{Stats, StatisticsReporter},
    tx::{finalize_head, header_template},
};

/// Largest ancillary payload carried in one packet.
pub const ANC_MAX_PAYLOAD: usize = 1200;

#[derive(Clone)]
pub struct TxAncConfig {
    pub name: String,
    pub num_ports: usize,
    pub dst_ip: [Ipv4Addr; 2],
    pub udp_port: [u16; 2],
    pub payload_type: u8,
    pub fps: Fps,
    pub interlaced: bool,
    pub framebuff_cnt: u16,
    pub flags: SessionFlags,
}

impl Default for TxAncConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            num_ports: 1,
            dst_ip: [Ipv4Addr::UNSPECIFIED; 2],
            udp_port: [40000; 2],
            payload_type: 113,
            fps: Fps::P59_94,
            interlaced: false,
            framebuff_cnt: 3,
            flags: 0,
        }
    }
}

pub struct TxAncHandle {
    pool: Arc<TxFramePool<MediaMeta>>,
    stop: Arc<AtomicBool>,
}

impl TxAncHandle {
    /// Claim a buffer; fill it with packed ancillary data words (see
    /// [`codec::anc::AncPacket::encode`]) and put it with the packet
    /// count in the meta.
    pub fn buffer_get(&self, timeout: Duration) -> Result<TxFrameGuard<MediaMeta>, Error> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }

        self.pool.get(timeout)
    }

    /// Quiesce the session: its tasklets become inert from the next
    /// round; buffers drain back to their pools.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

pub struct TxAncSession {
    name: String,
    pool: Arc<TxFramePool<MediaMeta>>,
    handler: Box<dyn TxMediaHandler>,
    devs: Vec<(Arc<dyn PortDevice>, usize)>,
    templates: Arc<Mutex<Vec<BytesMut>>>,
    clock: Arc<dyn Clock>,
    ptp: Arc<PtpClock>,

    payload_type: u8,
    frame_time: f64,
    frame_time_sampling: f64,

    cur_epoch: u64,
    target_tsc: u64,
    seq: u32,
    ipv4_id: u16,
    done: VecDeque<(u16, MediaMeta)>,

    stop: Arc<AtomicBool>,
    reporter: StatisticsReporter,
}

impl TxAncSession {
    fn round(&mut self) -> Poll {
        while let Some((idx, meta)) = self.done.front().copied() {
            if !self.pool.complete(idx) {
                break;
            }
            self.done.pop_front();
            self.handler.frame_done(idx, &meta);
        }

        // one packet per frame epoch
        if self.target_tsc == 0 {
            let ptp = self.ptp.get_time();
            let epoch = ((ptp as f64 / self.frame_time) as u64).max(self.cur_epoch + 1);
            self.cur_epoch = epoch;
            self.target_tsc = self.clock.now_ns()
                + ((epoch as f64 * self.frame_time) as u64).saturating_sub(ptp);
        }
        if self.clock.now_ns() < self.target_tsc {
            return Poll::AllDone;
        }

        let mut meta = MediaMeta::default();
        let idx = match self.handler.next_frame(&mut meta) {
            Ok(idx) => idx,
            Err(Error::WouldBlock) => {
                self.reporter.send(&[Stats::UserBusy(1)]);
                return Poll::AllDone;
            }
            Err(_) => return Poll::AllDone,
        };

        let Ok((payload, stored)) = self.pool.begin_transmit(idx) else {
            return Poll::AllDone;
        };
        if meta.size == 0 {
            meta = stored;
        }
        let size = meta.size.min(payload.len());

        let rtp_timestamp =
            ((self.cur_epoch as f64 * self.frame_time_sampling) as u64 % (1 << 32)) as u32;

        let templates = self.templates.lock();
        for (port, (dev, queue)) in self.devs.iter().enumerate() {
            let mut head = templates[port].clone();
            RtpHeader {
                marker: true,
                payload_type: self.payload_type,
                sequence: self.seq as u16,
                timestamp: rtp_timestamp,
                ssrc: 0x40 ^ self.payload_type as u32,
            }
            .encode(&mut head);
            anc::PayloadHeader {
                ext_sequence: (self.seq >> 16) as u16,
                length: size as u16,
                anc_count: meta.anc_count,
                field: if meta.second_field { 3 } else { 0 },
            }
            .encode(&mut head);
            finalize_head(&mut head, self.ipv4_id, size);

            let mut pkt = Packet::new(head);
            pkt.payload = Some(payload.slice(0..size));
            pkt.tx_tsc = self.target_tsc;

            let mut out = VecDeque::new();
            out.push_back(pkt);
            let tx = dev.tx_burst(*queue, &mut out);
            self.reporter.send(&[Stats::PktsBurst(tx)]);
        }
        drop(templates);

        self.seq = self.seq.wrapping_add(1);
        self.ipv4_id = self.ipv4_id.wrapping_add(1);
        self.target_tsc = 0;
        self.done.push_back((idx, meta));
        self.reporter
            .send(&[Stats::PktsBuilt(self.devs.len()), Stats::FramesSent(1)]);

        Poll::HasPending
    }
}

impl Tasklet for TxAncSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler(&mut self) -> Poll {
        if self.stop.load(Ordering::Acquire) {
            return Poll::AllDone;
        }

        self.round()
    }

    fn advice_sleep_us(&self) -> Option<u64> {
        Some((self.frame_time / 4_000.0) as u64)
    }
}

pub(crate) struct TxAncParts {
    pub handle: TxAncHandle,
    pub session: TxAncSession,
    pub quota_mbps: u32,
    pub stop: Arc<AtomicBool>,
}

pub(crate) fn create(
    cfg: &TxAncConfig,
    handler: Box<dyn TxMediaHandler>,
    devs: Vec<(Arc<dyn PortDevice>, usize)>,
    dest_macs: Vec<codec::net::MacAddr>,
    clock: Arc<dyn Clock>,
    ptp: Arc<PtpClock>,
    reporter: StatisticsReporter,
) -> Result<TxAncParts, Error> {
    if cfg.num_ports == 0
        || cfg.num_ports > 2
        || !codec::is_valid_payload_type(cfg.payload_type)
        || cfg.framebuff_cnt < 2
    {
        return Err(Error::InvalidArgument);
    }

    let pool = TxFramePool::<MediaMeta>::new(cfg.framebuff_cnt, ANC_MAX_PAYLOAD)?;

    let templates: Vec<BytesMut> = devs
        .iter()
        .zip(dest_macs.iter())
        .enumerate()
        .map(|(i, ((dev, _), mac))| {
            header_template(
                dev.mac(),
                *mac,
                dev.ip(),
                cfg.dst_ip[i],
                cfg.udp_port[i],
                cfg.udp_port[i],
            )
        })
        .collect();

    let tm = cfg.fps.timing();
    let frame_time = NS_PER_S as f64 * tm.den as f64 / tm.mul as f64;
    let frame_time = if cfg.interlaced {
        frame_time / 2.0
    } else {
        frame_time
    };

    let stop = Arc::new(AtomicBool::new(false));
    Ok(TxAncParts {
        handle: TxAncHandle {
            pool: pool.clone(),
            stop: stop.clone(),
        },
        session: TxAncSession {
            name: format!("{}-anc", cfg.name),
            pool,
            handler,
            devs,
            templates: Arc::new(Mutex::new(templates)),
            clock,
            ptp,
            payload_type: cfg.payload_type,
            frame_time,
            frame_time_sampling: tm.sampling_clock_rate as f64 * tm.den as f64 / tm.mul as f64,
            cur_epoch: 0,
            target_tsc: 0,
            seq: 0,
            ipv4_id: 0,
            done: VecDeque::new(),
            stop: stop.clone(),
            reporter,
        },
        quota_mbps: 10,
        stop,
    })
}
