//! Transmit audio sessions (ST 2110-30).
//!
//! PCM packetization is a straight walk: every ptime interval one RTP
//! packet of `samples_per_packet × channels × sample_size` bytes leaves
//! the port, timestamped in sample units. Frames are a whole number of
//! packets; pacing anchors each packet to its ptime epoch.

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
use codec::rtp::RtpHeader;
use parking_lot::Mutex;
use service::{
    Error, MediaMeta, SessionFlags, TxMediaHandler,
    fmt::NS_PER_S,
    frame::{TxFrameGuard, TxFramePool},
};

use crate::{
    net::{Clock, Packet, PortDevice},
    ptp::PtpClock,
    sched::{Poll, Tasklet},
    statistics::{Stats, StatisticsReporter},
    tx::{finalize_head, header_template},
};

/// PCM sample widths of ST 2110-30.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Pcm8,
    Pcm16,
    Pcm24,
}

impl AudioFormat {
    pub fn sample_size(&self) -> usize {
        match self {
            Self::Pcm8 => 1,
            Self::Pcm16 => 2,
            Self::Pcm24 => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSampling {
    Hz48k,
    Hz96k,
}

impl AudioSampling {
    pub fn rate(&self) -> u32 {
        match self {
            Self::Hz48k => 48_000,
            Self::Hz96k => 96_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioPtime {
    Ms1,
    Us125,
}

impl AudioPtime {
    pub fn ns(&self) -> u64 {
        match self {
            Self::Ms1 => 1_000_000,
            Self::Us125 => 125_000,
        }
    }

    /// Samples per packet at the given rate.
    pub fn samples(&self, sampling: AudioSampling) -> u32 {
        (sampling.rate() as u64 * self.ns() / NS_PER_S) as u32
    }
}

#[derive(Clone)]
pub struct TxAudioConfig {
    pub name: String,
    pub num_ports: usize,
    pub dst_ip: [Ipv4Addr; 2],
    pub udp_port: [u16; 2],
    pub payload_type: u8,
    pub channels: u16,
    pub fmt: AudioFormat,
    pub sampling: AudioSampling,
    pub ptime: AudioPtime,
    pub framebuff_cnt: u16,
    /// Packets per frame buffer.
    pub pkts_per_frame: u32,
    pub flags: SessionFlags,
}

impl Default for TxAudioConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            num_ports: 1,
            dst_ip: [Ipv4Addr::UNSPECIFIED; 2],
            udp_port: [30000; 2],
            payload_type: 111,
            channels: 2,
            fmt: AudioFormat::Pcm24,
            sampling: AudioSampling::Hz48k,
            ptime: AudioPtime::Ms1,
            framebuff_cnt: 3,
            pkts_per_frame: 10,
            flags: 0,
        }
    }
}

pub struct TxAudioHandle {
    pool: Arc<TxFramePool<MediaMeta>>,
    stop: Arc<AtomicBool>,
}

impl TxAudioHandle {
    pub fn buffer_get(&self, timeout: Duration) -> Result<TxFrameGuard<MediaMeta>, Error> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }

        self.pool.get(timeout)
    }

    pub fn frame_size(&self) -> usize {
        self.pool.frame_size()
    }

    /// Quiesce the session: its tasklets become inert from the next
    /// round; buffers drain back to their pools.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// The audio build-and-send tasklet; the per packet rates are low
/// enough that splitting build from burst buys nothing.
pub struct TxAudioSession {
    name: String,
    pool: Arc<TxFramePool<MediaMeta>>,
    handler: Box<dyn TxMediaHandler>,
    devs: Vec<(Arc<dyn PortDevice>, usize)>,
    templates: Arc<Mutex<Vec<BytesMut>>>,
    clock: Arc<dyn Clock>,
    ptp: Arc<PtpClock>,

    payload_type: u8,
    pkt_len: usize,
    pkts_per_frame: u32,
    ptime_ns: u64,
    samples_per_pkt: u32,

    cur_epoch: u64,
    target_tsc: u64,
    frame: Option<(u16, bytes::Bytes, MediaMeta)>,
    pkt_idx: u32,
    seq: u16,
    ipv4_id: u16,
    done: VecDeque<(u16, MediaMeta)>,

    stop: Arc<AtomicBool>,
    reporter: StatisticsReporter,
}

impl TxAudioSession {
    fn sync(&mut self) {
        let ptp = self.ptp.get_time();
        let epoch = (ptp / self.ptime_ns).max(self.cur_epoch + 1);
        self.cur_epoch = epoch;
        self.target_tsc = self.clock.now_ns() + (epoch * self.ptime_ns).saturating_sub(ptp);
    }

    fn round(&mut self) -> Poll {
        while let Some((idx, meta)) = self.done.front().copied() {
            if !self.pool.complete(idx) {
                break;
            }
            self.done.pop_front();
            self.handler.frame_done(idx, &meta);
        }

        if self.frame.is_none() {
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
            if meta.timestamp == 0 {
                meta = stored;
            }

            self.frame = Some((idx, payload, meta));
            self.pkt_idx = 0;
        }

        // one packet per ptime epoch
        if self.target_tsc == 0 {
            self.sync();
        }
        if self.clock.now_ns() < self.target_tsc {
            return Poll::AllDone;
        }

        let Some((idx, payload, meta)) =
            self.frame.as_ref().map(|f| (f.0, f.1.clone(), f.2))
        else {
            return Poll::AllDone;
        };
        let at = self.pkt_idx as usize * self.pkt_len;
        let slice = payload.slice(at..at + self.pkt_len);
        let rtp_timestamp =
            ((self.cur_epoch as u128 * self.samples_per_pkt as u128) % (1 << 32)) as u32;

        let templates = self.templates.lock();
        for (port, (dev, queue)) in self.devs.iter().enumerate() {
            let mut head = templates[port].clone();
            RtpHeader {
                marker: false,
                payload_type: self.payload_type,
                sequence: self.seq,
                timestamp: rtp_timestamp,
                ssrc: 0x30 ^ self.payload_type as u32,
            }
            .encode(&mut head);
            finalize_head(&mut head, self.ipv4_id, slice.len());

            let mut pkt = Packet::new(head);
            pkt.payload = Some(slice.clone());
            pkt.tx_tsc = self.target_tsc;
            pkt.pkt_idx = self.pkt_idx;

            let mut out = VecDeque::new();
            out.push_back(pkt);
            let tx = dev.tx_burst(*queue, &mut out);
            self.reporter.send(&[Stats::PktsBurst(tx)]);
        }
        drop(templates);

        self.seq = self.seq.wrapping_add(1);
        self.ipv4_id = self.ipv4_id.wrapping_add(1);
        self.pkt_idx += 1;
        self.target_tsc = 0;
        self.reporter.send(&[Stats::PktsBuilt(self.devs.len())]);

        if self.pkt_idx >= self.pkts_per_frame {
            self.frame = None;
            self.done.push_back((idx, meta));
            self.reporter.send(&[Stats::FramesSent(1)]);
        }

        Poll::HasPending
    }
}

impl Tasklet for TxAudioSession {
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
        Some(self.ptime_ns / 4_000)
    }
}

pub(crate) struct TxAudioParts {
    pub handle: TxAudioHandle,
    pub session: TxAudioSession,
    pub quota_mbps: u32,
    pub stop: Arc<AtomicBool>,
}

pub(crate) fn create(
    cfg: &TxAudioConfig,
    handler: Box<dyn TxMediaHandler>,
    devs: Vec<(Arc<dyn PortDevice>, usize)>,
    dest_macs: Vec<codec::net::MacAddr>,
    clock: Arc<dyn Clock>,
    ptp: Arc<PtpClock>,
    reporter: StatisticsReporter,
) -> Result<TxAudioParts, Error> {
    if cfg.num_ports == 0
        || cfg.num_ports > 2
        || !codec::is_valid_payload_type(cfg.payload_type)
        || cfg.framebuff_cnt < 2
        || cfg.channels == 0
        || cfg.pkts_per_frame == 0
    {
        return Err(Error::InvalidArgument);
    }

    let samples = cfg.ptime.samples(cfg.sampling);
    let pkt_len = samples as usize * cfg.channels as usize * cfg.fmt.sample_size();
    let frame_size = pkt_len * cfg.pkts_per_frame as usize;
    let pool = TxFramePool::<MediaMeta>::new(cfg.framebuff_cnt, frame_size)?;

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

    let stop = Arc::new(AtomicBool::new(false));
    let pkts_per_sec = NS_PER_S / cfg.ptime.ns();
    let quota_mbps =
        ((pkt_len as u64 + 54) * 8 * pkts_per_sec * cfg.num_ports as u64 / 1_000_000) as u32 + 1;

    Ok(TxAudioParts {
        handle: TxAudioHandle {
            pool: pool.clone(),
            stop: stop.clone(),
        },
        session: TxAudioSession {
            name: format!("{}-audio", cfg.name),
            pool,
            handler,
            devs,
            templates: Arc::new(Mutex::new(templates)),
            clock,
            ptp,
            payload_type: cfg.payload_type,
            pkt_len,
            pkts_per_frame: cfg.pkts_per_frame,
            ptime_ns: cfg.ptime.ns(),
            samples_per_pkt: samples,
            cur_epoch: 0,
            target_tsc: 0,
            frame: None,
            pkt_idx: 0,
            seq: 0,
            ipv4_id: 0,
            done: VecDeque::new(),
            stop: stop.clone(),
            reporter,
        },
        quota_mbps,
        stop,
    })
}
