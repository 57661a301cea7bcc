//! Receive audio sessions (ST 2110-30).
//!
//! Incoming PCM packets append into a frame buffer a whole number of
//! packets long; the sequence number relative to the frame's first
//! packet picks the write offset, so a short reorder heals itself.

use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use codec::rtp::RtpHeader;
use service::{
    Error, MediaMeta, RxMediaHandler, SessionFlags,
    frame::RxFramePool,
    slot::SlotTable,
};

use crate::{
    net::{Clock, Packet, RxQueue},
    sched::{Poll, Tasklet},
    statistics::{Stats, StatisticsReporter},
    tx::audio::{AudioFormat, AudioPtime, AudioSampling},
};

#[derive(Clone)]
pub struct RxAudioConfig {
    pub name: String,
    pub num_ports: usize,
    pub ip: [Ipv4Addr; 2],
    pub udp_port: [u16; 2],
    pub src_ip: [Option<Ipv4Addr>; 2],
    pub payload_type: u8,
    pub channels: u16,
    pub fmt: AudioFormat,
    pub sampling: AudioSampling,
    pub ptime: AudioPtime,
    pub framebuff_cnt: u16,
    pub pkts_per_frame: u32,
    pub flags: SessionFlags,
}

impl Default for RxAudioConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            num_ports: 1,
            ip: [Ipv4Addr::UNSPECIFIED; 2],
            udp_port: [30000; 2],
            src_ip: [None; 2],
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

pub struct RxAudioHandle {
    stop: Arc<AtomicBool>,
}

impl RxAudioHandle {
    /// Quiesce the session: its tasklets become inert from the next
    /// round; buffers drain back to their pools.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

pub struct RxAudioSession {
    name: String,
    queues: Vec<Box<dyn RxQueue>>,
    pool: Arc<RxFramePool>,
    handler: Box<dyn RxMediaHandler>,
    clock: Arc<dyn Clock>,

    payload_type: u8,
    pkt_len: usize,
    pkts_per_frame: u32,
    samples_per_pkt: u32,

    /// Sequence number of the first packet ever accepted; frames are
    /// whole packet runs from there.
    base_seq: Option<u16>,
    /// One assembly frame at a time; audio reordering never spans more.
    slots: SlotTable,

    stop: Arc<AtomicBool>,
    reporter: StatisticsReporter,
}

impl RxAudioSession {
    fn handle_packet(&mut self, port: usize, pkt: &Packet) -> Result<(), Error> {
        let frame = &pkt.head;
        let rtp_at = super::rtp_offset(frame).ok_or(Error::Dropped)?;
        let rtp = RtpHeader::decode(&frame[rtp_at..]).map_err(|_| Error::Dropped)?;

        if rtp.payload_type != self.payload_type {
            self.reporter.send(&[Stats::PktsWrongPayloadType(1)]);
            return Err(Error::Dropped);
        }

        let payload = frame
            .get(rtp_at + RtpHeader::SIZE..)
            .ok_or(Error::Dropped)?;
        if payload.len() < self.pkt_len {
            return Err(Error::Dropped);
        }

        // frames are packet runs anchored at the first sequence number
        // the session ever saw, so they line up with the sender's
        let base = *self.base_seq.get_or_insert(rtp.sequence);
        let offset = rtp.sequence.wrapping_sub(base) as u32;
        let frame_idx = offset / self.pkts_per_frame;
        let pkt_in_frame = offset % self.pkts_per_frame;

        let now = self.clock.now_ns();
        let pool = self.pool.clone();
        let (slot_idx, evicted) = self
            .slots
            .find_or_evict(frame_idx, now, move || pool.get());
        if let Some(evicted) = evicted {
            self.reporter.send(&[Stats::SlotEvictions(1)]);
            if let Some(frame) = evicted.frame {
                self.reporter.send(&[Stats::FramesDropped(1)]);
                self.pool.put(frame);
            }
        }

        let slot = self.slots.get_mut(slot_idx);
        if slot.frame.is_none() {
            return Err(Error::Dropped);
        }

        if slot.test_and_set(pkt_in_frame) {
            self.reporter.send(&[Stats::PktsRedundantDropped(1)]);
            return Err(Error::Dropped);
        }

        let at = pkt_in_frame as usize * self.pkt_len;
        if let Some(buf) = slot.frame.as_mut() {
            buf[at..at + self.pkt_len].copy_from_slice(&payload[..self.pkt_len]);
        }

        slot.frame_recv_size += self.pkt_len;
        slot.pkts_recv[port] += 1;
        slot.last_activity = now;
        self.reporter.send(&[Stats::PktsReceived(1)]);

        if slot.frame_recv_size >= self.pkt_len * self.pkts_per_frame as usize {
            // media timestamp of the frame's first packet
            let timestamp = rtp
                .timestamp
                .wrapping_sub(pkt_in_frame * self.samples_per_pkt);
            let recv = slot.frame_recv_size;
            if let Some(frame) = slot.take_frame() {
                let meta = MediaMeta {
                    rtp_timestamp: timestamp,
                    size: recv,
                    ..Default::default()
                };
                self.reporter.send(&[Stats::FramesReceived(1)]);
                let _ = self.handler.frame_ready(self.pool.deliver(frame), &meta);
            }
        }

        Ok(())
    }
}

impl Tasklet for RxAudioSession {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler(&mut self) -> Poll {
        if self.stop.load(Ordering::Acquire) {
            return Poll::AllDone;
        }

        let mut got_any = false;
        for port in 0..self.queues.len() {
            let mut pkts = Vec::new();
            self.queues[port].rx_burst(&mut pkts, 64);
            for pkt in &pkts {
                got_any = true;
                if let Err(Error::Dropped) = self.handle_packet(port, pkt) {
                    self.reporter.send(&[Stats::PktsDropped(1)]);
                }
            }
        }

        if got_any { Poll::HasPending } else { Poll::AllDone }
    }

    fn advice_sleep_us(&self) -> Option<u64> {
        Some(200)
    }
}

pub(crate) struct RxAudioParts {
    pub handle: RxAudioHandle,
    pub session: RxAudioSession,
    pub quota_mbps: u32,
    pub stop: Arc<AtomicBool>,
}

pub(crate) fn create(
    cfg: &RxAudioConfig,
    handler: Box<dyn RxMediaHandler>,
    queues: Vec<Box<dyn RxQueue>>,
    clock: Arc<dyn Clock>,
    reporter: StatisticsReporter,
) -> Result<RxAudioParts, Error> {
    if cfg.num_ports == 0
        || cfg.num_ports > 2
        || !codec::is_valid_payload_type(cfg.payload_type)
        || cfg.framebuff_cnt < 2
        || queues.len() != cfg.num_ports
        || cfg.pkts_per_frame == 0
    {
        return Err(Error::InvalidArgument);
    }

    let samples = cfg.ptime.samples(cfg.sampling);
    let pkt_len = samples as usize * cfg.channels as usize * cfg.fmt.sample_size();
    let frame_size = pkt_len * cfg.pkts_per_frame as usize;

    let stop = Arc::new(AtomicBool::new(false));
    let session = RxAudioSession {
        name: format!("{}-audio", cfg.name),
        queues,
        pool: RxFramePool::new(cfg.framebuff_cnt, frame_size)?,
        handler,
        clock,
        payload_type: cfg.payload_type,
        pkt_len,
        pkts_per_frame: cfg.pkts_per_frame,
        samples_per_pkt: samples,
        base_seq: None,
        slots: SlotTable::new(2, cfg.pkts_per_frame),
        stop: stop.clone(),
        reporter,
    };

    Ok(RxAudioParts {
        handle: RxAudioHandle { stop: stop.clone() },
        session,
        quota_mbps: 50,
        stop,
    })
}
