//! Receive ancillary sessions (ST 2110-40).
//!
//! Ancillary frames are single packets; each one decodes its payload
//! header and hands the packed data words to the application.

use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use codec::{anc, rtp::RtpHeader};
use service::{Error, MediaMeta, RxMediaHandler, SessionFlags, frame::RxFramePool};

use crate::{
    net::{Packet, RxQueue},
    sched::{Poll, Tasklet},
    statistics::{Stats, StatisticsReporter},
    tx::anc::ANC_MAX_PAYLOAD,
};

#[derive(Clone)]
pub struct RxAncConfig {
    pub name: String,
    pub num_ports: usize,
    pub ip: [Ipv4Addr; 2],
    pub udp_port: [u16; 2],
    pub src_ip: [Option<Ipv4Addr>; 2],
    pub payload_type: u8,
    pub framebuff_cnt: u16,
    pub flags: SessionFlags,
}

impl Default for RxAncConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            num_ports: 1,
            ip: [Ipv4Addr::UNSPECIFIED; 2],
            udp_port: [40000; 2],
            src_ip: [None; 2],
            payload_type: 113,
            framebuff_cnt: 3,
            flags: 0,
        }
    }
}

pub struct RxAncHandle {
    stop: Arc<AtomicBool>,
}

impl RxAncHandle {
    /// Quiesce the session: its tasklets become inert from the next
    /// round; buffers drain back to their pools.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

pub struct RxAncSession {
    name: String,
    queues: Vec<Box<dyn RxQueue>>,
    pool: Arc<RxFramePool>,
    handler: Box<dyn RxMediaHandler>,
    payload_type: u8,
    /// Duplicate filter across redundant ports.
    last_timestamp: Option<u32>,
    stop: Arc<AtomicBool>,
    reporter: StatisticsReporter,
}

impl RxAncSession {
    fn handle_packet(&mut self, pkt: &Packet) -> Result<(), Error> {
        let frame = &pkt.head;
        let rtp_at = super::rtp_offset(frame).ok_or(Error::Dropped)?;
        let rtp = RtpHeader::decode(&frame[rtp_at..]).map_err(|_| Error::Dropped)?;

        if rtp.payload_type != self.payload_type {
            self.reporter.send(&[Stats::PktsWrongPayloadType(1)]);
            return Err(Error::Dropped);
        }

        // the same timestamp from the redundant port is a duplicate
        if self.last_timestamp == Some(rtp.timestamp) {
            self.reporter.send(&[Stats::PktsRedundantDropped(1)]);
            return Err(Error::Dropped);
        }

        let hdr_at = rtp_at + RtpHeader::SIZE;
        let hdr = anc::PayloadHeader::decode(&frame[hdr_at..]).map_err(|_| Error::Dropped)?;
        let payload = frame
            .get(hdr_at + anc::PayloadHeader::SIZE..)
            .ok_or(Error::Dropped)?;
        let size = (hdr.length as usize).min(payload.len());

        let Some(mut buf) = self.pool.get() else {
            self.reporter.send(&[Stats::FramesDropped(1)]);
            return Err(Error::Dropped);
        };
        buf[..size].copy_from_slice(&payload[..size]);
        buf.truncate(size);

        self.last_timestamp = Some(rtp.timestamp);
        self.reporter
            .send(&[Stats::PktsReceived(1), Stats::FramesReceived(1)]);

        let meta = MediaMeta {
            rtp_timestamp: rtp.timestamp,
            size,
            anc_count: hdr.anc_count,
            second_field: hdr.field == 3,
            ..Default::default()
        };
        let _ = self.handler.frame_ready(self.pool.deliver(buf), &meta);
        Ok(())
    }
}

impl Tasklet for RxAncSession {
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
            self.queues[port].rx_burst(&mut pkts, 16);
            for pkt in &pkts {
                got_any = true;
                if let Err(Error::Dropped) = self.handle_packet(pkt) {
                    self.reporter.send(&[Stats::PktsDropped(1)]);
                }
            }
        }

        if got_any { Poll::HasPending } else { Poll::AllDone }
    }

    fn advice_sleep_us(&self) -> Option<u64> {
        Some(1000)
    }
}

pub(crate) struct RxAncParts {
    pub handle: RxAncHandle,
    pub session: RxAncSession,
    pub quota_mbps: u32,
    pub stop: Arc<AtomicBool>,
}

pub(crate) fn create(
    cfg: &RxAncConfig,
    handler: Box<dyn RxMediaHandler>,
    queues: Vec<Box<dyn RxQueue>>,
    reporter: StatisticsReporter,
) -> Result<RxAncParts, Error> {
    if cfg.num_ports == 0
        || cfg.num_ports > 2
        || !codec::is_valid_payload_type(cfg.payload_type)
        || cfg.framebuff_cnt < 2
        || queues.len() != cfg.num_ports
    {
        return Err(Error::InvalidArgument);
    }

    let stop = Arc::new(AtomicBool::new(false));
    Ok(RxAncParts {
        handle: RxAncHandle { stop: stop.clone() },
        session: RxAncSession {
            name: format!("{}-anc", cfg.name),
            queues,
            pool: RxFramePool::new(cfg.framebuff_cnt, ANC_MAX_PAYLOAD)?,
            handler,
            payload_type: cfg.payload_type,
            last_timestamp: None,
            stop: stop.clone(),
            reporter,
        },
        quota_mbps: 10,
        stop,
    })
}
