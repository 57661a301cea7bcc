//! Receive video sessions (ST 2110-20 and -22).
//!
//! Each received packet is classified by its RTP timestamp into one of a
//! few reassembly slots, written into the slot's frame at the offset its
//! row descriptors (or codestream counters) dictate, and ticked off in
//! the completion bitmap. A filled frame goes to the application; a slot
//! evicted half way is dropped or, when the session opted in, delivered
//! incomplete.

use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use codec::{extended_sequence, rfc4175, rfc9134, rtp::RtpHeader};
use service::{
    Error, FLAG_RECEIVE_INCOMPLETE_FRAME, FrameStatus, RxVideoHandler, RxVideoMeta, SessionFlags,
    fmt::{Fps, PacketGeometry, Packing, PixelGroup, VideoFormat},
    frame::RxFramePool,
    slot::{Evicted, NUM_SLOTS, SlotTable},
    timing::TimingParser,
};

use crate::{
    net::{Clock, Packet, RxQueue},
    sched::{Poll, Tasklet},
    statistics::{Stats, StatisticsReporter},
};

/// Receive burst size per port per round.
pub const RX_BURST: usize = 128;

/// Create parameters of a receive video session.
#[derive(Clone)]
pub struct RxVideoConfig {
    pub name: String,
    pub num_ports: usize,
    /// Flow destination per port: the multicast group or the local
    /// address.
    pub ip: [Ipv4Addr; 2],
    pub udp_port: [u16; 2],
    /// Source filter per port (SSM).
    pub src_ip: [Option<Ipv4Addr>; 2],
    pub payload_type: u8,
    pub width: u32,
    pub height: u32,
    pub fps: Fps,
    pub fmt: VideoFormat,
    pub packing: Packing,
    pub interlaced: bool,
    pub framebuff_cnt: u16,
    pub flags: SessionFlags,
    /// Application stride in bytes; zero for tight packing.
    pub linesize: usize,
    /// ST 2110-22: the largest codestream a frame may carry.
    pub st22_max_codestream: Option<usize>,
    /// Run the timing conformance parser on this session.
    pub enable_timing: bool,
}

impl Default for RxVideoConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            num_ports: 1,
            ip: [Ipv4Addr::UNSPECIFIED; 2],
            udp_port: [20000; 2],
            src_ip: [None; 2],
            payload_type: 112,
            width: 1920,
            height: 1080,
            fps: Fps::P59_94,
            fmt: VideoFormat::Yuv422_10bit,
            packing: Packing::Bpm,
            interlaced: false,
            framebuff_cnt: 3,
            flags: 0,
            linesize: 0,
            st22_max_codestream: None,
            enable_timing: false,
        }
    }
}

/// The application facing handle of a receive video session.
pub struct RxVideoHandle {
    stop: Arc<AtomicBool>,
}

impl RxVideoHandle {
    /// Quiesce the session: its tasklets become inert from the next
    /// round; buffers drain back to their pools.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// The receive tasklet.
pub struct RxVideoRecv {
    name: String,
    queues: Vec<Box<dyn RxQueue>>,
    pool: Arc<RxFramePool>,
    handler: Box<dyn RxVideoHandler>,
    slots: SlotTable,
    clock: Arc<dyn Clock>,
    timing: Option<TimingParser>,

    geometry: PacketGeometry,
    pg: PixelGroup,
    row_pitch: usize,
    payload_type: u8,
    flags: SessionFlags,
    st22: bool,
    meta: RxVideoMeta,

    stop: Arc<AtomicBool>,
    reporter: StatisticsReporter,
}

impl RxVideoRecv {
    fn drop_evicted(&mut self, evicted: Evicted) {
        self.reporter.send(&[Stats::SlotEvictions(1)]);
        log::debug!(
            "{}: slot evicted, ts {} recv {} bits {}",
            self.name,
            evicted.timestamp,
            evicted.frame_recv_size,
            evicted.bits_set,
        );

        let Some(frame) = evicted.frame else {
            return;
        };

        if self.flags & FLAG_RECEIVE_INCOMPLETE_FRAME != 0 && evicted.frame_recv_size > 0 {
            let mut meta = self.meta;
            meta.rtp_timestamp = evicted.timestamp;
            meta.status = FrameStatus::Incomplete;
            meta.frame_recv_size = evicted.frame_recv_size;
            meta.pkts_recv = evicted.pkts_recv;
            meta.second_field = evicted.second_field;

            self.reporter.send(&[Stats::FramesIncomplete(1)]);
            let _ = self.handler.frame_ready(self.pool.deliver(frame), &meta);
        } else {
            self.reporter.send(&[Stats::FramesDropped(1)]);
            self.pool.put(frame);
        }
    }

    fn deliver(&mut self, slot_idx: usize, status: FrameStatus, pkts_total: u32) {
        let (frame, timestamp, recv_size, pkts_recv, second_field) = {
            let slot = self.slots.get_mut(slot_idx);
            let timestamp = slot.timestamp;
            let recv_size = slot.frame_recv_size;
            let pkts_recv = slot.pkts_recv;
            let second_field = slot.second_field;
            match slot.take_frame() {
                Some(frame) => (frame, timestamp, recv_size, pkts_recv, second_field),
                None => return,
            }
        };

        let mut meta = self.meta;
        meta.rtp_timestamp = timestamp;
        meta.status = status;
        meta.frame_recv_size = recv_size;
        meta.pkts_total = pkts_total;
        meta.pkts_recv = pkts_recv;
        meta.second_field = second_field;

        self.reporter.send(&[match status {
            FrameStatus::Complete => Stats::FramesReceived(1),
            FrameStatus::Incomplete => Stats::FramesIncomplete(1),
        }]);

        let _ = self.handler.frame_ready(self.pool.deliver(frame), &meta);
    }

    fn handle_packet(&mut self, port: usize, pkt: &Packet) -> Result<(), Error> {
        let frame = &pkt.head;
        let rtp_at = super::rtp_offset(frame).ok_or(Error::Dropped)?;
        let rtp = RtpHeader::decode(&frame[rtp_at..]).map_err(|_| Error::Dropped)?;

        if rtp.payload_type != self.payload_type {
            self.reporter.send(&[Stats::PktsWrongPayloadType(1)]);
            return Err(Error::Dropped);
        }

        if self.st22 {
            self.handle_st22(port, pkt, rtp, rtp_at + RtpHeader::SIZE)
        } else {
            self.handle_st20(port, pkt, rtp, rtp_at + RtpHeader::SIZE)
        }
    }

    fn handle_st20(
        &mut self,
        port: usize,
        pkt: &Packet,
        rtp: RtpHeader,
        hdr_at: usize,
    ) -> Result<(), Error> {
        let frame = &pkt.head;
        let hdr = rfc4175::PayloadHeader::decode(&frame[hdr_at..]).map_err(|_| Error::Dropped)?;
        let seq = extended_sequence(hdr.ext_sequence, rtp.sequence);
        let now = self.clock.now_ns();

        let pool = self.pool.clone();
        let (slot_idx, evicted) = self
            .slots
            .find_or_evict(rtp.timestamp, now, move || pool.get());
        if let Some(evicted) = evicted {
            self.drop_evicted(evicted);
        }

        let incomplete_ok = self.flags & FLAG_RECEIVE_INCOMPLETE_FRAME != 0;
        let slot = self.slots.get_mut(slot_idx);
        if slot.frame.is_none() {
            // pool exhausted; nothing to write into
            return Err(Error::Dropped);
        }

        let pkt_idx = if slot.seq_id_got {
            let pkt_idx = slot.pkt_idx(seq)?;
            if slot.test_and_set(pkt_idx) {
                self.reporter.send(&[Stats::PktsRedundantDropped(1)]);
                return Err(Error::Dropped);
            }
            pkt_idx
        } else {
            // the first packet accepted must open the frame, unless the
            // session accepts partial frames
            if !incomplete_ok && (hdr.row.number != 0 || hdr.row.offset != 0) {
                return Err(Error::Dropped);
            }

            slot.seq_id_base = seq;
            slot.seq_id_got = true;
            slot.test_and_set(0);
            0
        };

        // copy the payload into the frame at the stride aware offset
        let data_at = hdr_at + hdr.size();
        let payload = frame.get(data_at..).ok_or(Error::Dropped)?;

        let pg = self.pg;
        let row_pitch = self.row_pitch;
        let frame_size = self.geometry.frame_size;
        let bytes_in_line = self.geometry.bytes_in_line;

        let copy_row = |slot: &mut service::slot::Slot,
                        row: &rfc4175::RowDescriptor,
                        from: usize|
         -> Result<usize, Error> {
            let col = (row.offset as u32 / pg.coverage * pg.size) as usize;
            let tight = row.number as usize * bytes_in_line + col;
            if tight + row.length as usize > frame_size {
                return Err(Error::Dropped);
            }

            let at = row.number as usize * row_pitch + col;
            let data = payload
                .get(from..from + row.length as usize)
                .ok_or(Error::Dropped)?;

            let buf = slot.frame.as_mut().ok_or(Error::Dropped)?;
            buf[at..at + row.length as usize].copy_from_slice(data);
            Ok(row.length as usize)
        };

        let mut wrote = 0usize;
        let mut failed = false;
        match copy_row(slot, &hdr.row, 0) {
            Ok(n) => wrote += n,
            Err(_) => failed = true,
        }
        if let Some(second) = &hdr.second_row {
            if !failed {
                match copy_row(slot, second, wrote) {
                    Ok(n) => wrote += n,
                    Err(_) => failed = true,
                }
            }
        }
        if failed {
            self.reporter.send(&[Stats::PktsOffsetDropped(1)]);
            return Err(Error::Dropped);
        }

        slot.frame_recv_size += wrote;
        slot.pkts_recv[port] += 1;
        slot.second_field = hdr.row.second_field;
        slot.last_activity = now;
        self.reporter.send(&[Stats::PktsReceived(1)]);

        if let Some(timing) = &mut self.timing {
            if let Some(report) = timing.on_packet(rtp.timestamp, pkt.rx_timestamp, pkt_idx) {
                log_timing_report(&self.name, &report);
            }
        }

        if slot.frame_recv_size >= self.geometry.frame_size {
            self.deliver(slot_idx, FrameStatus::Complete, self.geometry.total_pkts);
        }

        Ok(())
    }

    fn handle_st22(
        &mut self,
        port: usize,
        pkt: &Packet,
        rtp: RtpHeader,
        hdr_at: usize,
    ) -> Result<(), Error> {
        let frame = &pkt.head;
        let hdr = rfc9134::PayloadHeader::decode(&frame[hdr_at..]).map_err(|_| Error::Dropped)?;
        let now = self.clock.now_ns();

        // the codestream counters give the packet index directly
        let pkt_idx = hdr.sep_counter as u32 * 2048 + hdr.p_counter as u32;

        let pool = self.pool.clone();
        let (slot_idx, evicted) = self
            .slots
            .find_or_evict(rtp.timestamp, now, move || pool.get());
        if let Some(evicted) = evicted {
            self.drop_evicted(evicted);
        }

        let slot = self.slots.get_mut(slot_idx);
        if slot.frame.is_none() {
            return Err(Error::Dropped);
        }

        if !slot.seq_id_got {
            let seq = extended_sequence(hdr.ext_sequence, rtp.sequence);
            slot.seq_id_base = seq.wrapping_sub(pkt_idx);
            slot.seq_id_got = true;
        }

        if pkt_idx as usize * self.geometry.pkt_len >= self.pool.frame_size() {
            self.reporter.send(&[Stats::PktsOffsetDropped(1)]);
            return Err(Error::Dropped);
        }

        if slot.test_and_set(pkt_idx) {
            self.reporter.send(&[Stats::PktsRedundantDropped(1)]);
            return Err(Error::Dropped);
        }

        let payload = frame.get(hdr_at + rfc9134::PayloadHeader::SIZE..).ok_or(Error::Dropped)?;
        let at = pkt_idx as usize * self.geometry.pkt_len;
        {
            let buf = slot.frame.as_mut().ok_or(Error::Dropped)?;
            let end = (at + payload.len()).min(buf.len());
            if at >= end {
                self.reporter.send(&[Stats::PktsOffsetDropped(1)]);
                return Err(Error::Dropped);
            }
            buf[at..end].copy_from_slice(&payload[..end - at]);
            slot.frame_recv_size += end - at;
        }

        slot.pkts_recv[port] += 1;
        slot.last_activity = now;
        if rtp.marker || hdr.last_packet {
            slot.marker_seen = true;
            slot.pkts_total = pkt_idx + 1;
        }
        self.reporter.send(&[Stats::PktsReceived(1)]);

        if let Some(timing) = &mut self.timing {
            if let Some(report) = timing.on_packet(rtp.timestamp, pkt.rx_timestamp, pkt_idx) {
                log_timing_report(&self.name, &report);
            }
        }

        let slot = self.slots.get(slot_idx);
        if slot.marker_seen {
            let total = slot.pkts_total;
            if slot.bits_set() >= total {
                self.deliver(slot_idx, FrameStatus::Complete, total);
            }
            // an incomplete compressed frame stays in its slot until a
            // straggler completes it or eviction flushes it
        }

        Ok(())
    }
}

fn log_timing_report(name: &str, report: &service::timing::Report) {
    log::info!(
        "{name}: Cinst AVG {:.2} MIN {} MAX {} test {}",
        report.cinst.avg,
        report.cinst.min,
        report.cinst.max,
        report.cinst_verdict.name(),
    );
    log::info!(
        "{name}: VRX AVG {:.2} MIN {} MAX {} test {}",
        report.vrx.avg,
        report.vrx.min,
        report.vrx.max,
        report.vrx_verdict.name(),
    );
    log::info!(
        "{name}: FPT AVG {:.2} MIN {} MAX {} test {}",
        report.fpt.avg,
        report.fpt.min,
        report.fpt.max,
        report.fpt_verdict.name(),
    );
    log::info!(
        "{name}: RTP Offset AVG {:.2} MIN {} MAX {} test {}",
        report.rtp_offset.avg,
        report.rtp_offset.min,
        report.rtp_offset.max,
        report.rtp_offset_verdict.name(),
    );
    log::info!(
        "{name}: RTP TS Delta AVG {:.2} MIN {} MAX {} test {}",
        report.rtp_ts_delta.avg,
        report.rtp_ts_delta.min,
        report.rtp_ts_delta.max,
        report.rtp_ts_delta_verdict.name(),
    );
    log::info!(
        "{name}: Inter-packet time(ns) AVG {:.2} MIN {} MAX {}",
        report.inter_pkt_time.avg,
        report.inter_pkt_time.min,
        report.inter_pkt_time.max,
    );
}

impl Tasklet for RxVideoRecv {
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
            self.queues[port].rx_burst(&mut pkts, RX_BURST);

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
        Some(100)
    }
}

pub(crate) struct RxVideoParts {
    pub handle: RxVideoHandle,
    pub recv: RxVideoRecv,
    pub quota_mbps: u32,
    pub stop: Arc<AtomicBool>,
}

fn check_config(cfg: &RxVideoConfig) -> Result<(), Error> {
    if cfg.num_ports == 0
        || cfg.num_ports > 2
        || !codec::is_valid_payload_type(cfg.payload_type)
        || cfg.framebuff_cnt < 2
        || cfg.width == 0
        || cfg.height == 0
    {
        return Err(Error::InvalidArgument);
    }

    Ok(())
}

/// Wire a receive session: pool, slots, queues and the recv tasklet.
pub(crate) fn create(
    cfg: &RxVideoConfig,
    handler: Box<dyn RxVideoHandler>,
    queues: Vec<Box<dyn RxQueue>>,
    clock: Arc<dyn Clock>,
    reporter: StatisticsReporter,
) -> Result<RxVideoParts, Error> {
    check_config(cfg)?;
    if queues.len() != cfg.num_ports {
        return Err(Error::InvalidArgument);
    }

    let field_height = if cfg.interlaced {
        cfg.height / 2
    } else {
        cfg.height
    };

    let (geometry, frame_size, st22) = match cfg.st22_max_codestream {
        Some(max) => {
            let geometry = PacketGeometry::compute_st22(rfc9134::BOXES_SIZE + max);
            (geometry, rfc9134::BOXES_SIZE + max, true)
        }
        None => {
            let geometry =
                PacketGeometry::compute(cfg.width, cfg.height, cfg.fmt, cfg.packing, cfg.interlaced)?;
            if cfg.linesize != 0 && cfg.linesize < geometry.bytes_in_line {
                return Err(Error::InvalidArgument);
            }

            let fb = if cfg.linesize > geometry.bytes_in_line {
                cfg.linesize * field_height as usize
            } else {
                geometry.frame_size
            };
            (geometry, fb, false)
        }
    };

    let row_pitch = if cfg.linesize > geometry.bytes_in_line {
        cfg.linesize
    } else {
        geometry.bytes_in_line
    };

    let pool = RxFramePool::new(cfg.framebuff_cnt, frame_size)?;
    let slots = SlotTable::new(NUM_SLOTS, geometry.total_pkts.max(1));

    let timing = (cfg.enable_timing && !st22).then(|| {
        TimingParser::new(cfg.width, cfg.height, cfg.fps, cfg.fmt, cfg.interlaced)
    });

    let stop = Arc::new(AtomicBool::new(false));
    let meta = RxVideoMeta {
        width: cfg.width,
        height: cfg.height,
        fps: Some(cfg.fps),
        fmt: Some(cfg.fmt),
        ..Default::default()
    };

    let recv = RxVideoRecv {
        name: format!("{}-recv", cfg.name),
        queues,
        pool,
        handler,
        slots,
        clock,
        timing,
        geometry,
        pg: cfg.fmt.pixel_group(),
        row_pitch,
        payload_type: cfg.payload_type,
        flags: cfg.flags,
        st22,
        meta,
        stop: stop.clone(),
        reporter,
    };

    let quota_mbps = geometry.bandwidth_mbps(cfg.fps) * cfg.num_ports as u32;

    Ok(RxVideoParts {
        handle: RxVideoHandle { stop: stop.clone() },
        recv,
        quota_mbps,
        stop,
    })
}
