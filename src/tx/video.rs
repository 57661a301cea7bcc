//! Transmit video sessions (ST 2110-20 and -22).
//!
//! The build tasklet turns application frames into paced RTP packets:
//! four per round, headers cloned from per port templates, payload
//! sliced zero copy out of the frozen frame, every packet stamped with
//! the TSC the transmitter must honor. The companion send tasklet lives
//! in [`crate::transmitter`].

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use codec::{rfc4175, rfc9134, rtp::RtpHeader};
use parking_lot::Mutex;
use service::{
    Error, FLAG_DISABLE_BULK, FLAG_TSC_PACING, FLAG_USER_PACING, FLAG_USER_TIMESTAMP, SessionFlags,
    TimestampFormat, TxVideoHandler, TxVideoMeta,
    convert::{self, FrameFormat},
    fmt::{Fps, PKT_L2L4_OVERHEAD, PacketGeometry, Packing, VideoFormat},
    frame::{TxFrameGuard, TxFramePool},
    media_clock,
    pacing::{Pacing, PacingWay, TrainingCache, rate_limit_bps, solve_pad_interval},
};

use crate::{
    net::{Clock, Packet, PortDevice},
    ptp::PtpClock,
    sched::{Poll, Tasklet},
    statistics::{Stats, StatisticsReporter},
    transmitter::{PortSend, VideoTransmitter},
    tx::{DestInfo, finalize_head, header_template},
};

/// The per round packet batch.
pub const BULK: usize = 4;

/// Session to transmitter ring depth.
pub const TX_RING_SIZE: usize = 128;

const TRAIN_ITERATIONS: u32 = 30;

/// ST 2110-22 specific create parameters.
#[derive(Debug, Clone, Copy)]
pub struct St22Config {
    /// Largest codestream the application will submit.
    pub codestream_max: usize,
    pub bitrate_mbps: u32,
}

/// Create parameters of a transmit video session.
#[derive(Clone)]
pub struct TxVideoConfig {
    pub name: String,
    pub num_ports: usize,
    pub dst_ip: [Ipv4Addr; 2],
    pub udp_port: [u16; 2],
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
    /// The application side pixel format when it differs from the wire.
    pub app_format: Option<FrameFormat>,
    pub st22: Option<St22Config>,
    /// Drive packet building from `lines_ready` callbacks.
    pub slice_mode: bool,
}

impl Default for TxVideoConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            num_ports: 1,
            dst_ip: [Ipv4Addr::UNSPECIFIED; 2],
            udp_port: [20000; 2],
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
            app_format: None,
            st22: None,
            slice_mode: false,
        }
    }
}

fn check_config(cfg: &TxVideoConfig) -> Result<(), Error> {
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

/// One port as the session sees it.
pub(crate) struct SessionPort {
    pub dev: Arc<dyn PortDevice>,
    pub queue: usize,
    /// Global port index, the training cache key.
    pub port_idx: usize,
    pub way: PacingWay,
}

/// The application facing handle of a transmit video session.
pub struct TxVideoHandle {
    pool: Arc<TxFramePool>,
    templates: Arc<Mutex<Vec<BytesMut>>>,
    ports: Vec<(Arc<dyn PortDevice>, u16)>,
    stop: Arc<AtomicBool>,
}

impl TxVideoHandle {
    /// Claim the next FREE frame buffer.
    pub fn buffer_get(&self, timeout: Duration) -> Result<TxFrameGuard, Error> {
        if self.stop.load(Ordering::Acquire) {
            return Err(Error::InvalidState);
        }

        self.pool.get(timeout)
    }

    pub fn framebuffer_count(&self) -> u16 {
        self.pool.count()
    }

    pub fn frame_size(&self) -> usize {
        self.pool.frame_size()
    }

    /// Rewrite the cached headers of one port, for on the fly multicast
    /// retargeting. Takes effect from the next built packet.
    pub fn update_destination(&self, port: usize, dest: DestInfo) -> Result<(), Error> {
        let (dev, src_port) = self.ports.get(port).ok_or(Error::InvalidArgument)?;

        let mac = match dest.mac {
            Some(mac) => mac,
            None if dest.ip.is_multicast() => codec::net::multicast_mac(dest.ip),
            // unicast retarget without an explicit mac needs the caller
            // to have resolved it
            None => return Err(Error::InvalidArgument),
        };

        let head = header_template(dev.mac(), mac, dev.ip(), dest.ip, *src_port, dest.udp_port);
        let mut templates = self.templates.lock();
        *templates.get_mut(port).ok_or(Error::InvalidArgument)? = head;
        Ok(())
    }

    /// Quiesce the session: its tasklets become inert from the next
    /// round; buffers drain back to their pools.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

enum FrameState {
    Wait,
    Sending,
}

struct CurrentFrame {
    idx: u16,
    payload: Bytes,
    meta: TxVideoMeta,
    total_pkts: u32,
    frame_size: usize,
}

struct St22Build {
    boxes: BytesMut,
    frame_counter: u32,
}

/// The build tasklet.
pub struct TxVideoBuild {
    name: String,
    pool: Arc<TxFramePool>,
    handler: Box<dyn TxVideoHandler>,
    clock: Arc<dyn Clock>,
    ptp: Arc<PtpClock>,
    pacing: Pacing,
    geometry: PacketGeometry,
    pg: service::fmt::PixelGroup,
    templates: Arc<Mutex<Vec<BytesMut>>>,
    producers: Vec<rtrb::Producer<Packet>>,
    inflight: Vec<Vec<Packet>>,
    st22: Option<St22Build>,

    payload_type: u8,
    ssrc: u32,
    packing: Packing,
    width: u32,
    /// Field height: the row number range of one transmitted frame.
    height: u32,
    linesize: usize,
    flags: SessionFlags,
    slice_mode: bool,
    bulk: usize,
    advice_us: u64,

    state: FrameState,
    frame: Option<CurrentFrame>,
    pkt_idx: u32,
    seq_id: u32,
    ipv4_id: u16,
    lines_ready: u16,
    done_queue: VecDeque<(u16, TxVideoMeta)>,
    /// TSC of the first starved round, for the stall alarm.
    busy_since: Option<u64>,

    stop: Arc<AtomicBool>,
    reporter: StatisticsReporter,
}

impl TxVideoBuild {
    fn sync_pacing(&mut self, meta: &TxVideoMeta) {
        let required_tai = (self.flags & FLAG_USER_PACING != 0
            && meta.tfmt == TimestampFormat::Tai
            && meta.timestamp != 0)
            .then_some(meta.timestamp);

        let outcome = self
            .pacing
            .sync(self.ptp.get_time(), self.clock.now_ns(), required_tai);

        if outcome.epoch_drops > 0 {
            self.reporter
                .send(&[Stats::EpochDrops(outcome.epoch_drops as usize)]);
        }
        if outcome.troffset_mismatch {
            self.reporter.send(&[Stats::EpochMismatch(1)]);
        }
        if outcome.user_timestamp_error {
            self.reporter.send(&[Stats::UserTimestampError(1)]);
        }

        if self.flags & FLAG_USER_TIMESTAMP != 0 && meta.timestamp != 0 {
            self.pacing.rtp_time_stamp = media_clock(meta.tfmt, meta.timestamp, 90_000);
        }
    }

    /// Take the next READY frame from the application.
    fn next_frame(&mut self) -> Result<(), Error> {
        let mut meta = TxVideoMeta::default();
        let idx = self.handler.next_frame(&mut meta)?;

        let stored = self.pool.meta(idx);
        // callback values win over the stored put meta when provided
        if meta.timestamp == 0 {
            meta.timestamp = stored.timestamp;
            meta.tfmt = stored.tfmt;
        }
        meta.second_field = stored.second_field;
        if meta.codestream_size == 0 {
            meta.codestream_size = stored.codestream_size;
        }

        let (payload, _) = self.pool.begin_transmit(idx)?;

        let (total_pkts, frame_size) = match &mut self.st22 {
            Some(st22) => {
                let size = rfc9134::BOXES_SIZE + meta.codestream_size;
                if meta.codestream_size == 0 || meta.codestream_size > payload.len() {
                    // a frame the geometry cannot carry is abandoned
                    self.pool.complete(idx);
                    return Err(Error::InvalidArgument);
                }
                st22.frame_counter = st22.frame_counter.wrapping_add(1);
                (
                    size.div_ceil(self.geometry.pkt_len) as u32,
                    size,
                )
            }
            None => (self.geometry.total_pkts, self.geometry.frame_size),
        };

        self.sync_pacing(&meta);
        self.lines_ready = 0;
        self.pkt_idx = 0;
        self.frame = Some(CurrentFrame {
            idx,
            payload,
            meta,
            total_pkts,
            frame_size,
        });
        self.state = FrameState::Sending;
        Ok(())
    }

    /// Build one ST 2110-20 packet head + payload slice.
    fn build_st20(&mut self, frame: &CurrentFrame, head: &mut BytesMut) -> Option<Bytes> {
        let geo = &self.geometry;
        let pg = self.pg;
        let bytes_in_line = geo.bytes_in_line;
        let padded = self.linesize > bytes_in_line;
        let row_pitch = if padded { self.linesize } else { bytes_in_line };
        let marker = self.pkt_idx + 1 >= frame.total_pkts;

        let (row, col_pixels, left_len, second, offset) = match self.packing {
            Packing::GpmSl => {
                let row = self.pkt_idx / geo.pkts_in_line;
                let pixels_per_pkt =
                    (geo.pkt_len / pg.size as usize * pg.coverage as usize) as u32;
                let col = pixels_per_pkt * (self.pkt_idx % geo.pkts_in_line);
                let left = (geo.pkt_len)
                    .min(((self.width - col) / pg.coverage * pg.size) as usize);
                let offset = row as usize * row_pitch
                    + (col / pg.coverage * pg.size) as usize;
                (row, col, left, None, offset)
            }
            Packing::Bpm | Packing::Gpm => {
                let tight = geo.pkt_len * self.pkt_idx as usize;
                let left = geo.pkt_len.min(frame.frame_size - tight);
                let row = (tight / bytes_in_line) as u32;
                let col =
                    ((tight % bytes_in_line) * pg.coverage as usize / pg.size as usize) as u32;

                let crosses = tight + left > (row as usize + 1) * bytes_in_line;
                let second = (crosses && tight + left < frame.frame_size).then(|| {
                    let line1 = (row as usize + 1) * bytes_in_line - tight;
                    (row + 1, line1, left - line1)
                });

                let offset = if padded {
                    tight % bytes_in_line + row as usize * row_pitch
                } else {
                    tight
                };
                (row, col, left, second, offset)
            }
        };

        RtpHeader {
            marker,
            payload_type: self.payload_type,
            sequence: self.seq_id as u16,
            timestamp: self.pacing.rtp_time_stamp,
            ssrc: self.ssrc,
        }
        .encode(head);

        let second_field = frame.meta.second_field;
        rfc4175::PayloadHeader {
            ext_sequence: (self.seq_id >> 16) as u16,
            row: rfc4175::RowDescriptor {
                length: second.as_ref().map(|(_, l1, _)| *l1 as u16).unwrap_or(left_len as u16),
                number: row as u16,
                offset: col_pixels as u16,
                second_field,
                continuation: false,
            },
            second_row: second.as_ref().map(|(row2, _, l2)| rfc4175::RowDescriptor {
                length: *l2 as u16,
                number: *row2 as u16,
                offset: 0,
                second_field,
                continuation: false,
            }),
        }
        .encode(head);

        self.seq_id = self.seq_id.wrapping_add(1);

        // payload: zero copy slice, except a line straddle over a padded
        // stride which has to gather two pieces
        if let (Some((row2, line1, line2)), true) = (second.as_ref(), padded) {
            let buf = &frame.payload;
            head.extend_from_slice(&buf[offset..offset + line1]);
            let at2 = *row2 as usize * row_pitch;
            head.extend_from_slice(&buf[at2..at2 + line2]);
            None
        } else {
            Some(frame.payload.slice(offset..offset + left_len))
        }
    }

    /// Build one ST 2110-22 packet; the first packet of a frame carries
    /// the box prefix in its head.
    fn build_st22(&mut self, frame: &CurrentFrame, head: &mut BytesMut) -> Option<Bytes> {
        let Some(st22) = self.st22.as_ref() else {
            return None;
        };
        let frame_counter = st22.frame_counter;
        let geo = &self.geometry;

        let virt = geo.pkt_len * self.pkt_idx as usize;
        let left = geo.pkt_len.min(frame.frame_size - virt);
        let last = self.pkt_idx + 1 >= frame.total_pkts;

        RtpHeader {
            marker: last,
            payload_type: self.payload_type,
            sequence: self.seq_id as u16,
            timestamp: self.pacing.rtp_time_stamp,
            ssrc: self.ssrc,
        }
        .encode(head);

        let mut payload_hdr = rfc9134::PayloadHeader::progressive(frame_counter, self.pkt_idx);
        payload_hdr.ext_sequence = (self.seq_id >> 16) as u16;
        payload_hdr.last_packet = last;
        payload_hdr.encode(head);

        self.seq_id = self.seq_id.wrapping_add(1);

        if self.pkt_idx == 0 {
            if let Some(st22) = self.st22.as_ref() {
                head.extend_from_slice(&st22.boxes);
            }
            let data = left - rfc9134::BOXES_SIZE;
            Some(frame.payload.slice(0..data))
        } else {
            let at = virt - rfc9134::BOXES_SIZE;
            Some(frame.payload.slice(at..at + left))
        }
    }

    fn slice_gate(&mut self) -> bool {
        if !self.slice_mode {
            return true;
        }

        let Some(frame) = self.frame.as_ref() else {
            return true;
        };

        let next_idx = self.pkt_idx + self.bulk as u32;
        let line_needed = match self.packing {
            Packing::GpmSl => next_idx / self.geometry.pkts_in_line,
            _ => {
                (self.geometry.pkt_len * next_idx as usize / self.geometry.bytes_in_line) as u32 + 1
            }
        };
        let line_needed = line_needed.min(self.height.saturating_sub(1)) as u16;
        let frame_idx = frame.idx;

        if line_needed < self.lines_ready {
            return true;
        }

        self.lines_ready = self.handler.lines_ready(frame_idx);
        if line_needed >= self.lines_ready {
            self.reporter.send(&[Stats::LinesNotReady(1)]);
            return false;
        }

        true
    }

    fn enqueue(&mut self, port: usize, pkts: Vec<Packet>) -> bool {
        let producer = &mut self.producers[port];
        if producer.slots() < pkts.len() {
            self.inflight[port] = pkts;
            self.reporter.send(&[Stats::RingFull(1)]);
            return false;
        }

        for pkt in pkts {
            // room checked above
            let _ = producer.push(pkt);
        }
        true
    }

    fn round(&mut self) -> Poll {
        // retry inflight bulks before anything else
        for port in 0..self.producers.len() {
            if !self.inflight[port].is_empty() {
                let pkts = std::mem::take(&mut self.inflight[port]);
                if !self.enqueue(port, pkts) {
                    return Poll::AllDone;
                }
            }
        }

        // frames whose packets all left the NIC go back to FREE
        while let Some((idx, meta)) = self.done_queue.front().copied() {
            if !self.pool.complete(idx) {
                break;
            }
            self.done_queue.pop_front();
            self.handler.frame_done(idx, &meta);
        }

        if matches!(self.state, FrameState::Wait) {
            match self.next_frame() {
                Ok(()) => self.busy_since = None,
                Err(Error::WouldBlock) => {
                    self.reporter.send(&[Stats::UserBusy(1)]);

                    // starving for over a second is an error condition
                    let now = self.clock.now_ns();
                    let since = *self.busy_since.get_or_insert(now);
                    if now.saturating_sub(since) > 1_000_000_000 {
                        log::error!("{}: no frame from the application for over a second", self.name);
                        self.busy_since = Some(now);
                    }
                    return Poll::AllDone;
                }
                Err(_) => return Poll::AllDone,
            }
        }

        if !self.slice_gate() {
            return Poll::AllDone;
        }

        let Some(frame) = self.frame.take() else {
            return Poll::AllDone;
        };
        let total_pkts = frame.total_pkts;
        let num_ports = self.producers.len();

        let count = self
            .bulk
            .min((total_pkts - self.pkt_idx) as usize);
        let mut bulks: Vec<Vec<Packet>> = (0..num_ports).map(|_| Vec::with_capacity(count)).collect();

        for _ in 0..count {
            let templates = self.templates.lock();
            let mut heads: Vec<BytesMut> =
                templates.iter().map(|t| t.clone()).collect();
            drop(templates);

            let mut head = heads.remove(0);
            let payload = if self.st22.is_some() {
                self.build_st22(&frame, &mut head)
            } else {
                self.build_st20(&frame, &mut head)
            };

            let chained = payload.as_ref().map(|p| p.len()).unwrap_or(0);
            finalize_head(&mut head, self.ipv4_id, chained);

            let mut pkt = Packet::new(head);
            pkt.payload = payload.clone();
            pkt.tx_tsc = self.pacing.tsc_time_cursor as u64;
            pkt.tx_ptp = self.pacing.ptp_time_cursor as u64;
            pkt.pkt_idx = self.pkt_idx;
            let base_head = pkt.head.clone();
            bulks[0].push(pkt);

            // the redundant port repeats headers and payload verbatim,
            // only the l2/l3 template differs
            for (port, mut head_r) in heads.into_iter().enumerate() {
                let wire = &base_head[PKT_L2L4_OVERHEAD..];
                head_r.extend_from_slice(wire);
                finalize_head(&mut head_r, self.ipv4_id, chained);

                let mut pkt_r = Packet::new(head_r);
                pkt_r.payload = payload.clone();
                pkt_r.tx_tsc = self.pacing.tsc_time_cursor as u64;
                pkt_r.tx_ptp = self.pacing.ptp_time_cursor as u64;
                pkt_r.pkt_idx = self.pkt_idx;
                bulks[port + 1].push(pkt_r);
            }

            self.ipv4_id = self.ipv4_id.wrapping_add(1);
            self.pacing.forward();
            self.pkt_idx += 1;
        }

        self.reporter
            .send(&[Stats::PktsBuilt(count * num_ports)]);

        let mut blocked = false;
        for (port, pkts) in bulks.into_iter().enumerate() {
            if !self.enqueue(port, pkts) {
                blocked = true;
            }
        }

        if self.pkt_idx >= total_pkts {
            // end of frame: a natural flush point
            self.state = FrameState::Wait;
            self.pkt_idx = 0;
            self.done_queue.push_back((frame.idx, frame.meta));
            self.reporter.send(&[Stats::FramesSent(1)]);

            if (self.clock.now_ns() as f64) > self.pacing.tsc_time_cursor {
                self.reporter.send(&[Stats::ExceedFrameTime(1)]);
            }
        } else {
            self.frame = Some(frame);
        }

        if blocked { Poll::AllDone } else { Poll::HasPending }
    }
}

impl Tasklet for TxVideoBuild {
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
        Some(self.advice_us)
    }
}

pub(crate) struct TxVideoParts {
    pub handle: TxVideoHandle,
    pub build: TxVideoBuild,
    pub send: VideoTransmitter,
    pub quota_mbps: u32,
    pub stop: Arc<AtomicBool>,
}

/// Wire a session together: pool, pacing, templates, rings, build and
/// send tasklets.
pub(crate) fn create(
    cfg: &TxVideoConfig,
    handler: Box<dyn TxVideoHandler>,
    ports: Vec<SessionPort>,
    dest_macs: Vec<codec::net::MacAddr>,
    clock: Arc<dyn Clock>,
    ptp: Arc<PtpClock>,
    reporter: StatisticsReporter,
    cache: TrainingCache,
) -> Result<TxVideoParts, Error> {
    check_config(cfg)?;
    if ports.len() != cfg.num_ports || dest_macs.len() != cfg.num_ports {
        return Err(Error::InvalidArgument);
    }

    let pg = cfg.fmt.pixel_group();
    let field_height = if cfg.interlaced {
        cfg.height / 2
    } else {
        cfg.height
    };

    let (geometry, frame_size, side) = match cfg.st22 {
        Some(st22) => {
            let geometry = PacketGeometry::compute_st22(rfc9134::BOXES_SIZE + st22.codestream_max);
            (geometry, st22.codestream_max, None)
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

            let side = match cfg.app_format {
                Some(app) => {
                    if cfg.fmt != VideoFormat::Yuv422_10bit {
                        return Err(Error::InvalidArgument);
                    }
                    let wire = FrameFormat::Yuv422Rfc4175Pg2Be10;
                    let convert = convert::converter(app, wire).ok_or(Error::InvalidArgument)?;
                    Some((convert, convert::frame_size(app, cfg.width, field_height)))
                }
                None => None,
            };

            (geometry, fb, side)
        }
    };

    let pool = match side {
        Some((convert, side_size)) => TxFramePool::with_converter(
            cfg.framebuff_cnt,
            frame_size,
            side_size,
            Some(convert),
            (cfg.width, field_height),
        )?,
        None => TxFramePool::new(cfg.framebuff_cnt, frame_size)?,
    };

    let mut pacing = Pacing::new(
        cfg.height,
        cfg.fps,
        cfg.interlaced,
        geometry.total_pkts,
        cfg.st22.is_some(),
    );

    // resolve pacing way per port, training the rate limiter when asked
    let bps = rate_limit_bps(
        geometry.pkt_size + PKT_L2L4_OVERHEAD,
        geometry.total_pkts,
        cfg.fps,
        cfg.height,
        cfg.interlaced,
    );
    let mut ways: Vec<PacingWay> = Vec::with_capacity(ports.len());
    for port in &ports {
        let mut way = if cfg.flags & FLAG_TSC_PACING != 0 {
            PacingWay::Tsc
        } else {
            port.way
        };

        if matches!(way, PacingWay::Auto | PacingWay::RateLimit) {
            match cache.search(port.port_idx, bps) {
                Some(pad_interval) => {
                    pacing.pad_interval = pad_interval;
                    way = PacingWay::RateLimit;
                }
                None => {
                    let trained = port
                        .dev
                        .rate_limit_train(port.queue, bps, geometry.pkt_size, TRAIN_ITERATIONS)
                        .and_then(|mut samples| {
                            solve_pad_interval(
                                &mut samples,
                                cfg.fps,
                                geometry.total_pkts,
                                cfg.height,
                                cfg.interlaced,
                            )
                        });

                    match trained {
                        Ok(pad_interval) => {
                            cache.add(port.port_idx, bps, pad_interval);
                            pacing.pad_interval = pad_interval;
                            way = PacingWay::RateLimit;
                        }
                        Err(_) => {
                            way = PacingWay::Tsc;
                        }
                    }
                }
            }
        }

        ways.push(way);
    }

    // two ports must agree; disagreement demotes both to tsc
    if ways.len() > 1 && ways[0] != ways[1] {
        log::warn!("{}: different pacing detected, all set to tsc", cfg.name);
        ways.fill(PacingWay::Tsc);
    }

    let templates: Vec<BytesMut> = ports
        .iter()
        .zip(dest_macs.iter())
        .enumerate()
        .map(|(i, (port, mac))| {
            header_template(
                port.dev.mac(),
                *mac,
                port.dev.ip(),
                cfg.dst_ip[i],
                cfg.udp_port[i],
                cfg.udp_port[i],
            )
        })
        .collect();
    let templates = Arc::new(Mutex::new(templates));

    let stop = Arc::new(AtomicBool::new(false));
    let mut producers = Vec::with_capacity(ports.len());
    let mut sends = Vec::with_capacity(ports.len());

    for (i, port) in ports.iter().enumerate() {
        let (producer, consumer) = rtrb::RingBuffer::new(TX_RING_SIZE);
        producers.push(producer);

        // the pad packet: same flow, shifted payload type, ignored by
        // any conformant receiver
        let pad_pt = if cfg.payload_type >= 127 {
            96
        } else {
            cfg.payload_type + 1
        };
        let mut pad = templates.lock()[i].clone();
        RtpHeader {
            marker: false,
            payload_type: pad_pt,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
        }
        .encode(&mut pad);
        pad.resize(pad.len() + geometry.pkt_len, 0);
        finalize_head(&mut pad, 0, 0);

        sends.push(PortSend {
            dev: port.dev.clone(),
            queue: port.queue,
            consumer,
            way: ways[i],
            trs: pacing.trs,
            warm_pkts: pacing.warm_pkts,
            pad_interval: pacing.pad_interval,
            pad,
            bulk: if cfg.flags & FLAG_DISABLE_BULK != 0 {
                1
            } else {
                BULK
            },
        });
    }

    let advice_us = (pacing.trs * 128.0 / 1000.0) as u64;
    let st22 = cfg.st22.map(|st22| {
        let mut boxes = BytesMut::with_capacity(rfc9134::BOXES_SIZE);
        rfc9134::encode_boxes(
            &rfc9134::BoxParams {
                bitrate_mbps: st22.bitrate_mbps,
                fps: cfg.fps.rounded(),
            },
            &mut boxes,
        );
        St22Build {
            boxes,
            frame_counter: u32::MAX,
        }
    });

    let handle = TxVideoHandle {
        pool: pool.clone(),
        templates: templates.clone(),
        ports: ports
            .iter()
            .enumerate()
            .map(|(i, p)| (p.dev.clone(), cfg.udp_port[i]))
            .collect(),
        stop: stop.clone(),
    };

    let build = TxVideoBuild {
        name: format!("{}-build", cfg.name),
        pool,
        handler,
        clock: clock.clone(),
        ptp,
        pacing,
        pg,
        ssrc: 0x2110 ^ ((cfg.udp_port[0] as u32) << 8) ^ cfg.payload_type as u32,
        geometry,
        templates,
        inflight: (0..ports.len()).map(|_| Vec::new()).collect(),
        producers,
        st22,
        payload_type: cfg.payload_type,
        packing: cfg.packing,
        width: cfg.width,
        height: field_height,
        linesize: cfg.linesize,
        flags: cfg.flags,
        slice_mode: cfg.slice_mode,
        bulk: if cfg.flags & FLAG_DISABLE_BULK != 0 {
            1
        } else {
            BULK
        },
        advice_us,
        state: FrameState::Wait,
        frame: None,
        pkt_idx: 0,
        seq_id: 0,
        ipv4_id: 0,
        lines_ready: 0,
        done_queue: VecDeque::new(),
        busy_since: None,
        stop: stop.clone(),
        reporter: reporter.clone(),
    };

    let send = VideoTransmitter::new(
        format!("{}-send", cfg.name),
        sends,
        clock,
        reporter,
        stop.clone(),
    );

    let quota_mbps = geometry.bandwidth_mbps(cfg.fps) * cfg.num_ports as u32;

    log::info!(
        "{}: {}x{} total pkts {} pacing {}",
        cfg.name,
        cfg.width,
        cfg.height,
        geometry.total_pkts,
        ways[0].name(),
    );

    Ok(TxVideoParts {
        handle,
        build,
        send,
        quota_mbps,
        stop,
    })
}
