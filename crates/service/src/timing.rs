//! On-line timing conformance measurement for receive sessions.
//!
//! For every packet of every completed frame the parser derives the
//! instantaneous receiver buffer occupancy (VRX), the sender cluster
//! size (Cinst), the frame presentation time (FPT, first packet arrival
//! relative to the epoch boundary), the RTP timestamp offset and delta,
//! and the inter packet time, then judges the rolling window against the
//! narrow and wide ST 2110-21 pass bands.

use super::fmt::{
    Fps, NS_PER_S, PKT_L2L4_OVERHEAD, PKT_MAX_ETHER_BYTES, VideoFormat, raster_timing,
};

/// Frames per evaluation window.
pub const REPORT_INTERVAL: u32 = 300;

const CINST_DRAIN_FACTOR: f64 = 2.0;
const RTP_WRAP: u64 = 0x1_0000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    PassNarrow,
    PassWide,
    /// Outside the wide band, but explainable by software receive
    /// timestamps.
    PassWideWa,
    Pass,
    Fail,
}

impl Verdict {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PassNarrow => "PASSED NARROW",
            Self::PassWide => "PASSED WIDE",
            Self::PassWideWa => "PASSED WIDE WA",
            Self::Pass => "PASSED",
            Self::Fail => "FAILED",
        }
    }
}

/// Min/max/average of one measured quantity over the window.
#[derive(Debug, Clone, Copy)]
pub struct Metric {
    pub min: i64,
    pub max: i64,
    pub avg: f32,
    pub cnt: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Rolling {
    min: i64,
    max: i64,
    sum: i64,
    cnt: u32,
}

impl Rolling {
    fn clear(&mut self) {
        self.min = i64::MAX;
        self.max = i64::MIN;
        self.sum = 0;
        self.cnt = 0;
    }

    fn push(&mut self, value: i64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.cnt += 1;
    }

    fn metric(&self) -> Metric {
        Metric {
            min: self.min,
            max: self.max,
            avg: if self.cnt > 0 {
                self.sum as f32 / self.cnt as f32
            } else {
                -1.0
            },
            cnt: self.cnt,
        }
    }
}

/// One evaluation window's worth of measurements and their verdicts.
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub cinst: Metric,
    pub cinst_verdict: Verdict,
    pub vrx: Metric,
    pub vrx_verdict: Verdict,
    pub fpt: Metric,
    pub fpt_verdict: Verdict,
    pub latency: Metric,
    pub rtp_offset: Metric,
    pub rtp_offset_verdict: Verdict,
    pub rtp_ts_delta: Metric,
    pub rtp_ts_delta_verdict: Verdict,
    pub inter_pkt_time: Metric,
}

/// The timing parser of one receive session.
pub struct TimingParser {
    // pass band constants
    frame_time: f64,
    frame_time_sampling: f64,
    trs: f64,
    tr_offset: f64,
    c_max_narrow: i64,
    c_max_wide: i64,
    vrx_full_narrow: i64,
    vrx_full_wide: i64,
    rtp_offset_max: i64,

    // per frame cursors
    cur_epochs: u64,
    vrx_prev: i64,
    vrx_drained_prev: i64,
    cinst_initial_time: u64,
    prev_rtp_ts: Option<u32>,
    prev_pkt_time: Option<u64>,
    frame_idx: u32,

    cinst: Rolling,
    vrx: Rolling,
    fpt: Rolling,
    latency: Rolling,
    rtp_offset: Rolling,
    rtp_ts_delta: Rolling,
    inter_pkt_time: Rolling,
}

impl TimingParser {
    pub fn new(width: u32, height: u32, fps: Fps, fmt: VideoFormat, interlaced: bool) -> Self {
        let tm = fps.timing();
        let frame_time = NS_PER_S as f64 * tm.den as f64 / tm.mul as f64;
        let frame_time_s = tm.den as f64 / tm.mul as f64;
        let raster = raster_timing(height, interlaced);

        // the reference model packs one line per packet group, as the
        // conformance tables do
        let pg = fmt.pixel_group();
        let bytes_in_pkt = PKT_MAX_ETHER_BYTES
            - PKT_L2L4_OVERHEAD
            - codec::rtp::RtpHeader::SIZE
            - codec::rfc4175::PayloadHeader::SIZE;
        let bytes_in_line = width as usize * pg.size as usize / pg.coverage as usize;
        let pkts_in_line = (bytes_in_line / bytes_in_pkt) + 1;
        let total_pkts = (height as usize * pkts_in_line) as f64;
        let ractive = height as f64 / raster.total_lines as f64;

        let trs = frame_time / (pkts_in_line as f64 * raster.total_lines as f64);
        let tr_offset = frame_time * raster.tro_lines as f64 / raster.total_lines as f64;

        let mut parser = Self {
            frame_time,
            frame_time_sampling: tm.sampling_clock_rate as f64 * tm.den as f64 / tm.mul as f64,
            trs,
            tr_offset,
            c_max_narrow: 4i64.max((total_pkts / (43_200.0 * ractive * frame_time_s)) as i64),
            c_max_wide: 16i64.max((total_pkts / (21_600.0 * frame_time_s)) as i64),
            vrx_full_narrow: 8i64.max((total_pkts / (27_000.0 * frame_time_s)) as i64),
            vrx_full_wide: 720i64.max((total_pkts / (300.0 * frame_time_s)) as i64),
            rtp_offset_max: ((tr_offset / NS_PER_S as f64) * tm.sampling_clock_rate as f64).ceil()
                as i64
                + 1,
            cur_epochs: 0,
            vrx_prev: 0,
            vrx_drained_prev: 0,
            cinst_initial_time: 0,
            prev_rtp_ts: None,
            prev_pkt_time: None,
            frame_idx: 0,
            cinst: Rolling::default(),
            vrx: Rolling::default(),
            fpt: Rolling::default(),
            latency: Rolling::default(),
            rtp_offset: Rolling::default(),
            rtp_ts_delta: Rolling::default(),
            inter_pkt_time: Rolling::default(),
        };
        parser.clear();
        parser
    }

    fn clear(&mut self) {
        self.cinst.clear();
        self.vrx.clear();
        self.fpt.clear();
        self.latency.clear();
        self.rtp_offset.clear();
        self.rtp_ts_delta.clear();
        self.inter_pkt_time.clear();
    }

    /// Derived constants, exposed for the session's periodic dump.
    pub fn pass_bands(&self) -> (i64, i64, i64, i64) {
        (
            self.c_max_narrow,
            self.c_max_wide,
            self.vrx_full_narrow,
            self.vrx_full_wide,
        )
    }

    fn on_frame(&mut self, rtp_ts: u32, pkt_time: u64) -> Option<Report> {
        let report = {
            self.frame_idx += 1;
            if self.frame_idx % REPORT_INTERVAL == 0 {
                let report = self.report();
                self.clear();
                Some(report)
            } else {
                None
            }
        };

        let epochs = (pkt_time as f64 / self.frame_time) as u64;
        let epoch_time = epochs as f64 * self.frame_time;
        let fpt = pkt_time as f64 - epoch_time;

        self.cur_epochs = epochs;
        self.vrx_prev = 0;
        self.vrx_drained_prev = 0;
        self.cinst_initial_time = pkt_time;

        self.fpt.push(fpt as i64);

        // latency against the sender's media clock instant
        let ticks = (epoch_time * self.frame_time_sampling / self.frame_time).round() as u64;
        let delta_ticks = (ticks % RTP_WRAP) as i64 - rtp_ts as i64;
        let tr = (epochs as f64 * self.frame_time * self.frame_time_sampling
            - delta_ticks as f64)
            / self.frame_time_sampling;
        self.latency.push((pkt_time as f64 - tr) as i64);

        // rtp offset from the epoch's nominal timestamp
        let nominal = ((epochs as f64 * self.frame_time_sampling) as u64 % RTP_WRAP) as u32;
        self.rtp_offset
            .push(rtp_ts.wrapping_sub(nominal) as i32 as i64);

        if let Some(prev) = self.prev_rtp_ts {
            self.rtp_ts_delta.push(rtp_ts.wrapping_sub(prev) as i64);
        }
        self.prev_rtp_ts = Some(rtp_ts);
        self.prev_pkt_time = None;

        report
    }

    /// Feed one accepted packet; returns a report at window boundaries.
    ///
    /// `pkt_time` is the hardware receive timestamp in PTP nanoseconds,
    /// `pkt_idx` the packet's index within its frame.
    pub fn on_packet(&mut self, rtp_ts: u32, pkt_time: u64, pkt_idx: u32) -> Option<Report> {
        let report = if pkt_idx == 0 {
            self.on_frame(rtp_ts, pkt_time)
        } else {
            None
        };

        // VRX: arrivals minus the ideal drain since the epoch
        let tvd = self.cur_epochs as f64 * self.frame_time + self.tr_offset;
        let packet_delta = pkt_time as f64 - tvd;
        let drained = ((packet_delta + self.trs) / self.trs) as i64;
        let vrx = self.vrx_prev + 1 - (drained - self.vrx_drained_prev);

        self.vrx.push(vrx);
        self.vrx_prev = vrx;
        self.vrx_drained_prev = drained;

        // Cinst: how far the sender ran ahead of the drain model
        let expected =
            (((pkt_time - self.cinst_initial_time) as f64 / self.trs) * CINST_DRAIN_FACTOR) as i64;
        let cinst = 0i64.max(pkt_idx as i64 - expected);
        self.cinst.push(cinst);

        if let Some(prev) = self.prev_pkt_time {
            self.inter_pkt_time.push(pkt_time as i64 - prev as i64);
        }
        self.prev_pkt_time = Some(pkt_time);

        report
    }

    fn report(&self) -> Report {
        let cinst = self.cinst.metric();
        let cinst_verdict = if cinst.max <= self.c_max_narrow {
            Verdict::PassNarrow
        } else if cinst.max <= self.c_max_wide {
            Verdict::PassWide
        } else if cinst.max <= self.c_max_wide * 16 {
            Verdict::PassWideWa
        } else {
            Verdict::Fail
        };

        let vrx = self.vrx.metric();
        let vrx_verdict = if vrx.min > 0 && vrx.max <= self.vrx_full_narrow {
            Verdict::PassNarrow
        } else if vrx.min > 0 && vrx.max <= self.vrx_full_wide {
            Verdict::PassWide
        } else if vrx.max <= self.vrx_full_wide {
            Verdict::PassWideWa
        } else {
            Verdict::Fail
        };

        let fpt = self.fpt.metric();
        let fpt_verdict = if fpt.max as f64 <= self.tr_offset {
            Verdict::Pass
        } else if fpt.max as f64 <= self.tr_offset * 2.0 {
            Verdict::PassWideWa
        } else {
            Verdict::Fail
        };

        let rtp_offset = self.rtp_offset.metric();
        let rtp_offset_verdict = if rtp_offset.min < 0 || rtp_offset.max > self.rtp_offset_max {
            Verdict::Fail
        } else {
            Verdict::Pass
        };

        let rtp_ts_delta = self.rtp_ts_delta.metric();
        let nominal = self.frame_time_sampling as i64;
        let rtp_ts_delta_verdict =
            if rtp_ts_delta.cnt > 0 && (rtp_ts_delta.min < nominal || rtp_ts_delta.max > nominal + 1) {
                Verdict::Fail
            } else {
                Verdict::Pass
            };

        Report {
            cinst,
            cinst_verdict,
            vrx,
            vrx_verdict,
            fpt,
            fpt_verdict,
            latency: self.latency.metric(),
            rtp_offset,
            rtp_offset_verdict,
            rtp_ts_delta,
            rtp_ts_delta_verdict,
            inter_pkt_time: self.inter_pkt_time.metric(),
        }
    }

    /// Geometry the parser assumes, for callers that want to feed it a
    /// synthetic stream.
    pub fn trs(&self) -> f64 {
        self.trs
    }

    pub fn tr_offset(&self) -> f64 {
        self.tr_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> TimingParser {
        TimingParser::new(1920, 1080, Fps::P50, VideoFormat::Yuv422_10bit, false)
    }

    /// Feed a perfectly paced stream and expect narrow verdicts.
    #[test]
    fn ideal_stream_passes_narrow() {
        let mut parser = parser();
        let trs = parser.trs();
        let tr_offset = parser.tr_offset();
        let frame_time = 20_000_000u64;
        let pkts = 500u32;

        let mut report = None;
        for frame in 0..REPORT_INTERVAL + 1 {
            let epoch = 1000 + frame as u64;
            let rtp_ts = ((epoch as u128 * 1800) % (1 << 32)) as u32;
            let base = epoch * frame_time + tr_offset as u64;

            for pkt in 0..pkts {
                let at = base + (pkt as f64 * trs) as u64;
                if let Some(r) = parser.on_packet(rtp_ts, at, pkt) {
                    report = Some(r);
                }
            }
        }

        let report = report.expect("a window boundary within 301 frames");
        assert_eq!(report.cinst_verdict, Verdict::PassNarrow);
        assert_eq!(report.vrx_verdict, Verdict::PassNarrow);
        assert_eq!(report.fpt_verdict, Verdict::Pass);
        assert_eq!(report.rtp_offset_verdict, Verdict::Pass);
        assert_eq!(report.rtp_ts_delta_verdict, Verdict::Pass);

        // inter packet time tracks trs
        assert!((report.inter_pkt_time.avg as f64 - trs).abs() < 2.0);
    }

    /// A sender bursting the whole frame at once blows the Cinst band.
    #[test]
    fn burst_stream_fails() {
        let mut parser = parser();
        let frame_time = 20_000_000u64;

        let mut report = None;
        for frame in 0..REPORT_INTERVAL {
            let epoch = 1000 + frame as u64;
            let rtp_ts = ((epoch as u128 * 1800) % (1 << 32)) as u32;
            let base = epoch * frame_time;

            for pkt in 0..2000u32 {
                // every packet lands within a microsecond
                if let Some(r) = parser.on_packet(rtp_ts, base + (pkt / 100) as u64, pkt) {
                    report = Some(r);
                }
            }
        }

        let report = report.expect("window boundary");
        assert_eq!(report.cinst_verdict, Verdict::Fail);
        assert!(report.vrx_verdict == Verdict::Fail || report.vrx.max > 720);
    }

    /// The RTP timestamp stepping of 59.94 Hz alternates 1501/1502 and
    /// still passes the delta band.
    #[test]
    fn fractional_rate_ts_delta() {
        let mut parser =
            TimingParser::new(1920, 1080, Fps::P59_94, VideoFormat::Yuv422_10bit, false);
        let frame_time = parser.frame_time;
        let sampling = parser.frame_time_sampling;
        let tr_offset = parser.tr_offset();

        let mut report = None;
        for frame in 0..REPORT_INTERVAL + 1 {
            let epoch = 5000 + frame as u64;
            let rtp_ts = ((epoch as f64 * sampling) as u64 % RTP_WRAP) as u32;
            let at = (epoch as f64 * frame_time + tr_offset) as u64;
            if let Some(r) = parser.on_packet(rtp_ts, at, 0) {
                report = Some(r);
            }
        }

        let report = report.expect("window boundary");
        assert_eq!(report.rtp_ts_delta_verdict, Verdict::Pass);
        assert!(report.rtp_ts_delta.min >= 1501);
        assert!(report.rtp_ts_delta.max <= 1502);
    }
}
