//! The ST 2110-21 pacing engine.
//!
//! Every outgoing packet is stamped with the TSC at which the transmitter
//! must hand it to the NIC. The anchor is the epoch: the integer number
//! of frame intervals since the PTP epoch. The first packet of a frame
//! leaves `tr_offset` after the epoch boundary, minus the warm up pad
//! packets that push the NIC queue into phase; every further packet
//! follows `trs` later.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use super::{
    Error,
    fmt::{Fps, NS_PER_S, active_ratio, raster_timing},
};

/// How the transmitter spaces packets on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingWay {
    /// Try the NIC rate limiter first, fall back to TSC.
    #[default]
    Auto,
    /// NIC rate limiter plus software pad insertion.
    RateLimit,
    /// Pure software pacing against the TSC.
    Tsc,
    /// The application supplies the pacing via its frame timestamps.
    User,
}

impl PacingWay {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::RateLimit => "ratelimit",
            Self::Tsc => "tsc",
            Self::User => "user",
        }
    }
}

/// Counters produced by one epoch sync, folded into session statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Epochs skipped because the build ran late.
    pub epoch_drops: u64,
    /// The wall clock was already past the TR offset window.
    pub troffset_mismatch: bool,
    /// A user supplied TAI lay in the past.
    pub user_timestamp_error: bool,
}

/// Per session, per port pacing state.
#[derive(Debug, Clone)]
pub struct Pacing {
    /// Frame period in nanoseconds.
    pub frame_time: f64,
    /// Media clock ticks per frame.
    pub frame_time_sampling: f64,
    /// Nominal inter packet gap in nanoseconds.
    pub trs: f64,
    /// Offset from the epoch boundary to the first active picture packet.
    pub tr_offset: f64,
    /// Packets of VRX compensation subtracted from the first packet time.
    pub tr_offset_vrx: u32,
    /// Pad packets emitted ahead of the first payload packet.
    pub warm_pkts: u32,
    pub vrx_narrow: u32,
    pub vrx_wide: u32,
    /// The epoch last dispatched.
    pub cur_epochs: u64,
    /// Media clock timestamp of the frame being built.
    pub rtp_time_stamp: u32,
    /// Payload packets between two rate limiter pads.
    pub pad_interval: f64,
    /// TSC at which the next packet is due.
    pub tsc_time_cursor: f64,
    /// PTP time of the next packet, for instrumentation.
    pub ptp_time_cursor: f64,
}

impl Pacing {
    /// Derive the pacing constants of a session.
    ///
    /// `height` is the full raster height even for interlaced formats;
    /// `total_pkts` covers one transmitted frame (one field when
    /// interlaced). ST 2110-22 sessions force both the VRX allowance and
    /// the warm up to zero.
    pub fn new(height: u32, fps: Fps, interlaced: bool, total_pkts: u32, st22: bool) -> Self {
        let tm = fps.timing();
        let frame_time = NS_PER_S as f64 * tm.den as f64 / tm.mul as f64;
        let frame_time_s = tm.den as f64 / tm.mul as f64;
        let frame_time_sampling =
            tm.sampling_clock_rate as f64 * tm.den as f64 / tm.mul as f64;

        let raster = raster_timing(height, interlaced);
        let tr_offset =
            frame_time * raster.tro_lines as f64 / raster.total_lines as f64 * raster.field_factor as f64;
        let trs = frame_time * active_ratio(height, interlaced) / total_pkts as f64;

        let vrx_narrow = 8u32.max((total_pkts as f64 / (27_000.0 * frame_time_s)) as u32);
        let vrx_wide = 720u32.max((total_pkts as f64 / (300.0 * frame_time_s)) as u32);

        // 80 percent of the TR offset window as warm up, capped
        let mut warm_pkts = ((tr_offset / trs) as u32) * 8 / 10;
        warm_pkts = warm_pkts.min(128);

        // warm pkts widen the window; two packets of NIC burst rounding
        // and two of deviation tolerance narrow it back
        let mut tr_offset_vrx = vrx_narrow + warm_pkts;
        tr_offset_vrx = tr_offset_vrx.saturating_sub(4);

        if height <= 576 && !st22 {
            warm_pkts = 8;
            tr_offset_vrx = vrx_narrow;
        }

        let (warm_pkts, tr_offset_vrx, vrx_narrow) = if st22 {
            (0, 0, 0)
        } else {
            (warm_pkts, tr_offset_vrx, vrx_narrow)
        };

        Self {
            frame_time,
            frame_time_sampling,
            trs,
            tr_offset,
            tr_offset_vrx,
            warm_pkts,
            vrx_narrow,
            vrx_wide,
            cur_epochs: 0,
            rtp_time_stamp: 0,
            pad_interval: total_pkts as f64,
            tsc_time_cursor: 0.0,
            ptp_time_cursor: 0.0,
        }
    }

    /// PTP time of the first transmitted packet (warm up included) of an
    /// epoch.
    fn tr_offset_time(&self, epochs: u64) -> f64 {
        epochs as f64 * self.frame_time + self.tr_offset - self.tr_offset_vrx as f64 * self.trs
    }

    /// The 32 bit media clock timestamp of an epoch.
    fn time_stamp(&self, epochs: u64) -> u32 {
        let tr_offset_time = self.tr_offset_time(epochs);
        ((tr_offset_time / self.frame_time) * self.frame_time_sampling) as u64 as u32
    }

    /// Resolve the epoch of the next frame and arm the packet cursor.
    ///
    /// The target epoch is `max(current, last + 1)`; when the wall clock
    /// has already consumed the TR offset window the epoch advances once
    /// more. An application supplied TAI replaces the clock reading.
    pub fn sync(&mut self, ptp_now: u64, tsc_now: u64, required_tai: Option<u64>) -> SyncOutcome {
        let mut outcome = SyncOutcome::default();
        let next_epochs = self.cur_epochs + 1;

        let mut epochs = match required_tai {
            Some(tai) => {
                let epochs = (tai as f64 / self.frame_time) as u64;
                if epochs < (ptp_now as f64 / self.frame_time) as u64 {
                    outcome.user_timestamp_error = true;
                }
                epochs
            }
            None => (ptp_now as f64 / self.frame_time) as u64,
        };

        // the previous frame usually finishes building within its own
        // epoch; move on to the next one
        if epochs == self.cur_epochs || epochs + 1 == self.cur_epochs {
            epochs = next_epochs;
        }

        let mut to_epoch = self.tr_offset_time(epochs) - ptp_now as f64;
        if to_epoch < 0.0 {
            // run out of the tr offset window already, sync to the next
            outcome.troffset_mismatch = true;
            epochs += 1;
            to_epoch = self.tr_offset_time(epochs) - ptp_now as f64;
        }

        if to_epoch < 0.0 {
            to_epoch = 0.0;
        }

        if epochs > next_epochs {
            outcome.epoch_drops = epochs - next_epochs;
        }

        self.cur_epochs = epochs;
        self.rtp_time_stamp = self.time_stamp(epochs);
        self.tsc_time_cursor = tsc_now as f64 + to_epoch;
        self.ptp_time_cursor = self.tr_offset_time(epochs);

        outcome
    }

    /// Advance the cursor by one packet.
    pub fn forward(&mut self) {
        self.tsc_time_cursor += self.trs;
        self.ptp_time_cursor += self.trs;
    }

    /// The TSC deadline of the frame currently being built.
    pub fn frame_deadline(&self, total_pkts: u32) -> f64 {
        self.tsc_time_cursor + self.trs * total_pkts as f64
    }
}

/// The average bandwidth the rate limiter must enforce, in bits per
/// second.
pub fn rate_limit_bps(
    pkt_size: usize,
    total_pkts: u32,
    fps: Fps,
    height: u32,
    interlaced: bool,
) -> u64 {
    let tm = fps.timing();
    let ractive = if interlaced && height <= 576 {
        active_ratio(height, interlaced)
    } else {
        1.0
    };

    (pkt_size as f64 * total_pkts as f64 * 8.0 * tm.mul as f64 / tm.den as f64 / ractive) as u64
}

/// Derive `pad_interval` from a rate limiter training run.
///
/// `samples` holds the measured packets per second of each iteration;
/// the five smallest and largest are trimmed before averaging, as the
/// original training loop does.
pub fn solve_pad_interval(
    samples: &mut [f64],
    fps: Fps,
    total_pkts: u32,
    height: u32,
    interlaced: bool,
) -> Result<f64, Error> {
    const TRIM: usize = 5;

    if samples.len() <= TRIM * 2 {
        return Err(Error::InvalidArgument);
    }

    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let kept = &samples[TRIM..samples.len() - TRIM];
    let pkts_per_sec = kept.iter().sum::<f64>() / kept.len() as f64;

    let tm = fps.timing();
    let mut pkts_per_frame = pkts_per_sec * tm.den as f64 / tm.mul as f64;
    pkts_per_frame *= active_ratio(height, interlaced);

    if pkts_per_frame <= total_pkts as f64 {
        return Err(Error::HardwareError);
    }

    let pad_interval = total_pkts as f64 / (pkts_per_frame - total_pkts as f64);
    if pad_interval < 32.0 {
        return Err(Error::HardwareError);
    }

    Ok(pad_interval)
}

/// Cache of trained pad intervals keyed by (port, target bps), shared by
/// co-located sessions so training runs once per rate.
#[derive(Default, Clone)]
pub struct TrainingCache(Arc<RwLock<AHashMap<(usize, u64), f64>>>);

impl TrainingCache {
    /// # Test
    ///
    /// ```
    /// use st2110_service::pacing::TrainingCache;
    ///
    /// let cache = TrainingCache::default();
    /// assert_eq!(cache.search(0, 2_000_000_000), None);
    ///
    /// cache.add(0, 2_000_000_000, 512.0);
    /// assert_eq!(cache.search(0, 2_000_000_000), Some(512.0));
    /// assert_eq!(cache.search(1, 2_000_000_000), None);
    /// ```
    pub fn search(&self, port: usize, bps: u64) -> Option<f64> {
        self.0.read().get(&(port, bps)).copied()
    }

    pub fn add(&self, port: usize, bps: u64, pad_interval: f64) {
        self.0.write().insert((port, bps), pad_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacing_1080p50() -> Pacing {
        // 4320 single line packets
        Pacing::new(1080, Fps::P50, false, 4320, false)
    }

    #[test]
    fn tr_offset_table() {
        let p = pacing_1080p50();
        assert!((p.frame_time - 20_000_000.0).abs() < 1e-6);
        assert!((p.tr_offset - 20_000_000.0 * 43.0 / 1125.0).abs() < 1e-3);

        let hd720 = Pacing::new(720, Fps::P60, false, 3000, false);
        let ft = 1e9 / 60.0;
        assert!((hd720.tr_offset - ft * 28.0 / 750.0).abs() < 1e-3);

        let ntsc = Pacing::new(480, Fps::P29_97, true, 1000, false);
        let ft = 1e9 * 1001.0 / 30_000.0;
        assert!((ntsc.tr_offset - ft * 20.0 / 525.0 * 2.0).abs() < 1e-3);

        let pal = Pacing::new(576, Fps::P25, true, 1000, false);
        assert!((pal.tr_offset - 40_000_000.0 * 26.0 / 625.0 * 2.0).abs() < 1e-3);

        let fhd_i = Pacing::new(1080, Fps::P29_97, true, 2000, false);
        let ft = 1e9 * 1001.0 / 30_000.0;
        assert!((fhd_i.tr_offset - ft * 22.0 / 1125.0 * 2.0).abs() < 1e-3);
    }

    #[test]
    fn vrx_window() {
        let p = pacing_1080p50();
        // 4320 pkts at 20ms: narrow = max(8, 4320 / (27000 * 0.02)) = 8
        assert_eq!(p.vrx_narrow, 8);
        assert_eq!(p.vrx_wide, 720);
        assert!(p.warm_pkts > 0 && p.warm_pkts <= 128);
        assert_eq!(p.tr_offset_vrx, p.vrx_narrow + p.warm_pkts - 4);
    }

    #[test]
    fn st22_forces_zero_warmup() {
        let p = Pacing::new(1080, Fps::P50, false, 4688, true);
        assert_eq!(p.warm_pkts, 0);
        assert_eq!(p.vrx_narrow, 0);
        assert_eq!(p.tr_offset_vrx, 0);
    }

    #[test]
    fn sync_monotonic_epochs() {
        let mut p = pacing_1080p50();
        let tsc = 5_000_000_000u64;

        // start of epoch 100
        let out = p.sync(100 * 20_000_000, tsc, None);
        assert_eq!(out.epoch_drops, 0);
        let first_epoch = p.cur_epochs;
        assert!(first_epoch >= 100);

        // sync again within the same epoch moves to the next one
        p.sync(100 * 20_000_000 + 1000, tsc, None);
        assert_eq!(p.cur_epochs, first_epoch + 1);

        // packet cursor advances by trs per packet
        let t0 = p.tsc_time_cursor;
        p.forward();
        p.forward();
        assert!((p.tsc_time_cursor - t0 - 2.0 * p.trs).abs() < 1e-6);
    }

    #[test]
    fn sync_drops_epochs_when_late() {
        let mut p = pacing_1080p50();
        p.sync(100 * 20_000_000, 0, None);
        let cur = p.cur_epochs;

        // jump five frames ahead
        let out = p.sync((cur + 5) * 20_000_000, 0, None);
        assert!(out.epoch_drops >= 3);
        assert!(p.cur_epochs > cur + 1);
    }

    #[test]
    fn sync_user_tai() {
        let mut p = pacing_1080p50();

        // a user TAI in the future lands on its epoch
        let out = p.sync(100 * 20_000_000, 0, Some(200 * 20_000_000 + 10));
        assert!(!out.user_timestamp_error);
        assert_eq!(p.cur_epochs, 200);

        // one in the past is flagged
        let out = p.sync(300 * 20_000_000, 0, Some(250 * 20_000_000));
        assert!(out.user_timestamp_error);
    }

    #[test]
    fn rtp_timestamp_wraps() {
        let mut p = pacing_1080p50();
        // an epoch far enough out that epoch * sampling overflows 32 bit
        let epoch = (u32::MAX as u64 / 1800) + 10;
        p.sync(epoch * 20_000_000, 0, None);

        // a small positive lead over (epoch * 1800) mod 2^32, from the
        // vrx window ahead of the epoch boundary
        let expect = (p.cur_epochs as u128 * 1800) % (1u128 << 32);
        let got = p.rtp_time_stamp as i64;
        let delta = (got - expect as i64).rem_euclid(1 << 32);
        assert!(delta <= 32, "delta {delta}");
    }

    #[test]
    fn pad_interval_training() {
        // a NIC delivering one percent above nominal: pad every ~100 pkts
        let total = 4320u32;
        let nominal = total as f64 * 50.0 / active_ratio(1080, false);
        let mut samples: Vec<f64> = (0..30).map(|i| nominal * 1.01 + i as f64).collect();

        let pad = solve_pad_interval(&mut samples, Fps::P50, total, 1080, false).unwrap();
        assert!(pad > 90.0 && pad < 110.0, "pad {pad}");
    }

    #[test]
    fn pad_interval_rejects_slow_nic() {
        let total = 4320u32;
        let nominal = total as f64 * 50.0 / active_ratio(1080, false);
        let mut samples: Vec<f64> = (0..30).map(|_| nominal * 0.9).collect();

        assert_eq!(
            solve_pad_interval(&mut samples, Fps::P50, total, 1080, false),
            Err(Error::HardwareError)
        );
    }
}
