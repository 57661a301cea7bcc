//! Session statistics.
//!
//! Every session registers a counter block keyed by its identity;
//! tasklets hold a cheap reporter handle and fire increments at it. The
//! transport's status loop reads the table every dump period and logs
//! rates and drop counts.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The kind half of a session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    TxVideo,
    RxVideo,
    TxAudio,
    RxAudio,
    TxAncillary,
    RxAncillary,
}

impl SessionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TxVideo => "tx_video",
            Self::RxVideo => "rx_video",
            Self::TxAudio => "tx_audio",
            Self::RxAudio => "rx_audio",
            Self::TxAncillary => "tx_anc",
            Self::RxAncillary => "rx_anc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub kind: SessionKind,
    pub idx: usize,
}

/// The type of information passed to a reporter.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    PktsBuilt(usize),
    PktsBurst(usize),
    PktsReceived(usize),
    PktsDropped(usize),
    PktsRedundantDropped(usize),
    PktsOffsetDropped(usize),
    PktsWrongPayloadType(usize),
    PadsSent(usize),
    FramesSent(usize),
    FramesReceived(usize),
    FramesDropped(usize),
    FramesIncomplete(usize),
    SlotEvictions(usize),
    EpochDrops(usize),
    EpochMismatch(usize),
    WarmupMismatch(usize),
    UserBusy(usize),
    RingFull(usize),
    LinesNotReady(usize),
    ExceedFrameTime(usize),
    UserTimestampError(usize),
    PacingDesync(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// One session's counter block.
#[derive(Default)]
pub struct Counts<T> {
    pub pkts_built: T,
    pub pkts_burst: T,
    pub pkts_received: T,
    pub pkts_dropped: T,
    pub pkts_redundant_dropped: T,
    pub pkts_offset_dropped: T,
    pub pkts_wrong_payload_type: T,
    pub pads_sent: T,
    pub frames_sent: T,
    pub frames_received: T,
    pub frames_dropped: T,
    pub frames_incomplete: T,
    pub slot_evictions: T,
    pub epoch_drops: T,
    pub epoch_mismatch: T,
    pub warmup_mismatch: T,
    pub user_busy: T,
    pub ring_full: T,
    pub lines_not_ready: T,
    pub exceed_frame_time: T,
    pub user_timestamp_error: T,
    pub pacing_desync: T,
}

impl<T: Number> Counts<T> {
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::PktsBuilt(v) => self.pkts_built.add(*v),
            Stats::PktsBurst(v) => self.pkts_burst.add(*v),
            Stats::PktsReceived(v) => self.pkts_received.add(*v),
            Stats::PktsDropped(v) => self.pkts_dropped.add(*v),
            Stats::PktsRedundantDropped(v) => self.pkts_redundant_dropped.add(*v),
            Stats::PktsOffsetDropped(v) => self.pkts_offset_dropped.add(*v),
            Stats::PktsWrongPayloadType(v) => self.pkts_wrong_payload_type.add(*v),
            Stats::PadsSent(v) => self.pads_sent.add(*v),
            Stats::FramesSent(v) => self.frames_sent.add(*v),
            Stats::FramesReceived(v) => self.frames_received.add(*v),
            Stats::FramesDropped(v) => self.frames_dropped.add(*v),
            Stats::FramesIncomplete(v) => self.frames_incomplete.add(*v),
            Stats::SlotEvictions(v) => self.slot_evictions.add(*v),
            Stats::EpochDrops(v) => self.epoch_drops.add(*v),
            Stats::EpochMismatch(v) => self.epoch_mismatch.add(*v),
            Stats::WarmupMismatch(v) => self.warmup_mismatch.add(*v),
            Stats::UserBusy(v) => self.user_busy.add(*v),
            Stats::RingFull(v) => self.ring_full.add(*v),
            Stats::LinesNotReady(v) => self.lines_not_ready.add(*v),
            Stats::ExceedFrameTime(v) => self.exceed_frame_time.add(*v),
            Stats::UserTimestampError(v) => self.user_timestamp_error.add(*v),
            Stats::PacingDesync(v) => self.pacing_desync.add(*v),
        }
    }
}

/// The process wide statistics table.
#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<SessionId, Arc<Counts<Count>>>>>);

impl Statistics {
    /// Add a session to the watch list and get its reporter.
    pub fn register(&self, id: SessionId) -> StatisticsReporter {
        let counts = Arc::new(Counts::default());
        self.0.write().insert(id, counts.clone());
        StatisticsReporter { counts }
    }

    pub fn unregister(&self, id: &SessionId) {
        self.0.write().remove(id);
    }

    /// Read a snapshot of one session's counters.
    pub fn get(&self, id: &SessionId) -> Option<Counts<usize>> {
        self.0.read().get(id).map(|counts| Counts {
            pkts_built: counts.pkts_built.get(),
            pkts_burst: counts.pkts_burst.get(),
            pkts_received: counts.pkts_received.get(),
            pkts_dropped: counts.pkts_dropped.get(),
            pkts_redundant_dropped: counts.pkts_redundant_dropped.get(),
            pkts_offset_dropped: counts.pkts_offset_dropped.get(),
            pkts_wrong_payload_type: counts.pkts_wrong_payload_type.get(),
            pads_sent: counts.pads_sent.get(),
            frames_sent: counts.frames_sent.get(),
            frames_received: counts.frames_received.get(),
            frames_dropped: counts.frames_dropped.get(),
            frames_incomplete: counts.frames_incomplete.get(),
            slot_evictions: counts.slot_evictions.get(),
            epoch_drops: counts.epoch_drops.get(),
            epoch_mismatch: counts.epoch_mismatch.get(),
            warmup_mismatch: counts.warmup_mismatch.get(),
            user_busy: counts.user_busy.get(),
            ring_full: counts.ring_full.get(),
            lines_not_ready: counts.lines_not_ready.get(),
            exceed_frame_time: counts.exceed_frame_time.get(),
            user_timestamp_error: counts.user_timestamp_error.get(),
            pacing_desync: counts.pacing_desync.get(),
        })
    }

    /// Log every session's totals; the status loop calls this each dump
    /// period.
    pub fn dump(&self) {
        for (id, counts) in self.0.read().iter() {
            match id.kind {
                SessionKind::TxVideo | SessionKind::TxAudio | SessionKind::TxAncillary => {
                    log::info!(
                        "{}({}): frames {} pkts {} pads {} epoch drops {} busy {} late {}",
                        id.kind.name(),
                        id.idx,
                        counts.frames_sent.get(),
                        counts.pkts_burst.get(),
                        counts.pads_sent.get(),
                        counts.epoch_drops.get(),
                        counts.user_busy.get(),
                        counts.exceed_frame_time.get(),
                    );
                }
                _ => {
                    log::info!(
                        "{}({}): frames {} ({} incomplete, {} dropped) pkts {} drops {}/{}/{}",
                        id.kind.name(),
                        id.idx,
                        counts.frames_received.get(),
                        counts.frames_incomplete.get(),
                        counts.frames_dropped.get(),
                        counts.pkts_received.get(),
                        counts.pkts_dropped.get(),
                        counts.pkts_redundant_dropped.get(),
                        counts.pkts_offset_dropped.get(),
                    );
                }
            }
        }
    }
}

/// Held by each tasklet; increments go straight to the shared block.
#[derive(Clone)]
pub struct StatisticsReporter {
    counts: Arc<Counts<Count>>,
}

impl StatisticsReporter {
    pub fn send(&self, reports: &[Stats]) {
        for report in reports {
            self.counts.add(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporter_feeds_table() {
        let statistics = Statistics::default();
        let id = SessionId {
            kind: SessionKind::TxVideo,
            idx: 0,
        };

        let reporter = statistics.register(id);
        reporter.send(&[Stats::PktsBuilt(4), Stats::FramesSent(1)]);
        reporter.send(&[Stats::PktsBuilt(4)]);

        let counts = statistics.get(&id).unwrap();
        assert_eq!(counts.pkts_built, 8);
        assert_eq!(counts.frames_sent, 1);
        assert_eq!(counts.pkts_dropped, 0);

        statistics.unregister(&id);
        assert!(statistics.get(&id).is_none());
    }
}
