//! Seamless 1+1 receive merging (ST 2022-7 style).
//!
//! Two single port receive sessions listen to the same essence on
//! independent networks. Frames rendezvous by RTP timestamp: the first
//! port to complete a timestamp wins, the other port's copy is dropped
//! when it lands. An incomplete frame is held back while the other port
//! may still complete the same timestamp; once a later timestamp shows
//! up the merge gives up on it, handing it over only when the
//! application asked for incomplete frames.

use std::sync::{Arc, Mutex as StdMutex};

use parking_lot::Mutex;
use service::{
    Error, FLAG_RECEIVE_INCOMPLETE_FRAME, RxVideoHandler, RxVideoMeta, frame::RxFrame,
};

use crate::rx::video::RxVideoConfig;

struct Pending {
    frame: RxFrame,
    meta: RxVideoMeta,
}

struct Rendezvous {
    /// The newest timestamp handed to the application.
    last_delivered: Option<u32>,
    pending_incomplete: Option<Pending>,
}

/// Is `ts` newer than the delivery horizon, in wrap safe order?
fn newer(ts: u32, than: Option<u32>) -> bool {
    match than {
        None => true,
        Some(last) => ts.wrapping_sub(last) as i32 > 0,
    }
}

/// The shared merge state plus the downstream handler.
struct Merge {
    state: Mutex<Rendezvous>,
    inner: StdMutex<Box<dyn RxVideoHandler>>,
    deliver_incomplete: bool,
}

impl Merge {
    fn deliver(&self, frame: RxFrame, meta: &RxVideoMeta) {
        if let Ok(mut inner) = self.inner.lock() {
            let _ = inner.frame_ready(frame, meta);
        }
    }
}

/// The per port handler wired into each underlying session.
pub struct MergeHandler {
    merge: Arc<Merge>,
    port: usize,
}

impl RxVideoHandler for MergeHandler {
    fn frame_ready(&mut self, frame: RxFrame, meta: &RxVideoMeta) -> Result<(), Error> {
        let mut state = self.merge.state.lock();

        // per port counters land in the merged meta at this port's slot
        let mut meta = *meta;
        let recv = meta.pkts_recv[0];
        meta.pkts_recv = [0; 2];
        meta.pkts_recv[self.port] = recv;
        let ts = meta.rtp_timestamp;

        // anything at or behind the horizon is the other port's late
        // copy of a frame the application already has
        if !newer(ts, state.last_delivered) {
            return Ok(());
        }

        if meta.status.is_complete() {
            // a held incomplete for an older timestamp had its interval;
            // the same timestamp is simply superseded
            if let Some(pending) = state.pending_incomplete.take() {
                let pending_ts = pending.meta.rtp_timestamp;
                if pending_ts != ts && newer(ts, Some(pending_ts)) {
                    if self.merge.deliver_incomplete && newer(pending_ts, state.last_delivered) {
                        state.last_delivered = Some(pending_ts);
                        self.merge.deliver(pending.frame, &pending.meta);
                    }
                } else if pending_ts != ts {
                    // the pending frame is newer; keep holding it
                    state.pending_incomplete = Some(pending);
                }
            }

            state.last_delivered = Some(ts);
            drop(state);
            self.merge.deliver(frame, &meta);
            return Ok(());
        }

        // incomplete: hold it while the other port may still complete
        // this timestamp; the first copy of a timestamp keeps the slot
        let held_ts = state
            .pending_incomplete
            .as_ref()
            .map(|p| p.meta.rtp_timestamp);
        match held_ts {
            None => state.pending_incomplete = Some(Pending { frame, meta }),
            Some(held) if held == ts || !newer(ts, Some(held)) => {}
            Some(held) => {
                // the held frame's interval has passed
                let old = state.pending_incomplete.replace(Pending { frame, meta });
                if let Some(old) = old {
                    if self.merge.deliver_incomplete && newer(held, state.last_delivered) {
                        state.last_delivered = Some(held);
                        self.merge.deliver(old.frame, &old.meta);
                    }
                }
            }
        }

        Ok(())
    }
}

/// Split a dual port receive config into the two single port sessions
/// plus the pair of merge handlers that rendezvous their frames.
///
/// Incomplete frame delivery is forced on the underlying sessions; the
/// merge layer is what decides whether an incomplete copy ever reaches
/// the application (only when the caller's own flags asked for it).
pub(crate) fn split(
    cfg: &RxVideoConfig,
    handler: Box<dyn RxVideoHandler>,
) -> Result<(Vec<RxVideoConfig>, Vec<Box<dyn RxVideoHandler>>), Error> {
    if cfg.num_ports != 2 {
        return Err(Error::InvalidArgument);
    }

    let merge = Arc::new(Merge {
        state: Mutex::new(Rendezvous {
            last_delivered: None,
            pending_incomplete: None,
        }),
        inner: StdMutex::new(handler),
        deliver_incomplete: cfg.flags & FLAG_RECEIVE_INCOMPLETE_FRAME != 0,
    });

    let mut configs = Vec::with_capacity(2);
    let mut handlers: Vec<Box<dyn RxVideoHandler>> = Vec::with_capacity(2);

    for port in 0..2 {
        let mut sub = cfg.clone();
        sub.name = format!("{}-{}", cfg.name, if port == 0 { "p" } else { "r" });
        sub.num_ports = 1;
        sub.ip = [cfg.ip[port], cfg.ip[0]];
        sub.udp_port = [cfg.udp_port[port]; 2];
        sub.src_ip = [cfg.src_ip[port], None];
        // the merge layer needs to see partial frames to arbitrate
        sub.flags |= FLAG_RECEIVE_INCOMPLETE_FRAME;

        configs.push(sub);
        handlers.push(Box::new(MergeHandler {
            merge: merge.clone(),
            port,
        }));
    }

    Ok((configs, handlers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use service::{FrameStatus, frame::RxFramePool};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        complete: Arc<AtomicUsize>,
        incomplete: Arc<AtomicUsize>,
        wins: Arc<Mutex<Vec<usize>>>,
    }

    impl RxVideoHandler for Counting {
        fn frame_ready(&mut self, _frame: RxFrame, meta: &RxVideoMeta) -> Result<(), Error> {
            if meta.status.is_complete() {
                self.complete.fetch_add(1, Ordering::AcqRel);
            } else {
                self.incomplete.fetch_add(1, Ordering::AcqRel);
            }
            self.wins
                .lock()
                .push(if meta.pkts_recv[1] > 0 { 1 } else { 0 });
            Ok(())
        }
    }

    fn frame(pool: &Arc<RxFramePool>) -> RxFrame {
        let buf = pool.get().unwrap();
        pool.deliver(buf)
    }

    fn meta(ts: u32, status: FrameStatus) -> RxVideoMeta {
        RxVideoMeta {
            rtp_timestamp: ts,
            status,
            pkts_recv: [10, 0],
            ..Default::default()
        }
    }

    fn harness(
        flags: service::SessionFlags,
    ) -> (
        Vec<Box<dyn RxVideoHandler>>,
        Arc<AtomicUsize>,
        Arc<AtomicUsize>,
        Arc<Mutex<Vec<usize>>>,
    ) {
        let complete = Arc::new(AtomicUsize::new(0));
        let incomplete = Arc::new(AtomicUsize::new(0));
        let wins = Arc::new(Mutex::new(Vec::new()));

        let (_, handlers) = split(
            &RxVideoConfig {
                num_ports: 2,
                flags,
                ..Default::default()
            },
            Box::new(Counting {
                complete: complete.clone(),
                incomplete: incomplete.clone(),
                wins: wins.clone(),
            }),
        )
        .unwrap();

        (handlers, complete, incomplete, wins)
    }

    #[test]
    fn first_complete_wins_duplicate_dropped() {
        let pool = RxFramePool::new(8, 64).unwrap();
        let (mut handlers, complete, incomplete, wins) = harness(0);
        let mut r = handlers.pop().unwrap();
        let mut p = handlers.pop().unwrap();

        // port P completes ts 1000 first, port R's copy is dropped
        p.frame_ready(frame(&pool), &meta(1000, FrameStatus::Complete))
            .unwrap();
        r.frame_ready(frame(&pool), &meta(1000, FrameStatus::Complete))
            .unwrap();
        assert_eq!(complete.load(Ordering::Acquire), 1);
        assert_eq!(wins.lock()[0], 0);

        // next timestamp: P is lossy, R completes
        p.frame_ready(frame(&pool), &meta(2000, FrameStatus::Incomplete))
            .unwrap();
        r.frame_ready(frame(&pool), &meta(2000, FrameStatus::Complete))
            .unwrap();
        assert_eq!(complete.load(Ordering::Acquire), 2);
        assert_eq!(incomplete.load(Ordering::Acquire), 0);
        assert_eq!(wins.lock()[1], 1);

        // a stale eviction flush from P for a served timestamp is inert
        p.frame_ready(frame(&pool), &meta(1000, FrameStatus::Incomplete))
            .unwrap();
        assert_eq!(incomplete.load(Ordering::Acquire), 0);

        // all frames returned to the pool in the end
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn lone_incomplete_flushes_when_asked() {
        let pool = RxFramePool::new(4, 64).unwrap();
        let (mut handlers, _complete, incomplete, _wins) =
            harness(FLAG_RECEIVE_INCOMPLETE_FRAME);
        let mut p = handlers.remove(0);

        // both ports degraded: the incomplete is held one interval and
        // handed over when the next timestamp shows up
        p.frame_ready(frame(&pool), &meta(1000, FrameStatus::Incomplete))
            .unwrap();
        assert_eq!(incomplete.load(Ordering::Acquire), 0);

        p.frame_ready(frame(&pool), &meta(2000, FrameStatus::Incomplete))
            .unwrap();
        assert_eq!(incomplete.load(Ordering::Acquire), 1);
    }

    #[test]
    fn lone_incomplete_dropped_by_default() {
        let pool = RxFramePool::new(4, 64).unwrap();
        let (mut handlers, _complete, incomplete, _wins) = harness(0);
        let mut p = handlers.remove(0);

        p.frame_ready(frame(&pool), &meta(1000, FrameStatus::Incomplete))
            .unwrap();
        p.frame_ready(frame(&pool), &meta(2000, FrameStatus::Incomplete))
            .unwrap();

        assert_eq!(incomplete.load(Ordering::Acquire), 0);
        // held one, dropped one back to the pool
        assert_eq!(pool.available(), 3);
    }
}
