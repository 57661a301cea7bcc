//! The video send tasklet.
//!
//! Drains a session's per port ring into the NIC queue under the pacing
//! contract. Two strategies: the rate limiter path trusts the NIC for
//! average rate and inserts pad packets to consume the session's exact
//! bandwidth, with a warm up burst phasing the queue at every frame
//! start; the TSC path holds each packet until its own deadline.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::BytesMut;
use service::{fmt::NS_PER_S, pacing::PacingWay};

use crate::{
    net::{Clock, PAD_PKT_IDX, Packet, PortDevice},
    sched::{Poll, Tasklet},
    statistics::{Stats, StatisticsReporter},
};

/// One port's send state, built by the session.
pub(crate) struct PortSend {
    pub dev: Arc<dyn PortDevice>,
    pub queue: usize,
    pub consumer: rtrb::Consumer<Packet>,
    pub way: PacingWay,
    pub trs: f64,
    pub warm_pkts: u32,
    pub pad_interval: f64,
    /// The prebuilt pad frame, cloned per insertion.
    pub pad: BytesMut,
    pub bulk: usize,
}

struct PortState {
    send: PortSend,
    target_tsc: u64,
    inflight: VecDeque<Packet>,
    pad_inflight: u32,
}

pub struct VideoTransmitter {
    name: String,
    ports: Vec<PortState>,
    clock: Arc<dyn Clock>,
    reporter: StatisticsReporter,
    stop: Arc<AtomicBool>,
}

impl VideoTransmitter {
    pub(crate) fn new(
        name: String,
        ports: Vec<PortSend>,
        clock: Arc<dyn Clock>,
        reporter: StatisticsReporter,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            ports: ports
                .into_iter()
                .map(|send| PortState {
                    send,
                    target_tsc: 0,
                    inflight: VecDeque::new(),
                    pad_inflight: 0,
                })
                .collect(),
            clock,
            reporter,
            stop,
        }
    }

    fn pad_packet(send: &PortSend) -> Packet {
        let mut pkt = Packet::new(send.pad.clone());
        pkt.pkt_idx = PAD_PKT_IDX;
        pkt
    }

    /// Push the NIC queue into phase: emit the warm up pads, minus
    /// however many packet slots the clock already consumed.
    fn warm_up(port: &mut PortState, now: u64, reporter: &StatisticsReporter) {
        let late_pkts = (now.saturating_sub(port.target_tsc) as f64 / port.send.trs) as u32;

        let Some(warm) = port.send.warm_pkts.checked_sub(late_pkts) else {
            reporter.send(&[Stats::WarmupMismatch(1)]);
            return;
        };

        let mut pads: VecDeque<Packet> =
            (0..warm).map(|_| Self::pad_packet(&port.send)).collect();
        let tx = port.send.dev.tx_burst(port.send.queue, &mut pads);
        port.pad_inflight += pads.len() as u32;
        reporter.send(&[Stats::PadsSent(tx)]);
    }

    fn rl_round(port: &mut PortState, clock: &dyn Clock, reporter: &StatisticsReporter) -> Poll {
        // pending on the first packet of a frame
        if port.target_tsc != 0 {
            let now = clock.now_ns();
            if now < port.target_tsc {
                let delta = port.target_tsc - now;
                if delta < NS_PER_S {
                    return Poll::AllDone;
                }
                reporter.send(&[Stats::PacingDesync(1)]);
            }
            Self::warm_up(port, now, reporter);
            port.target_tsc = 0;
        }

        // leftover pads from a short warm up burst
        if port.pad_inflight > 0 {
            let mut pads = VecDeque::new();
            pads.push_back(Self::pad_packet(&port.send));
            let tx = port.send.dev.tx_burst(port.send.queue, &mut pads);
            port.pad_inflight -= tx as u32;
            reporter.send(&[Stats::PadsSent(tx)]);
            return Poll::HasPending;
        }

        // packets the NIC rejected last round
        if !port.inflight.is_empty() {
            let tx = port.send.dev.tx_burst(port.send.queue, &mut port.inflight);
            reporter.send(&[Stats::PktsBurst(tx)]);
            return Poll::HasPending;
        }

        // dequeue a bulk, stopping at a frame boundary
        let mut batch: VecDeque<Packet> = VecDeque::with_capacity(port.send.bulk);
        let mut first_idx = None;
        while batch.len() < port.send.bulk {
            let Ok(peeked) = port.send.consumer.peek() else {
                break;
            };

            if peeked.pkt_idx == 0 && !batch.is_empty() {
                // next frame starts here; flush what we have first
                break;
            }

            if peeked.pkt_idx == 0 {
                let target = peeked.tx_tsc;
                let now = clock.now_ns();
                if now < target {
                    let delta = target - now;
                    if delta < NS_PER_S {
                        port.target_tsc = target;
                        return Poll::AllDone;
                    }
                    reporter.send(&[Stats::PacingDesync(1)]);
                }

                port.target_tsc = target;
                Self::warm_up(port, now.max(target), reporter);
                port.target_tsc = 0;
            }

            let Ok(pkt) = port.send.consumer.pop() else {
                break;
            };
            first_idx.get_or_insert(pkt.pkt_idx);
            batch.push_back(pkt);
        }

        if batch.is_empty() {
            return Poll::AllDone;
        }

        let wanted = batch.len();
        let tx = port.send.dev.tx_burst(port.send.queue, &mut batch);
        reporter.send(&[Stats::PktsBurst(tx)]);
        if tx < wanted {
            port.inflight = batch;
        }

        // pad insertion keeps the rate limiter bucket fed exactly
        if let Some(first_idx) = first_idx {
            if ((first_idx + 1) as f64) % port.send.pad_interval < port.send.bulk as f64 {
                let mut pads = VecDeque::new();
                pads.push_back(Self::pad_packet(&port.send));
                let tx = port.send.dev.tx_burst(port.send.queue, &mut pads);
                if tx < 1 {
                    port.pad_inflight += 1;
                } else {
                    reporter.send(&[Stats::PadsSent(1)]);
                }
            }
        }

        Poll::HasPending
    }

    fn tsc_round(port: &mut PortState, clock: &dyn Clock, reporter: &StatisticsReporter) -> Poll {
        if port.target_tsc != 0 {
            let now = clock.now_ns();
            if now < port.target_tsc {
                let delta = port.target_tsc - now;
                if delta < NS_PER_S {
                    return Poll::AllDone;
                }
                reporter.send(&[Stats::PacingDesync(1)]);
            }
            port.target_tsc = 0;
        }

        if !port.inflight.is_empty() {
            let tx = port.send.dev.tx_burst(port.send.queue, &mut port.inflight);
            reporter.send(&[Stats::PktsBurst(tx)]);
            return Poll::HasPending;
        }

        let Ok(peeked) = port.send.consumer.peek() else {
            return Poll::AllDone;
        };

        let target = peeked.tx_tsc;
        let now = clock.now_ns();
        if now < target {
            let delta = target - now;
            if delta < NS_PER_S {
                port.target_tsc = target;
                return Poll::AllDone;
            }
            reporter.send(&[Stats::PacingDesync(1)]);
        }

        let Ok(pkt) = port.send.consumer.pop() else {
            return Poll::AllDone;
        };

        let mut one = VecDeque::with_capacity(1);
        one.push_back(pkt);
        let tx = port.send.dev.tx_burst(port.send.queue, &mut one);
        reporter.send(&[Stats::PktsBurst(tx)]);
        if tx < 1 {
            port.inflight = one;
        }

        Poll::HasPending
    }
}

impl Tasklet for VideoTransmitter {
    fn name(&self) -> &str {
        &self.name
    }

    fn handler(&mut self) -> Poll {
        if self.stop.load(Ordering::Acquire) {
            return Poll::AllDone;
        }

        let mut pending = Poll::AllDone;
        for port in self.ports.iter_mut() {
            let poll = match port.send.way {
                PacingWay::RateLimit => Self::rl_round(port, &*self.clock, &self.reporter),
                _ => Self::tsc_round(port, &*self.clock, &self.reporter),
            };
            if poll == Poll::HasPending {
                pending = Poll::HasPending;
            }
        }

        pending
    }

    fn advice_sleep_us(&self) -> Option<u64> {
        let trs = self.ports.first().map(|p| p.send.trs).unwrap_or(0.0);
        Some((trs * 32.0 / 1000.0) as u64)
    }
}
