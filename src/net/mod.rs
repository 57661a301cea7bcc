//! The device layer.
//!
//! The transport talks to a NIC port through [`PortDevice`]: burst
//! transmit of whole Ethernet frames, flow filtered receive queues, and
//! the IEEE 1588 time register. [`loopback::LoopPort`] pairs two in
//! memory endpoints for the integration tests; on Linux
//! [`afpacket::PacketSocket`] is the reference implementation over an
//! AF_PACKET socket.

pub mod loopback;
pub mod neigh;

#[cfg(target_os = "linux")]
pub mod afpacket;

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use codec::net::MacAddr;
use service::Error;

/// A monotonic nanosecond time source, the TSC of the pacing engine.
///
/// All pacing state is computed against this clock so tests can drive
/// the pipeline with a manually advanced instance.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// The production clock, monotonic since process start.
pub struct TscClock(Instant);

impl Default for TscClock {
    fn default() -> Self {
        Self(Instant::now())
    }
}

impl Clock for TscClock {
    fn now_ns(&self) -> u64 {
        self.0.elapsed().as_nanos() as u64
    }
}

/// A manually advanced clock for deterministic tests.
#[derive(Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn advance(&self, ns: u64) {
        self.0.fetch_add(ns, Ordering::Release);
    }

    pub fn set(&self, ns: u64) {
        self.0.store(ns, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Marks a pad packet in [`Packet::pkt_idx`].
pub const PAD_PKT_IDX: u32 = u32::MAX;

/// The transport's packet: pre-built headers plus an optional zero copy
/// payload slice of the frame being sent, and the metadata the
/// transmitter paces by.
pub struct Packet {
    /// Ethernet, IP, UDP and RTP headers (plus any copied payload).
    pub head: BytesMut,
    /// Zero copy payload chained behind the headers.
    pub payload: Option<Bytes>,
    /// TSC at which the transmitter must hand this packet to the NIC.
    pub tx_tsc: u64,
    /// PTP time the packet was scheduled for, for instrumentation.
    pub tx_ptp: u64,
    /// Hardware receive timestamp, PTP nanoseconds.
    pub rx_timestamp: u64,
    /// Index of the packet within its frame; [`PAD_PKT_IDX`] for pads.
    pub pkt_idx: u32,
}

impl Packet {
    pub fn new(head: BytesMut) -> Self {
        Self {
            head,
            payload: None,
            tx_tsc: 0,
            tx_ptp: 0,
            rx_timestamp: 0,
            pkt_idx: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.head.len() + self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flatten the segments into one wire frame (the DMA gather step of
    /// a real NIC).
    pub fn contiguous(&self) -> BytesMut {
        let mut frame = BytesMut::with_capacity(self.len());
        frame.extend_from_slice(&self.head);
        if let Some(payload) = &self.payload {
            frame.extend_from_slice(payload);
        }
        frame
    }
}

/// A receive flow classifier, one per RX queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFilter {
    /// Match UDP datagrams to a destination tuple, optionally source
    /// filtered (SSM).
    Udp {
        dst_ip: Ipv4Addr,
        dst_port: u16,
        src_ip: Option<Ipv4Addr>,
    },
    /// Match the PTP flows: UDP 319/320 plus Ethertype 0x88F7.
    Ptp,
    /// Match ARP frames.
    Arp,
}

/// One physical port.
///
/// `tx_burst` sends from the front of the queue and leaves whatever the
/// NIC would not take, mirroring a partial descriptor ring write.
pub trait PortDevice: Send + Sync {
    fn name(&self) -> &str;
    fn mac(&self) -> MacAddr;
    fn ip(&self) -> Ipv4Addr;

    fn tx_burst(&self, queue: usize, pkts: &mut VecDeque<Packet>) -> usize;

    fn open_rx_queue(&self, flow: &FlowFilter) -> Result<Box<dyn RxQueue>, Error>;

    /// The NIC 1588 time register, nanoseconds.
    fn read_time(&self) -> u64;

    /// Discipline the 1588 register by a signed correction.
    fn adjust_time(&self, delta_ns: i64);

    /// Hardware timestamp of the last transmitted event packet, consumed
    /// on read. `None` until the NIC latches one.
    fn tx_timestamp(&self, queue: usize) -> Option<u64>;

    fn has_rx_timestamp(&self) -> bool {
        false
    }

    fn has_rate_limiter(&self) -> bool {
        false
    }

    /// Run the rate limiter training bursts for `iterations` rounds and
    /// report the measured packets per second of each.
    ///
    /// Fails with [`Error::HardwareError`] when the port has no rate
    /// limiter or cannot sustain the target; the caller falls back to
    /// TSC pacing.
    #[allow(unused_variables)]
    fn rate_limit_train(
        &self,
        queue: usize,
        bps: u64,
        pkt_size: usize,
        iterations: u32,
    ) -> Result<Vec<f64>, Error> {
        Err(Error::HardwareError)
    }
}

/// A flow filtered receive queue.
pub trait RxQueue: Send {
    /// Fill `pkts` with up to `max` received packets; returns the count.
    fn rx_burst(&mut self, pkts: &mut Vec<Packet>, max: usize) -> usize;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::default();
        assert_eq!(clock.now_ns(), 0);
        clock.advance(500);
        clock.advance(500);
        assert_eq!(clock.now_ns(), 1000);
    }

    #[test]
    fn packet_contiguous_chains_payload() {
        let mut pkt = Packet::new(BytesMut::from(&b"head"[..]));
        pkt.payload = Some(Bytes::from_static(b"payload"));

        assert_eq!(pkt.len(), 11);
        assert_eq!(&pkt.contiguous()[..], b"headpayload");
    }
}
