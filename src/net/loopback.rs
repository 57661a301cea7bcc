//! An in-memory port pair.
//!
//! Two [`LoopPort`] endpoints deliver Ethernet frames to each other
//! synchronously, stamping receive timestamps from the shared clock.
//! The port answers ARP requests for its own address by itself (the
//! peer's kernel would), can drop a programmed fraction of media
//! packets, and models a rate limiter whose training either reports a
//! configured throughput or fails on request.

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        Arc, Weak,
        atomic::{AtomicI64, AtomicU64, Ordering},
    },
};

use bytes::BytesMut;
use codec::net::{
    ARP_OP_REPLY, ARP_OP_REQUEST, ArpPacket, ETHER_TYPE_ARP, ETHER_TYPE_IPV4, ETHER_TYPE_PTP,
    EthernetHeader, IP_PROTO_UDP, Ipv4Header, MacAddr, UdpHeader,
};
use parking_lot::Mutex;
use service::Error;

use super::{Clock, FlowFilter, Packet, PortDevice, RxQueue};

struct QueueSlot {
    filter: FlowFilter,
    pending: Arc<Mutex<VecDeque<Packet>>>,
}

struct LossState {
    /// Drop `numerator` of every `denominator` media packets.
    numerator: u32,
    denominator: u32,
    counter: u32,
}

struct Inner {
    mac: MacAddr,
    ip: Ipv4Addr,
    queues: Mutex<Vec<QueueSlot>>,
    peer: Mutex<Weak<Inner>>,
    clock: Arc<dyn Clock>,
    /// The port's 1588 register: clock plus a disciplined offset.
    time_offset: AtomicI64,
    tx_timestamp: Mutex<Option<u64>>,
    loss: Mutex<Option<LossState>>,
    rate_limit_pps: Mutex<Option<f64>>,
    fail_training: Mutex<bool>,
    train_calls: AtomicU64,
    stat_tx_pkts: AtomicU64,
    stat_rx_drops: AtomicU64,
}

/// One endpoint of an in-memory pair.
#[derive(Clone)]
pub struct LoopPort {
    name: String,
    inner: Arc<Inner>,
}

impl LoopPort {
    /// Create two connected endpoints.
    pub fn pair(
        clock: Arc<dyn Clock>,
        a: (MacAddr, Ipv4Addr),
        b: (MacAddr, Ipv4Addr),
    ) -> (Self, Self) {
        let make = |(mac, ip): (MacAddr, Ipv4Addr)| {
            Arc::new(Inner {
                mac,
                ip,
                queues: Mutex::new(Vec::new()),
                peer: Mutex::new(Weak::new()),
                clock: clock.clone(),
                time_offset: AtomicI64::new(0),
                tx_timestamp: Mutex::new(None),
                loss: Mutex::new(None),
                rate_limit_pps: Mutex::new(None),
                fail_training: Mutex::new(false),
                train_calls: AtomicU64::new(0),
                stat_tx_pkts: AtomicU64::new(0),
                stat_rx_drops: AtomicU64::new(0),
            })
        };

        let left = make(a);
        let right = make(b);
        *left.peer.lock() = Arc::downgrade(&right);
        *right.peer.lock() = Arc::downgrade(&left);

        (
            Self {
                name: "loop-p".to_string(),
                inner: left,
            },
            Self {
                name: "loop-r".to_string(),
                inner: right,
            },
        )
    }

    /// Drop `numerator` of every `denominator` received media packets.
    pub fn set_loss(&self, numerator: u32, denominator: u32) {
        *self.inner.loss.lock() = Some(LossState {
            numerator,
            denominator,
            counter: 0,
        });
    }

    /// Give the port a rate limiter that trains at `pps` packets per
    /// second.
    pub fn set_rate_limiter(&self, pps: f64) {
        *self.inner.rate_limit_pps.lock() = Some(pps);
    }

    /// Make the next training attempts fail.
    pub fn fail_training(&self, fail: bool) {
        *self.inner.fail_training.lock() = fail;
    }

    /// How many training runs the port performed.
    pub fn train_calls(&self) -> u64 {
        self.inner.train_calls.load(Ordering::Acquire)
    }

    pub fn tx_pkts(&self) -> u64 {
        self.inner.stat_tx_pkts.load(Ordering::Acquire)
    }

    fn answer_arp(&self, frame: &[u8]) -> Option<()> {
        let arp = ArpPacket::decode(&frame[EthernetHeader::SIZE..]).ok()?;
        if arp.operation != ARP_OP_REQUEST || arp.target_ip != self.inner.ip {
            return None;
        }

        let mut head = BytesMut::with_capacity(EthernetHeader::SIZE + ArpPacket::SIZE);
        EthernetHeader {
            dst: arp.sender_mac,
            src: self.inner.mac,
            ether_type: ETHER_TYPE_ARP,
        }
        .encode(&mut head);
        ArpPacket {
            operation: ARP_OP_REPLY,
            sender_mac: self.inner.mac,
            sender_ip: self.inner.ip,
            target_mac: arp.sender_mac,
            target_ip: arp.sender_ip,
        }
        .encode(&mut head);

        // deliver the reply back to the asking endpoint
        let peer = self.inner.peer.lock().upgrade()?;
        deliver(&peer, head, self.inner.clock.now_ns());
        Some(())
    }
}

/// Classify a received frame against a queue filter.
pub(crate) fn frame_matches(filter: &FlowFilter, frame: &[u8]) -> bool {
    let Ok(eth) = EthernetHeader::decode(frame) else {
        return false;
    };

    match filter {
        FlowFilter::Arp => eth.ether_type == ETHER_TYPE_ARP,
        FlowFilter::Ptp => {
            if eth.ether_type == ETHER_TYPE_PTP {
                return true;
            }
            if eth.ether_type != ETHER_TYPE_IPV4 {
                return false;
            }
            udp_tuple(frame)
                .map(|(_, _, dst_port)| dst_port == 319 || dst_port == 320)
                .unwrap_or(false)
        }
        FlowFilter::Udp {
            dst_ip,
            dst_port,
            src_ip,
        } => {
            if eth.ether_type != ETHER_TYPE_IPV4 {
                return false;
            }
            udp_tuple(frame)
                .map(|(src, dst, port)| {
                    dst == *dst_ip
                        && port == *dst_port
                        && src_ip.map(|want| want == src).unwrap_or(true)
                })
                .unwrap_or(false)
        }
    }
}

fn udp_tuple(frame: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr, u16)> {
    let ip = Ipv4Header::decode(&frame[EthernetHeader::SIZE..]).ok()?;
    if ip.protocol != IP_PROTO_UDP {
        return None;
    }

    let udp_at = EthernetHeader::SIZE + Ipv4Header::header_len(&frame[EthernetHeader::SIZE..]);
    let udp = UdpHeader::decode(&frame[udp_at..]).ok()?;
    Some((ip.src, ip.dst, udp.dst_port))
}

fn deliver(to: &Arc<Inner>, frame: BytesMut, rx_timestamp: u64) {
    let queues = to.queues.lock();
    for slot in queues.iter() {
        if frame_matches(&slot.filter, &frame) {
            let mut pkt = Packet::new(frame.clone());
            pkt.rx_timestamp = rx_timestamp;
            slot.pending.lock().push_back(pkt);
        }
    }
}

impl PortDevice for LoopPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn mac(&self) -> MacAddr {
        self.inner.mac
    }

    fn ip(&self) -> Ipv4Addr {
        self.inner.ip
    }

    fn tx_burst(&self, _queue: usize, pkts: &mut VecDeque<Packet>) -> usize {
        let peer = self.inner.peer.lock().upgrade();
        let mut sent = 0;

        while let Some(pkt) = pkts.pop_front() {
            let frame = pkt.contiguous();
            self.inner.stat_tx_pkts.fetch_add(1, Ordering::Release);

            if frame.len() < EthernetHeader::SIZE {
                sent += 1;
                continue;
            }

            // event PTP frames latch a hardware TX timestamp
            if frame.len() > EthernetHeader::SIZE {
                let ether_type = u16::from_be_bytes([frame[12], frame[13]]);
                let is_ptp_event = ether_type == ETHER_TYPE_PTP
                    || udp_tuple(&frame).map(|(_, _, p)| p == 319).unwrap_or(false);
                if is_ptp_event {
                    *self.inner.tx_timestamp.lock() = Some(self.read_time());
                }
            }

            // the local endpoint answers ARP for its peer address space
            if u16::from_be_bytes([frame[12], frame[13]]) == ETHER_TYPE_ARP {
                if let Some(peer) = &peer {
                    let port = LoopPort {
                        name: String::new(),
                        inner: peer.clone(),
                    };
                    if port.answer_arp(&frame).is_some() {
                        sent += 1;
                        continue;
                    }
                }
            }

            if let Some(peer) = &peer {
                let mut drop_it = false;
                if let Some(loss) = peer.loss.lock().as_mut() {
                    if u16::from_be_bytes([frame[12], frame[13]]) == ETHER_TYPE_IPV4 {
                        drop_it = loss.counter % loss.denominator < loss.numerator;
                        loss.counter += 1;
                    }
                }

                if drop_it {
                    peer.stat_rx_drops.fetch_add(1, Ordering::Release);
                } else {
                    let rx_time = peer.time_offset.load(Ordering::Acquire) as i128
                        + peer.clock.now_ns() as i128;
                    deliver(peer, frame, rx_time as u64);
                }
            }

            sent += 1;
        }

        sent
    }

    fn open_rx_queue(&self, flow: &FlowFilter) -> Result<Box<dyn RxQueue>, Error> {
        let pending = Arc::new(Mutex::new(VecDeque::new()));
        self.inner.queues.lock().push(QueueSlot {
            filter: *flow,
            pending: pending.clone(),
        });

        Ok(Box::new(LoopRxQueue { pending }))
    }

    fn read_time(&self) -> u64 {
        let now = self.inner.clock.now_ns() as i128;
        (now + self.inner.time_offset.load(Ordering::Acquire) as i128) as u64
    }

    fn adjust_time(&self, delta_ns: i64) {
        self.inner.time_offset.fetch_add(delta_ns, Ordering::AcqRel);
    }

    fn tx_timestamp(&self, _queue: usize) -> Option<u64> {
        self.inner.tx_timestamp.lock().take()
    }

    fn has_rx_timestamp(&self) -> bool {
        true
    }

    fn has_rate_limiter(&self) -> bool {
        self.inner.rate_limit_pps.lock().is_some()
    }

    fn rate_limit_train(
        &self,
        _queue: usize,
        _bps: u64,
        _pkt_size: usize,
        iterations: u32,
    ) -> Result<Vec<f64>, Error> {
        self.inner.train_calls.fetch_add(1, Ordering::AcqRel);

        if *self.inner.fail_training.lock() {
            return Err(Error::HardwareError);
        }

        let pps = self
            .inner
            .rate_limit_pps
            .lock()
            .ok_or(Error::HardwareError)?;

        // a stable limiter: identical measurements every round
        Ok((0..iterations).map(|_| pps).collect())
    }
}

struct LoopRxQueue {
    pending: Arc<Mutex<VecDeque<Packet>>>,
}

impl RxQueue for LoopRxQueue {
    fn rx_burst(&mut self, pkts: &mut Vec<Packet>, max: usize) -> usize {
        let mut pending = self.pending.lock();
        let n = max.min(pending.len());
        pkts.extend(pending.drain(..n));
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ManualClock;

    fn pair() -> (LoopPort, LoopPort, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let (a, b) = LoopPort::pair(
            clock.clone() as Arc<dyn Clock>,
            ([2, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 85, 80)),
            ([2, 0, 0, 0, 0, 2], Ipv4Addr::new(192, 168, 85, 81)),
        );
        (a, b, clock)
    }

    fn udp_frame(dst_port: u16) -> BytesMut {
        let mut head = BytesMut::with_capacity(128);
        EthernetHeader {
            dst: [2, 0, 0, 0, 0, 2],
            src: [2, 0, 0, 0, 0, 1],
            ether_type: ETHER_TYPE_IPV4,
        }
        .encode(&mut head);
        Ipv4Header {
            tos: 0,
            total_length: 28,
            packet_id: 0,
            ttl: 64,
            protocol: IP_PROTO_UDP,
            src: Ipv4Addr::new(192, 168, 85, 80),
            dst: Ipv4Addr::new(192, 168, 85, 81),
        }
        .encode(&mut head);
        UdpHeader {
            src_port: 5000,
            dst_port,
            length: 8,
        }
        .encode(&mut head);
        head
    }

    #[test]
    fn demux_by_flow() {
        let (a, b, clock) = pair();
        clock.set(1234);

        let mut q20 = b
            .open_rx_queue(&FlowFilter::Udp {
                dst_ip: Ipv4Addr::new(192, 168, 85, 81),
                dst_port: 20000,
                src_ip: None,
            })
            .unwrap();
        let mut q21 = b
            .open_rx_queue(&FlowFilter::Udp {
                dst_ip: Ipv4Addr::new(192, 168, 85, 81),
                dst_port: 21000,
                src_ip: None,
            })
            .unwrap();

        let mut out = VecDeque::new();
        out.push_back(Packet::new(udp_frame(20000)));
        assert_eq!(a.tx_burst(0, &mut out), 1);

        let mut got = Vec::new();
        assert_eq!(q20.rx_burst(&mut got, 16), 1);
        assert_eq!(got[0].rx_timestamp, 1234);
        assert_eq!(q21.rx_burst(&mut Vec::new(), 16), 0);
    }

    #[test]
    fn loss_drops_fraction() {
        let (a, b, _clock) = pair();
        b.set_loss(1, 10);

        let mut q = b
            .open_rx_queue(&FlowFilter::Udp {
                dst_ip: Ipv4Addr::new(192, 168, 85, 81),
                dst_port: 20000,
                src_ip: None,
            })
            .unwrap();

        let mut out = VecDeque::new();
        for _ in 0..100 {
            out.push_back(Packet::new(udp_frame(20000)));
        }
        a.tx_burst(0, &mut out);

        let mut got = Vec::new();
        q.rx_burst(&mut got, 200);
        assert_eq!(got.len(), 90);
    }

    #[test]
    fn disciplined_time() {
        let (a, _b, clock) = pair();
        clock.set(1_000_000);
        assert_eq!(a.read_time(), 1_000_000);

        a.adjust_time(-250);
        assert_eq!(a.read_time(), 999_750);
    }
}
