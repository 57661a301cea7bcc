//! Neighbor resolution and multicast membership.
//!
//! ARP resolution blocks session setup: a broadcast request goes out,
//! retried every 100 ms with a log line every 5 s, until the matching
//! reply arrives. Multicast destinations never resolve; their MAC is
//! derived arithmetically. The membership list feeds an unsolicited
//! IGMPv3 report every 10 seconds.

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::Arc,
    time::Duration,
};

use ahash::AHashMap;
use bytes::BytesMut;
use codec::net::{
    ARP_OP_REPLY, ARP_OP_REQUEST, ArpPacket, BROADCAST_MAC, ETHER_TYPE_ARP, ETHER_TYPE_IPV4,
    EthernetHeader, IGMP_TOS, IP_PROTO_IGMP, Ipv4Header, MacAddr, encode_igmp_report,
    multicast_mac,
};
use parking_lot::Mutex;
use service::Error;

use super::{Clock, FlowFilter, Packet, PortDevice};

const ARP_RETRY: Duration = Duration::from_millis(100);
const ARP_LOG_PERIOD: Duration = Duration::from_secs(5);

/// The IGMPv3 report destination, all IGMPv3-capable routers.
const IGMP_REPORT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 22);

pub const IGMP_REPORT_PERIOD_NS: u64 = 10_000_000_000;

/// Per port neighbor state: the ARP cache and the joined group list.
pub struct Neighbors {
    dev: Arc<dyn PortDevice>,
    clock: Arc<dyn Clock>,
    cache: Mutex<AHashMap<Ipv4Addr, MacAddr>>,
    /// group -> reference count, insertion ordered reports
    groups: Mutex<Vec<(Ipv4Addr, u32)>>,
    last_report: Mutex<u64>,
}

impl Neighbors {
    pub fn new(dev: Arc<dyn PortDevice>, clock: Arc<dyn Clock>) -> Self {
        Self {
            dev,
            clock,
            cache: Mutex::new(AHashMap::new()),
            groups: Mutex::new(Vec::new()),
            last_report: Mutex::new(0),
        }
    }

    /// Resolve the destination MAC of `ip`.
    ///
    /// Multicast addresses map arithmetically; unicast addresses go
    /// through the cache and then through blocking ARP with the retry
    /// and log cadence of the resolution contract. `deadline` bounds the
    /// wait (a session create should not hang forever in tests).
    pub fn resolve(&self, ip: Ipv4Addr, deadline: Duration) -> Result<MacAddr, Error> {
        if ip.is_multicast() {
            return Ok(multicast_mac(ip));
        }

        if let Some(mac) = self.cache.lock().get(&ip) {
            return Ok(*mac);
        }

        let mut queue = self.dev.open_rx_queue(&FlowFilter::Arp)?;
        let start = self.clock.now_ns();
        let mut last_try = None::<u64>;
        let mut last_log = start;

        loop {
            let now = self.clock.now_ns();
            if now - start > deadline.as_nanos() as u64 {
                log::error!("arp: resolve {ip} timed out");
                return Err(Error::HardwareError);
            }

            if last_try
                .map(|t| now - t >= ARP_RETRY.as_nanos() as u64)
                .unwrap_or(true)
            {
                self.send_request(ip);
                last_try = Some(now);
            }

            if now - last_log >= ARP_LOG_PERIOD.as_nanos() as u64 {
                log::info!("arp: still waiting for {ip}");
                last_log = now;
            }

            let mut pkts = Vec::new();
            queue.rx_burst(&mut pkts, 8);
            for pkt in &pkts {
                if let Some(mac) = self.accept_reply(ip, &pkt.head) {
                    self.cache.lock().insert(ip, mac);
                    return Ok(mac);
                }
            }

            std::thread::yield_now();
        }
    }

    fn send_request(&self, ip: Ipv4Addr) {
        let mut head = BytesMut::with_capacity(EthernetHeader::SIZE + ArpPacket::SIZE);
        EthernetHeader {
            dst: BROADCAST_MAC,
            src: self.dev.mac(),
            ether_type: ETHER_TYPE_ARP,
        }
        .encode(&mut head);
        ArpPacket {
            operation: ARP_OP_REQUEST,
            sender_mac: self.dev.mac(),
            sender_ip: self.dev.ip(),
            target_mac: [0; 6],
            target_ip: ip,
        }
        .encode(&mut head);

        let mut out = VecDeque::new();
        out.push_back(Packet::new(head));
        self.dev.tx_burst(0, &mut out);
    }

    fn accept_reply(&self, want: Ipv4Addr, frame: &[u8]) -> Option<MacAddr> {
        let arp = ArpPacket::decode(&frame[EthernetHeader::SIZE..]).ok()?;
        (arp.operation == ARP_OP_REPLY && arp.sender_ip == want).then_some(arp.sender_mac)
    }

    /// Join a multicast group; repeated joins stack.
    pub fn join(&self, group: Ipv4Addr) -> Result<(), Error> {
        if !group.is_multicast() {
            return Err(Error::InvalidArgument);
        }

        let mut groups = self.groups.lock();
        match groups.iter_mut().find(|(g, _)| *g == group) {
            Some((_, refs)) => *refs += 1,
            None => groups.push((group, 1)),
        }
        drop(groups);

        // announce the membership right away
        self.report();
        Ok(())
    }

    pub fn leave(&self, group: Ipv4Addr) {
        let mut groups = self.groups.lock();
        if let Some(at) = groups.iter().position(|(g, _)| *g == group) {
            groups[at].1 -= 1;
            if groups[at].1 == 0 {
                groups.remove(at);
            }
        }
    }

    /// The current membership, for tests and the status dump.
    pub fn memberships(&self) -> Vec<Ipv4Addr> {
        self.groups.lock().iter().map(|(g, _)| *g).collect()
    }

    /// Emit the unsolicited membership report when the period elapsed.
    pub fn poll_report(&self) {
        let now = self.clock.now_ns();
        let mut last = self.last_report.lock();
        if now.saturating_sub(*last) < IGMP_REPORT_PERIOD_NS {
            return;
        }
        *last = now;
        drop(last);

        self.report();
    }

    fn report(&self) {
        let groups = self.memberships();
        if groups.is_empty() {
            return;
        }

        let mut igmp = BytesMut::with_capacity(8 + groups.len() * 8);
        encode_igmp_report(&groups, &mut igmp);

        let mut head = BytesMut::with_capacity(64 + igmp.len());
        EthernetHeader {
            dst: multicast_mac(IGMP_REPORT_GROUP),
            src: self.dev.mac(),
            ether_type: ETHER_TYPE_IPV4,
        }
        .encode(&mut head);
        Ipv4Header {
            tos: IGMP_TOS,
            total_length: (Ipv4Header::SIZE + igmp.len()) as u16,
            packet_id: 0,
            ttl: 1,
            protocol: IP_PROTO_IGMP,
            src: self.dev.ip(),
            dst: IGMP_REPORT_GROUP,
        }
        .encode(&mut head);
        head.extend_from_slice(&igmp);

        let mut out = VecDeque::new();
        out.push_back(Packet::new(head));
        self.dev.tx_burst(0, &mut out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{ManualClock, loopback::LoopPort};

    fn setup() -> (Neighbors, LoopPort, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let (a, b) = LoopPort::pair(
            clock.clone() as Arc<dyn Clock>,
            ([2, 0, 0, 0, 0, 1], Ipv4Addr::new(192, 168, 85, 80)),
            ([2, 0, 0, 0, 0, 2], Ipv4Addr::new(192, 168, 85, 81)),
        );
        (
            Neighbors::new(Arc::new(a), clock.clone() as Arc<dyn Clock>),
            b,
            clock,
        )
    }

    #[test]
    fn multicast_resolves_arithmetically() {
        let (neigh, _b, _clock) = setup();
        let mac = neigh
            .resolve(Ipv4Addr::new(239, 168, 85, 20), Duration::from_secs(1))
            .unwrap();
        assert_eq!(mac, [0x01, 0x00, 0x5e, 0x28, 0x55, 0x14]);
    }

    #[test]
    fn unicast_resolves_via_arp() {
        let (neigh, _b, _clock) = setup();

        // the loop peer answers for its own address
        let mac = neigh
            .resolve(Ipv4Addr::new(192, 168, 85, 81), Duration::from_secs(1))
            .unwrap();
        assert_eq!(mac, [2, 0, 0, 0, 0, 2]);

        // second resolve hits the cache
        let again = neigh
            .resolve(Ipv4Addr::new(192, 168, 85, 81), Duration::ZERO)
            .unwrap();
        assert_eq!(again, mac);
    }

    #[test]
    fn join_leave_is_idempotent() {
        let (neigh, _b, _clock) = setup();
        let g1 = Ipv4Addr::new(239, 0, 0, 1);
        let g2 = Ipv4Addr::new(239, 0, 0, 2);

        let before = neigh.memberships();

        neigh.join(g1).unwrap();
        neigh.join(g2).unwrap();
        neigh.join(g1).unwrap();
        neigh.leave(g1);
        neigh.leave(g2);
        neigh.leave(g1);

        let mut after = neigh.memberships();
        after.sort();
        let mut want = before.clone();
        want.sort();
        assert_eq!(after, want);
    }

    #[test]
    fn periodic_report_cadence() {
        let (neigh, _b, clock) = setup();
        neigh.join(Ipv4Addr::new(239, 0, 0, 1)).unwrap();

        // join itself reported once; the poll does nothing until 10 s
        clock.advance(IGMP_REPORT_PERIOD_NS - 1);
        neigh.poll_report();

        clock.advance(2);
        neigh.poll_report();
    }
}
