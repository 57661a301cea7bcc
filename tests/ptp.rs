mod common;

use std::{collections::VecDeque, time::Duration, time::Instant};

use bytes::BytesMut;
use codec::{
    net::{
        ETHER_TYPE_IPV4, EthernetHeader, IP_PROTO_UDP, Ipv4Header, UdpHeader,
    },
    ptp::{
        ClockQuality, Message, MessageBody, PTP_L4_GROUP, PTP_L4_MULTICAST_MAC, PortIdentity,
        PtpTimestamp, PTP_UDP_EVENT_PORT, PTP_UDP_GENERAL_PORT,
    },
};
use common::rig;
use st2110::net::{FlowFilter, Packet, PortDevice};

/// A hand rolled grandmaster on the peer port.
struct Master {
    identity: PortIdentity,
    sequence: u16,
}

impl Master {
    fn new() -> Self {
        Self {
            identity: PortIdentity {
                clock_identity: [0x00, 0x11, 0x22, 0xff, 0xfe, 0x33, 0x44, 0x55],
                port_number: 1,
            },
            sequence: 0,
        }
    }

    fn send(&self, port: &st2110::net::loopback::LoopPort, msg: &Message, event: bool) {
        let mut body = BytesMut::with_capacity(64);
        msg.encode(&mut body);

        let mut head = BytesMut::with_capacity(128);
        EthernetHeader {
            dst: PTP_L4_MULTICAST_MAC,
            src: port.mac(),
            ether_type: ETHER_TYPE_IPV4,
        }
        .encode(&mut head);
        Ipv4Header {
            tos: 0,
            total_length: (Ipv4Header::SIZE + UdpHeader::SIZE + body.len()) as u16,
            packet_id: msg.sequence_id,
            ttl: 255,
            protocol: IP_PROTO_UDP,
            src: port.ip(),
            dst: PTP_L4_GROUP.into(),
        }
        .encode(&mut head);
        let dst_port = if event {
            PTP_UDP_EVENT_PORT
        } else {
            PTP_UDP_GENERAL_PORT
        };
        UdpHeader {
            src_port: dst_port,
            dst_port,
            length: (UdpHeader::SIZE + body.len()) as u16,
        }
        .encode(&mut head);
        head.extend_from_slice(&body);

        let mut out = VecDeque::new();
        out.push_back(Packet::new(head));
        port.tx_burst(0, &mut out);
    }

    fn message(&self, body: MessageBody) -> Message {
        Message {
            domain_number: 0,
            sequence_id: self.sequence,
            source_port_identity: self.identity,
            body,
        }
    }

    fn announce(&mut self, port: &st2110::net::loopback::LoopPort) {
        self.sequence += 1;
        let msg = self.message(MessageBody::Announce {
            origin_timestamp: PtpTimestamp::default(),
            current_utc_offset: 0,
            quality: ClockQuality {
                priority1: 128,
                clock_class: 6,
                clock_accuracy: 0x21,
                offset_scaled_log_variance: 0x4000,
                priority2: 128,
                grandmaster_identity: self.identity.clock_identity,
            },
            steps_removed: 0,
        });
        self.send(port, &msg, false);
    }

    fn sync_follow_up(&mut self, port: &st2110::net::loopback::LoopPort) {
        self.sequence += 1;
        let t1 = port.read_time();
        let sync = self.message(MessageBody::Sync {
            origin_timestamp: PtpTimestamp::default(),
        });
        self.send(port, &sync, true);

        let follow_up = self.message(MessageBody::FollowUp {
            precise_origin_timestamp: PtpTimestamp::from_nanos(t1),
        });
        self.send(port, &follow_up, false);
    }
}

/// The slave's time register converges onto the master's through the
/// four timestamp exchange.
#[test]
fn delay_request_exchange_disciplines_the_port() {
    let rig = rig(1);
    let slave = &rig.tx_ports[0];
    let master_port = &rig.rx_ports[0];

    // the master's register runs one and a half milliseconds ahead
    master_port.adjust_time(1_500_000);
    rig.clock.set(1_000_000_000);

    let mut master = Master::new();
    let mut delay_reqs = master_port
        .open_rx_queue(&FlowFilter::Ptp)
        .expect("master ptp queue");

    master.announce(master_port);

    let budget = Instant::now();
    let mut corrected = false;
    while !corrected {
        assert!(
            budget.elapsed() < Duration::from_secs(60),
            "no ptp convergence"
        );

        master.sync_follow_up(master_port);

        // give the slave its 50 microsecond delay request window
        for _ in 0..100 {
            rig.clock.advance(10_000);
            std::thread::sleep(Duration::from_micros(200));

            let mut pkts = Vec::new();
            delay_reqs.rx_burst(&mut pkts, 4);
            for pkt in &pkts {
                // find the delay request among our own sync traffic
                let at = 14 + 20 + 8;
                let Ok(msg) = Message::decode(&pkt.head[at..]) else {
                    continue;
                };
                if !matches!(msg.body, MessageBody::DelayReq { .. }) {
                    continue;
                }

                let t4 = pkt.rx_timestamp;
                let resp = Message {
                    domain_number: 0,
                    sequence_id: msg.sequence_id,
                    source_port_identity: master.identity,
                    body: MessageBody::DelayResp {
                        receive_timestamp: PtpTimestamp::from_nanos(t4),
                        requesting_port_identity: msg.source_port_identity,
                    },
                };
                master.send(master_port, &resp, false);
            }

            let offset = master_port.read_time() as i64 - slave.read_time() as i64;
            if offset.abs() < 10_000 {
                corrected = true;
                break;
            }
        }
    }

    let offset = master_port.read_time() as i64 - slave.read_time() as i64;
    assert!(offset.abs() < 10_000, "residual offset {offset}");

    // the disciplined clock now backs the transport's media time
    let ptp_time = rig.tx.ptp_time(0).unwrap();
    assert!((ptp_time as i64 - master_port.read_time() as i64).abs() < 10_000);
}
