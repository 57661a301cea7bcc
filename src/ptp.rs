//! A minimal IEEE 1588v2 client.
//!
//! Just enough to discipline the port's 1588 register for pacing: adopt
//! the best announcing master, run the four timestamp exchange, and
//! apply the filtered offset. The system clock is never touched; when no
//! master shows up within ten seconds, [`PtpClock::get_time`] falls back
//! to the system realtime clock.

use std::{
    collections::VecDeque,
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use codec::{
    net::{ETHER_TYPE_IPV4, ETHER_TYPE_PTP, EthernetHeader, IP_PROTO_UDP, Ipv4Header, UdpHeader},
    ptp::{
        ClockQuality, Message, MessageBody, PTP_L4_GROUP, PTP_L4_MULTICAST_MAC,
        PTP_L2_MULTICAST_MAC, PTP_UDP_EVENT_PORT, PTP_UDP_GENERAL_PORT, PortIdentity, PtpTimestamp,
    },
};
use service::Error;

use crate::{
    net::{Clock, FlowFilter, Packet, PortDevice, RxQueue},
    sched::{Poll, Tasklet},
};

/// Delay request goes out this long after the FOLLOW_UP.
const DELAY_REQ_DELAY_NS: u64 = 50_000;

/// How long to poll the NIC for the DELAY_REQ transmit timestamp.
const TX_TIMESTAMP_POLL_NS: u64 = 50_000;

/// A SYNC receive timestamp further than this from the register is
/// clamped.
const RX_MAX_DELTA_NS: u64 = 1_000_000;

/// Give up on an exchange leg after this long and re-arm on ANNOUNCE.
const EXCHANGE_TIMEOUT_NS: u64 = 100_000_000;

/// Without any master, fall back to the system clock after this long.
const NO_MASTER_FALLBACK_NS: u64 = 10_000_000_000;

/// The disciplined time source handed to pacing and sessions.
pub struct PtpClock {
    dev: Arc<dyn PortDevice>,
    /// Seconds between TAI and UTC, pinned from the ANNOUNCE.
    utc_offset: AtomicI64,
    synced: AtomicBool,
    fallback: AtomicBool,
}

impl PtpClock {
    pub fn new(dev: Arc<dyn PortDevice>) -> Arc<Self> {
        Arc::new(Self {
            dev,
            utc_offset: AtomicI64::new(0),
            synced: AtomicBool::new(false),
            fallback: AtomicBool::new(false),
        })
    }

    /// PTP nanoseconds. The NIC register once a master disciplined it,
    /// the system realtime clock otherwise.
    pub fn get_time(&self) -> u64 {
        if self.synced.load(Ordering::Acquire) || !self.fallback.load(Ordering::Acquire) {
            let raw = self.dev.read_time() as i128;
            let utc = self.utc_offset.load(Ordering::Acquire) as i128 * 1_000_000_000;
            (raw - utc).max(0) as u64
        } else {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    L2,
    L4,
}

struct Master {
    quality: ClockQuality,
    port_identity: PortIdentity,
    ip: Option<Ipv4Addr>,
    transport: Transport,
    domain: u8,
}

#[derive(Default)]
struct ExchangeStat {
    delta_sum: u64,
    delta_cnt: u64,
    consecutive_err: u32,
    corrections: u64,
    rx_sync_err: u64,
    tx_timestamp_miss: u64,
}

/// The PTP tasklet of one port.
pub struct PtpClient {
    dev: Arc<dyn PortDevice>,
    clock: Arc<dyn Clock>,
    ptp: Arc<PtpClock>,
    rx: Box<dyn RxQueue>,
    our_identity: PortIdentity,
    master: Option<Master>,
    start_tsc: u64,

    // the four timestamps of the exchange, zero when pending
    t1: u64,
    t2: u64,
    t3: u64,
    t4: u64,
    t2_sequence: u16,
    t3_sequence: u16,
    delay_req_due: Option<u64>,
    leg_deadline: Option<u64>,
    stat: ExchangeStat,
}

impl PtpClient {
    pub fn new(
        dev: Arc<dyn PortDevice>,
        clock: Arc<dyn Clock>,
        ptp: Arc<PtpClock>,
    ) -> Result<Self, Error> {
        let rx = dev.open_rx_queue(&FlowFilter::Ptp)?;

        // clock identity from the mac, EUI-64 style
        let mac = dev.mac();
        let mut clock_identity = [0u8; 8];
        clock_identity[..3].copy_from_slice(&mac[..3]);
        clock_identity[3] = 0xff;
        clock_identity[4] = 0xfe;
        clock_identity[5..].copy_from_slice(&mac[3..]);

        let start_tsc = clock.now_ns();
        Ok(Self {
            dev,
            clock,
            ptp,
            rx,
            our_identity: PortIdentity {
                clock_identity,
                port_number: 1,
            },
            master: None,
            start_tsc,
            t1: 0,
            t2: 0,
            t3: 0,
            t4: 0,
            t2_sequence: 0,
            t3_sequence: 0,
            delay_req_due: None,
            leg_deadline: None,
            stat: ExchangeStat::default(),
        })
    }

    fn reset_exchange(&mut self) {
        self.t1 = 0;
        self.t2 = 0;
        self.t3 = 0;
        self.t4 = 0;
        self.delay_req_due = None;
        self.leg_deadline = None;
    }

    fn on_announce(&mut self, msg: &Message, src_ip: Option<Ipv4Addr>) {
        let MessageBody::Announce {
            current_utc_offset,
            quality,
            ..
        } = msg.body
        else {
            return;
        };

        let better = match &self.master {
            None => true,
            Some(master) => quality < master.quality,
        };
        if !better {
            return;
        }

        let transport = if src_ip.is_some() {
            Transport::L4
        } else {
            Transport::L2
        };

        log::info!(
            "ptp({}): master adopted, mode {}, utc offset {}, domain {}",
            self.dev.name(),
            if transport == Transport::L4 { "l4" } else { "l2" },
            current_utc_offset,
            msg.domain_number,
        );

        self.ptp
            .utc_offset
            .store(current_utc_offset as i64, Ordering::Release);
        self.master = Some(Master {
            quality,
            port_identity: msg.source_port_identity,
            ip: src_ip,
            transport,
            domain: msg.domain_number,
        });
        self.reset_exchange();
    }

    fn on_sync(&mut self, msg: &Message, rx_timestamp: u64) {
        if self.master.is_none() {
            return;
        }

        // clamp an implausible hardware stamp to the register
        let now = self.dev.read_time();
        let rx = if now.saturating_sub(rx_timestamp) > RX_MAX_DELTA_NS {
            self.stat.rx_sync_err += 1;
            now
        } else {
            rx_timestamp
        };

        self.t1 = 0;
        self.t3 = 0;
        self.t4 = 0;
        self.delay_req_due = None;
        self.t2 = rx;
        self.t2_sequence = msg.sequence_id;
        self.leg_deadline = Some(self.clock.now_ns() + EXCHANGE_TIMEOUT_NS);
    }

    fn on_follow_up(&mut self, msg: &Message) {
        if self.t2 == 0 || msg.sequence_id != self.t2_sequence {
            return;
        }

        let MessageBody::FollowUp {
            precise_origin_timestamp,
        } = msg.body
        else {
            return;
        };

        self.t1 = precise_origin_timestamp.as_nanos();
        self.delay_req_due = Some(self.clock.now_ns() + DELAY_REQ_DELAY_NS);
        self.leg_deadline = Some(self.clock.now_ns() + EXCHANGE_TIMEOUT_NS);
    }

    fn send_delay_req(&mut self) {
        let Some(master) = &self.master else {
            return;
        };

        self.t3_sequence = self.t3_sequence.wrapping_add(1);
        let msg = Message {
            domain_number: master.domain,
            sequence_id: self.t3_sequence,
            source_port_identity: self.our_identity,
            body: MessageBody::DelayReq {
                origin_timestamp: PtpTimestamp::default(),
            },
        };

        let mut head = BytesMut::with_capacity(128);
        match master.transport {
            Transport::L2 => {
                EthernetHeader {
                    dst: PTP_L2_MULTICAST_MAC,
                    src: self.dev.mac(),
                    ether_type: ETHER_TYPE_PTP,
                }
                .encode(&mut head);
                msg.encode(&mut head);
            }
            Transport::L4 => {
                EthernetHeader {
                    dst: PTP_L4_MULTICAST_MAC,
                    src: self.dev.mac(),
                    ether_type: ETHER_TYPE_IPV4,
                }
                .encode(&mut head);

                let mut body = BytesMut::with_capacity(64);
                msg.encode(&mut body);

                Ipv4Header {
                    tos: 0,
                    total_length: (Ipv4Header::SIZE + UdpHeader::SIZE + body.len()) as u16,
                    packet_id: self.t3_sequence,
                    ttl: 255,
                    protocol: IP_PROTO_UDP,
                    src: self.dev.ip(),
                    dst: master.ip.unwrap_or(Ipv4Addr::from(PTP_L4_GROUP)),
                }
                .encode(&mut head);
                UdpHeader {
                    src_port: PTP_UDP_EVENT_PORT,
                    dst_port: PTP_UDP_EVENT_PORT,
                    length: (UdpHeader::SIZE + body.len()) as u16,
                }
                .encode(&mut head);
                head.extend_from_slice(&body);
            }
        }

        let mut out = VecDeque::new();
        out.push_back(Packet::new(head));
        if self.dev.tx_burst(0, &mut out) < 1 {
            return;
        }

        // poll the NIC for the event timestamp, bounded busy wait
        let poll_start = self.clock.now_ns();
        let mut t3 = None;
        while self.clock.now_ns() - poll_start < TX_TIMESTAMP_POLL_NS {
            if let Some(ts) = self.dev.tx_timestamp(0) {
                t3 = Some(ts);
                break;
            }
            std::hint::spin_loop();
        }

        self.t3 = match t3 {
            Some(ts) => ts,
            None => {
                // accuracy downgrade: use the register instead
                self.stat.tx_timestamp_miss += 1;
                self.dev.read_time()
            }
        };
        self.leg_deadline = Some(self.clock.now_ns() + EXCHANGE_TIMEOUT_NS);

        if self.t4 != 0 && self.t2 != 0 && self.t1 != 0 {
            self.finish_exchange();
        }
    }

    fn on_delay_resp(&mut self, msg: &Message) {
        if self.t4 != 0 || msg.sequence_id != self.t3_sequence {
            return;
        }

        let MessageBody::DelayResp {
            receive_timestamp,
            requesting_port_identity,
        } = msg.body
        else {
            return;
        };
        if requesting_port_identity != self.our_identity {
            return;
        }

        self.t4 = receive_timestamp.as_nanos();

        if self.t3 != 0 && self.t2 != 0 && self.t1 != 0 {
            self.finish_exchange();
        }
    }

    /// Apply `delta = ((t4 - t3) - (t2 - t1)) / 2` through the excursion
    /// filter.
    fn finish_exchange(&mut self) {
        let delta = ((self.t4 as i64 - self.t3 as i64) - (self.t2 as i64 - self.t1 as i64)) / 2;
        let abs_delta = delta.unsigned_abs();
        self.leg_deadline = None;

        if self.stat.delta_cnt > 0 {
            let expect = (self.stat.delta_sum / self.stat.delta_cnt * 2).max(100_000);
            if abs_delta > expect {
                self.stat.consecutive_err += 1;
                if self.stat.consecutive_err > 5 {
                    self.stat.consecutive_err = 0;
                    self.stat.delta_cnt = 0;
                    self.stat.delta_sum = 0;
                }
                self.reset_exchange();
                return;
            }
        }
        self.stat.consecutive_err = 0;

        self.dev.adjust_time(delta);
        self.ptp.synced.store(true, Ordering::Release);
        self.stat.delta_sum += abs_delta;
        self.stat.delta_cnt += 1;
        self.stat.corrections += 1;
        self.reset_exchange();

        log::debug!("ptp({}): corrected {delta} ns", self.dev.name());
    }

    fn handle_frame(&mut self, pkt: &Packet) {
        let frame = &pkt.head;
        let Ok(eth) = EthernetHeader::decode(frame) else {
            return;
        };

        let (msg_at, src_ip) = if eth.ether_type == ETHER_TYPE_PTP {
            (EthernetHeader::SIZE, None)
        } else {
            let ip_at = EthernetHeader::SIZE;
            let Ok(ip) = Ipv4Header::decode(&frame[ip_at..]) else {
                return;
            };
            let udp_at = ip_at + Ipv4Header::header_len(&frame[ip_at..]);
            let Ok(udp) = UdpHeader::decode(&frame[udp_at..]) else {
                return;
            };
            if udp.dst_port != PTP_UDP_EVENT_PORT && udp.dst_port != PTP_UDP_GENERAL_PORT {
                return;
            }
            (udp_at + UdpHeader::SIZE, Some(ip.src))
        };

        let Ok(msg) = Message::decode(&frame[msg_at..]) else {
            return;
        };

        // only our adopted master's messages count, announce excepted
        if let Some(master) = &self.master {
            if !matches!(msg.body, MessageBody::Announce { .. })
                && msg.source_port_identity != master.port_identity
            {
                return;
            }
        }

        match msg.body {
            MessageBody::Announce { .. } => self.on_announce(&msg, src_ip),
            MessageBody::Sync { .. } => self.on_sync(&msg, pkt.rx_timestamp),
            MessageBody::FollowUp { .. } => self.on_follow_up(&msg),
            MessageBody::DelayResp { .. } => self.on_delay_resp(&msg),
            MessageBody::DelayReq { .. } => {}
        }
    }
}

impl Tasklet for PtpClient {
    fn name(&self) -> &str {
        "ptp"
    }

    fn handler(&mut self) -> Poll {
        let mut pkts = Vec::new();
        self.rx.rx_burst(&mut pkts, 16);
        for pkt in &pkts {
            self.handle_frame(pkt);
        }

        let now = self.clock.now_ns();

        if let Some(due) = self.delay_req_due {
            if now >= due {
                self.delay_req_due = None;
                self.send_delay_req();
            }
        }

        // a stalled leg re-arms on the next announce/sync
        if let Some(deadline) = self.leg_deadline {
            if now >= deadline {
                self.reset_exchange();
            }
        }

        if self.master.is_none() && now - self.start_tsc > NO_MASTER_FALLBACK_NS {
            self.ptp.fallback.store(true, Ordering::Release);
        }

        if pkts.is_empty() {
            Poll::AllDone
        } else {
            Poll::HasPending
        }
    }

    fn advice_sleep_us(&self) -> Option<u64> {
        // a sync every second leaves plenty of room
        Some(1000)
    }
}
