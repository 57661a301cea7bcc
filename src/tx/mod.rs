//! Transmit sessions.

pub mod anc;
pub mod audio;
pub mod video;

use std::net::Ipv4Addr;

use bytes::BytesMut;
use codec::net::{
    ETHER_TYPE_IPV4, EthernetHeader, IP_PROTO_UDP, Ipv4Header, MacAddr, UdpHeader,
    internet_checksum,
};

/// A session's destination on one port.
#[derive(Debug, Clone, Copy)]
pub struct DestInfo {
    pub ip: Ipv4Addr,
    pub udp_port: u16,
    /// Overrides ARP/multicast resolution when set.
    pub mac: Option<MacAddr>,
}

/// Pre-built Ethernet + IPv4 + UDP head cloned into every packet; the
/// length and checksum fields are patched per packet.
pub(crate) fn header_template(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
) -> BytesMut {
    let mut head = BytesMut::with_capacity(EthernetHeader::SIZE + Ipv4Header::SIZE + UdpHeader::SIZE);

    EthernetHeader {
        dst: dst_mac,
        src: src_mac,
        ether_type: ETHER_TYPE_IPV4,
    }
    .encode(&mut head);
    Ipv4Header {
        tos: 0,
        total_length: 0,
        packet_id: 0,
        ttl: 64,
        protocol: IP_PROTO_UDP,
        src: src_ip,
        dst: dst_ip,
    }
    .encode(&mut head);
    UdpHeader {
        src_port,
        dst_port,
        length: 0,
    }
    .encode(&mut head);

    head
}

/// Patch packet id, total length, UDP length and the IPv4 checksum of a
/// head whose payload runs `payload_len` bytes past it.
pub(crate) fn finalize_head(head: &mut BytesMut, ipv4_id: u16, payload_len: usize) {
    let ip_at = EthernetHeader::SIZE;
    let udp_at = ip_at + Ipv4Header::SIZE;

    let total = (head.len() - ip_at + payload_len) as u16;
    let udp_len = (head.len() - udp_at + payload_len) as u16;

    head[ip_at + 2..ip_at + 4].copy_from_slice(&total.to_be_bytes());
    head[ip_at + 4..ip_at + 6].copy_from_slice(&ipv4_id.to_be_bytes());
    head[udp_at + 4..udp_at + 6].copy_from_slice(&udp_len.to_be_bytes());

    head[ip_at + 10..ip_at + 12].copy_from_slice(&[0, 0]);
    let checksum = internet_checksum(&head[ip_at..ip_at + Ipv4Header::SIZE]);
    head[ip_at + 10..ip_at + 12].copy_from_slice(&checksum.to_be_bytes());
}
