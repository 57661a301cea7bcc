//! Receive sessions.

pub mod anc;
pub mod audio;
pub mod video;

use codec::net::{EthernetHeader, Ipv4Header, UdpHeader};

/// Offset of the RTP header within a received media frame, skipping any
/// IPv4 options.
pub(crate) fn rtp_offset(frame: &[u8]) -> Option<usize> {
    if frame.len() < EthernetHeader::SIZE + Ipv4Header::SIZE + UdpHeader::SIZE {
        return None;
    }

    let ip_at = EthernetHeader::SIZE;
    Some(ip_at + Ipv4Header::header_len(&frame[ip_at..]) + UdpHeader::SIZE)
}
