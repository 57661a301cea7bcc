use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use super::Error;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;
pub const ETHER_TYPE_PTP: u16 = 0x88f7;

pub const IP_PROTO_IGMP: u8 = 2;
pub const IP_PROTO_UDP: u8 = 17;

/// DSCP/ECN byte used on IGMP frames.
pub const IGMP_TOS: u8 = 0xc0;

pub const MAC_LEN: usize = 6;

pub type MacAddr = [u8; MAC_LEN];

pub const BROADCAST_MAC: MacAddr = [0xff; MAC_LEN];

/// Map a multicast group address to its Ethernet destination.
///
/// The low 23 bits of the group address land in a `01:00:5e` prefix.
///
/// # Test
///
/// ```
/// use std::net::Ipv4Addr;
/// use st2110_codec::net::multicast_mac;
///
/// let mac = multicast_mac(Ipv4Addr::new(239, 168, 85, 20));
/// assert_eq!(mac, [0x01, 0x00, 0x5e, 0x28, 0x55, 0x14]);
/// ```
pub fn multicast_mac(group: Ipv4Addr) -> MacAddr {
    let ip = group.octets();
    [0x01, 0x00, 0x5e, ip[1] & 0x7f, ip[2], ip[3]]
}

/// The RFC 1071 internet checksum over a header.
pub fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in bytes.chunks(2) {
        let word = if chunk.len() == 2 {
            ((chunk[0] as u32) << 8) | chunk[1] as u32
        } else {
            (chunk[0] as u32) << 8
        };
        sum += word;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// An Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
}

impl EthernetHeader {
    pub const SIZE: usize = 14;

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_slice(&self.dst);
        bytes.put_slice(&self.src);
        bytes.put_u16(self.ether_type);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            dst: bytes[0..6].try_into()?,
            src: bytes[6..12].try_into()?,
            ether_type: u16::from_be_bytes(bytes[12..14].try_into()?),
        })
    }
}

/// An IPv4 header without options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub tos: u8,
    pub total_length: u16,
    pub packet_id: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub const SIZE: usize = 20;

    /// # Test
    ///
    /// ```
    /// use std::net::Ipv4Addr;
    /// use bytes::BytesMut;
    /// use st2110_codec::net::Ipv4Header;
    ///
    /// let hdr = Ipv4Header {
    ///     tos: 0,
    ///     total_length: 28,
    ///     packet_id: 1,
    ///     ttl: 64,
    ///     protocol: 17,
    ///     src: Ipv4Addr::new(192, 168, 0, 1),
    ///     dst: Ipv4Addr::new(239, 0, 0, 1),
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(20);
    /// hdr.encode(&mut bytes);
    ///
    /// let back = Ipv4Header::decode(&bytes).unwrap();
    /// assert_eq!(back, hdr);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        let start = bytes.len();
        bytes.put_u8(0x45); // version 4, ihl 5
        bytes.put_u8(self.tos);
        bytes.put_u16(self.total_length);
        bytes.put_u16(self.packet_id);
        bytes.put_u16(0x4000); // don't fragment
        bytes.put_u8(self.ttl);
        bytes.put_u8(self.protocol);
        bytes.put_u16(0);
        bytes.put_slice(&self.src.octets());
        bytes.put_slice(&self.dst.octets());

        let checksum = internet_checksum(&bytes[start..start + Self::SIZE]);
        bytes[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        if bytes[0] >> 4 != 4 {
            return Err(Error::UnknownVersion);
        }

        Ok(Self {
            tos: bytes[1],
            total_length: u16::from_be_bytes(bytes[2..4].try_into()?),
            packet_id: u16::from_be_bytes(bytes[4..6].try_into()?),
            ttl: bytes[8],
            protocol: bytes[9],
            src: Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[12..16])?),
            dst: Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[16..20])?),
        })
    }

    /// Header length in 32 bit words, to skip options on receive.
    pub fn header_len(bytes: &[u8]) -> usize {
        ((bytes[0] & 0xf) as usize) * 4
    }
}

/// A UDP header. The checksum is left zero (optional over IPv4); the
/// media path relies on the IPv4 header checksum alone, as the original
/// transport does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

impl UdpHeader {
    pub const SIZE: usize = 8;

    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.src_port);
        bytes.put_u16(self.dst_port);
        bytes.put_u16(self.length);
        bytes.put_u16(0);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            src_port: u16::from_be_bytes(bytes[0..2].try_into()?),
            dst_port: u16::from_be_bytes(bytes[2..4].try_into()?),
            length: u16::from_be_bytes(bytes[4..6].try_into()?),
        })
    }
}

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

/// An ARP packet for IPv4 over Ethernet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub const SIZE: usize = 28;

    /// # Test
    ///
    /// ```
    /// use std::net::Ipv4Addr;
    /// use bytes::BytesMut;
    /// use st2110_codec::net::{ArpPacket, ARP_OP_REQUEST};
    ///
    /// let arp = ArpPacket {
    ///     operation: ARP_OP_REQUEST,
    ///     sender_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
    ///     sender_ip: Ipv4Addr::new(192, 168, 0, 1),
    ///     target_mac: [0x00; 6],
    ///     target_ip: Ipv4Addr::new(192, 168, 0, 2),
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(28);
    /// arp.encode(&mut bytes);
    ///
    /// assert_eq!(&bytes[..8], &[0x00, 0x01, 0x08, 0x00, 0x06, 0x04, 0x00, 0x01]);
    /// assert_eq!(ArpPacket::decode(&bytes).unwrap(), arp);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(1); // ethernet
        bytes.put_u16(ETHER_TYPE_IPV4);
        bytes.put_u8(6);
        bytes.put_u8(4);
        bytes.put_u16(self.operation);
        bytes.put_slice(&self.sender_mac);
        bytes.put_slice(&self.sender_ip.octets());
        bytes.put_slice(&self.target_mac);
        bytes.put_slice(&self.target_ip.octets());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        if u16::from_be_bytes(bytes[0..2].try_into()?) != 1
            || u16::from_be_bytes(bytes[2..4].try_into()?) != ETHER_TYPE_IPV4
        {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            operation: u16::from_be_bytes(bytes[6..8].try_into()?),
            sender_mac: bytes[8..14].try_into()?,
            sender_ip: Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[14..18])?),
            target_mac: bytes[18..24].try_into()?,
            target_ip: Ipv4Addr::from(<[u8; 4]>::try_from(&bytes[24..28])?),
        })
    }
}

pub const IGMP_V3_REPORT: u8 = 0x22;
pub const IGMP_MODE_IS_EXCLUDE: u8 = 2;

/// An unsolicited IGMPv3 membership report listing the joined groups,
/// each as a MODE_IS_EXCLUDE record with no sources.
///
/// # Test
///
/// ```
/// use std::net::Ipv4Addr;
/// use bytes::BytesMut;
/// use st2110_codec::net::{encode_igmp_report, internet_checksum};
///
/// let mut bytes = BytesMut::with_capacity(64);
/// encode_igmp_report(&[Ipv4Addr::new(239, 0, 0, 1)], &mut bytes);
///
/// assert_eq!(bytes[0], 0x22);
/// assert_eq!(&bytes[6..8], &[0x00, 0x01]); // one record
/// assert_eq!(bytes[8], 2); // MODE_IS_EXCLUDE
/// assert_eq!(internet_checksum(&bytes), 0);
/// ```
pub fn encode_igmp_report(groups: &[Ipv4Addr], bytes: &mut BytesMut) {
    let start = bytes.len();
    bytes.put_u8(IGMP_V3_REPORT);
    bytes.put_u8(0);
    bytes.put_u16(0); // checksum
    bytes.put_u16(0);
    bytes.put_u16(groups.len() as u16);

    for group in groups {
        bytes.put_u8(IGMP_MODE_IS_EXCLUDE);
        bytes.put_u8(0); // aux data len
        bytes.put_u16(0); // source count
        bytes.put_slice(&group.octets());
    }

    let checksum = internet_checksum(&bytes[start..]);
    bytes[start + 2..start + 4].copy_from_slice(&checksum.to_be_bytes());
}
