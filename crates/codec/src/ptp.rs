use bytes::{BufMut, BytesMut};

use super::Error;

pub const PTP_VERSION: u8 = 2;

/// Event (SYNC/DELAY_REQ) and general (ANNOUNCE/FOLLOW_UP/DELAY_RESP)
/// UDP ports of the L4 transport.
pub const PTP_UDP_EVENT_PORT: u16 = 319;
pub const PTP_UDP_GENERAL_PORT: u16 = 320;

/// The L4 primary multicast group, 224.0.1.129.
pub const PTP_L4_GROUP: [u8; 4] = [224, 0, 1, 129];

/// Destination MAC of L4 mode (224.0.1.129 mapped).
pub const PTP_L4_MULTICAST_MAC: [u8; 6] = [0x01, 0x00, 0x5e, 0x00, 0x01, 0x81];

/// Destination MAC of L2 mode (Ethertype 0x88F7).
pub const PTP_L2_MULTICAST_MAC: [u8; 6] = [0x01, 0x1b, 0x19, 0x00, 0x00, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Sync,
    DelayReq,
    FollowUp,
    DelayResp,
    Announce,
}

impl MessageType {
    fn from_nibble(value: u8) -> Result<Self, Error> {
        Ok(match value {
            0x0 => Self::Sync,
            0x1 => Self::DelayReq,
            0x8 => Self::FollowUp,
            0x9 => Self::DelayResp,
            0xb => Self::Announce,
            _ => return Err(Error::UnknownMethod),
        })
    }

    fn nibble(&self) -> u8 {
        match self {
            Self::Sync => 0x0,
            Self::DelayReq => 0x1,
            Self::FollowUp => 0x8,
            Self::DelayResp => 0x9,
            Self::Announce => 0xb,
        }
    }

    /// SYNC and DELAY_REQ are event messages and travel on UDP 319; the
    /// rest are general messages on UDP 320.
    pub fn is_event(&self) -> bool {
        matches!(self, Self::Sync | Self::DelayReq)
    }
}

/// The sending port of a PTP message, clock identity plus port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortIdentity {
    pub clock_identity: [u8; 8],
    pub port_number: u16,
}

/// The 48+32 bit second/nanosecond timestamp format of IEEE 1588.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtpTimestamp {
    pub seconds: u64,
    pub nanos: u32,
}

impl PtpTimestamp {
    /// # Test
    ///
    /// ```
    /// use st2110_codec::ptp::PtpTimestamp;
    ///
    /// let ts = PtpTimestamp { seconds: 2, nanos: 5 };
    /// assert_eq!(ts.as_nanos(), 2_000_000_005);
    /// assert_eq!(PtpTimestamp::from_nanos(2_000_000_005), ts);
    /// ```
    pub fn as_nanos(&self) -> u64 {
        self.seconds * 1_000_000_000 + self.nanos as u64
    }

    pub fn from_nanos(ns: u64) -> Self {
        Self {
            seconds: ns / 1_000_000_000,
            nanos: (ns % 1_000_000_000) as u32,
        }
    }

    fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16((self.seconds >> 32) as u16);
        bytes.put_u32(self.seconds as u32);
        bytes.put_u32(self.nanos);
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let msb = u16::from_be_bytes(bytes[0..2].try_into()?) as u64;
        let lsb = u32::from_be_bytes(bytes[2..6].try_into()?) as u64;

        Ok(Self {
            seconds: (msb << 32) | lsb,
            nanos: u32::from_be_bytes(bytes[6..10].try_into()?),
        })
    }
}

/// The grandmaster description carried by an ANNOUNCE, in dataset
/// comparison order: a lexicographically smaller tuple is the better
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClockQuality {
    pub priority1: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub priority2: u8,
    pub grandmaster_identity: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody {
    Announce {
        origin_timestamp: PtpTimestamp,
        current_utc_offset: i16,
        quality: ClockQuality,
        steps_removed: u16,
    },
    Sync {
        origin_timestamp: PtpTimestamp,
    },
    DelayReq {
        origin_timestamp: PtpTimestamp,
    },
    FollowUp {
        precise_origin_timestamp: PtpTimestamp,
    },
    DelayResp {
        receive_timestamp: PtpTimestamp,
        requesting_port_identity: PortIdentity,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Announce { .. } => MessageType::Announce,
            Self::Sync { .. } => MessageType::Sync,
            Self::DelayReq { .. } => MessageType::DelayReq,
            Self::FollowUp { .. } => MessageType::FollowUp,
            Self::DelayResp { .. } => MessageType::DelayResp,
        }
    }
}

/// A PTPv2 message: the common 34 byte header plus the typed body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    pub domain_number: u8,
    pub sequence_id: u16,
    pub source_port_identity: PortIdentity,
    pub body: MessageBody,
}

pub const HEADER_SIZE: usize = 34;

impl Message {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use st2110_codec::ptp::*;
    ///
    /// let msg = Message {
    ///     domain_number: 0,
    ///     sequence_id: 7,
    ///     source_port_identity: PortIdentity {
    ///         clock_identity: [1, 2, 3, 0xff, 0xfe, 4, 5, 6],
    ///         port_number: 1,
    ///     },
    ///     body: MessageBody::Sync {
    ///         origin_timestamp: PtpTimestamp::from_nanos(1_000_000_001),
    ///     },
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(64);
    /// msg.encode(&mut bytes);
    ///
    /// assert_eq!(bytes.len(), 44);
    /// assert_eq!(bytes[0] & 0xf, 0x0); // SYNC
    /// assert_eq!(bytes[1] & 0xf, 2); // version
    /// assert_eq!(Message::decode(&bytes).unwrap(), msg);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        let start = bytes.len();

        bytes.put_u8(self.body.message_type().nibble());
        bytes.put_u8(PTP_VERSION);
        bytes.put_u16(0); // message length, patched below
        bytes.put_u8(self.domain_number);
        bytes.put_u8(0);
        bytes.put_u16(0); // flags
        bytes.put_u64(0); // correction field
        bytes.put_u32(0);
        bytes.put_slice(&self.source_port_identity.clock_identity);
        bytes.put_u16(self.source_port_identity.port_number);
        bytes.put_u16(self.sequence_id);
        bytes.put_u8(0); // control field
        bytes.put_u8(0x7f); // log message interval

        match &self.body {
            MessageBody::Announce {
                origin_timestamp,
                current_utc_offset,
                quality,
                steps_removed,
            } => {
                origin_timestamp.encode(bytes);
                bytes.put_i16(*current_utc_offset);
                bytes.put_u8(0);
                bytes.put_u8(quality.priority1);
                bytes.put_u8(quality.clock_class);
                bytes.put_u8(quality.clock_accuracy);
                bytes.put_u16(quality.offset_scaled_log_variance);
                bytes.put_u8(quality.priority2);
                bytes.put_slice(&quality.grandmaster_identity);
                bytes.put_u16(*steps_removed);
                bytes.put_u8(0xa0); // time source: internal oscillator
            }
            MessageBody::Sync { origin_timestamp } | MessageBody::DelayReq { origin_timestamp } => {
                origin_timestamp.encode(bytes);
            }
            MessageBody::FollowUp {
                precise_origin_timestamp,
            } => {
                precise_origin_timestamp.encode(bytes);
            }
            MessageBody::DelayResp {
                receive_timestamp,
                requesting_port_identity,
            } => {
                receive_timestamp.encode(bytes);
                bytes.put_slice(&requesting_port_identity.clock_identity);
                bytes.put_u16(requesting_port_identity.port_number);
            }
        }

        let length = (bytes.len() - start) as u16;
        bytes[start + 2..start + 4].copy_from_slice(&length.to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE + 10 {
            return Err(Error::InvalidInput);
        }

        if bytes[1] & 0xf != PTP_VERSION {
            return Err(Error::UnknownVersion);
        }

        let message_type = MessageType::from_nibble(bytes[0] & 0xf)?;
        let source_port_identity = PortIdentity {
            clock_identity: bytes[20..28].try_into()?,
            port_number: u16::from_be_bytes(bytes[28..30].try_into()?),
        };

        let body = &bytes[HEADER_SIZE..];
        let body = match message_type {
            MessageType::Sync => MessageBody::Sync {
                origin_timestamp: PtpTimestamp::decode(body)?,
            },
            MessageType::DelayReq => MessageBody::DelayReq {
                origin_timestamp: PtpTimestamp::decode(body)?,
            },
            MessageType::FollowUp => MessageBody::FollowUp {
                precise_origin_timestamp: PtpTimestamp::decode(body)?,
            },
            MessageType::DelayResp => {
                if body.len() < 20 {
                    return Err(Error::InvalidInput);
                }

                MessageBody::DelayResp {
                    receive_timestamp: PtpTimestamp::decode(body)?,
                    requesting_port_identity: PortIdentity {
                        clock_identity: body[10..18].try_into()?,
                        port_number: u16::from_be_bytes(body[18..20].try_into()?),
                    },
                }
            }
            MessageType::Announce => {
                if body.len() < 30 {
                    return Err(Error::InvalidInput);
                }

                MessageBody::Announce {
                    origin_timestamp: PtpTimestamp::decode(body)?,
                    current_utc_offset: i16::from_be_bytes(body[10..12].try_into()?),
                    quality: ClockQuality {
                        priority1: body[13],
                        clock_class: body[14],
                        clock_accuracy: body[15],
                        offset_scaled_log_variance: u16::from_be_bytes(body[16..18].try_into()?),
                        priority2: body[18],
                        grandmaster_identity: body[19..27].try_into()?,
                    },
                    steps_removed: u16::from_be_bytes(body[27..29].try_into()?),
                }
            }
        };

        Ok(Self {
            domain_number: bytes[4],
            sequence_id: u16::from_be_bytes(bytes[30..32].try_into()?),
            source_port_identity,
            body,
        })
    }
}
