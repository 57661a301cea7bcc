use bytes::{BufMut, BytesMut};

use super::Error;

pub const RTP_VERSION: u8 = 2;

/// The fixed 12 byte RTP header of RFC 3550.
///
/// ST 2110 media streams never use CSRC entries or header extensions, so
/// the header is always exactly [`RtpHeader::SIZE`] bytes and the payload
/// starts right behind it.
///
/// The marker bit carries the end-of-frame (video) or end-of-field
/// indication; the timestamp is the 90 kHz (video) or sample rate (audio)
/// media clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub const SIZE: usize = 12;

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use st2110_codec::rtp::RtpHeader;
    ///
    /// let hdr = RtpHeader {
    ///     marker: true,
    ///     payload_type: 96,
    ///     sequence: 0x1234,
    ///     timestamp: 0xdeadbeef,
    ///     ssrc: 0x11223344,
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    /// hdr.encode(&mut bytes);
    ///
    /// assert_eq!(
    ///     &bytes[..],
    ///     &[
    ///         0x80, 0xe0, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xef, 0x11, 0x22,
    ///         0x33, 0x44,
    ///     ]
    /// );
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u8(RTP_VERSION << 6);
        bytes.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        bytes.put_u16(self.sequence);
        bytes.put_u32(self.timestamp);
        bytes.put_u32(self.ssrc);
    }

    /// # Test
    ///
    /// ```
    /// use st2110_codec::rtp::RtpHeader;
    ///
    /// let bytes = [
    ///     0x80u8, 0xe0, 0x12, 0x34, 0xde, 0xad, 0xbe, 0xef, 0x11, 0x22,
    ///     0x33, 0x44,
    /// ];
    ///
    /// let hdr = RtpHeader::decode(&bytes).unwrap();
    ///
    /// assert!(hdr.marker);
    /// assert_eq!(hdr.payload_type, 96);
    /// assert_eq!(hdr.sequence, 0x1234);
    /// assert_eq!(hdr.timestamp, 0xdeadbeef);
    /// assert_eq!(hdr.ssrc, 0x11223344);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        if bytes[0] >> 6 != RTP_VERSION {
            return Err(Error::UnknownVersion);
        }

        Ok(Self {
            marker: bytes[1] >> 7 == 1,
            payload_type: bytes[1] & 0x7f,
            sequence: u16::from_be_bytes(bytes[2..4].try_into()?),
            timestamp: u32::from_be_bytes(bytes[4..8].try_into()?),
            ssrc: u32::from_be_bytes(bytes[8..12].try_into()?),
        })
    }
}
