use bytes::{BufMut, BytesMut};

use super::Error;

/// The ST 2110-22 payload header that follows the RTP header (RFC 9134).
///
/// Two bytes of extended sequence number, then four bit-packed bytes:
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+---+---------+---------------------+---------------------+
/// |T|K|L| I |F counter|     SEP counter     |      P counter      |
/// +-+-+-+---+---------+---------------------+---------------------+
/// ```
///
/// `trans_order` (T) is always 1 for sequential transmission and `kmode`
/// (K) always 0 for codestream packetization; `last_packet` (L) is raised
/// together with the RTP marker on the final packet of a frame. The frame
/// counter wraps at 32, the SEP and P counters are derived from the packet
/// index within the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadHeader {
    pub ext_sequence: u16,
    pub trans_order: bool,
    pub kmode: bool,
    pub last_packet: bool,
    pub interlaced: u8,
    pub f_counter: u8,
    pub sep_counter: u16,
    pub p_counter: u16,
}

impl PayloadHeader {
    pub const SIZE: usize = 6;

    /// Derive the counter fields for packet `pkt_idx` of frame
    /// `frame_idx` of a progressive codestream.
    ///
    /// # Test
    ///
    /// ```
    /// use st2110_codec::rfc9134::PayloadHeader;
    ///
    /// let hdr = PayloadHeader::progressive(33, 2049);
    ///
    /// assert_eq!(hdr.f_counter, 1);
    /// assert_eq!(hdr.sep_counter, 1);
    /// assert_eq!(hdr.p_counter, 1);
    /// ```
    pub fn progressive(frame_idx: u32, pkt_idx: u32) -> Self {
        Self {
            ext_sequence: 0,
            trans_order: true,
            kmode: false,
            last_packet: false,
            interlaced: 0,
            f_counter: (frame_idx % 32) as u8,
            sep_counter: (pkt_idx / 2048) as u16,
            p_counter: (pkt_idx % 2048) as u16,
        }
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use st2110_codec::rfc9134::PayloadHeader;
    ///
    /// let mut hdr = PayloadHeader::progressive(1, 5);
    /// hdr.ext_sequence = 2;
    /// hdr.last_packet = true;
    ///
    /// let mut bytes = BytesMut::with_capacity(6);
    /// hdr.encode(&mut bytes);
    ///
    /// assert_eq!(&bytes[..], &[0x00, 0x02, 0xa0, 0x40, 0x00, 0x05]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.ext_sequence);
        bytes.put_u8(
            ((self.trans_order as u8) << 7)
                | ((self.kmode as u8) << 6)
                | ((self.last_packet as u8) << 5)
                | ((self.interlaced & 0x3) << 3)
                | ((self.f_counter >> 2) & 0x7),
        );
        bytes.put_u8(((self.f_counter & 0x3) << 6) | ((self.sep_counter >> 5) as u8 & 0x3f));
        bytes.put_u8((((self.sep_counter & 0x1f) as u8) << 3) | ((self.p_counter >> 8) as u8 & 0x7));
        bytes.put_u8((self.p_counter & 0xff) as u8);
    }

    /// # Test
    ///
    /// ```
    /// use st2110_codec::rfc9134::PayloadHeader;
    ///
    /// let hdr = PayloadHeader::decode(&[0x00, 0x02, 0xa0, 0x40, 0x00, 0x05]).unwrap();
    ///
    /// assert_eq!(hdr.ext_sequence, 2);
    /// assert!(hdr.trans_order);
    /// assert!(!hdr.kmode);
    /// assert!(hdr.last_packet);
    /// assert_eq!(hdr.f_counter, 1);
    /// assert_eq!(hdr.sep_counter, 0);
    /// assert_eq!(hdr.p_counter, 5);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            ext_sequence: u16::from_be_bytes(bytes[0..2].try_into()?),
            trans_order: bytes[2] >> 7 == 1,
            kmode: bytes[2] >> 6 & 0x1 == 1,
            last_packet: bytes[2] >> 5 & 0x1 == 1,
            interlaced: bytes[2] >> 3 & 0x3,
            f_counter: ((bytes[2] & 0x7) << 2) | (bytes[3] >> 6),
            sep_counter: (((bytes[3] & 0x3f) as u16) << 5) | (bytes[4] >> 3) as u16,
            p_counter: (((bytes[4] & 0x7) as u16) << 8) | bytes[5] as u16,
        })
    }
}

/// Parameters for the JPEG XS box prefix prepended to every transmitted
/// frame.
#[derive(Debug, Clone, Copy)]
pub struct BoxParams {
    /// Codestream bitrate in Mbit/s.
    pub bitrate_mbps: u32,
    /// Integer frame rate, stored as fixed point `1 << 24 | fps`.
    pub fps: u32,
}

/// Total size of the box prefix written by [`encode_boxes`].
pub const BOXES_SIZE: usize = 60;

const JPVS_SIZE: u32 = 42;
const JPVI_SIZE: u32 = 22;
const JXPL_SIZE: u32 = 12;
const COLR_SIZE: u32 = 18;

/// Write the `jpvs` wrapper (`jpvi` + `jxpl`) and the `colr` box.
///
/// The sample characteristics are fixed to 10 bit 4:2:2, the profile to
/// Main 422.10 (`ppih` 0x3540), the level to 4k-1 full (`plev` 0x2080) and
/// the colourspace to the ITU-R BT.709 method 5 descriptor.
///
/// # Test
///
/// ```
/// use bytes::BytesMut;
/// use st2110_codec::rfc9134::{BoxParams, encode_boxes, BOXES_SIZE};
///
/// let mut bytes = BytesMut::with_capacity(BOXES_SIZE);
/// encode_boxes(
///     &BoxParams {
///         bitrate_mbps: 400,
///         fps: 60,
///     },
///     &mut bytes,
/// );
///
/// assert_eq!(bytes.len(), BOXES_SIZE);
/// assert_eq!(&bytes[4..8], b"jpvs");
/// assert_eq!(&bytes[12..16], b"jpvi");
/// assert_eq!(&bytes[16..20], &400u32.to_be_bytes());
/// assert_eq!(&bytes[20..24], &(1u32 << 24 | 60).to_be_bytes());
/// assert_eq!(&bytes[24..26], &[0x80, 0x90]); // 10 bit 4:2:2
/// assert_eq!(&bytes[34..38], b"jxpl");
/// assert_eq!(&bytes[38..40], &[0x35, 0x40]); // Main 422.10
/// assert_eq!(&bytes[40..42], &[0x20, 0x80]); // 4k-1 full
/// assert_eq!(&bytes[46..50], b"colr");
/// assert_eq!(bytes[50], 0x05);
/// ```
pub fn encode_boxes(params: &BoxParams, bytes: &mut BytesMut) {
    // jpvs wrapper
    bytes.put_u32(JPVS_SIZE);
    bytes.put_slice(b"jpvs");

    // jpvi: bitrate, frame rate, sample characteristics, timecode
    bytes.put_u32(JPVI_SIZE);
    bytes.put_slice(b"jpvi");
    bytes.put_u32(params.bitrate_mbps);
    bytes.put_u32(1 << 24 | params.fps);
    bytes.put_u16(0x8000 | ((10 - 1) << 4)); // valid, 10 bit, 4:2:2
    bytes.put_u32(0);

    // jxpl: profile and level
    bytes.put_u32(JXPL_SIZE);
    bytes.put_slice(b"jxpl");
    bytes.put_u16(0x3540);
    bytes.put_u16(0x2080);

    // colr: method 5, ITU-R BT.709-6
    bytes.put_u32(COLR_SIZE);
    bytes.put_slice(b"colr");
    bytes.put_u8(0x05);
    bytes.put_slice(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x01, 0x80, 0x00, 0x00]);
}
