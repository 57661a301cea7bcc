use bytes::{BufMut, BytesMut};

use super::Error;

/// Bit 15 of the row number field marks the second field of an interlaced
/// frame.
pub const SECOND_FIELD: u16 = 0x8000;

/// Bit 15 of the row offset field marks that another sample row
/// description follows this one (a packet straddling a line boundary).
pub const CONTINUATION: u16 = 0x8000;

/// One sample row description of the RFC 4175 payload header.
///
/// `row_number` and `row_offset` are stripped of their flag bits; the
/// flags are reported separately so callers never have to mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowDescriptor {
    pub length: u16,
    pub number: u16,
    pub offset: u16,
    pub second_field: bool,
    pub continuation: bool,
}

impl RowDescriptor {
    pub const SIZE: usize = 6;

    fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.length);
        bytes.put_u16(self.number | if self.second_field { SECOND_FIELD } else { 0 });
        bytes.put_u16(self.offset | if self.continuation { CONTINUATION } else { 0 });
    }

    fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let number = u16::from_be_bytes(bytes[2..4].try_into()?);
        let offset = u16::from_be_bytes(bytes[4..6].try_into()?);

        Ok(Self {
            length: u16::from_be_bytes(bytes[0..2].try_into()?),
            number: number & !SECOND_FIELD,
            offset: offset & !CONTINUATION,
            second_field: number & SECOND_FIELD != 0,
            continuation: offset & CONTINUATION != 0,
        })
    }
}

/// The ST 2110-20 payload header that follows the RTP header.
///
/// Two bytes of extended sequence number (the high 16 bits of the 32 bit
/// sequence), then one sample row description, optionally followed by a
/// second one when the packet crosses a line boundary in block packing.
/// The continuation flag of the first description announces the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub ext_sequence: u16,
    pub row: RowDescriptor,
    pub second_row: Option<RowDescriptor>,
}

impl PayloadHeader {
    /// Header size without the optional second row description.
    pub const SIZE: usize = 2 + RowDescriptor::SIZE;

    pub fn size(&self) -> usize {
        if self.second_row.is_some() {
            Self::SIZE + RowDescriptor::SIZE
        } else {
            Self::SIZE
        }
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use st2110_codec::rfc4175::{PayloadHeader, RowDescriptor};
    ///
    /// let hdr = PayloadHeader {
    ///     ext_sequence: 0x0001,
    ///     row: RowDescriptor {
    ///         length: 1200,
    ///         number: 42,
    ///         offset: 480,
    ///         second_field: false,
    ///         continuation: false,
    ///     },
    ///     second_row: None,
    /// };
    ///
    /// let mut bytes = BytesMut::with_capacity(64);
    /// hdr.encode(&mut bytes);
    ///
    /// assert_eq!(&bytes[..], &[0x00, 0x01, 0x04, 0xb0, 0x00, 0x2a, 0x01, 0xe0]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.put_u16(self.ext_sequence);

        let mut row = self.row;
        row.continuation = self.second_row.is_some();
        row.encode(bytes);

        if let Some(second) = &self.second_row {
            second.encode(bytes);
        }
    }

    /// # Test
    ///
    /// ```
    /// use st2110_codec::rfc4175::PayloadHeader;
    ///
    /// // a packet straddling from the end of line 11 into line 12
    /// let bytes = [
    ///     0x00u8, 0x02, // ext seq
    ///     0x01, 0x90, 0x00, 0x0b, 0x82, 0x30, // 400 bytes, line 11, offset 560 | C
    ///     0x03, 0x5c, 0x00, 0x0c, 0x00, 0x00, // 860 bytes, line 12, offset 0
    /// ];
    ///
    /// let hdr = PayloadHeader::decode(&bytes).unwrap();
    /// let second = hdr.second_row.unwrap();
    ///
    /// assert_eq!(hdr.ext_sequence, 2);
    /// assert_eq!(hdr.row.length, 400);
    /// assert_eq!(hdr.row.number, 11);
    /// assert_eq!(hdr.row.offset, 560);
    /// assert!(hdr.row.continuation);
    /// assert_eq!(second.number, 12);
    /// assert_eq!(second.length, 860);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidInput);
        }

        let ext_sequence = u16::from_be_bytes(bytes[0..2].try_into()?);
        let row = RowDescriptor::decode(&bytes[2..])?;

        let second_row = if row.continuation {
            if bytes.len() < Self::SIZE + RowDescriptor::SIZE {
                return Err(Error::InvalidInput);
            }

            Some(RowDescriptor::decode(&bytes[Self::SIZE..])?)
        } else {
            None
        };

        Ok(Self {
            ext_sequence,
            row,
            second_row,
        })
    }
}
