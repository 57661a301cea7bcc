//! Pixel format conversion at the frame pool boundary.
//!
//! Conversion is a pure lookup from (application format, transport
//! format) to a function; the transport itself never inspects pixels.
//! The only pair shipped is planar 10 bit 4:2:2 little endian against
//! the RFC 4175 big endian pixel group, which is what the transmit
//! conversion path and its loopback inverse need.

use super::Error;

/// Formats an application buffer may be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameFormat {
    /// Three planes of little endian u16 holding 10 bit samples.
    Yuv422Planar10Le,
    /// The ST 2110-20 wire format, 5 byte big endian pixel groups.
    Yuv422Rfc4175Pg2Be10,
}

/// `convert(src, dst, width, height)`; `dst` must already be sized for
/// the destination format.
pub type ConvertFn = fn(&[u8], &mut [u8], u32, u32) -> Result<(), Error>;

/// Look up the converter for a format pair, `None` when the pair needs
/// no conversion or is not supported.
pub fn converter(src: FrameFormat, dst: FrameFormat) -> Option<ConvertFn> {
    match (src, dst) {
        (FrameFormat::Yuv422Planar10Le, FrameFormat::Yuv422Rfc4175Pg2Be10) => {
            Some(yuv422p10le_to_rfc4175)
        }
        (FrameFormat::Yuv422Rfc4175Pg2Be10, FrameFormat::Yuv422Planar10Le) => {
            Some(rfc4175_to_yuv422p10le)
        }
        _ => None,
    }
}

/// Size of a frame in the given format.
pub fn frame_size(fmt: FrameFormat, width: u32, height: u32) -> usize {
    let pixels = width as usize * height as usize;
    match fmt {
        // 2 bytes per luma sample plus 2 bytes per chroma pair sample
        FrameFormat::Yuv422Planar10Le => pixels * 4,
        FrameFormat::Yuv422Rfc4175Pg2Be10 => pixels * 5 / 2,
    }
}

/// Pack planar CbYCr into 5 byte big endian pixel groups:
/// Cb(10) Y0(10) Cr(10) Y1(10).
fn yuv422p10le_to_rfc4175(src: &[u8], dst: &mut [u8], width: u32, height: u32) -> Result<(), Error> {
    let pixels = width as usize * height as usize;
    if src.len() < pixels * 4 || dst.len() < pixels * 5 / 2 {
        return Err(Error::InvalidArgument);
    }

    let (y_plane, chroma) = src.split_at(pixels * 2);
    let (cb_plane, cr_plane) = chroma.split_at(pixels);

    let word = |plane: &[u8], idx: usize| -> u16 {
        u16::from_le_bytes([plane[idx * 2], plane[idx * 2 + 1]]) & 0x3ff
    };

    for group in 0..pixels / 2 {
        let cb = word(cb_plane, group);
        let y0 = word(y_plane, group * 2);
        let cr = word(cr_plane, group);
        let y1 = word(y_plane, group * 2 + 1);

        let out = &mut dst[group * 5..group * 5 + 5];
        out[0] = (cb >> 2) as u8;
        out[1] = (((cb & 0x3) << 6) | (y0 >> 4)) as u8;
        out[2] = (((y0 & 0xf) << 4) | (cr >> 6)) as u8;
        out[3] = (((cr & 0x3f) << 2) | (y1 >> 8)) as u8;
        out[4] = (y1 & 0xff) as u8;
    }

    Ok(())
}

/// The inverse of [`yuv422p10le_to_rfc4175`].
fn rfc4175_to_yuv422p10le(src: &[u8], dst: &mut [u8], width: u32, height: u32) -> Result<(), Error> {
    let pixels = width as usize * height as usize;
    if src.len() < pixels * 5 / 2 || dst.len() < pixels * 4 {
        return Err(Error::InvalidArgument);
    }

    let (y_plane, chroma) = dst.split_at_mut(pixels * 2);
    let (cb_plane, cr_plane) = chroma.split_at_mut(pixels);

    for group in 0..pixels / 2 {
        let pg = &src[group * 5..group * 5 + 5];
        let cb = ((pg[0] as u16) << 2) | (pg[1] >> 6) as u16;
        let y0 = (((pg[1] & 0x3f) as u16) << 4) | (pg[2] >> 4) as u16;
        let cr = (((pg[2] & 0xf) as u16) << 6) | (pg[3] >> 2) as u16;
        let y1 = (((pg[3] & 0x3) as u16) << 8) | pg[4] as u16;

        cb_plane[group * 2..group * 2 + 2].copy_from_slice(&cb.to_le_bytes());
        cr_plane[group * 2..group * 2 + 2].copy_from_slice(&cr.to_le_bytes());
        y_plane[group * 4..group * 4 + 2].copy_from_slice(&y0.to_le_bytes());
        y_plane[group * 4 + 2..group * 4 + 4].copy_from_slice(&y1.to_le_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_table() {
        assert!(
            converter(
                FrameFormat::Yuv422Planar10Le,
                FrameFormat::Yuv422Rfc4175Pg2Be10
            )
            .is_some()
        );
        assert!(
            converter(
                FrameFormat::Yuv422Planar10Le,
                FrameFormat::Yuv422Planar10Le
            )
            .is_none()
        );
    }

    /// Byte exact against a hand packed reference group.
    #[test]
    fn reference_group() {
        // Cb=0x200, Y0=0x040, Cr=0x3ff, Y1=0x155
        let mut src = vec![0u8; frame_size(FrameFormat::Yuv422Planar10Le, 2, 1)];
        src[0..2].copy_from_slice(&0x040u16.to_le_bytes()); // y0
        src[2..4].copy_from_slice(&0x155u16.to_le_bytes()); // y1
        src[4..6].copy_from_slice(&0x200u16.to_le_bytes()); // cb
        src[6..8].copy_from_slice(&0x3ffu16.to_le_bytes()); // cr

        let mut dst = vec![0u8; frame_size(FrameFormat::Yuv422Rfc4175Pg2Be10, 2, 1)];
        yuv422p10le_to_rfc4175(&src, &mut dst, 2, 1).unwrap();

        // 10 bit fields packed MSB first
        assert_eq!(dst, vec![0x80, 0x04, 0x0f, 0xfd, 0x55]);
    }

    /// The conversion pair inverts itself on a 64x2 test pattern.
    #[test]
    fn roundtrip_64x2() {
        let (width, height) = (64u32, 2u32);
        let planar = frame_size(FrameFormat::Yuv422Planar10Le, width, height);
        let packed = frame_size(FrameFormat::Yuv422Rfc4175Pg2Be10, width, height);

        let mut src = vec![0u8; planar];
        for (i, chunk) in src.chunks_mut(2).enumerate() {
            let sample = ((i * 37) % 1024) as u16;
            chunk.copy_from_slice(&sample.to_le_bytes());
        }

        let mut wire = vec![0u8; packed];
        let mut back = vec![0u8; planar];
        yuv422p10le_to_rfc4175(&src, &mut wire, width, height).unwrap();
        rfc4175_to_yuv422p10le(&wire, &mut back, width, height).unwrap();

        assert_eq!(src, back);
    }
}
