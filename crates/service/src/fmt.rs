//! Video formats, frame rates and the ST 2110-20 packet geometry.
//!
//! The pixel group table and the raster timing table are data straight
//! out of SMPTE ST 2110-20/-21; the geometry calculation reproduces the
//! per packing mode packet counts the transmitter and receiver must agree
//! on.

use codec::{rfc4175, rfc9134, rtp::RtpHeader};

use super::Error;

/// Largest Ethernet frame the transport will emit (no jumbo frames).
pub const PKT_MAX_ETHER_BYTES: usize = 1514;

/// Ethernet + IPv4 + UDP overhead in front of the RTP header.
pub const PKT_L2L4_OVERHEAD: usize = 14 + 20 + 8;

/// Largest UDP payload that fits a normal Ethernet frame.
pub const PKT_MAX_UDP_BYTES: usize = PKT_MAX_ETHER_BYTES - PKT_L2L4_OVERHEAD;

/// The fixed payload size of block packing mode.
pub const BPM_PAYLOAD_BYTES: usize = 1260;

/// The wire pixel formats of ST 2110-20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoFormat {
    Yuv422_8bit,
    Yuv422_10bit,
    Yuv422_12bit,
    Yuv422_16bit,
    Yuv420_8bit,
    Yuv420_10bit,
    Yuv420_12bit,
    Rgb8bit,
    Rgb10bit,
    Rgb12bit,
    Rgb16bit,
    Yuv444_8bit,
    Yuv444_10bit,
    Yuv444_12bit,
    Yuv444_16bit,
}

/// A pixel group: `coverage` pixels spanning `size` bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelGroup {
    pub size: u32,
    pub coverage: u32,
}

impl VideoFormat {
    /// The ST 2110-20 pixel group coverage table.
    ///
    /// # Test
    ///
    /// ```
    /// use st2110_service::fmt::VideoFormat;
    ///
    /// let pg = VideoFormat::Yuv422_10bit.pixel_group();
    /// assert_eq!((pg.size, pg.coverage), (5, 2));
    /// ```
    pub fn pixel_group(&self) -> PixelGroup {
        let (size, coverage) = match self {
            Self::Yuv422_8bit => (4, 2),
            Self::Yuv422_10bit => (5, 2),
            Self::Yuv422_12bit => (6, 2),
            Self::Yuv422_16bit => (8, 2),
            Self::Yuv420_8bit => (6, 4),
            Self::Yuv420_10bit => (15, 8),
            Self::Yuv420_12bit => (9, 4),
            Self::Rgb8bit => (3, 1),
            Self::Rgb10bit => (15, 4),
            Self::Rgb12bit => (9, 2),
            Self::Rgb16bit => (6, 1),
            Self::Yuv444_8bit => (3, 1),
            Self::Yuv444_10bit => (15, 4),
            Self::Yuv444_12bit => (9, 2),
            Self::Yuv444_16bit => (6, 1),
        };

        PixelGroup { size, coverage }
    }
}

/// The supported frame rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fps {
    P120,
    P119_88,
    P100,
    P60,
    P59_94,
    P50,
    P30,
    P29_97,
    P25,
    P24,
    P23_98,
}

/// Frame rate as the exact fraction `mul / den`, plus the RTP sampling
/// clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FpsTiming {
    pub mul: u32,
    pub den: u32,
    pub sampling_clock_rate: u32,
}

pub const NS_PER_S: u64 = 1_000_000_000;

/// The video media clock of ST 2110-10.
pub const VIDEO_SAMPLING_RATE: u32 = 90_000;

impl Fps {
    pub fn timing(&self) -> FpsTiming {
        let (mul, den) = match self {
            Self::P120 => (120, 1),
            Self::P119_88 => (120_000, 1001),
            Self::P100 => (100, 1),
            Self::P60 => (60, 1),
            Self::P59_94 => (60_000, 1001),
            Self::P50 => (50, 1),
            Self::P30 => (30, 1),
            Self::P29_97 => (30_000, 1001),
            Self::P25 => (25, 1),
            Self::P24 => (24, 1),
            Self::P23_98 => (24_000, 1001),
        };

        FpsTiming {
            mul,
            den,
            sampling_clock_rate: VIDEO_SAMPLING_RATE,
        }
    }

    /// Frame period in nanoseconds.
    ///
    /// # Test
    ///
    /// ```
    /// use st2110_service::fmt::Fps;
    ///
    /// assert_eq!(Fps::P50.frame_time_ns(), 20_000_000.0);
    /// assert!((Fps::P59_94.frame_time_ns() - 16_683_350.0).abs() < 17.0);
    /// ```
    pub fn frame_time_ns(&self) -> f64 {
        let tm = self.timing();
        NS_PER_S as f64 * tm.den as f64 / tm.mul as f64
    }

    /// Media clock ticks per frame.
    pub fn frame_time_sampling(&self) -> f64 {
        let tm = self.timing();
        tm.sampling_clock_rate as f64 * tm.den as f64 / tm.mul as f64
    }

    /// Rounded integer frame rate, for the JPEG XS `jpvi` box.
    pub fn rounded(&self) -> u32 {
        let tm = self.timing();
        (tm.mul as f64 / tm.den as f64).round() as u32
    }
}

/// SMPTE raster timing: total line count of the frame interval and the
/// TR offset expressed in lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterTiming {
    pub total_lines: u32,
    pub tro_lines: u32,
    /// TR offset is doubled for interlaced rasters (the tables give the
    /// per field value).
    pub field_factor: u32,
}

/// Look up the TR offset table of ST 2110-21 for a raster.
///
/// # Test
///
/// ```
/// use st2110_service::fmt::raster_timing;
///
/// let hd = raster_timing(1080, false);
/// assert_eq!((hd.total_lines, hd.tro_lines, hd.field_factor), (1125, 43, 1));
///
/// let pal = raster_timing(576, true);
/// assert_eq!((pal.total_lines, pal.tro_lines, pal.field_factor), (625, 26, 2));
/// ```
pub fn raster_timing(height: u32, interlaced: bool) -> RasterTiming {
    let (total_lines, tro_lines, field_factor) = if interlaced {
        match height {
            480 => (525, 20, 2),
            576 => (625, 26, 2),
            _ => (1125, 22, 2),
        }
    } else if height >= 1080 {
        (1125, 43, 1)
    } else {
        (750, 28, 1)
    };

    RasterTiming {
        total_lines,
        tro_lines,
        field_factor,
    }
}

/// The active picture ratio used for trs and rate limiter bandwidth.
pub fn active_ratio(height: u32, interlaced: bool) -> f64 {
    if interlaced && height <= 576 {
        if height == 480 {
            487.0 / 525.0
        } else {
            576.0 / 625.0
        }
    } else {
        1080.0 / 1125.0
    }
}

/// ST 2110-20 packing modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// One line (or part of one) per packet, the line tail packet is
    /// shorter.
    GpmSl,
    /// Block packing: fixed 1260 byte payloads crossing line boundaries.
    Bpm,
    /// Generic packing: a computed pixel group count per packet.
    Gpm,
}

/// The agreed packet shape of a session, identical on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketGeometry {
    /// Nominal payload bytes per packet.
    pub pkt_len: usize,
    /// Payload plus RTP and payload header.
    pub pkt_size: usize,
    pub total_pkts: u32,
    /// GPM_SL only; zero otherwise.
    pub pkts_in_line: u32,
    pub bytes_in_line: usize,
    /// Tight packed frame size on the wire.
    pub frame_size: usize,
    /// Packets that straddle a line boundary and carry a second row
    /// descriptor.
    pub extra_pkts: u32,
    /// Payload bytes of the final packet, when shorter than `pkt_len`.
    pub last_pkt_len: usize,
}

impl PacketGeometry {
    /// Compute the geometry of an uncompressed session.
    ///
    /// For interlaced rasters the height is the field height.
    ///
    /// # Test
    ///
    /// ```
    /// use st2110_service::fmt::{PacketGeometry, Packing, VideoFormat};
    ///
    /// // 1080p 4:2:2 10 bit block packing: 5.184.000 byte frames
    /// let geo =
    ///     PacketGeometry::compute(1920, 1080, VideoFormat::Yuv422_10bit, Packing::Bpm, false)
    ///         .unwrap();
    ///
    /// assert_eq!(geo.frame_size, 5_184_000);
    /// assert_eq!(geo.pkt_len, 1260);
    /// assert_eq!(geo.total_pkts, 4115);
    /// assert_eq!(geo.last_pkt_len, 5_184_000 % 1260);
    /// ```
    pub fn compute(
        width: u32,
        height: u32,
        fmt: VideoFormat,
        packing: Packing,
        interlaced: bool,
    ) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidArgument);
        }

        let pg = fmt.pixel_group();
        if width % pg.coverage != 0 && width > 1 {
            return Err(Error::InvalidArgument);
        }

        let height = if interlaced { height / 2 } else { height };
        let bytes_in_line = (width as usize).div_ceil(pg.coverage as usize) * pg.size as usize;
        let frame_size = bytes_in_line * height as usize;

        let geometry = match packing {
            Packing::GpmSl => {
                let bytes_in_pkt =
                    PKT_MAX_ETHER_BYTES - PKT_L2L4_OVERHEAD - RtpHeader::SIZE - rfc4175::PayloadHeader::SIZE;
                let pkts_in_line = (bytes_in_line / bytes_in_pkt) as u32 + 1;
                let pixel_in_pkt = width.div_ceil(pkts_in_line);
                let pkt_len =
                    (pixel_in_pkt.div_ceil(pg.coverage) * pg.size) as usize;
                let last_pkt_len = bytes_in_line - pkt_len * (pkts_in_line as usize - 1);

                Self {
                    pkt_len,
                    pkt_size: pkt_len + RtpHeader::SIZE + rfc4175::PayloadHeader::SIZE,
                    total_pkts: height * pkts_in_line,
                    pkts_in_line,
                    bytes_in_line,
                    frame_size,
                    extra_pkts: 0,
                    last_pkt_len: if last_pkt_len == pkt_len { 0 } else { last_pkt_len },
                }
            }
            Packing::Bpm => Self::block(width, height, bytes_in_line, frame_size, BPM_PAYLOAD_BYTES),
            Packing::Gpm => {
                let max_data_len = PKT_MAX_UDP_BYTES
                    - RtpHeader::SIZE
                    - rfc4175::PayloadHeader::SIZE
                    - rfc4175::RowDescriptor::SIZE;
                let align = (pg.size * 2) as usize;
                let max_data_len = max_data_len / align * align;
                let pg_per_pkt = max_data_len / pg.size as usize;
                let pkt_len = pg_per_pkt * pg.size as usize;

                Self::block(width, height, bytes_in_line, frame_size, pkt_len)
            }
        };

        if geometry.pkt_size > PKT_MAX_ETHER_BYTES - PKT_L2L4_OVERHEAD {
            return Err(Error::InvalidArgument);
        }

        Ok(geometry)
    }

    fn block(
        _width: u32,
        height: u32,
        bytes_in_line: usize,
        frame_size: usize,
        pkt_len: usize,
    ) -> Self {
        let total_pkts = frame_size.div_ceil(pkt_len) as u32;
        let last_pkt_len = frame_size % pkt_len;

        // count the lines whose start coincides with a packet start; all
        // other line transitions happen inside a packet and need a second
        // row descriptor
        let mut span = bytes_in_line;
        while span % pkt_len != 0 && span <= frame_size {
            span += bytes_in_line;
        }
        let none_extra_lines = frame_size.div_ceil(span) as u32;
        let extra_pkts = height.saturating_sub(none_extra_lines);

        Self {
            pkt_len,
            pkt_size: pkt_len + RtpHeader::SIZE + rfc4175::PayloadHeader::SIZE,
            total_pkts,
            pkts_in_line: 0,
            bytes_in_line,
            frame_size,
            extra_pkts,
            last_pkt_len,
        }
    }

    /// Compute the geometry of an ST 2110-22 codestream frame (box prefix
    /// included in `frame_size`).
    ///
    /// # Test
    ///
    /// ```
    /// use st2110_service::fmt::PacketGeometry;
    ///
    /// let geo = PacketGeometry::compute_st22(6_600_000);
    /// assert_eq!(geo.total_pkts, (6_600_000 + geo.pkt_len - 1) as u32 / geo.pkt_len as u32);
    /// assert_eq!(geo.pkt_len % 128, 0);
    /// ```
    pub fn compute_st22(frame_size: usize) -> Self {
        let max_data_len = PKT_MAX_UDP_BYTES - RtpHeader::SIZE - rfc9134::PayloadHeader::SIZE;
        let align = 128;
        let pkt_len = max_data_len / align * align;

        Self {
            pkt_len,
            pkt_size: pkt_len + RtpHeader::SIZE + rfc9134::PayloadHeader::SIZE,
            total_pkts: frame_size.div_ceil(pkt_len) as u32,
            pkts_in_line: 0,
            bytes_in_line: 0,
            frame_size,
            extra_pkts: 0,
            last_pkt_len: frame_size % pkt_len,
        }
    }

    /// The session bandwidth in Mbit/s, used for scheduler quota.
    pub fn bandwidth_mbps(&self, fps: Fps) -> u32 {
        let tm = fps.timing();
        let bits = (self.pkt_size + PKT_L2L4_OVERHEAD) as u64 * self.total_pkts as u64 * 8;
        (bits * tm.mul as u64 / tm.den as u64 / 1_000_000) as u32 + 1
    }
}
