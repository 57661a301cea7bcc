//! ## ST 2110 session machinery
//!
//! The platform independent half of the transport: video formats and
//! packet geometry, frame buffer pools and their lifecycle, the ST 2110-21
//! pacing engine, receive side reassembly slots, and the timing
//! conformance parser. Everything here is driven by the runtime crate's
//! schedulers and device layer; nothing in this crate touches a socket or
//! spawns a thread.

pub mod convert;
pub mod fmt;
pub mod frame;
pub mod pacing;
pub mod slot;
pub mod timing;

use self::fmt::{Fps, VideoFormat};
use self::frame::RxFrame;

/// The error kinds of the transport, carried as a small enum and never as
/// strings.
///
/// `Dropped` is special: a dropped receive packet is always counted and
/// never surfaced as a per-call error to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidArgument,
    Capacity,
    OutOfLcores,
    AlreadyRunning,
    InvalidState,
    WouldBlock,
    NoBuffer,
    Overflow,
    HardwareError,
    Dropped,
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Session flags, a bit-or of `FLAG_*` values recognized at create time.
pub type SessionFlags = u32;

pub const FLAG_USER_PACING: SessionFlags = 1 << 0;
pub const FLAG_USER_TIMESTAMP: SessionFlags = 1 << 1;
pub const FLAG_ENABLE_RTCP: SessionFlags = 1 << 2;
pub const FLAG_ENABLE_VSYNC: SessionFlags = 1 << 3;
pub const FLAG_RECEIVE_INCOMPLETE_FRAME: SessionFlags = 1 << 4;
pub const FLAG_DMA_OFFLOAD: SessionFlags = 1 << 5;
pub const FLAG_DATA_PATH_ONLY: SessionFlags = 1 << 6;
pub const FLAG_HDR_SPLIT: SessionFlags = 1 << 7;
pub const FLAG_FORCE_NUMA: SessionFlags = 1 << 8;
pub const FLAG_USER_P_MAC: SessionFlags = 1 << 9;
pub const FLAG_USER_R_MAC: SessionFlags = 1 << 10;
pub const FLAG_EXACT_USER_PACING: SessionFlags = 1 << 11;
pub const FLAG_RTP_TIMESTAMP_EPOCH: SessionFlags = 1 << 12;
pub const FLAG_DISABLE_BULK: SessionFlags = 1 << 13;
pub const FLAG_STATIC_PAD_P: SessionFlags = 1 << 14;
pub const FLAG_USE_MULTI_THREADS: SessionFlags = 1 << 15;
pub const FLAG_TSC_PACING: SessionFlags = 1 << 16;

/// How an application supplied timestamp is to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimestampFormat {
    /// 32 bit media clock ticks (90 kHz for video).
    #[default]
    MediaClock,
    /// Nanoseconds since the PTP epoch.
    Tai,
}

/// Convert a user timestamp to 32 bit media clock ticks.
///
/// # Test
///
/// ```
/// use st2110_service::{media_clock, TimestampFormat};
///
/// assert_eq!(media_clock(TimestampFormat::MediaClock, 1234, 90_000), 1234);
/// assert_eq!(media_clock(TimestampFormat::Tai, 1_000_000_000, 90_000), 90_000);
/// ```
pub fn media_clock(tfmt: TimestampFormat, timestamp: u64, rate: u32) -> u32 {
    match tfmt {
        TimestampFormat::MediaClock => timestamp as u32,
        TimestampFormat::Tai => {
            ((timestamp as u128 * rate as u128 / 1_000_000_000) % (1u128 << 32)) as u32
        }
    }
}

/// Completion status of a delivered receive frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    Complete,
    Incomplete,
}

impl FrameStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Metadata travelling with a transmit video frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxVideoMeta {
    pub width: u32,
    pub height: u32,
    pub fps: Option<Fps>,
    pub fmt: Option<VideoFormat>,
    pub second_field: bool,
    pub tfmt: TimestampFormat,
    /// User supplied timestamp, zero when the pacer decides.
    pub timestamp: u64,
    /// ST 2110-22 only: the codestream size of this frame.
    pub codestream_size: usize,
}

/// Metadata delivered together with a receive video frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct RxVideoMeta {
    pub width: u32,
    pub height: u32,
    pub fps: Option<Fps>,
    pub fmt: Option<VideoFormat>,
    pub second_field: bool,
    pub rtp_timestamp: u32,
    pub status: FrameStatus,
    pub frame_recv_size: usize,
    pub pkts_total: u32,
    /// Packets accepted per session port, primary then redundant.
    pub pkts_recv: [u32; 2],
}

/// The transmit side application contract for video sessions.
///
/// Both callbacks run on the scheduler's worker; they must not block and
/// must tolerate re-entry within one tasklet round (the completion of
/// frame N and the request for frame N + 1 can interleave).
pub trait TxVideoHandler: Send {
    /// Hand the transport the index of the next READY frame, filling in
    /// the meta (user timestamp, second field, codestream size).
    ///
    /// Return [`Error::WouldBlock`] when no frame is ready yet; the build
    /// tasklet will retry next round.
    fn next_frame(&mut self, meta: &mut TxVideoMeta) -> Result<u16, Error>;

    /// The final packet of frame `idx` left the NIC and the buffer
    /// returned to FREE.
    #[allow(unused_variables)]
    fn frame_done(&mut self, idx: u16, meta: &TxVideoMeta) {}

    /// Slice mode: how many lines of frame `idx` are ready for building.
    /// The default reports the whole frame.
    #[allow(unused_variables)]
    fn lines_ready(&mut self, idx: u16) -> u16 {
        u16::MAX
    }
}

/// The receive side application contract for video sessions.
pub trait RxVideoHandler: Send {
    /// A frame completed (or was delivered incomplete, if the session
    /// opted in). Returning an error hands the buffer straight back to
    /// the pool.
    fn frame_ready(&mut self, frame: RxFrame, meta: &RxVideoMeta) -> Result<(), Error>;
}

/// Metadata for audio and ancillary frames; both directions share it.
#[derive(Debug, Clone, Copy, Default)]
pub struct MediaMeta {
    pub tfmt: TimestampFormat,
    pub timestamp: u64,
    pub rtp_timestamp: u32,
    pub size: usize,
    /// Ancillary only: data packets in the frame.
    pub anc_count: u8,
    pub second_field: bool,
}

pub trait TxMediaHandler: Send {
    /// Index of the next frame to send.
    fn next_frame(&mut self, meta: &mut MediaMeta) -> Result<u16, Error>;

    #[allow(unused_variables)]
    fn frame_done(&mut self, idx: u16, meta: &MediaMeta) {}
}

pub trait RxMediaHandler: Send {
    fn frame_ready(&mut self, frame: RxFrame, meta: &MediaMeta) -> Result<(), Error>;
}
