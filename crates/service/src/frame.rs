//! Frame buffer pools and their lifecycle.
//!
//! A transmit frame walks FREE → APP_OWNED → READY → TRANSMITTING → FREE.
//! The FREE → APP_OWNED claim is a compare and swap, so concurrent
//! callers can never own the same index. While TRANSMITTING the payload
//! is a frozen [`Bytes`] and every packet holds a zero copy slice of it;
//! the buffer only returns to FREE once all slices are gone
//! (`try_into_mut` succeeds), which is the refcount guard against
//! reusing a frame with packets still in flight.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use super::{Error, TxVideoMeta, convert::ConvertFn};

pub const FRAME_FREE: u8 = 0;
pub const FRAME_APP_OWNED: u8 = 1;
pub const FRAME_READY: u8 = 2;
pub const FRAME_TRANSMITTING: u8 = 3;

enum Payload {
    Empty,
    Writable(BytesMut),
    Shared(Bytes),
}

struct TxFrameEntry<M> {
    state: AtomicU8,
    payload: Mutex<Payload>,
    /// The application side buffer when a pixel format conversion is
    /// configured; the transport buffer then only ever holds converted
    /// data.
    side: Mutex<Option<BytesMut>>,
    meta: Mutex<M>,
}

/// The transmit frame pool of one session. The meta type defaults to
/// video; audio and ancillary sessions instantiate their own.
pub struct TxFramePool<M: Copy + Default = TxVideoMeta> {
    entries: Vec<TxFrameEntry<M>>,
    frame_size: usize,
    converter: Option<ConvertFn>,
    /// Width and height the converter runs at.
    raster: (u32, u32),
    free_lock: Mutex<()>,
    free_cond: Condvar,
}

impl<M: Copy + Default> TxFramePool<M> {
    /// Allocate `count` frames of `frame_size` bytes. At least two
    /// buffers are required so the application can fill one while the
    /// transport drains another.
    pub fn new(count: u16, frame_size: usize) -> Result<Arc<Self>, Error> {
        Self::with_converter(count, frame_size, 0, None, (0, 0))
    }

    /// `side_size` is the application format's frame size, which can
    /// differ from the transport size when a converter is configured.
    pub fn with_converter(
        count: u16,
        frame_size: usize,
        side_size: usize,
        converter: Option<ConvertFn>,
        raster: (u32, u32),
    ) -> Result<Arc<Self>, Error> {
        if count < 2 || frame_size == 0 {
            return Err(Error::InvalidArgument);
        }

        let entries = (0..count)
            .map(|_| TxFrameEntry {
                state: AtomicU8::new(FRAME_FREE),
                payload: Mutex::new(Payload::Writable(BytesMut::zeroed(frame_size))),
                side: Mutex::new(converter.map(|_| BytesMut::zeroed(side_size))),
                meta: Mutex::new(M::default()),
            })
            .collect();

        Ok(Arc::new(Self {
            entries,
            frame_size,
            converter,
            raster,
            free_lock: Mutex::new(()),
            free_cond: Condvar::new(),
        }))
    }

    pub fn count(&self) -> u16 {
        self.entries.len() as u16
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Claim a FREE buffer for the application.
    ///
    /// With a zero timeout this is the non blocking form and returns
    /// [`Error::WouldBlock`] when every buffer is busy; otherwise the
    /// call parks until a buffer frees up or the timeout elapses
    /// ([`Error::NoBuffer`]).
    pub fn get(self: &Arc<Self>, timeout: Duration) -> Result<TxFrameGuard<M>, Error> {
        loop {
            if let Some(guard) = self.try_claim() {
                return Ok(guard);
            }

            if timeout.is_zero() {
                return Err(Error::WouldBlock);
            }

            let mut lock = self.free_lock.lock();
            if self
                .free_cond
                .wait_for(&mut lock, timeout)
                .timed_out()
            {
                return match self.try_claim() {
                    Some(guard) => Ok(guard),
                    None => Err(Error::NoBuffer),
                };
            }
        }
    }

    fn try_claim(self: &Arc<Self>) -> Option<TxFrameGuard<M>> {
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry
                .state
                .compare_exchange(
                    FRAME_FREE,
                    FRAME_APP_OWNED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // hand out the side buffer when converting, the
                // transport buffer otherwise
                let payload = match self.converter {
                    Some(_) => entry.side.lock().take(),
                    None => {
                        let mut payload = entry.payload.lock();
                        match std::mem::replace(&mut *payload, Payload::Empty) {
                            Payload::Writable(buf) => Some(buf),
                            other => {
                                *payload = other;
                                None
                            }
                        }
                    }
                };

                let payload = match payload {
                    Some(buf) => buf,
                    // lifecycle violation, give the slot back
                    None => {
                        entry.state.store(FRAME_FREE, Ordering::Release);
                        continue;
                    }
                };

                return Some(TxFrameGuard {
                    pool: self.clone(),
                    idx: idx as u16,
                    payload: Some(payload),
                });
            }
        }

        None
    }

    fn put_internal(&self, idx: u16, mut buf: BytesMut, meta: M) {
        let entry = &self.entries[idx as usize];

        if let Some(convert) = self.converter {
            // the guard carried the side buffer; convert into the
            // transport backing
            let mut payload = entry.payload.lock();
            if let Payload::Writable(dst) = &mut *payload {
                let (width, height) = self.raster;
                let _ = convert(&buf, dst, width, height);
            }
            *entry.side.lock() = Some(buf);
        } else {
            if buf.len() != self.frame_size {
                buf.resize(self.frame_size, 0);
            }
            *entry.payload.lock() = Payload::Writable(buf);
        }

        *entry.meta.lock() = meta;
        entry.state.store(FRAME_READY, Ordering::Release);
    }

    fn abandon(&self, idx: u16, buf: BytesMut) {
        let entry = &self.entries[idx as usize];

        match self.converter {
            Some(_) => *entry.side.lock() = Some(buf),
            None => *entry.payload.lock() = Payload::Writable(buf),
        }

        entry.state.store(FRAME_FREE, Ordering::Release);
        self.free_cond.notify_one();
    }

    /// The state of a frame, for tests and statistics.
    pub fn state(&self, idx: u16) -> u8 {
        self.entries[idx as usize].state.load(Ordering::Acquire)
    }

    /// READY → TRANSMITTING: freeze the payload and return the shared
    /// handle the builder slices packets from.
    pub fn begin_transmit(&self, idx: u16) -> Result<(Bytes, M), Error> {
        let entry = self
            .entries
            .get(idx as usize)
            .ok_or(Error::InvalidArgument)?;

        entry
            .state
            .compare_exchange(
                FRAME_READY,
                FRAME_TRANSMITTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::InvalidState)?;

        let mut payload = entry.payload.lock();
        let bytes = match std::mem::replace(&mut *payload, Payload::Empty) {
            Payload::Writable(buf) => buf.freeze(),
            Payload::Shared(bytes) => bytes,
            Payload::Empty => return Err(Error::InvalidState),
        };

        *payload = Payload::Shared(bytes.clone());
        Ok((bytes, *entry.meta.lock()))
    }

    /// TRANSMITTING → FREE, once every packet slice is gone.
    ///
    /// Returns false while packets still reference the frame; the caller
    /// retries on a later round.
    pub fn complete(&self, idx: u16) -> bool {
        let entry = &self.entries[idx as usize];
        let mut payload = entry.payload.lock();

        let bytes = match std::mem::replace(&mut *payload, Payload::Empty) {
            Payload::Shared(bytes) => bytes,
            other => {
                *payload = other;
                return false;
            }
        };

        match bytes.try_into_mut() {
            Ok(buf) => {
                *payload = Payload::Writable(buf);
                drop(payload);
                entry.state.store(FRAME_FREE, Ordering::Release);
                self.free_cond.notify_one();
                true
            }
            Err(bytes) => {
                *payload = Payload::Shared(bytes);
                false
            }
        }
    }

    /// The user meta recorded at put time.
    pub fn meta(&self, idx: u16) -> M {
        *self.entries[idx as usize].meta.lock()
    }
}

/// An APP_OWNED transmit frame. Write the pixel data through
/// [`TxFrameGuard::as_mut`], then [`TxFrameGuard::put`] it back as READY.
/// Dropping the guard without putting abandons the frame back to FREE.
pub struct TxFrameGuard<M: Copy + Default = TxVideoMeta> {
    pool: Arc<TxFramePool<M>>,
    idx: u16,
    payload: Option<BytesMut>,
}

impl<M: Copy + Default> TxFrameGuard<M> {
    pub fn index(&self) -> u16 {
        self.idx
    }

    pub fn as_mut(&mut self) -> &mut [u8] {
        self.payload.as_mut().map(|b| b.as_mut()).unwrap_or(&mut [])
    }

    /// APP_OWNED → READY.
    pub fn put(mut self, meta: M) {
        if let Some(buf) = self.payload.take() {
            self.pool.put_internal(self.idx, buf, meta);
        }
    }
}

impl<M: Copy + Default> Drop for TxFrameGuard<M> {
    fn drop(&mut self) {
        if let Some(buf) = self.payload.take() {
            self.pool.abandon(self.idx, buf);
        }
    }
}

/// The receive frame pool: a free list of reusable buffers.
pub struct RxFramePool {
    free: Mutex<Vec<BytesMut>>,
    frame_size: usize,
}

impl RxFramePool {
    pub fn new(count: u16, frame_size: usize) -> Result<Arc<Self>, Error> {
        if count < 2 || frame_size == 0 {
            return Err(Error::InvalidArgument);
        }

        Ok(Arc::new(Self {
            free: Mutex::new(
                (0..count)
                    .map(|_| BytesMut::zeroed(frame_size))
                    .collect(),
            ),
            frame_size,
        }))
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Take a buffer for a reassembly slot, sized to one full frame.
    pub fn get(&self) -> Option<BytesMut> {
        self.free.lock().pop()
    }

    pub fn put(&self, mut buf: BytesMut) {
        buf.clear();
        buf.resize(self.frame_size, 0);
        self.free.lock().push(buf);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Wrap a filled buffer for delivery to the application.
    pub fn deliver(self: &Arc<Self>, payload: BytesMut) -> RxFrame {
        RxFrame {
            pool: self.clone(),
            payload: Some(payload),
        }
    }
}

/// A received frame on loan to the application; dropping it returns the
/// buffer to the pool.
pub struct RxFrame {
    pool: Arc<RxFramePool>,
    payload: Option<BytesMut>,
}

impl RxFrame {
    pub fn as_slice(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }
}

impl std::ops::Deref for RxFrame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl Drop for RxFrame {
    fn drop(&mut self) {
        if let Some(buf) = self.payload.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pool_needs_two_frames() {
        assert!(TxFramePool::<TxVideoMeta>::new(1, 64).is_err());
        assert!(TxFramePool::<TxVideoMeta>::new(2, 64).is_ok());
    }

    #[test]
    fn lifecycle_roundtrip() {
        let pool = TxFramePool::<TxVideoMeta>::new(2, 64).unwrap();

        let mut guard = pool.get(Duration::ZERO).unwrap();
        let idx = guard.index();
        assert_eq!(pool.state(idx), FRAME_APP_OWNED);

        guard.as_mut()[0] = 0xab;
        guard.put(TxVideoMeta::default());
        assert_eq!(pool.state(idx), FRAME_READY);

        let (bytes, _) = pool.begin_transmit(idx).unwrap();
        assert_eq!(pool.state(idx), FRAME_TRANSMITTING);
        assert_eq!(bytes[0], 0xab);

        // a packet slice keeps the frame busy
        let slice = bytes.slice(0..16);
        drop(bytes);
        assert!(!pool.complete(idx));
        assert_eq!(pool.state(idx), FRAME_TRANSMITTING);

        drop(slice);
        assert!(pool.complete(idx));
        assert_eq!(pool.state(idx), FRAME_FREE);
    }

    #[test]
    fn cas_prevents_double_claim() {
        let pool = TxFramePool::<TxVideoMeta>::new(2, 16).unwrap();

        let a = pool.get(Duration::ZERO).unwrap();
        let b = pool.get(Duration::ZERO).unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(pool.get(Duration::ZERO).unwrap_err(), Error::WouldBlock);

        // abandoning one frees its slot again
        drop(a);
        let c = pool.get(Duration::ZERO).unwrap();
        drop(b);
        drop(c);
    }

    #[test]
    fn concurrent_claims_never_alias() {
        let pool = TxFramePool::<TxVideoMeta>::new(4, 16).unwrap();
        let mut handles = Vec::new();

        for _ in 0..4 {
            let pool = pool.clone();
            handles.push(thread::spawn(move || {
                let mut got = Vec::new();
                for _ in 0..100 {
                    if let Ok(guard) = pool.get(Duration::ZERO) {
                        got.push(guard.index());
                        drop(guard);
                    }
                }
                got
            }));
        }

        for handle in handles {
            // every claim observed a valid index
            for idx in handle.join().unwrap() {
                assert!(idx < 4);
            }
        }

        // all frames returned to FREE
        for idx in 0..4 {
            assert_eq!(pool.state(idx), FRAME_FREE);
        }
    }

    #[test]
    fn get_with_timeout_wakes_on_free() {
        let pool = TxFramePool::<TxVideoMeta>::new(2, 16).unwrap();
        let a = pool.get(Duration::ZERO).unwrap();
        let b = pool.get(Duration::ZERO).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get(Duration::from_secs(2)).map(|g| g.index()))
        };

        thread::sleep(Duration::from_millis(50));
        drop(a);

        assert!(waiter.join().unwrap().is_ok());
        drop(b);
    }

    #[test]
    fn rx_pool_recycles() {
        let pool = RxFramePool::new(2, 128).unwrap();
        assert_eq!(pool.available(), 2);

        let buf = pool.get().unwrap();
        assert_eq!(pool.available(), 1);

        let frame = pool.deliver(buf);
        assert_eq!(frame.len(), 128);
        drop(frame);

        assert_eq!(pool.available(), 2);
    }
}
