//! Receive side reassembly slots.
//!
//! A session keeps a handful of slots so packets of up to that many
//! frames can interleave on the wire. Each slot binds one RTP timestamp
//! to a frame buffer, remembers the sequence number of the first packet
//! it saw, and tracks arrival in a completion bitmap (one bit per packet
//! index). When a timestamp matches no slot and none is free, the slot
//! with the oldest activity is evicted.

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::BytesMut;

use super::Error;

/// The recommended out of order window.
pub const NUM_SLOTS: usize = 4;

pub struct Slot {
    pub timestamp: u32,
    pub seq_id_base: u32,
    pub seq_id_got: bool,
    pub frame: Option<BytesMut>,
    pub frame_recv_size: usize,
    /// Packets accepted per session port.
    pub pkts_recv: [u32; 2],
    pub second_field: bool,
    pub marker_seen: bool,
    /// Total packet count learned from the marker packet (compressed
    /// streams); zero until known.
    pub pkts_total: u32,
    /// TSC of the last accepted packet, the eviction key.
    pub last_activity: u64,
    bitmap: Vec<AtomicU8>,
    in_use: bool,
}

impl Slot {
    fn new(bitmap_bits: u32) -> Self {
        Self {
            timestamp: 0,
            seq_id_base: 0,
            seq_id_got: false,
            frame: None,
            frame_recv_size: 0,
            pkts_recv: [0; 2],
            second_field: false,
            marker_seen: false,
            pkts_total: 0,
            last_activity: 0,
            bitmap: (0..(bitmap_bits as usize).div_ceil(8))
                .map(|_| AtomicU8::new(0))
                .collect(),
            in_use: false,
        }
    }

    /// Packet index relative to the first packet of this frame, with
    /// 32 bit wrap handling.
    pub fn pkt_idx(&self, seq_id: u32) -> Result<u32, Error> {
        let idx = seq_id.wrapping_sub(self.seq_id_base);
        if idx as usize >= self.bitmap.len() * 8 {
            return Err(Error::Dropped);
        }

        Ok(idx)
    }

    /// Atomically mark packet `idx` received; true when the bit was
    /// already set (a duplicate).
    pub fn test_and_set(&self, idx: u32) -> bool {
        let byte = &self.bitmap[idx as usize / 8];
        let mask = 1u8 << (idx % 8);
        byte.fetch_or(mask, Ordering::AcqRel) & mask != 0
    }

    pub fn bits_set(&self) -> u32 {
        self.bitmap
            .iter()
            .map(|b| b.load(Ordering::Acquire).count_ones())
            .sum()
    }

    fn reset(&mut self, timestamp: u32, frame: Option<BytesMut>, now: u64) {
        self.timestamp = timestamp;
        self.seq_id_base = 0;
        self.seq_id_got = false;
        self.frame = frame;
        self.frame_recv_size = 0;
        self.pkts_recv = [0; 2];
        self.second_field = false;
        self.marker_seen = false;
        self.pkts_total = 0;
        self.last_activity = now;
        for byte in &self.bitmap {
            byte.store(0, Ordering::Release);
        }
        self.in_use = true;
    }

    /// Hand the frame out for delivery and leave the slot reusable.
    pub fn take_frame(&mut self) -> Option<BytesMut> {
        self.in_use = false;
        self.frame_recv_size = 0;
        self.frame.take()
    }
}

/// What fell out of the table when a new timestamp forced an eviction.
pub struct Evicted {
    pub timestamp: u32,
    pub frame: Option<BytesMut>,
    pub frame_recv_size: usize,
    pub pkts_recv: [u32; 2],
    pub second_field: bool,
    pub bits_set: u32,
}

pub struct SlotTable {
    slots: Vec<Slot>,
}

impl SlotTable {
    pub fn new(num_slots: usize, bitmap_bits: u32) -> Self {
        Self {
            slots: (0..num_slots).map(|_| Slot::new(bitmap_bits)).collect(),
        }
    }

    pub fn get(&self, idx: usize) -> &Slot {
        &self.slots[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Slot {
        &mut self.slots[idx]
    }

    /// Find the slot bound to `timestamp`, or rebind the least recently
    /// active one. The partial state of an evicted slot is returned so
    /// the session can drop it or deliver it incomplete.
    ///
    /// `frame` supplies the buffer for a fresh binding; `None` leaves the
    /// binding frameless (the caller failed to get a pool buffer and
    /// counts the loss).
    pub fn find_or_evict(
        &mut self,
        timestamp: u32,
        now: u64,
        frame: impl FnOnce() -> Option<BytesMut>,
    ) -> (usize, Option<Evicted>) {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.in_use && slot.timestamp == timestamp {
                return (idx, None);
            }
        }

        // prefer an idle slot, else evict the stalest
        let idx = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_use)
            .map(|(i, _)| i)
            .next()
            .unwrap_or_else(|| {
                self.slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.last_activity)
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            });

        let slot = &mut self.slots[idx];
        let evicted = if slot.in_use {
            Some(Evicted {
                timestamp: slot.timestamp,
                frame: slot.frame.take(),
                frame_recv_size: slot.frame_recv_size,
                pkts_recv: slot.pkts_recv,
                second_field: slot.second_field,
                bits_set: slot.bits_set(),
            })
        } else {
            None
        };

        slot.reset(timestamp, frame(), now);
        (idx, evicted)
    }

    /// Whether any slot is currently bound to `timestamp`.
    pub fn contains(&self, timestamp: u32) -> bool {
        self.slots
            .iter()
            .any(|s| s.in_use && s.timestamp == timestamp)
    }
}
