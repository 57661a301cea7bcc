use std::time::Duration;

use anyhow::Result;
use st2110_service::{
    Error, TxVideoMeta,
    fmt::{Fps, Packing, PacketGeometry, VideoFormat},
    frame::{FRAME_FREE, FRAME_READY, FRAME_TRANSMITTING, RxFramePool, TxFramePool},
    pacing::Pacing,
    slot::{NUM_SLOTS, SlotTable},
};

/// The get/put law: every buffer cycles back to FREE within a bounded
/// number of transmit rounds, for every buffer of the pool.
#[test]
fn test_frame_lifecycle_law() -> Result<()> {
    let pool = TxFramePool::<TxVideoMeta>::new(4, 256)?;

    for _ in 0..3 {
        // claim and fill every buffer
        let mut claimed = Vec::new();
        for _ in 0..4 {
            claimed.push(pool.get(Duration::ZERO)?);
        }
        assert_eq!(pool.get(Duration::ZERO).unwrap_err(), Error::WouldBlock);

        let indices: Vec<u16> = claimed.iter().map(|g| g.index()).collect();
        for guard in claimed {
            guard.put(TxVideoMeta::default());
        }

        // transmit each: slices in flight hold the buffer, then FREE
        for idx in indices {
            assert_eq!(pool.state(idx), FRAME_READY);
            let (bytes, _) = pool.begin_transmit(idx)?;
            assert_eq!(pool.state(idx), FRAME_TRANSMITTING);

            let pkt_a = bytes.slice(0..128);
            let pkt_b = bytes.slice(128..256);
            drop(bytes);

            assert!(!pool.complete(idx));
            drop(pkt_a);
            assert!(!pool.complete(idx));
            drop(pkt_b);
            assert!(pool.complete(idx));
            assert_eq!(pool.state(idx), FRAME_FREE);
        }
    }

    Ok(())
}

/// A whole transmit frame walked through the slot table covers the
/// receive frame exactly once: every bit set, no overlap, full size.
#[test]
fn test_bitmap_covers_frame() -> Result<()> {
    let geometry =
        PacketGeometry::compute(1920, 1080, VideoFormat::Yuv422_10bit, Packing::Bpm, false)?;
    let pool = RxFramePool::new(2, geometry.frame_size)?;

    let mut table = SlotTable::new(NUM_SLOTS, geometry.total_pkts);
    let (idx, evicted) = table.find_or_evict(90_000, 1, || pool.get());
    assert!(evicted.is_none());

    let slot = table.get_mut(idx);
    slot.seq_id_base = 0xffff_fff0; // wrap within the frame
    slot.seq_id_got = true;

    let mut covered = 0usize;
    for pkt in 0..geometry.total_pkts {
        let seq = 0xffff_fff0u32.wrapping_add(pkt);
        let pkt_idx = slot.pkt_idx(seq)?;
        assert_eq!(pkt_idx, pkt);
        assert!(!slot.test_and_set(pkt_idx), "duplicate at {pkt}");

        covered += if pkt == geometry.total_pkts - 1 && geometry.last_pkt_len > 0 {
            geometry.last_pkt_len
        } else {
            geometry.pkt_len
        };
    }

    assert_eq!(slot.bits_set(), geometry.total_pkts);
    assert_eq!(covered, geometry.frame_size);
    Ok(())
}

/// Packet times within one frame are strictly monotonic and trs apart.
#[test]
fn test_packet_spacing_invariant() {
    let geometry =
        PacketGeometry::compute(1920, 1080, VideoFormat::Yuv422_10bit, Packing::GpmSl, false)
            .unwrap();
    let mut pacing = Pacing::new(1080, Fps::P50, false, geometry.total_pkts, false);
    pacing.sync(42 * 20_000_000, 1_000_000, None);

    let first = pacing.tsc_time_cursor;
    let mut prev = first;
    for pkt in 1..geometry.total_pkts as usize {
        pacing.forward();
        assert!(pacing.tsc_time_cursor > prev);
        let nominal = first + pkt as f64 * pacing.trs;
        assert!((pacing.tsc_time_cursor - nominal).abs() < 1.0);
        prev = pacing.tsc_time_cursor;
    }
}
