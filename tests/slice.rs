mod common;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use common::{Consumer, drive, rig, RX_IP};
use parking_lot::Mutex;
use service::{
    Error, TxVideoHandler, TxVideoMeta,
    fmt::{Fps, Packing},
};
use st2110::{rx::video::RxVideoConfig, tx::video::TxVideoConfig};

/// A slice producer: frames become ready 180 lines at a time, each
/// `lines_ready` poll advancing the watermark.
struct SliceProducer {
    ready: Arc<Mutex<VecDeque<u16>>>,
    lines: u16,
    polls: Arc<Mutex<Vec<u16>>>,
}

impl TxVideoHandler for SliceProducer {
    fn next_frame(&mut self, _meta: &mut TxVideoMeta) -> Result<u16, Error> {
        let idx = self.ready.lock().pop_front().ok_or(Error::WouldBlock)?;
        self.lines = 0;
        Ok(idx)
    }

    fn lines_ready(&mut self, _idx: u16) -> u16 {
        self.lines = (self.lines + 180).min(720);
        self.polls.lock().push(self.lines);
        self.lines
    }
}

/// 720p60 slice mode: the builder trails the application's line
/// watermark, frames arrive in order and no reassembly slot is ever
/// evicted.
#[test]
fn slice_mode_720p60() {
    let rig = rig(1);
    const FRAMES: usize = 8;

    let ready = Arc::new(Mutex::new(VecDeque::new()));
    let polls = Arc::new(Mutex::new(Vec::new()));
    let producer = SliceProducer {
        ready: ready.clone(),
        lines: 0,
        polls: polls.clone(),
    };
    let (consumer, delivered) = Consumer::new(0);

    let tx_cfg = TxVideoConfig {
        name: "tvslice".to_string(),
        dst_ip: [RX_IP, RX_IP],
        width: 1280,
        height: 720,
        fps: Fps::P60,
        packing: Packing::GpmSl,
        slice_mode: true,
        ..Default::default()
    };
    let tx = rig
        .tx
        .create_tx_video(&[0], &tx_cfg, Box::new(producer))
        .unwrap();

    let rx_cfg = RxVideoConfig {
        name: "rvslice".to_string(),
        ip: [RX_IP, RX_IP],
        width: 1280,
        height: 720,
        fps: Fps::P60,
        packing: Packing::GpmSl,
        ..Default::default()
    };
    rig.rx
        .create_rx_video(&[0], &rx_cfg, Box::new(consumer))
        .unwrap();

    let mut sent = 0usize;
    drive(&rig.clock, 200_000, || {
        if sent < FRAMES {
            if let Ok(guard) = tx.buffer_get(Duration::ZERO) {
                let idx = guard.index();
                guard.put(TxVideoMeta::default());
                ready.lock().push_back(idx);
                sent += 1;
            }
        }
        delivered.lock().len() >= FRAMES
    });

    // in order delivery: timestamps strictly increase
    let frames = delivered.lock();
    for pair in frames.windows(2) {
        let delta = pair[1]
            .meta
            .rtp_timestamp
            .wrapping_sub(pair[0].meta.rtp_timestamp);
        assert!((delta as i32) > 0);
        assert!(pair[0].meta.status.is_complete());
    }

    // the watermark was actually consulted, stepping by 180
    let polls = polls.lock();
    assert!(!polls.is_empty());
    assert!(polls.iter().all(|lines| lines % 180 == 0));

    // and no slot eviction occurred on the receiver
    let stats = rig
        .rx
        .statistics()
        .get(&st2110::statistics::SessionId {
            kind: st2110::statistics::SessionKind::RxVideo,
            idx: 0,
        })
        .unwrap();
    assert_eq!(stats.slot_evictions, 0);
    assert_eq!(stats.frames_dropped, 0);
}
