mod common;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use common::{drive, rig, RX_IP};
use parking_lot::Mutex;
use service::{Error, MediaMeta, RxMediaHandler, TxMediaHandler, frame::RxFrame};
use st2110::{
    rx::{anc::RxAncConfig, audio::RxAudioConfig},
    tx::{anc::TxAncConfig, audio::TxAudioConfig},
};

struct MediaProducer {
    ready: Arc<Mutex<VecDeque<(u16, MediaMeta)>>>,
}

impl TxMediaHandler for MediaProducer {
    fn next_frame(&mut self, meta: &mut MediaMeta) -> Result<u16, Error> {
        let (idx, stored) = self.ready.lock().pop_front().ok_or(Error::WouldBlock)?;
        *meta = stored;
        Ok(idx)
    }
}

struct MediaConsumer {
    frames: Arc<Mutex<Vec<(MediaMeta, Vec<u8>)>>>,
}

impl RxMediaHandler for MediaConsumer {
    fn frame_ready(&mut self, frame: RxFrame, meta: &MediaMeta) -> Result<(), Error> {
        self.frames.lock().push((*meta, frame.to_vec()));
        Ok(())
    }
}

/// A millisecond ptime PCM stream crosses the loop intact, one packet
/// per epoch, frames a whole number of packets long.
#[test]
fn audio_pcm24_roundtrip() {
    let rig = rig(1);
    const FRAMES: usize = 6;

    let ready = Arc::new(Mutex::new(VecDeque::new()));
    let frames = Arc::new(Mutex::new(Vec::new()));

    let tx = rig
        .tx
        .create_tx_audio(
            &[0],
            &TxAudioConfig {
                name: "ta".to_string(),
                dst_ip: [RX_IP, RX_IP],
                ..Default::default()
            },
            Box::new(MediaProducer {
                ready: ready.clone(),
            }),
        )
        .unwrap();

    rig.rx
        .create_rx_audio(
            &[0],
            &RxAudioConfig {
                name: "ra".to_string(),
                ip: [RX_IP, RX_IP],
                ..Default::default()
            },
            Box::new(MediaConsumer {
                frames: frames.clone(),
            }),
        )
        .unwrap();

    // 48 samples x 2ch x 3B = 288 bytes per packet, 10 packets per frame
    assert_eq!(tx.frame_size(), 2880);

    let mut sent = 0usize;
    drive(&rig.clock, 100_000, || {
        if sent < FRAMES {
            if let Ok(mut guard) = tx.buffer_get(Duration::ZERO) {
                common::fill_pattern(guard.as_mut(), sent as u8);
                let idx = guard.index();
                guard.put(MediaMeta::default());
                ready.lock().push_back((idx, MediaMeta::default()));
                sent += 1;
            }
        }
        frames.lock().len() >= FRAMES
    });

    let frames = frames.lock();
    assert!(frames.len() >= FRAMES);

    for (i, (meta, payload)) in frames.iter().take(FRAMES).enumerate() {
        assert_eq!(meta.size, 2880);
        let mut want = vec![0u8; 2880];
        common::fill_pattern(&mut want, i as u8);
        assert_eq!(payload, &want, "frame {i}");
    }

    // timestamps advance by one frame of samples
    for pair in frames.windows(2) {
        let delta = pair[1].0.rtp_timestamp.wrapping_sub(pair[0].0.rtp_timestamp);
        assert_eq!(delta, 480);
    }
}

/// Ancillary data packets survive the payload header and parity words.
#[test]
fn ancillary_roundtrip() {
    let rig = rig(1);
    const FRAMES: usize = 4;

    let ready = Arc::new(Mutex::new(VecDeque::new()));
    let frames = Arc::new(Mutex::new(Vec::new()));

    let tx = rig
        .tx
        .create_tx_anc(
            &[0],
            &TxAncConfig {
                name: "tanc".to_string(),
                dst_ip: [RX_IP, RX_IP],
                ..Default::default()
            },
            Box::new(MediaProducer {
                ready: ready.clone(),
            }),
        )
        .unwrap();

    rig.rx
        .create_rx_anc(
            &[0],
            &RxAncConfig {
                name: "ranc".to_string(),
                ip: [RX_IP, RX_IP],
                ..Default::default()
            },
            Box::new(MediaConsumer {
                frames: frames.clone(),
            }),
        )
        .unwrap();

    // one packed ancillary data packet per frame
    let mut words = bytes::BytesMut::new();
    codec::anc::AncPacket {
        color_channel: false,
        line_number: 9,
        horizontal_offset: 0,
        stream_num: 0,
        did: 0x45,
        sdid: 0x01,
        data: &[1, 2, 3, 4, 5, 6, 7, 8],
    }
    .encode(&mut words);

    let mut sent = 0usize;
    drive(&rig.clock, 200_000, || {
        if sent < FRAMES {
            if let Ok(mut guard) = tx.buffer_get(Duration::ZERO) {
                guard.as_mut()[..words.len()].copy_from_slice(&words);
                let idx = guard.index();
                let meta = MediaMeta {
                    size: words.len(),
                    anc_count: 1,
                    ..Default::default()
                };
                guard.put(meta);
                ready.lock().push_back((idx, meta));
                sent += 1;
            }
        }
        frames.lock().len() >= FRAMES
    });

    let frames = frames.lock();
    assert!(frames.len() >= FRAMES);

    for (meta, payload) in frames.iter().take(FRAMES) {
        assert_eq!(meta.anc_count, 1);
        assert_eq!(payload.len(), words.len());

        let decoded = codec::anc::AncPacket::decode(payload).unwrap();
        assert_eq!(decoded.did, 0x45);
        assert_eq!(decoded.sdid, 0x01);
        assert_eq!(decoded.data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decoded.line_number, 9);
    }
}
