mod common;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use common::{Consumer, Producer, drive, fill_pattern, rig, RX_IP};
use parking_lot::Mutex;
use service::{
    FrameStatus, TxVideoMeta,
    convert::{self, FrameFormat},
    fmt::{Fps, Packing},
};
use st2110::{
    net::{FlowFilter, PortDevice},
    rx::video::RxVideoConfig,
    statistics::{SessionId, SessionKind},
    tx::video::TxVideoConfig,
};

fn feed_frames(
    handle: &st2110::tx::video::TxVideoHandle,
    ready: &Arc<Mutex<VecDeque<(u16, TxVideoMeta)>>>,
    seed: u8,
) -> bool {
    match handle.buffer_get(Duration::ZERO) {
        Ok(mut guard) => {
            fill_pattern(guard.as_mut(), seed);
            let idx = guard.index();
            guard.put(TxVideoMeta::default());
            ready.lock().push_back((idx, TxVideoMeta::default()));
            true
        }
        Err(_) => false,
    }
}

/// 1080p59.94 progressive 10 bit 4:2:2, block packing, single port,
/// TSC pacing: sixty frames arrive with 90 kHz timestamps stepping
/// 1501/1502.
#[test]
fn st20_1080p59_bpm_single_port() {
    let rig = rig(1);
    const FRAMES: usize = 60;

    let (producer, ready, done) = Producer::new();
    let (consumer, delivered) = Consumer::new(1);

    let tx_cfg = TxVideoConfig {
        name: "tv1080p59".to_string(),
        dst_ip: [RX_IP, RX_IP],
        fps: Fps::P59_94,
        packing: Packing::Bpm,
        framebuff_cnt: 3,
        ..Default::default()
    };
    let tx = rig
        .tx
        .create_tx_video(&[0], &tx_cfg, Box::new(producer))
        .unwrap();

    let rx_cfg = RxVideoConfig {
        name: "rv1080p59".to_string(),
        ip: [RX_IP, RX_IP],
        fps: Fps::P59_94,
        packing: Packing::Bpm,
        framebuff_cnt: 3,
        ..Default::default()
    };
    rig.rx
        .create_rx_video(&[0], &rx_cfg, Box::new(consumer))
        .unwrap();

    let mut sent = 0usize;
    drive(&rig.clock, 200_000, || {
        if sent < FRAMES && feed_frames(&tx, &ready, sent as u8) {
            sent += 1;
        }
        delivered.lock().len() >= FRAMES
    });

    let frames = delivered.lock();
    assert_eq!(frames.len(), FRAMES);

    // every frame complete, timestamps monotonic at the 59.94 cadence
    let mut deltas = Vec::new();
    for pair in frames.windows(2) {
        assert!(pair[0].meta.status.is_complete());
        let delta = pair[1]
            .meta
            .rtp_timestamp
            .wrapping_sub(pair[0].meta.rtp_timestamp);
        deltas.push(delta);
        assert!(delta == 1501 || delta == 1502, "delta {delta}");
    }
    assert!(deltas.contains(&1501) && deltas.contains(&1502));

    // byte exact identity on the captured frame
    let first = &frames[0];
    let mut want = vec![0u8; first.payload.len()];
    fill_pattern(&mut want, 0);
    assert_eq!(first.payload, want);
    assert_eq!(first.meta.frame_recv_size, 1920 * 1080 * 5 / 2);

    // the producer got all its buffers back
    drive(&rig.clock, 200_000, || done.lock().len() >= FRAMES);
}

/// 1080p25 single line packing over two redundant ports with ten
/// percent loss on the primary: every frame still completes, the
/// redundant port carrying at least as many of the wins.
#[test]
fn st20_1080p25_redundant_lossy_primary() {
    let rig = rig(2);
    const FRAMES: usize = 20;

    // drop 10 percent of everything arriving at the primary rx port
    rig.rx_ports[0].set_loss(1, 10);

    let (producer, ready, _done) = Producer::new();
    let (consumer, delivered) = Consumer::new(0);

    let tx_cfg = TxVideoConfig {
        name: "tv1080p25r".to_string(),
        num_ports: 2,
        dst_ip: [RX_IP, RX_IP],
        udp_port: [20000, 20002],
        fps: Fps::P25,
        packing: Packing::GpmSl,
        ..Default::default()
    };
    let tx = rig
        .tx
        .create_tx_video(&[0, 1], &tx_cfg, Box::new(producer))
        .unwrap();

    let rx_cfg = RxVideoConfig {
        name: "rv1080p25r".to_string(),
        num_ports: 2,
        ip: [RX_IP, RX_IP],
        udp_port: [20000, 20002],
        fps: Fps::P25,
        packing: Packing::GpmSl,
        ..Default::default()
    };
    rig.rx
        .create_rx_video(&[0, 1], &rx_cfg, Box::new(consumer))
        .unwrap();

    let mut sent = 0usize;
    drive(&rig.clock, 400_000, || {
        if sent < FRAMES && feed_frames(&tx, &ready, sent as u8) {
            sent += 1;
        }
        delivered.lock().len() >= FRAMES
    });

    let frames = delivered.lock();
    let mut wins = [0usize; 2];
    for frame in frames.iter() {
        assert_eq!(frame.meta.status, FrameStatus::Complete);
        if frame.meta.pkts_recv[1] > 0 {
            wins[1] += 1;
        } else {
            wins[0] += 1;
        }
    }

    assert!(
        wins[1] >= wins[0],
        "lossless port should win at least as often: {wins:?}"
    );
}

/// The RTP sequence numbers of one session are identical per packet
/// index on both redundant ports.
#[test]
fn redundant_ports_carry_identical_sequences() {
    let rig = rig(2);

    // tap the media flow on both rx ports
    let mut taps: Vec<_> = (0..2)
        .map(|i| {
            rig.rx_ports[i]
                .open_rx_queue(&FlowFilter::Udp {
                    dst_ip: RX_IP,
                    dst_port: 21000 + i as u16 * 2,
                    src_ip: None,
                })
                .unwrap()
        })
        .collect();

    let (producer, ready, _done) = Producer::new();

    let tx_cfg = TxVideoConfig {
        name: "tvseq".to_string(),
        num_ports: 2,
        dst_ip: [RX_IP, RX_IP],
        udp_port: [21000, 21002],
        width: 64,
        height: 4,
        fps: Fps::P50,
        packing: Packing::Bpm,
        ..Default::default()
    };
    let tx = rig
        .tx
        .create_tx_video(&[0, 1], &tx_cfg, Box::new(producer))
        .unwrap();

    let collected: Arc<Mutex<[Vec<u16>; 2]>> = Arc::new(Mutex::new([Vec::new(), Vec::new()]));

    let mut sent = 0usize;
    {
        let collected = collected.clone();
        drive(&rig.clock, 100_000, move || {
            if sent < 10 && feed_frames(&tx, &ready, sent as u8) {
                sent += 1;
            }

            let mut collected = collected.lock();
            for (port, tap) in taps.iter_mut().enumerate() {
                let mut pkts = Vec::new();
                tap.rx_burst(&mut pkts, 64);
                for pkt in &pkts {
                    // seq lives at rtp offset + 2
                    let at = 14 + 20 + 8 + 2;
                    collected[port]
                        .push(u16::from_be_bytes([pkt.head[at], pkt.head[at + 1]]));
                }
            }

            collected[0].len() >= 10 && collected[1].len() >= 10
        });
    }

    let collected = collected.lock();
    let n = collected[0].len().min(collected[1].len());
    assert!(n >= 10);
    assert_eq!(collected[0][..n], collected[1][..n]);
}

/// Loopback identity with an application stride: the receiver's offset
/// mapping inverts the sender's padded linesize handling.
#[test]
fn linesize_padding_roundtrip() {
    let rig = rig(1);

    // 512 pixel lines are 1280 wire bytes, so 1260 byte block packets
    // straddle every line; a 1500 byte stride forces the copy path
    let (width, height, linesize) = (512u32, 4u32, 1500usize);

    let (producer, ready, _done) = Producer::new();
    let (consumer, delivered) = Consumer::new(1);

    let tx_cfg = TxVideoConfig {
        name: "tvpad".to_string(),
        dst_ip: [RX_IP, RX_IP],
        width,
        height,
        fps: Fps::P50,
        packing: Packing::Bpm,
        linesize,
        ..Default::default()
    };
    let tx = rig
        .tx
        .create_tx_video(&[0], &tx_cfg, Box::new(producer))
        .unwrap();

    let rx_cfg = RxVideoConfig {
        name: "rvpad".to_string(),
        ip: [RX_IP, RX_IP],
        width,
        height,
        fps: Fps::P50,
        packing: Packing::Bpm,
        linesize,
        ..Default::default()
    };
    rig.rx
        .create_rx_video(&[0], &rx_cfg, Box::new(consumer))
        .unwrap();

    // fill only the active regions; the padding stays zero on both ends
    let mut sent = false;
    drive(&rig.clock, 100_000, || {
        if !sent {
            if let Ok(mut guard) = tx.buffer_get(Duration::ZERO) {
                let buf = guard.as_mut();
                for row in 0..height as usize {
                    let line = &mut buf[row * linesize..row * linesize + 1280];
                    fill_pattern(line, row as u8);
                }
                let idx = guard.index();
                guard.put(TxVideoMeta::default());
                ready.lock().push_back((idx, TxVideoMeta::default()));
                sent = true;
            }
        }
        !delivered.lock().is_empty()
    });

    let frames = delivered.lock();
    let got = &frames[0].payload;
    assert_eq!(got.len(), linesize * height as usize);

    for row in 0..height as usize {
        let mut want = vec![0u8; 1280];
        fill_pattern(&mut want, row as u8);
        assert_eq!(&got[row * linesize..row * linesize + 1280], &want[..], "row {row}");
    }
}

/// Dropped packets on a single path session surface as an incomplete
/// delivery when the flag asks for it, and as counted drops otherwise.
#[test]
fn incomplete_frame_delivery_flag() {
    let rig = rig(1);
    rig.rx_ports[0].set_loss(1, 4);

    let (producer, ready, _done) = Producer::new();
    let (consumer, delivered) = Consumer::new(0);

    let tx_cfg = TxVideoConfig {
        name: "tvloss".to_string(),
        dst_ip: [RX_IP, RX_IP],
        width: 640,
        height: 8,
        fps: Fps::P50,
        packing: Packing::GpmSl,
        ..Default::default()
    };
    let tx = rig
        .tx
        .create_tx_video(&[0], &tx_cfg, Box::new(producer))
        .unwrap();

    let rx_cfg = RxVideoConfig {
        name: "rvloss".to_string(),
        ip: [RX_IP, RX_IP],
        width: 640,
        height: 8,
        fps: Fps::P50,
        packing: Packing::GpmSl,
        flags: service::FLAG_RECEIVE_INCOMPLETE_FRAME,
        ..Default::default()
    };
    rig.rx
        .create_rx_video(&[0], &rx_cfg, Box::new(consumer))
        .unwrap();

    let mut sent = 0usize;
    drive(&rig.clock, 100_000, || {
        if sent < 12 && feed_frames(&tx, &ready, sent as u8) {
            sent += 1;
        }
        delivered.lock().len() >= 6
    });

    // with 25 percent loss most frames are incomplete, and they only
    // reach the application because the flag is set
    let frames = delivered.lock();
    assert!(frames.iter().any(|f| f.meta.status == FrameStatus::Incomplete));

    let stats = rig
        .rx
        .statistics()
        .get(&SessionId {
            kind: SessionKind::RxVideo,
            idx: 0,
        })
        .unwrap();
    assert!(stats.frames_incomplete > 0);
}

/// Application planar 10 bit frames are converted to the wire pixel
/// group format on put; the received frame matches a reference
/// conversion byte for byte.
#[test]
fn tx_side_format_conversion() {
    let rig = rig(1);
    let (width, height) = (64u32, 2u32);

    let (producer, ready, _done) = Producer::new();
    let (consumer, delivered) = Consumer::new(1);

    let tx_cfg = TxVideoConfig {
        name: "tvconv".to_string(),
        dst_ip: [RX_IP, RX_IP],
        width,
        height,
        fps: Fps::P50,
        packing: Packing::GpmSl,
        app_format: Some(FrameFormat::Yuv422Planar10Le),
        ..Default::default()
    };
    let tx = rig
        .tx
        .create_tx_video(&[0], &tx_cfg, Box::new(producer))
        .unwrap();

    let rx_cfg = RxVideoConfig {
        name: "rvconv".to_string(),
        ip: [RX_IP, RX_IP],
        width,
        height,
        fps: Fps::P50,
        packing: Packing::GpmSl,
        ..Default::default()
    };
    rig.rx
        .create_rx_video(&[0], &rx_cfg, Box::new(consumer))
        .unwrap();

    // a 64x2 test pattern of in-range 10 bit samples
    let planar = convert::frame_size(FrameFormat::Yuv422Planar10Le, width, height);
    let mut source = vec![0u8; planar];
    for (i, chunk) in source.chunks_mut(2).enumerate() {
        let sample = ((i * 41) % 1024) as u16;
        chunk.copy_from_slice(&sample.to_le_bytes());
    }

    let mut sent = false;
    drive(&rig.clock, 100_000, || {
        if !sent {
            if let Ok(mut guard) = tx.buffer_get(Duration::ZERO) {
                guard.as_mut().copy_from_slice(&source);
                let idx = guard.index();
                guard.put(TxVideoMeta::default());
                ready.lock().push_back((idx, TxVideoMeta::default()));
                sent = true;
            }
        }
        !delivered.lock().is_empty()
    });

    // reference conversion of the same pattern
    let wire = convert::frame_size(FrameFormat::Yuv422Rfc4175Pg2Be10, width, height);
    let mut want = vec![0u8; wire];
    let reference = convert::converter(
        FrameFormat::Yuv422Planar10Le,
        FrameFormat::Yuv422Rfc4175Pg2Be10,
    )
    .unwrap();
    reference(&source, &mut want, width, height).unwrap();

    let frames = delivered.lock();
    assert_eq!(frames[0].payload, want);
}
