mod common;

use std::{collections::VecDeque, sync::Arc, time::Duration};

use common::{Consumer, Producer, drive, rig, RX_IP};
use parking_lot::Mutex;
use service::{
    TxVideoMeta,
    fmt::{Fps, Packing, active_ratio},
};
use st2110::{rx::video::RxVideoConfig, tx::video::TxVideoConfig};

fn feed(
    handle: &st2110::tx::video::TxVideoHandle,
    ready: &Arc<Mutex<VecDeque<(u16, TxVideoMeta)>>>,
) -> bool {
    match handle.buffer_get(Duration::ZERO) {
        Ok(guard) => {
            let idx = guard.index();
            guard.put(TxVideoMeta::default());
            ready.lock().push_back((idx, TxVideoMeta::default()));
            true
        }
        Err(_) => false,
    }
}

fn small_tx(name: &str, ports: usize, udp: u16) -> TxVideoConfig {
    TxVideoConfig {
        name: name.to_string(),
        num_ports: ports,
        dst_ip: [RX_IP, RX_IP],
        udp_port: [udp, udp + 2],
        width: 640,
        height: 16,
        fps: Fps::P50,
        packing: Packing::Bpm,
        ..Default::default()
    }
}

/// Rate limiter training fails on the redundant port: both ports must
/// demote to TSC pacing, and no frames are lost over the renegotiation.
#[test]
fn auto_pacing_demotes_both_ports_to_tsc() {
    let rig = rig(2);
    const FRAMES: usize = 10;

    // primary trains fine at one percent over nominal; redundant fails
    let geo = service::fmt::PacketGeometry::compute(
        640,
        16,
        service::fmt::VideoFormat::Yuv422_10bit,
        Packing::Bpm,
        false,
    )
    .unwrap();
    // one percent above the exact rate the active picture needs
    let trained_pps = geo.total_pkts as f64 * 50.0 / active_ratio(16, false) * 1.01;
    rig.tx_ports[0].set_rate_limiter(trained_pps);
    rig.tx_ports[1].set_rate_limiter(trained_pps);
    rig.tx_ports[1].fail_training(true);

    let (producer, ready, _done) = Producer::new();
    let (consumer, delivered) = Consumer::new(0);

    let tx = rig
        .tx
        .create_tx_video(&[0, 1], &small_tx("tvdemote", 2, 22000), Box::new(producer))
        .unwrap();

    // both ports were asked to train once
    assert_eq!(rig.tx_ports[0].train_calls(), 1);
    assert_eq!(rig.tx_ports[1].train_calls(), 1);

    let rx_cfg = RxVideoConfig {
        name: "rvdemote".to_string(),
        num_ports: 2,
        ip: [RX_IP, RX_IP],
        udp_port: [22000, 22002],
        width: 640,
        height: 16,
        fps: Fps::P50,
        packing: Packing::Bpm,
        ..Default::default()
    };
    rig.rx
        .create_rx_video(&[0, 1], &rx_cfg, Box::new(consumer))
        .unwrap();

    let mut sent = 0usize;
    drive(&rig.clock, 200_000, || {
        if sent < FRAMES && feed(&tx, &ready) {
            sent += 1;
        }
        delivered.lock().len() >= FRAMES
    });

    // every frame made it through, and the demoted TSC path never
    // inserted a rate limiter pad
    assert_eq!(delivered.lock().len(), FRAMES);
    let stats = rig
        .tx
        .statistics()
        .get(&st2110::statistics::SessionId {
            kind: st2110::statistics::SessionKind::TxVideo,
            idx: 0,
        })
        .unwrap();
    assert_eq!(stats.pads_sent, 0);
}

/// Training results are cached by (port, bandwidth): a second session
/// with the same rate reuses the interval without touching the NIC.
#[test]
fn rate_limit_training_is_idempotent() {
    let rig = rig(1);

    let geo = service::fmt::PacketGeometry::compute(
        640,
        16,
        service::fmt::VideoFormat::Yuv422_10bit,
        Packing::Bpm,
        false,
    )
    .unwrap();
    let trained_pps = geo.total_pkts as f64 * 50.0 / active_ratio(16, false) * 1.01;
    rig.tx_ports[0].set_rate_limiter(trained_pps);

    let (producer_a, _ready_a, _) = Producer::new();
    let (producer_b, _ready_b, _) = Producer::new();

    rig.tx
        .create_tx_video(&[0], &small_tx("tvtrain-a", 1, 23000), Box::new(producer_a))
        .unwrap();
    assert_eq!(rig.tx_ports[0].train_calls(), 1);

    // identical geometry and rate: served from the cache
    rig.tx
        .create_tx_video(&[0], &small_tx("tvtrain-b", 1, 23010), Box::new(producer_b))
        .unwrap();
    assert_eq!(rig.tx_ports[0].train_calls(), 1);
}
