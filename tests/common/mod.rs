//! Shared plumbing for the loopback integration tests: transport pairs
//! over in-memory ports, a frame producer, a collecting consumer, and a
//! virtual clock driver.
#![allow(dead_code)]

use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use st2110::{
    Transport,
    config::Config,
    net::{Clock, ManualClock, loopback::LoopPort},
};
use service::{
    Error, RxVideoHandler, RxVideoMeta, TxVideoHandler, TxVideoMeta, frame::RxFrame,
};

pub const TX_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 85, 80);
pub const RX_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 85, 81);

/// A connected pair of transports, one loop pair per port.
pub struct Rig {
    pub clock: Arc<ManualClock>,
    pub tx: Arc<Transport>,
    pub rx: Arc<Transport>,
    pub tx_ports: Vec<LoopPort>,
    pub rx_ports: Vec<LoopPort>,
}

pub fn rig(num_ports: usize) -> Rig {
    let _ = simple_logger::init_with_level(log::Level::Warn);

    let clock = Arc::new(ManualClock::default());
    let mut tx_ports = Vec::new();
    let mut rx_ports = Vec::new();

    for i in 0..num_ports {
        let (a, b) = LoopPort::pair(
            clock.clone() as Arc<dyn Clock>,
            ([0x02, 0, 0, 0, 0x10, i as u8], TX_IP),
            ([0x02, 0, 0, 0, 0x20, i as u8], RX_IP),
        );
        tx_ports.push(a);
        rx_ports.push(b);
    }

    let config = Config::from_str(r#"{ runtime: { "tasklet-thread": true, "dump-period-s": 3600 } }"#)
        .expect("config");

    let tx = Transport::new(
        &config,
        tx_ports
            .iter()
            .map(|p| Arc::new(p.clone()) as Arc<dyn st2110::net::PortDevice>)
            .collect(),
        clock.clone() as Arc<dyn Clock>,
    )
    .expect("tx transport");
    let rx = Transport::new(
        &config,
        rx_ports
            .iter()
            .map(|p| Arc::new(p.clone()) as Arc<dyn st2110::net::PortDevice>)
            .collect(),
        clock.clone() as Arc<dyn Clock>,
    )
    .expect("rx transport");

    Rig {
        clock,
        tx,
        rx,
        tx_ports,
        rx_ports,
    }
}

/// Feeds the build tasklet the frames the test thread put, in order.
pub struct Producer {
    pub ready: Arc<Mutex<std::collections::VecDeque<(u16, TxVideoMeta)>>>,
    pub done: Arc<Mutex<Vec<u16>>>,
}

impl Producer {
    pub fn new() -> (
        Self,
        Arc<Mutex<std::collections::VecDeque<(u16, TxVideoMeta)>>>,
        Arc<Mutex<Vec<u16>>>,
    ) {
        let ready = Arc::new(Mutex::new(std::collections::VecDeque::new()));
        let done = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                ready: ready.clone(),
                done: done.clone(),
            },
            ready,
            done,
        )
    }
}

impl TxVideoHandler for Producer {
    fn next_frame(&mut self, meta: &mut TxVideoMeta) -> Result<u16, Error> {
        let (idx, stored) = self.ready.lock().pop_front().ok_or(Error::WouldBlock)?;
        *meta = stored;
        Ok(idx)
    }

    fn frame_done(&mut self, idx: u16, _meta: &TxVideoMeta) {
        self.done.lock().push(idx);
    }
}

/// One delivered frame as the consumer saw it.
pub struct Delivered {
    pub meta: RxVideoMeta,
    pub payload: Vec<u8>,
}

pub struct Consumer {
    pub frames: Arc<Mutex<Vec<Delivered>>>,
    /// Keep payload copies for at most this many frames (they are big).
    pub keep_payload: usize,
}

impl Consumer {
    pub fn new(keep_payload: usize) -> (Self, Arc<Mutex<Vec<Delivered>>>) {
        let frames = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                frames: frames.clone(),
                keep_payload,
            },
            frames,
        )
    }
}

impl RxVideoHandler for Consumer {
    fn frame_ready(&mut self, frame: RxFrame, meta: &RxVideoMeta) -> Result<(), Error> {
        let mut frames = self.frames.lock();
        let payload = if frames.len() < self.keep_payload {
            frame.to_vec()
        } else {
            Vec::new()
        };
        frames.push(Delivered {
            meta: *meta,
            payload,
        });
        Ok(())
    }
}

/// Advance the virtual clock until `until` holds, with a real time
/// budget so a broken pipeline fails instead of hanging.
pub fn drive(clock: &ManualClock, step_ns: u64, mut until: impl FnMut() -> bool) {
    let budget = Instant::now();
    while !until() {
        assert!(
            budget.elapsed() < Duration::from_secs(120),
            "pipeline made no progress within the budget"
        );
        clock.advance(step_ns);
        std::thread::sleep(Duration::from_micros(200));
    }
}

/// A recognizable per frame fill pattern.
pub fn fill_pattern(buf: &mut [u8], seed: u8) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = seed.wrapping_add((i % 251) as u8);
    }
}
