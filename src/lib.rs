//! A userspace SMPTE ST 2110 media transport.
//!
//! Uncompressed video (ST 2110-20), JPEG XS compressed video
//! (ST 2110-22), PCM audio (ST 2110-30) and ancillary data (ST 2110-40)
//! over precisely paced RTP, with optional seamless 1+1 redundancy.
//! Packets are built, paced and burst by cooperative tasklets on pinned
//! scheduler workers; the media clock is disciplined by a minimal
//! IEEE 1588 client against the port's time register.

pub mod config;
pub mod net;
pub mod ptp;
pub mod redundant;
pub mod rx;
pub mod sched;
pub mod statistics;
pub mod transmitter;
pub mod tx;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use service::{Error, pacing::TrainingCache};

use crate::{
    config::Config,
    net::{Clock, FlowFilter, PortDevice, neigh::Neighbors},
    ptp::{PtpClient, PtpClock},
    rx::{
        anc::{RxAncConfig, RxAncHandle},
        audio::{RxAudioConfig, RxAudioHandle},
        video::{RxVideoConfig, RxVideoHandle},
    },
    sched::{SchedConfig, SchedType, Scheduler, SchedulerPool},
    statistics::{SessionId, SessionKind, Statistics},
    tx::{
        anc::{TxAncConfig, TxAncHandle},
        audio::{TxAudioConfig, TxAudioHandle},
        video::{SessionPort, TxVideoConfig, TxVideoHandle},
    },
};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "st2110-rs.",
    env!("CARGO_PKG_VERSION")
);

/// How long a session create waits on ARP before giving up.
const ARP_DEADLINE: Duration = Duration::from_secs(5);

struct PortCtx {
    dev: Arc<dyn PortDevice>,
    neigh: Arc<Neighbors>,
    ptp: Arc<PtpClock>,
    pacing: service::pacing::PacingWay,
    next_queue: AtomicUsize,
}

struct SessionEntry {
    stop: Arc<AtomicBool>,
    sch: Arc<Scheduler>,
    quota_mbps: u32,
}

/// The transport instance: ports, schedulers and sessions.
pub struct Transport {
    ports: Vec<PortCtx>,
    pool: SchedulerPool,
    statistics: Statistics,
    clock: Arc<dyn Clock>,
    cache: TrainingCache,
    sessions: Mutex<Vec<SessionEntry>>,
    session_seq: AtomicUsize,
    status_stop: Arc<AtomicBool>,
}

impl Transport {
    /// Bring the transport up on the given devices (one per configured
    /// interface). The PTP client of every port starts immediately; a
    /// status thread dumps statistics every dump period.
    pub fn new(
        config: &Config,
        devs: Vec<Arc<dyn PortDevice>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>, anyhow::Error> {
        if devs.is_empty() {
            anyhow::bail!("no ports given");
        }

        let sched_cfg = SchedConfig {
            run_in_thread: config.runtime.tasklet_thread,
            allow_sleep: config.runtime.tasklet_sleep,
            forced_sleep_us: config.runtime.tasklet_sleep_us,
            time_measure: config.runtime.tasklet_time_measure,
            data_quota_mbs_limit: config.runtime.data_quota_mbs_limit,
            max_cores: config.runtime.max_cores,
            ..Default::default()
        };

        let pool = SchedulerPool::new(sched_cfg);
        let statistics = Statistics::default();

        let mut ports = Vec::with_capacity(devs.len());
        for (i, dev) in devs.iter().enumerate() {
            let pacing = config
                .interfaces
                .get(i)
                .map(|cfg| cfg.pacing.as_way())
                .unwrap_or_default();

            ports.push(PortCtx {
                dev: dev.clone(),
                neigh: Arc::new(Neighbors::new(dev.clone(), clock.clone())),
                ptp: PtpClock::new(dev.clone()),
                pacing,
                next_queue: AtomicUsize::new(1),
            });
        }

        // the ptp clients of all ports share one control scheduler
        let control = pool.get(0, SchedType::Default)?;
        for port in &ports {
            let client = PtpClient::new(port.dev.clone(), clock.clone(), port.ptp.clone())?;
            control.register_tasklet(Box::new(client))?;
        }

        let this = Arc::new(Self {
            ports,
            pool,
            statistics,
            clock,
            cache: TrainingCache::default(),
            sessions: Mutex::new(Vec::new()),
            session_seq: AtomicUsize::new(0),
            status_stop: Arc::new(AtomicBool::new(false)),
        });

        // status loop: IGMP cadence every second, counters every dump
        // period
        let weak = Arc::downgrade(&this);
        let stop = this.status_stop.clone();
        let dump_period = config.runtime.dump_period_s.max(1);
        std::thread::Builder::new()
            .name("st-status".to_string())
            .spawn(move || {
                let mut ticks = 0u64;
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_secs(1));
                    let Some(this) = weak.upgrade() else {
                        break;
                    };

                    for port in &this.ports {
                        port.neigh.poll_report();
                    }

                    ticks += 1;
                    if ticks % dump_period == 0 {
                        this.statistics.dump();
                        this.pool.dump_stats();
                    }
                }
            })?;

        log::info!("{SOFTWARE}: started with {} ports", this.ports.len());
        Ok(this)
    }

    fn port(&self, idx: usize) -> Result<&PortCtx, Error> {
        self.ports.get(idx).ok_or(Error::InvalidArgument)
    }

    fn next_session_id(&self, kind: SessionKind) -> SessionId {
        SessionId {
            kind,
            idx: self.session_seq.fetch_add(1, Ordering::AcqRel),
        }
    }

    fn track(&self, stop: Arc<AtomicBool>, sch: Arc<Scheduler>, quota_mbps: u32) {
        self.sessions.lock().push(SessionEntry {
            stop,
            sch,
            quota_mbps,
        });
    }

    /// Create a transmit video session on `port_indices` (one or two
    /// ports for 1+1 transmission).
    pub fn create_tx_video(
        &self,
        port_indices: &[usize],
        cfg: &TxVideoConfig,
        handler: Box<dyn service::TxVideoHandler>,
    ) -> Result<TxVideoHandle, Error> {
        if port_indices.len() != cfg.num_ports {
            return Err(Error::InvalidArgument);
        }

        let mut session_ports = Vec::with_capacity(port_indices.len());
        let mut dest_macs = Vec::with_capacity(port_indices.len());

        for (i, &port_idx) in port_indices.iter().enumerate() {
            let port = self.port(port_idx)?;

            if cfg.dst_ip[i].is_multicast() {
                port.neigh.join(cfg.dst_ip[i])?;
            }
            dest_macs.push(
                port.neigh
                    .resolve(cfg.dst_ip[i], ARP_DEADLINE)
                    .map_err(|_| Error::HardwareError)?,
            );

            session_ports.push(SessionPort {
                dev: port.dev.clone(),
                queue: port.next_queue.fetch_add(1, Ordering::AcqRel),
                port_idx,
                way: port.pacing,
            });
        }

        let ptp = self.port(port_indices[0])?.ptp.clone();
        let id = self.next_session_id(SessionKind::TxVideo);
        let reporter = self.statistics.register(id);

        let parts = tx::video::create(
            cfg,
            handler,
            session_ports,
            dest_macs,
            self.clock.clone(),
            ptp,
            reporter,
            self.cache.clone(),
        )?;

        let sch = self.pool.get(parts.quota_mbps, SchedType::Default)?;
        sch.register_tasklet(Box::new(parts.build))?;
        sch.register_tasklet(Box::new(parts.send))?;
        self.track(parts.stop, sch, parts.quota_mbps);

        Ok(parts.handle)
    }

    /// Create a receive video session. Dual port configs run through
    /// the 1+1 merge layer.
    pub fn create_rx_video(
        &self,
        port_indices: &[usize],
        cfg: &RxVideoConfig,
        handler: Box<dyn service::RxVideoHandler>,
    ) -> Result<Vec<RxVideoHandle>, Error> {
        if port_indices.len() != cfg.num_ports {
            return Err(Error::InvalidArgument);
        }

        let (configs, handlers) = if cfg.num_ports == 2 {
            redundant::split(cfg, handler)?
        } else {
            (vec![cfg.clone()], vec![handler])
        };

        let mut handles = Vec::with_capacity(configs.len());
        for ((sub, sub_handler), &port_idx) in
            configs.into_iter().zip(handlers).zip(port_indices.iter())
        {
            handles.push(self.create_rx_video_single(port_idx, &sub, sub_handler)?);
        }

        Ok(handles)
    }

    fn create_rx_video_single(
        &self,
        port_idx: usize,
        cfg: &RxVideoConfig,
        handler: Box<dyn service::RxVideoHandler>,
    ) -> Result<RxVideoHandle, Error> {
        let port = self.port(port_idx)?;

        if cfg.ip[0].is_multicast() {
            port.neigh.join(cfg.ip[0])?;
        }

        let queue = port.dev.open_rx_queue(&FlowFilter::Udp {
            dst_ip: cfg.ip[0],
            dst_port: cfg.udp_port[0],
            src_ip: cfg.src_ip[0],
        })?;

        let id = self.next_session_id(SessionKind::RxVideo);
        let reporter = self.statistics.register(id);

        let parts = rx::video::create(cfg, handler, vec![queue], self.clock.clone(), reporter)?;

        let sch = self.pool.get(parts.quota_mbps, SchedType::RxVideoOnly)?;
        sch.register_tasklet(Box::new(parts.recv))?;
        self.track(parts.stop, sch, parts.quota_mbps);

        Ok(parts.handle)
    }

    pub fn create_tx_audio(
        &self,
        port_indices: &[usize],
        cfg: &TxAudioConfig,
        handler: Box<dyn service::TxMediaHandler>,
    ) -> Result<TxAudioHandle, Error> {
        if port_indices.len() != cfg.num_ports {
            return Err(Error::InvalidArgument);
        }

        let mut devs = Vec::new();
        let mut dest_macs = Vec::new();
        for (i, &port_idx) in port_indices.iter().enumerate() {
            let port = self.port(port_idx)?;
            if cfg.dst_ip[i].is_multicast() {
                port.neigh.join(cfg.dst_ip[i])?;
            }
            dest_macs.push(
                port.neigh
                    .resolve(cfg.dst_ip[i], ARP_DEADLINE)
                    .map_err(|_| Error::HardwareError)?,
            );
            devs.push((
                port.dev.clone(),
                port.next_queue.fetch_add(1, Ordering::AcqRel),
            ));
        }

        let ptp = self.port(port_indices[0])?.ptp.clone();
        let id = self.next_session_id(SessionKind::TxAudio);
        let reporter = self.statistics.register(id);

        let parts = tx::audio::create(
            cfg,
            handler,
            devs,
            dest_macs,
            self.clock.clone(),
            ptp,
            reporter,
        )?;

        let sch = self.pool.get(parts.quota_mbps, SchedType::Default)?;
        sch.register_tasklet(Box::new(parts.session))?;
        self.track(parts.stop, sch, parts.quota_mbps);

        Ok(parts.handle)
    }

    pub fn create_rx_audio(
        &self,
        port_indices: &[usize],
        cfg: &RxAudioConfig,
        handler: Box<dyn service::RxMediaHandler>,
    ) -> Result<RxAudioHandle, Error> {
        if port_indices.len() != cfg.num_ports {
            return Err(Error::InvalidArgument);
        }

        let mut queues = Vec::new();
        for (i, &port_idx) in port_indices.iter().enumerate() {
            let port = self.port(port_idx)?;
            if cfg.ip[i].is_multicast() {
                port.neigh.join(cfg.ip[i])?;
            }
            queues.push(port.dev.open_rx_queue(&FlowFilter::Udp {
                dst_ip: cfg.ip[i],
                dst_port: cfg.udp_port[i],
                src_ip: cfg.src_ip[i],
            })?);
        }

        let id = self.next_session_id(SessionKind::RxAudio);
        let reporter = self.statistics.register(id);
        let parts = rx::audio::create(cfg, handler, queues, self.clock.clone(), reporter)?;

        let sch = self.pool.get(parts.quota_mbps, SchedType::Default)?;
        sch.register_tasklet(Box::new(parts.session))?;
        self.track(parts.stop, sch, parts.quota_mbps);

        Ok(parts.handle)
    }

    pub fn create_tx_anc(
        &self,
        port_indices: &[usize],
        cfg: &TxAncConfig,
        handler: Box<dyn service::TxMediaHandler>,
    ) -> Result<TxAncHandle, Error> {
        if port_indices.len() != cfg.num_ports {
            return Err(Error::InvalidArgument);
        }

        let mut devs = Vec::new();
        let mut dest_macs = Vec::new();
        for (i, &port_idx) in port_indices.iter().enumerate() {
            let port = self.port(port_idx)?;
            if cfg.dst_ip[i].is_multicast() {
                port.neigh.join(cfg.dst_ip[i])?;
            }
            dest_macs.push(
                port.neigh
                    .resolve(cfg.dst_ip[i], ARP_DEADLINE)
                    .map_err(|_| Error::HardwareError)?,
            );
            devs.push((
                port.dev.clone(),
                port.next_queue.fetch_add(1, Ordering::AcqRel),
            ));
        }

        let ptp = self.port(port_indices[0])?.ptp.clone();
        let id = self.next_session_id(SessionKind::TxAncillary);
        let reporter = self.statistics.register(id);

        let parts = tx::anc::create(
            cfg,
            handler,
            devs,
            dest_macs,
            self.clock.clone(),
            ptp,
            reporter,
        )?;

        let sch = self.pool.get(parts.quota_mbps, SchedType::Default)?;
        sch.register_tasklet(Box::new(parts.session))?;
        self.track(parts.stop, sch, parts.quota_mbps);

        Ok(parts.handle)
    }

    pub fn create_rx_anc(
        &self,
        port_indices: &[usize],
        cfg: &RxAncConfig,
        handler: Box<dyn service::RxMediaHandler>,
    ) -> Result<RxAncHandle, Error> {
        if port_indices.len() != cfg.num_ports {
            return Err(Error::InvalidArgument);
        }

        let mut queues = Vec::new();
        for (i, &port_idx) in port_indices.iter().enumerate() {
            let port = self.port(port_idx)?;
            if cfg.ip[i].is_multicast() {
                port.neigh.join(cfg.ip[i])?;
            }
            queues.push(port.dev.open_rx_queue(&FlowFilter::Udp {
                dst_ip: cfg.ip[i],
                dst_port: cfg.udp_port[i],
                src_ip: cfg.src_ip[i],
            })?);
        }

        let id = self.next_session_id(SessionKind::RxAncillary);
        let reporter = self.statistics.register(id);
        let parts = rx::anc::create(cfg, handler, queues, reporter)?;

        let sch = self.pool.get(parts.quota_mbps, SchedType::Default)?;
        sch.register_tasklet(Box::new(parts.session))?;
        self.track(parts.stop, sch, parts.quota_mbps);

        Ok(parts.handle)
    }

    /// The PTP disciplined time of a port, nanoseconds.
    pub fn ptp_time(&self, port_idx: usize) -> Result<u64, Error> {
        Ok(self.port(port_idx)?.ptp.get_time())
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    /// Stop every session and scheduler. Sessions quiesce first (their
    /// tasklets observe the stop flag), then the workers exit.
    pub fn shutdown(&self) {
        self.status_stop.store(true, Ordering::Release);

        let mut sessions = self.sessions.lock();
        for entry in sessions.iter() {
            entry.stop.store(true, Ordering::Release);
        }
        for entry in sessions.iter() {
            self.pool.put(&entry.sch, entry.quota_mbps);
        }
        sessions.clear();
        drop(sessions);

        self.pool.stop_all();
        log::info!("{SOFTWARE}: shut down");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
