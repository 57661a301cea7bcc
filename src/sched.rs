//! Cooperative tasklet schedulers.
//!
//! A scheduler owns one worker (a pinned core or a plain thread) and
//! runs its tasklets round robin. Handlers never block: anything that
//! would, returns [`Poll::HasPending`] and gets its next chance one
//! round later. When a whole round reports [`Poll::AllDone`] the worker
//! may sleep, bounded by the smallest advice among the tasklets.
//!
//! Sessions buy capacity on a scheduler in Mbit/s; the pool hands out
//! schedulers by quota and keeps receive video traffic on its own
//! workers once a scheduler is typed that way.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use service::Error;

pub const MAX_SCHEDULERS: usize = 256;
pub const MAX_TASKLETS_PER_SCH: usize = 128;
pub const MAX_SESSIONS_PER_SCH: usize = 60;

/// What a tasklet handler reports back to the round loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Poll {
    AllDone,
    HasPending,
}

/// A cooperative unit of work.
pub trait Tasklet: Send {
    fn name(&self) -> &str;

    fn pre_start(&mut self) {}
    fn start(&mut self) {}
    fn stop(&mut self) {}

    fn handler(&mut self) -> Poll;

    /// How long the scheduler may sleep when this tasklet is idle.
    fn advice_sleep_us(&self) -> Option<u64> {
        None
    }
}

/// Scheduler behaviour knobs, shared by every scheduler of a pool.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Run workers as plain threads instead of pinning cores.
    pub run_in_thread: bool,
    pub allow_sleep: bool,
    pub default_sleep_us: u64,
    /// Overrides every advice when set.
    pub forced_sleep_us: Option<u64>,
    /// Sleeps below this just yield.
    pub zero_sleep_threshold_us: u64,
    pub time_measure: bool,
    pub data_quota_mbs_limit: u32,
    /// Cores the pool may pin, counted from the front of the core list.
    pub max_cores: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            run_in_thread: false,
            allow_sleep: true,
            default_sleep_us: 1000,
            forced_sleep_us: None,
            zero_sleep_threshold_us: 200,
            time_measure: false,
            data_quota_mbs_limit: 100_000,
            max_cores: num_cpus::get(),
        }
    }
}

/// Quota type tag: receive video gets dedicated workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedType {
    Default,
    RxVideoOnly,
}

struct TaskletSlot {
    tasklet: Box<dyn Tasklet>,
    name: String,
    started: bool,
    stat_min_us: u64,
    stat_max_us: u64,
    stat_sum_us: u64,
    stat_cnt: u64,
}

struct State {
    tasklets: Vec<Option<TaskletSlot>>,
    worker: Option<JoinHandle<()>>,
    sch_type: SchedType,
    quota_mbs: u32,
    sessions: u32,
}

pub struct Scheduler {
    idx: usize,
    cfg: SchedConfig,
    state: Mutex<State>,
    started: AtomicBool,
    request_stop: AtomicBool,
    stopped: AtomicBool,
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
}

/// Identifies a registered tasklet within its scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskletHandle(usize);

impl Scheduler {
    fn new(idx: usize, cfg: SchedConfig) -> Arc<Self> {
        Arc::new(Self {
            idx,
            cfg,
            state: Mutex::new(State {
                tasklets: Vec::new(),
                worker: None,
                sch_type: SchedType::Default,
                quota_mbs: 0,
                sessions: 0,
            }),
            started: AtomicBool::new(false),
            request_stop: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            sleep_lock: Mutex::new(()),
            sleep_cond: Condvar::new(),
        })
    }

    pub fn index(&self) -> usize {
        self.idx
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Add a tasklet. On a running scheduler its `pre_start`/`start`
    /// run before it joins the next round.
    pub fn register_tasklet(&self, mut tasklet: Box<dyn Tasklet>) -> Result<TaskletHandle, Error> {
        let mut state = self.state.lock();

        let slot_idx = state
            .tasklets
            .iter()
            .position(|slot| slot.is_none())
            .unwrap_or(state.tasklets.len());
        if slot_idx >= MAX_TASKLETS_PER_SCH {
            return Err(Error::Capacity);
        }

        let started = self.is_started();
        if started {
            tasklet.pre_start();
            tasklet.start();
        }

        let name = tasklet.name().to_string();
        let slot = TaskletSlot {
            tasklet,
            name: name.clone(),
            started,
            stat_min_us: u64::MAX,
            stat_max_us: 0,
            stat_sum_us: 0,
            stat_cnt: 0,
        };

        if slot_idx == state.tasklets.len() {
            state.tasklets.push(Some(slot));
        } else {
            state.tasklets[slot_idx] = Some(slot);
        }
        drop(state);

        self.wakeup();
        log::info!("sch({}): tasklet {name} registered at slot {slot_idx}", self.idx);
        Ok(TaskletHandle(slot_idx))
    }

    /// Remove a tasklet; only valid on a stopped scheduler.
    pub fn unregister_tasklet(&self, handle: TaskletHandle) -> Result<(), Error> {
        if self.is_started() {
            return Err(Error::InvalidState);
        }

        let mut state = self.state.lock();
        let slot = state
            .tasklets
            .get_mut(handle.0)
            .ok_or(Error::InvalidArgument)?;
        if slot.take().is_none() {
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }

    /// Launch the worker.
    pub fn start(self: &Arc<Self>, core: Option<core_affinity::CoreId>) -> Result<(), Error> {
        let mut state = self.state.lock();
        if self.is_started() {
            return Err(Error::AlreadyRunning);
        }

        if !self.cfg.run_in_thread && core.is_none() {
            return Err(Error::OutOfLcores);
        }

        self.request_stop.store(false, Ordering::Release);
        self.stopped.store(false, Ordering::Release);

        let this = self.clone();
        let pin = if self.cfg.run_in_thread { None } else { core };
        state.worker = Some(
            std::thread::Builder::new()
                .name(format!("st-sch-{}", self.idx))
                .spawn(move || this.worker_loop(pin))
                .map_err(|_| Error::OutOfLcores)?,
        );

        self.started.store(true, Ordering::Release);
        log::info!("sch({}): started", self.idx);
        Ok(())
    }

    /// Request stop and wait for the worker to exit its round loop.
    pub fn stop(&self) {
        if !self.is_started() {
            return;
        }

        self.request_stop.store(true, Ordering::Release);
        self.wakeup();

        let worker = self.state.lock().worker.take();
        if let Some(worker) = worker {
            let _ = worker.join();
        }

        self.started.store(false, Ordering::Release);
        log::info!("sch({}): stopped", self.idx);
    }

    fn wakeup(&self) {
        let _lock = self.sleep_lock.lock();
        self.sleep_cond.notify_one();
    }

    fn worker_loop(self: Arc<Self>, core: Option<core_affinity::CoreId>) {
        if let Some(core) = core {
            // fall back to the unpinned thread group when pinning fails
            let _ = core_affinity::set_for_current(core);
        }

        {
            let mut state = self.state.lock();
            for slot in state.tasklets.iter_mut().flatten() {
                if !slot.started {
                    slot.tasklet.pre_start();
                }
            }
            for slot in state.tasklets.iter_mut().flatten() {
                if !slot.started {
                    slot.tasklet.start();
                    slot.started = true;
                }
            }
        }

        while !self.request_stop.load(Ordering::Acquire) {
            let mut pending = Poll::AllDone;
            let mut sleep_us = self.cfg.forced_sleep_us.unwrap_or(u64::MAX);

            {
                let mut state = self.state.lock();
                for slot in state.tasklets.iter_mut().flatten() {
                    if !slot.started {
                        slot.tasklet.pre_start();
                        slot.tasklet.start();
                        slot.started = true;
                    }

                    let begin = self
                        .cfg
                        .time_measure
                        .then(std::time::Instant::now);

                    if slot.tasklet.handler() == Poll::HasPending {
                        pending = Poll::HasPending;
                    }

                    if let Some(begin) = begin {
                        let us = begin.elapsed().as_micros() as u64;
                        slot.stat_min_us = slot.stat_min_us.min(us);
                        slot.stat_max_us = slot.stat_max_us.max(us);
                        slot.stat_sum_us += us;
                        slot.stat_cnt += 1;
                    }

                    if self.cfg.forced_sleep_us.is_none() {
                        if let Some(advice) = slot.tasklet.advice_sleep_us() {
                            sleep_us = sleep_us.min(advice);
                        }
                    }
                }
            }

            if self.cfg.allow_sleep && pending == Poll::AllDone {
                let sleep_us = if sleep_us == u64::MAX {
                    self.cfg.default_sleep_us
                } else {
                    sleep_us
                };

                if sleep_us < self.cfg.zero_sleep_threshold_us {
                    std::thread::yield_now();
                } else {
                    // safety cap of one second on the timed wait
                    let wait = Duration::from_micros(sleep_us).min(Duration::from_secs(1));
                    let mut lock = self.sleep_lock.lock();
                    if !self.request_stop.load(Ordering::Acquire) {
                        let _ = self.sleep_cond.wait_for(&mut lock, wait);
                    }
                }
            }
        }

        let mut state = self.state.lock();
        for slot in state.tasklets.iter_mut().flatten() {
            slot.tasklet.stop();
            slot.started = false;
        }

        self.stopped.store(true, Ordering::Release);
    }

    /// Log per tasklet timing and reset, when measurement is on.
    pub fn dump_stats(&self) {
        if !self.cfg.time_measure {
            return;
        }

        let mut state = self.state.lock();
        for slot in state.tasklets.iter_mut().flatten() {
            if slot.stat_cnt > 0 {
                log::info!(
                    "sch({}): tasklet {} avg {}us max {}us min {}us",
                    self.idx,
                    slot.name,
                    slot.stat_sum_us / slot.stat_cnt,
                    slot.stat_max_us,
                    slot.stat_min_us,
                );
                slot.stat_min_us = u64::MAX;
                slot.stat_max_us = 0;
                slot.stat_sum_us = 0;
                slot.stat_cnt = 0;
            }
        }
    }

    fn try_add_quota(&self, quota_mbs: u32, sch_type: SchedType) -> bool {
        let mut state = self.state.lock();

        if state.sessions >= MAX_SESSIONS_PER_SCH as u32 {
            return false;
        }

        // a zero quota request fits any type
        if quota_mbs > 0 {
            if sch_type == SchedType::RxVideoOnly
                && state.sch_type == SchedType::Default
                && state.quota_mbs == 0
            {
                state.sch_type = SchedType::RxVideoOnly;
            }

            if state.sch_type != sch_type {
                return false;
            }

            if state.quota_mbs != 0 && state.quota_mbs + quota_mbs > self.cfg.data_quota_mbs_limit {
                return false;
            }
        }

        state.quota_mbs += quota_mbs;
        state.sessions += 1;
        log::info!(
            "sch({}): quota {} total now {}",
            self.idx,
            quota_mbs,
            state.quota_mbs
        );
        true
    }

    pub fn free_quota(&self, quota_mbs: u32) {
        let mut state = self.state.lock();
        state.quota_mbs = state.quota_mbs.saturating_sub(quota_mbs);
        state.sessions = state.sessions.saturating_sub(1);
        if state.quota_mbs == 0 {
            state.sch_type = SchedType::Default;
        }
    }

    pub fn quota_mbs(&self) -> u32 {
        self.state.lock().quota_mbs
    }

    pub fn sch_type(&self) -> SchedType {
        self.state.lock().sch_type
    }
}

/// The process wide scheduler table.
pub struct SchedulerPool {
    cfg: SchedConfig,
    schedulers: Mutex<Vec<Arc<Scheduler>>>,
    cores: Mutex<Vec<core_affinity::CoreId>>,
}

impl SchedulerPool {
    pub fn new(cfg: SchedConfig) -> Self {
        let mut cores = if cfg.run_in_thread {
            Vec::new()
        } else {
            core_affinity::get_core_ids().unwrap_or_default()
        };
        cores.truncate(cfg.max_cores);

        Self {
            cfg,
            schedulers: Mutex::new(Vec::new()),
            cores: Mutex::new(cores),
        }
    }

    /// Find a scheduler with room for `quota_mbs` of `sch_type`, or
    /// create and start a new one.
    pub fn get(&self, quota_mbs: u32, sch_type: SchedType) -> Result<Arc<Scheduler>, Error> {
        let mut schedulers = self.schedulers.lock();

        for sch in schedulers.iter() {
            if sch.try_add_quota(quota_mbs, sch_type) {
                return Ok(sch.clone());
            }
        }

        if schedulers.len() >= MAX_SCHEDULERS {
            return Err(Error::Capacity);
        }

        let sch = Scheduler::new(schedulers.len(), self.cfg.clone());
        if !sch.try_add_quota(quota_mbs, sch_type) {
            return Err(Error::Capacity);
        }

        let core = if self.cfg.run_in_thread {
            None
        } else {
            let mut cores = self.cores.lock();
            if cores.is_empty() {
                return Err(Error::OutOfLcores);
            }
            Some(cores.remove(0))
        };

        sch.start(core)?;
        schedulers.push(sch.clone());
        Ok(sch)
    }

    /// Release quota; the scheduler keeps running for future sessions.
    pub fn put(&self, sch: &Arc<Scheduler>, quota_mbs: u32) {
        sch.free_quota(quota_mbs);
    }

    pub fn stop_all(&self) {
        for sch in self.schedulers.lock().iter() {
            sch.stop();
        }
    }

    pub fn dump_stats(&self) {
        for sch in self.schedulers.lock().iter() {
            sch.dump_stats();
        }
    }
}

impl Drop for SchedulerPool {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct Counting {
        runs: Arc<AtomicU64>,
        pending_rounds: u64,
    }

    impl Tasklet for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn handler(&mut self) -> Poll {
            self.runs.fetch_add(1, Ordering::AcqRel);
            if self.pending_rounds > 0 {
                self.pending_rounds -= 1;
                Poll::HasPending
            } else {
                Poll::AllDone
            }
        }

        fn advice_sleep_us(&self) -> Option<u64> {
            Some(100)
        }
    }

    fn thread_cfg() -> SchedConfig {
        SchedConfig {
            run_in_thread: true,
            ..Default::default()
        }
    }

    #[test]
    fn runs_tasklets_until_stopped() {
        let sch = Scheduler::new(0, thread_cfg());
        let runs = Arc::new(AtomicU64::new(0));

        sch.register_tasklet(Box::new(Counting {
            runs: runs.clone(),
            pending_rounds: 50,
        }))
        .unwrap();

        sch.start(None).unwrap();
        assert_eq!(sch.start(None).unwrap_err(), Error::AlreadyRunning);

        while runs.load(Ordering::Acquire) < 50 {
            std::thread::yield_now();
        }
        sch.stop();

        assert!(runs.load(Ordering::Acquire) >= 50);
    }

    #[test]
    fn register_while_running() {
        let sch = Scheduler::new(0, thread_cfg());
        sch.start(None).unwrap();

        let runs = Arc::new(AtomicU64::new(0));
        let handle = sch
            .register_tasklet(Box::new(Counting {
                runs: runs.clone(),
                pending_rounds: 0,
            }))
            .unwrap();

        while runs.load(Ordering::Acquire) == 0 {
            std::thread::yield_now();
        }

        // unregister refuses while running
        assert_eq!(sch.unregister_tasklet(handle).unwrap_err(), Error::InvalidState);
        sch.stop();
        sch.unregister_tasklet(handle).unwrap();
    }

    #[test]
    fn tasklet_table_capacity() {
        let sch = Scheduler::new(0, thread_cfg());
        for _ in 0..MAX_TASKLETS_PER_SCH {
            sch.register_tasklet(Box::new(Counting {
                runs: Arc::new(AtomicU64::new(0)),
                pending_rounds: 0,
            }))
            .unwrap();
        }

        let err = sch
            .register_tasklet(Box::new(Counting {
                runs: Arc::new(AtomicU64::new(0)),
                pending_rounds: 0,
            }))
            .unwrap_err();
        assert_eq!(err, Error::Capacity);
    }

    #[test]
    fn quota_and_type_promotion() {
        let sch = Scheduler::new(0, thread_cfg());

        // first rx video quota promotes the empty default scheduler
        assert!(sch.try_add_quota(1000, SchedType::RxVideoOnly));
        assert_eq!(sch.sch_type(), SchedType::RxVideoOnly);

        // a default session no longer fits
        assert!(!sch.try_add_quota(1000, SchedType::Default));

        // freeing everything resets the type
        sch.free_quota(1000);
        assert_eq!(sch.sch_type(), SchedType::Default);
        assert!(sch.try_add_quota(1000, SchedType::Default));
    }

    #[test]
    fn quota_limit_is_enforced() {
        let cfg = SchedConfig {
            run_in_thread: true,
            data_quota_mbs_limit: 5000,
            ..Default::default()
        };
        let sch = Scheduler::new(0, cfg);

        assert!(sch.try_add_quota(4000, SchedType::Default));
        assert!(!sch.try_add_quota(2000, SchedType::Default));
        assert!(sch.try_add_quota(1000, SchedType::Default));
    }

    #[test]
    fn pool_reuses_and_separates() {
        let pool = SchedulerPool::new(thread_cfg());

        let a = pool.get(1000, SchedType::Default).unwrap();
        let b = pool.get(1000, SchedType::Default).unwrap();
        assert_eq!(a.index(), b.index());

        // rx video traffic lands on a different scheduler
        let c = pool.get(1000, SchedType::RxVideoOnly).unwrap();
        assert_ne!(a.index(), c.index());

        pool.put(&a, 1000);
        pool.put(&b, 1000);
        pool.put(&c, 1000);
        pool.stop_all();
    }
}
