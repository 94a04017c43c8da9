//! Pausable, bounded worker pool.
//!
//! Tasks run with no ordering guarantee relative to each other. The owner
//! can `pause` the pool as an exclusion barrier: `pause` returns only once no
//! task is executing, and no task starts until the matching `resume`.
//!
//! Workers are spawned lazily up to `max_workers` and retire after sitting
//! idle for `idle_timeout`.

use std::cell::Cell;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, ProxError, ProxResult};

/// Upper bound on the default worker count.
pub const MAX_WORKERS_CAP: usize = 10;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum concurrently running workers.
    pub max_workers: usize,
    /// Idle time after which a worker thread exits.
    #[serde(rename = "idle_timeout_ms", with = "super::duration_ms")]
    pub idle_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: thread::available_parallelism()
                .map_or(1, NonZeroUsize::get)
                .min(MAX_WORKERS_CAP),
            idle_timeout: Duration::from_secs(10),
        }
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    epoch: u64,
    task: Task,
}

#[derive(Debug, Default)]
struct PoolState {
    paused: usize,
    running: usize,
    /// Scheduled and not yet finished or dropped.
    pending: usize,
    live: usize,
    idle: usize,
    /// Bumped by `clear`/`stop`; jobs from an older epoch are dropped.
    epoch: u64,
    stopped: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    changed: Condvar,
    panicked: AtomicU64,
    completed: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PoolState>) -> MutexGuard<'a, PoolState> {
        self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

thread_local! {
    static CURRENT_POOL: Cell<usize> = const { Cell::new(0) };
}

/// Pausable worker pool for evaluation tasks.
pub struct Scheduler {
    name: String,
    config: SchedulerConfig,
    shared: Arc<Shared>,
    tx: Mutex<Option<Sender<Job>>>,
    rx: Receiver<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("paused", &st.paused)
            .field("running", &st.running)
            .field("pending", &st.pending)
            .field("live", &st.live)
            .field("stopped", &st.stopped)
            .finish()
    }
}

impl Scheduler {
    /// Creates a pool. No thread is spawned until the first task arrives.
    #[must_use]
    pub fn new(name: impl Into<String>, config: SchedulerConfig) -> Self {
        let (tx, rx) = unbounded::<Job>();
        Self {
            name: name.into(),
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState::default()),
                changed: Condvar::new(),
                panicked: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
            tx: Mutex::new(Some(tx)),
            rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    fn stopped_error(&self) -> ProxError {
        ProxError::Execution(ExecutionError::Stopped {
            component: self.name.clone(),
        })
    }

    fn in_own_worker(&self) -> bool {
        CURRENT_POOL.with(|c| c.get() == self.shared.key())
    }

    /// Enqueues a task without blocking.
    pub fn schedule<F>(&self, task: F) -> ProxResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let tx_guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx_guard.as_ref() else {
            return Err(self.stopped_error());
        };

        let mut st = self.shared.lock();
        if st.stopped {
            return Err(self.stopped_error());
        }

        // Sending under the state lock keeps a retiring worker from missing the job.
        let spawn = st.live < self.config.max_workers.max(1) && st.idle <= self.rx.len();
        let job = Job {
            epoch: st.epoch,
            task: Box::new(task),
        };
        if tx.send(job).is_err() {
            return Err(self.stopped_error());
        }
        st.pending += 1;
        if spawn {
            st.live += 1;
        }
        drop(st);
        drop(tx_guard);

        if spawn {
            self.spawn_worker();
        }
        Ok(())
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let rx = self.rx.clone();
        let idle_timeout = self.config.idle_timeout;
        let spawned = thread::Builder::new()
            .name(format!("{}-worker", self.name))
            .spawn(move || worker_loop(&shared, &rx, idle_timeout));

        match spawned {
            Ok(handle) => {
                let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(err) => {
                warn!(scheduler = %self.name, error = %err, "failed to spawn worker");
                self.shared.lock().live -= 1;
            }
        }
    }

    /// Blocks until no task is executing and keeps new tasks from starting.
    ///
    /// Pauses nest; each needs its own `resume`. Called from inside one of
    /// this pool's tasks, the calling task does not count as executing.
    pub fn pause(&self) {
        let in_worker = self.in_own_worker();
        let mut st = self.shared.lock();
        st.paused += 1;
        if in_worker {
            st.running = st.running.saturating_sub(1);
            self.shared.changed.notify_all();
        }
        while st.running > 0 && !st.stopped {
            st = self.shared.wait(st);
        }
        debug!(scheduler = %self.name, depth = st.paused, "paused");
    }

    /// Re-enables dispatch after a `pause`.
    pub fn resume(&self) {
        let in_worker = self.in_own_worker();
        let mut st = self.shared.lock();
        if st.paused == 0 {
            return;
        }
        st.paused -= 1;
        if in_worker {
            st.running += 1;
        }
        drop(st);
        self.shared.changed.notify_all();
        debug!(scheduler = %self.name, "resumed");
    }

    /// Pauses and returns a guard that resumes on drop.
    #[must_use]
    pub fn pause_guard(&self) -> PauseGuard<'_> {
        self.pause();
        PauseGuard { scheduler: self }
    }

    /// Drops queued tasks that have not started. Returns how many were drained
    /// from the queue.
    pub fn clear(&self) -> usize {
        let mut st = self.shared.lock();
        st.epoch += 1;
        let drained = self.rx.try_iter().count();
        st.pending -= drained;
        drop(st);
        self.shared.changed.notify_all();
        debug!(scheduler = %self.name, drained, "cleared queue");
        drained
    }

    /// Stops the pool. Queued tasks are abandoned; running tasks finish on
    /// their own. Idempotent.
    pub fn stop(&self) {
        let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };

        let mut st = self.shared.lock();
        st.stopped = true;
        st.epoch += 1;
        let drained = self.rx.try_iter().count();
        st.pending -= drained;
        drop(st);
        drop(tx);
        self.shared.changed.notify_all();

        // Detach: a task may be the one dropping the last owner of this pool.
        self.handles.lock().unwrap_or_else(PoisonError::into_inner).clear();
        info!(scheduler = %self.name, drained, "scheduler stopped");
    }

    /// Waits until every scheduled task has finished or been dropped.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        while st.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .shared
                .changed
                .wait_timeout(st, deadline - now)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }

    /// Tasks that ended in a panic.
    #[must_use]
    pub fn panicked_tasks(&self) -> u64 {
        self.shared.panicked.load(Ordering::Relaxed)
    }

    /// Tasks that ran to completion.
    #[must_use]
    pub fn completed_tasks(&self) -> u64 {
        self.shared.completed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.shared.lock().pending
    }

    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.lock().live
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused > 0
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.lock().stopped
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Resumes its scheduler when dropped.
#[must_use = "dropping the guard resumes the scheduler immediately"]
pub struct PauseGuard<'a> {
    scheduler: &'a Scheduler,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.scheduler.resume();
    }
}

fn worker_loop(shared: &Arc<Shared>, rx: &Receiver<Job>, idle_timeout: Duration) {
    CURRENT_POOL.with(|c| c.set(shared.key()));

    loop {
        shared.lock().idle += 1;
        let received = rx.recv_timeout(idle_timeout);
        let mut st = shared.lock();
        st.idle -= 1;

        let job = match received {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => {
                if rx.is_empty() || st.stopped {
                    st.live -= 1;
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                st.live -= 1;
                return;
            }
        };

        while st.paused > 0 && !st.stopped && job.epoch == st.epoch {
            st = shared.wait(st);
        }
        if st.stopped || job.epoch != st.epoch {
            st.pending -= 1;
            drop(st);
            shared.changed.notify_all();
            continue;
        }
        st.running += 1;
        drop(st);

        run_task(shared, job.task);

        let mut st = shared.lock();
        st.running -= 1;
        st.pending -= 1;
        drop(st);
        shared.changed.notify_all();
    }
}

fn run_task(shared: &Shared, task: Task) {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => {
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => {
            shared.panicked.fetch_add(1, Ordering::Relaxed);
            let reason = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(reason = %reason, "evaluation task panicked");
        }
    }
}
