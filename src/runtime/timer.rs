//! Cancellable deferred tasks keyed by id.
//!
//! One timer thread per instance. A key has at most one pending task; cancel
//! is idempotent and cancelling after the task fired is a no-op.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{ExecutionError, ProxError, ProxResult};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    seq: u64,
    task: Task,
}

struct TimerState<K> {
    entries: HashMap<K, Entry>,
    keys_by_seq: HashMap<u64, K>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    next_seq: u64,
    stopped: bool,
}

struct TimerShared<K> {
    state: Mutex<TimerState<K>>,
    changed: Condvar,
}

impl<K> TimerShared<K> {
    fn lock(&self) -> MutexGuard<'_, TimerState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A timer thread running keyed, cancellable one-shot tasks.
pub struct DeferredTasks<K> {
    name: String,
    shared: Arc<TimerShared<K>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<K> fmt::Debug for DeferredTasks<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.shared.lock();
        f.debug_struct("DeferredTasks")
            .field("name", &self.name)
            .field("pending", &st.entries.len())
            .field("stopped", &st.stopped)
            .finish()
    }
}

impl<K> DeferredTasks<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    /// Starts the timer thread.
    pub fn new(name: impl Into<String>) -> ProxResult<Self> {
        let name = name.into();
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                entries: HashMap::new(),
                keys_by_seq: HashMap::new(),
                deadlines: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            changed: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || timer_loop(&thread_shared))
            .map_err(|e| ProxError::internal(format!("failed to spawn timer thread: {e}")))?;

        Ok(Self {
            name,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Arms `task` to run after `delay` unless cancelled.
    ///
    /// Returns `Ok(false)` and drops `task` if `key` already has a pending task.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F) -> ProxResult<bool>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = self.shared.lock();
        if st.stopped {
            return Err(ProxError::Execution(ExecutionError::Stopped {
                component: self.name.clone(),
            }));
        }
        if st.entries.contains_key(&key) {
            return Ok(false);
        }

        let seq = st.next_seq;
        st.next_seq += 1;
        st.deadlines.push(Reverse((Instant::now() + delay, seq)));
        st.keys_by_seq.insert(seq, key.clone());
        st.entries.insert(
            key,
            Entry {
                seq,
                task: Box::new(task),
            },
        );
        drop(st);
        self.shared.changed.notify_all();
        Ok(true)
    }

    /// Cancels the pending task for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = {
            let mut st = self.shared.lock();
            let removed = st.entries.remove(key);
            if let Some(entry) = &removed {
                st.keys_by_seq.remove(&entry.seq);
            }
            removed
        };
        match removed {
            Some(_) => {
                debug!(timer = %self.name, key = ?key, "deferred task cancelled");
                true
            }
            None => false,
        }
    }

    /// Whether `key` has an armed task.
    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    /// Number of armed tasks.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.lock().entries.len()
    }
}

impl<K> DeferredTasks<K> {
    /// Stops the timer thread, dropping armed tasks. Idempotent.
    pub fn stop(&self) {
        let abandoned = {
            let mut st = self.shared.lock();
            if st.stopped {
                return;
            }
            st.stopped = true;
            st.keys_by_seq.clear();
            st.deadlines.clear();
            std::mem::take(&mut st.entries)
        };
        self.shared.changed.notify_all();
        // Task captures are dropped outside the lock.
        drop(abandoned);

        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl<K> Drop for DeferredTasks<K> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn timer_loop<K: Eq + Hash>(shared: &TimerShared<K>) {
    let mut st = shared.lock();
    loop {
        if st.stopped {
            return;
        }

        let now = Instant::now();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, seq))) = st.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            st.deadlines.pop();
            // Cancelled entries leave stale deadlines behind.
            if let Some(key) = st.keys_by_seq.remove(&seq) {
                if let Some(entry) = st.entries.remove(&key) {
                    due.push(entry.task);
                }
            }
        }

        if !due.is_empty() {
            drop(st);
            for task in due {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    warn!("deferred task panicked");
                }
            }
            st = shared.lock();
            continue;
        }

        st = match st.deadlines.peek().copied() {
            Some(Reverse((deadline, _))) => {
                let wait = deadline.saturating_duration_since(now);
                shared
                    .changed
                    .wait_timeout(st, wait)
                    .map(|(g, _)| g)
                    .unwrap_or_else(|e| e.into_inner().0)
            }
            None => shared.changed.wait(st).unwrap_or_else(PoisonError::into_inner),
        };
    }
}
