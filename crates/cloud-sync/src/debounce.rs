//! Trailing-edge write coalescing, one pending timer per key.

use futures::future::BoxFuture;
use futures::FutureExt;
use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

type WriteJob = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct PendingWrite {
    generation: u64,
    job: WriteJob,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct DebounceState {
    next_generation: u64,
    pending: HashMap<String, PendingWrite>,
    /// Serializes writes per key so a slow write is never overtaken.
    lanes: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Writes taken out of `pending` that have not finished yet.
    running: usize,
}

impl DebounceState {
    fn lane(&mut self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.lanes.entry(key.to_string()).or_default())
    }
}

/// Counts one running write; signals `idle` when the last one finishes.
struct RunningWrite {
    state: Arc<Mutex<DebounceState>>,
    idle: Arc<Notify>,
}

impl RunningWrite {
    /// Must be created while `state` is locked, in the same critical section
    /// that removes the job from `pending`.
    fn start(
        state: &mut DebounceState,
        shared: &Arc<Mutex<DebounceState>>,
        idle: &Arc<Notify>,
    ) -> Self {
        state.running += 1;
        Self {
            state: Arc::clone(shared),
            idle: Arc::clone(idle),
        }
    }
}

impl Drop for RunningWrite {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.running -= 1;
        if state.running == 0 {
            self.idle.notify_waiters();
        }
    }
}

/// Coalesces bursts of writes for the same key into one write of the latest
/// payload once the key has been idle for `delay`.
///
/// Only the pending timer is ever cancelled; a write that already started
/// runs to completion.
#[derive(Clone, Default)]
pub struct DebouncedWriter {
    state: Arc<Mutex<DebounceState>>,
    idle: Arc<Notify>,
}

impl DebouncedWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any pending write for `key` with `write_fn(payload)` due after `delay`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<T, F, Fut>(
        &self,
        key: impl Into<String>,
        payload: T,
        write_fn: F,
        delay: Duration,
    ) where
        T: Send + 'static,
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        let job: WriteJob = Box::new(move || write_fn(payload).boxed());

        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let shared = Arc::clone(&self.state);
        let idle = Arc::clone(&self.idle);
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let due = {
                let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
                let owned = state
                    .pending
                    .get(&timer_key)
                    .is_some_and(|pending| pending.generation == generation);
                match owned.then(|| state.pending.remove(&timer_key)).flatten() {
                    Some(pending) => {
                        let lane = state.lane(&timer_key);
                        let running = RunningWrite::start(&mut state, &shared, &idle);
                        Some((pending.job, lane, running))
                    }
                    None => None,
                }
            };
            if let Some((job, lane, _running)) = due {
                let _serial = lane.lock().await;
                job().await;
            }
        });

        if let Some(previous) = state.pending.insert(
            key.clone(),
            PendingWrite {
                generation,
                job,
                timer,
            },
        ) {
            previous.timer.abort();
            debug!("[Debounce] Coalesced pending write for {}", key);
        }
    }

    /// Drops the pending write for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &str) -> bool {
        match self.lock().pending.remove(key) {
            Some(pending) => {
                pending.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Runs every pending write now, then waits until no write is running,
    /// including ones whose timer had already fired. Returns how many were
    /// pending.
    pub async fn flush_all(&self) -> usize {
        let due: Vec<(WriteJob, Arc<tokio::sync::Mutex<()>>, RunningWrite)> = {
            let mut state = self.lock();
            let keys: Vec<String> = state.pending.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|key| {
                    let lane = state.lane(&key);
                    let pending = state.pending.remove(&key)?;
                    pending.timer.abort();
                    let running = RunningWrite::start(&mut state, &self.state, &self.idle);
                    Some((pending.job, lane, running))
                })
                .collect()
        };

        let count = due.len();
        if count > 0 {
            debug!("[Debounce] Flushing {} pending write(s)", count);
        }
        futures::future::join_all(due.into_iter().map(|(job, lane, running)| async move {
            let _serial = lane.lock().await;
            job().await;
            drop(running);
        }))
        .await;

        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.lock().running == 0 {
                break;
            }
            idle.await;
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for DebouncedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebouncedWriter")
            .field("pending", &self.pending_count())
            .finish()
    }
}
