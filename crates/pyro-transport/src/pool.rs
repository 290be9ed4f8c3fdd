//! `WorkerPool` — an elastic pool of concurrency units draining a shared
//! job queue.
//!
//! The unit of concurrency is a Tokio task rather than an OS thread: on
//! the multi-thread runtime a spawned task genuinely runs in parallel
//! with its siblings, which is all the elasticity and FIFO invariants
//! below actually require (see DESIGN.md, Open Question d). A single
//! mutex guards the `idle`/`busy` counts and every spawn decision; we
//! track counts rather than full `idle`/`busy` sets of connection
//! identities, since nothing downstream needs to enumerate them by
//! identity — a simplification recorded in DESIGN.md.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum QueueItem {
    Job(Job),
    /// The `nil` termination sentinel: one is pushed per
    /// worker by `close()`.
    Halt,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error(
        "worker pool has {busy} active workers but the queue still holds {queued} non-sentinel jobs"
    )]
    StillActive { busy: usize, queued: usize },
}

#[derive(Debug, Default)]
struct PoolState {
    idle: usize,
    busy: usize,
}

struct PoolInner {
    sender: mpsc::UnboundedSender<QueueItem>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueItem>>,
    queue_len: AtomicUsize,
    state: Mutex<PoolState>,
    min_threads: usize,
    max_threads: usize,
    idle_timeout: Duration,
}

/// Elastic pool with bounds `MIN <= N <= MAX`.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(min_threads: usize, max_threads: usize, idle_timeout: Duration) -> Self {
        assert!(min_threads <= max_threads, "MIN must be <= MAX");
        let (sender, receiver) = mpsc::unbounded_channel();
        let pool = WorkerPool {
            inner: Arc::new(PoolInner {
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                queue_len: AtomicUsize::new(0),
                state: Mutex::new(PoolState::default()),
                min_threads,
                max_threads,
                idle_timeout,
            }),
        };
        for _ in 0..min_threads {
            pool.spawn_worker(false);
        }
        pool
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").idle
    }

    pub fn busy_count(&self) -> usize {
        self.inner.state.lock().expect("pool lock poisoned").busy
    }

    pub fn worker_count(&self) -> usize {
        let state = self.inner.state.lock().expect("pool lock poisoned");
        state.idle + state.busy
    }

    /// Enqueue a job, growing the pool under this policy: if no worker is
    /// idle and the pool is below `MAX`, spawn one; if the queue is still
    /// deeper than one job after that, keep spawning until either the
    /// queue drains to one or the cap is reached.
    pub fn process(&self, job: Job) {
        self.inner.queue_len.fetch_add(1, Ordering::SeqCst);
        let _ = self.inner.sender.send(QueueItem::Job(job));
        self.grow_if_needed();
    }

    fn grow_if_needed(&self) {
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        loop {
            let total = state.idle + state.busy;
            let at_cap = total >= self.inner.max_threads;
            let no_idle = state.idle == 0;
            if !(no_idle && !at_cap) {
                break;
            }
            state.idle += 1;
            drop(state);
            self.spawn_worker(true);
            state = self.inner.state.lock().expect("pool lock poisoned");
            if self.inner.queue_len.load(Ordering::SeqCst) <= 1 {
                break;
            }
        }
    }

    /// Spawn one worker task. When `pre_counted` is `false`, this bumps
    /// `idle` itself (used for the initial `MIN` spawns at construction);
    /// `grow_if_needed` instead bumps the count itself while still
    /// holding the lock and passes `true`, to keep "decide to grow" and
    /// "the count reflects that decision" atomic.
    fn spawn_worker(&self, pre_counted: bool) {
        if !pre_counted {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.idle += 1;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(worker_loop(inner));
    }

    /// Push one `Halt` sentinel per current worker and return immediately
    ///.
    pub fn close(&self) {
        let count = self.worker_count();
        for _ in 0..count {
            let _ = self.inner.sender.send(QueueItem::Halt);
        }
    }

    /// Block until the job queue is empty and no worker remains busy.
    pub async fn drain(&self) -> Result<(), PoolError> {
        let mut stalled_ticks = 0u32;
        let mut last = (usize::MAX, usize::MAX);
        loop {
            let (busy, queued) = {
                let state = self.inner.state.lock().expect("pool lock poisoned");
                (state.busy, self.inner.queue_len.load(Ordering::SeqCst))
            };
            if queued == 0 && busy == 0 {
                return Ok(());
            }
            if busy == 0 && queued > 0 {
                // no worker will ever pick these up: every worker has halted.
                return Err(PoolError::StillActive { busy, queued });
            }
            if (busy, queued) == last {
                stalled_ticks += 1;
                if stalled_ticks > 200 {
                    return Err(PoolError::StillActive { busy, queued });
                }
            } else {
                stalled_ticks = 0;
                last = (busy, queued);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let item = {
            let mut rx = inner.receiver.lock().await;
            timeout(inner.idle_timeout, rx.recv()).await
        };

        match item {
            Err(_elapsed) => {
                let mut state = inner.state.lock().expect("pool lock poisoned");
                let total = state.idle + state.busy;
                if total > inner.min_threads {
                    state.idle -= 1;
                    debug!(remaining = total - 1, "worker halted after idle timeout");
                    return;
                }
                // stay at MIN, keep waiting
            }
            Ok(None) => {
                let mut state = inner.state.lock().expect("pool lock poisoned");
                state.idle = state.idle.saturating_sub(1);
                debug!("worker halted: job channel closed");
                return;
            }
            Ok(Some(QueueItem::Halt)) => {
                let mut state = inner.state.lock().expect("pool lock poisoned");
                state.idle = state.idle.saturating_sub(1);
                debug!("worker halted: sentinel received");
                return;
            }
            Ok(Some(QueueItem::Job(job))) => {
                {
                    let mut state = inner.state.lock().expect("pool lock poisoned");
                    state.idle = state.idle.saturating_sub(1);
                    state.busy += 1;
                }
                inner.queue_len.fetch_sub(1, Ordering::SeqCst);

                let outcome = AssertUnwindSafe(job).catch_unwind().await;

                let mut state = inner.state.lock().expect("pool lock poisoned");
                state.busy -= 1;
                match outcome {
                    Ok(()) => {
                        state.idle += 1;
                    }
                    Err(_) => {
                        debug!("worker halted: job panicked");
                        drop(state);
                        return;
                    }
                }
            }
        }
    }
}
