//! The worker pool that services incoming request tasks.
//!
//! Workers exist in three states: idle (parked on the queue), busy on a
//! request, or busy-awaiting-response, suspended inside an outgoing call
//! whose reply has not arrived. The pool starts at a configured minimum
//! and grows on demand: when a task is queued and every worker is either
//! busy or awaiting, a fresh worker is spawned so that re-entrant
//! callbacks can make progress instead of deadlocking the pool. There is
//! no hard cap; memory and scheduler limits apply.

use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, trace};

use crate::logical::WorkerId;

/// One unit of work: the serving worker's id is passed in so the task can
/// bind its logical identity.
pub type PoolTask = Box<dyn FnOnce(WorkerId) -> BoxFuture<'static, ()> + Send>;

#[derive(Debug)]
struct PoolShared {
    tx: mpsc::UnboundedSender<PoolTask>,
    rx: Mutex<mpsc::UnboundedReceiver<PoolTask>>,
    queued: AtomicUsize,
    idle: AtomicUsize,
    busy: AtomicUsize,
    awaiting: AtomicUsize,
    total: AtomicUsize,
    next_worker: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("total", &self.shared.total.load(Ordering::Relaxed))
            .field("idle", &self.shared.idle.load(Ordering::Relaxed))
            .field("awaiting", &self.shared.awaiting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Pool of worker tasks consuming the incoming-request queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// Start a pool with `min` permanent workers (at least one).
    #[must_use]
    pub fn new(min: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            tx,
            rx: Mutex::new(rx),
            queued: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            awaiting: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            next_worker: AtomicU64::new(0),
            shutdown,
        });
        let pool = Self { shared };
        for _ in 0..min.max(1) {
            pool.spawn_worker();
        }
        pool
    }

    fn spawn_worker(&self) {
        let shared = Arc::clone(&self.shared);
        let worker_id = shared.next_worker.fetch_add(1, Ordering::Relaxed) + 1;
        shared.total.fetch_add(1, Ordering::Relaxed);
        debug!(worker_id, "spawning pool worker");
        tokio::spawn(async move {
            let mut shutdown_rx = shared.shutdown.subscribe();
            loop {
                shared.idle.fetch_add(1, Ordering::Relaxed);
                let task = tokio::select! {
                    task = async {
                        let mut rx = shared.rx.lock().await;
                        rx.recv().await
                    } => task,
                    _ = shutdown_rx.changed() => None,
                };
                shared.idle.fetch_sub(1, Ordering::Relaxed);
                let Some(task) = task else { break };
                shared.queued.fetch_sub(1, Ordering::Relaxed);
                shared.busy.fetch_add(1, Ordering::Relaxed);
                task(worker_id).await;
                shared.busy.fetch_sub(1, Ordering::Relaxed);
            }
            shared.total.fetch_sub(1, Ordering::Relaxed);
            trace!(worker_id, "pool worker exiting");
        });
    }

    /// Queue a task; grows the pool when no worker is free to take it and
    /// at least one is parked awaiting a response.
    ///
    /// Returns `false` after shutdown.
    pub fn submit(&self, task: PoolTask) -> bool {
        if *self.shared.shutdown.borrow() {
            return false;
        }
        self.shared.queued.fetch_add(1, Ordering::Relaxed);
        if self.shared.tx.send(task).is_err() {
            self.shared.queued.fetch_sub(1, Ordering::Relaxed);
            return false;
        }
        self.grow_if_starved();
        true
    }

    fn grow_if_starved(&self) {
        let idle = self.shared.idle.load(Ordering::Relaxed);
        let awaiting = self.shared.awaiting.load(Ordering::Relaxed);
        let queued = self.shared.queued.load(Ordering::Relaxed);
        if queued > 0 && idle == 0 && awaiting > 0 {
            self.spawn_worker();
        }
    }

    /// Mark the current worker as awaiting a response for the duration of
    /// the returned guard; nudges the pool to grow when queued work would
    /// otherwise starve.
    #[must_use]
    pub fn awaiting_guard(&self) -> AwaitGuard {
        self.shared.busy.fetch_sub(1, Ordering::Relaxed);
        self.shared.awaiting.fetch_add(1, Ordering::Relaxed);
        self.grow_if_starved();
        AwaitGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Workers currently parked on the queue.
    #[must_use]
    pub fn idle_count(&self) -> usize { self.shared.idle.load(Ordering::Relaxed) }

    /// Workers currently suspended inside an outgoing call.
    #[must_use]
    pub fn awaiting_count(&self) -> usize { self.shared.awaiting.load(Ordering::Relaxed) }

    /// Workers alive in the pool.
    #[must_use]
    pub fn total_count(&self) -> usize { self.shared.total.load(Ordering::Relaxed) }

    /// Stop accepting work and wake every idle worker to exit.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }
}

/// RAII marker for the busy-awaiting-response state.
pub struct AwaitGuard {
    shared: Arc<PoolShared>,
}

impl Drop for AwaitGuard {
    fn drop(&mut self) {
        self.shared.awaiting.fetch_sub(1, Ordering::Relaxed);
        self.shared.busy.fetch_add(1, Ordering::Relaxed);
    }
}
