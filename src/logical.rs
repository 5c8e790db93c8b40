//! Logical-thread identity.
//!
//! A logical thread is the conceptual thread of control spanning nested
//! calls between the two peers. It is assigned when a top-level request
//! first enters the system, carried on every outgoing frame, and adopted
//! by whichever worker serves an incoming task, so a callback arriving
//! mid-call executes under the same logical identity as the call that
//! provoked it, and reentrant lock acquisition works across the process
//! boundary.

use std::{
    collections::HashMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use thiserror::Error;

/// Session-unique logical-thread identifier.
pub type LogicalId = u64;

/// Identifier of a pool worker within one engine.
pub type WorkerId = u64;

/// Ids minted by the peer that did not originate the session carry this
/// bit so the two allocators can never collide.
pub const LOCAL_ORIGIN_BIT: u64 = 1 << 63;

tokio::task_local! {
    static CURRENT_LOGICAL: LogicalId;
}

/// Run `fut` with the given logical identity in scope.
pub async fn scope<F>(id: LogicalId, fut: F) -> F::Output
where
    F: std::future::Future,
{
    CURRENT_LOGICAL.scope(id, fut).await
}

/// The logical identity of the current task, if any.
#[must_use]
pub fn current() -> Option<LogicalId> {
    CURRENT_LOGICAL.try_with(|id| *id).ok()
}

/// Errors raised by the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogicalError {
    /// A worker attempted to rebind to a different logical id without an
    /// intervening unbind. Always a programming error.
    #[error("worker {worker} already bound to logical thread {bound}, refusing {requested}")]
    Rebind {
        /// Worker that attempted the rebind.
        worker: WorkerId,
        /// Id the worker is currently bound to.
        bound: LogicalId,
        /// Id the rebind requested.
        requested: LogicalId,
    },
}

/// Allocator and worker-binding registry for logical-thread ids.
#[derive(Debug)]
pub struct LogicalThreads {
    next: AtomicU64,
    origin_bit: u64,
    bindings: Mutex<HashMap<WorkerId, LogicalId>>,
}

impl LogicalThreads {
    /// Registry for the session-originating peer (ids count up from 1).
    #[must_use]
    pub fn originator() -> Self { Self::with_origin(0) }

    /// Registry for the answering peer (ids carry [`LOCAL_ORIGIN_BIT`]).
    #[must_use]
    pub fn responder() -> Self { Self::with_origin(LOCAL_ORIGIN_BIT) }

    fn with_origin(origin_bit: u64) -> Self {
        Self {
            next: AtomicU64::new(0),
            origin_bit,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh id for a top-level entry into the system.
    #[must_use]
    pub fn allocate(&self) -> LogicalId {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        n | self.origin_bit
    }

    /// Bind a worker to the logical id of the task it is about to serve.
    ///
    /// Binding the id the worker is already bound to is a no-op, so the
    /// nested segments of one logical thread may share a worker.
    ///
    /// # Errors
    /// Returns [`LogicalError::Rebind`] when the worker is bound to a
    /// different id.
    pub fn bind(&self, worker: WorkerId, logical: LogicalId) -> Result<(), LogicalError> {
        let mut bindings = self
            .bindings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match bindings.get(&worker) {
            Some(&bound) if bound != logical => Err(LogicalError::Rebind {
                worker,
                bound,
                requested: logical,
            }),
            _ => {
                bindings.insert(worker, logical);
                Ok(())
            }
        }
    }

    /// The logical id a worker is currently bound to.
    #[must_use]
    pub fn bound(&self, worker: WorkerId) -> Option<LogicalId> {
        self.bindings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&worker)
            .copied()
    }

    /// Release a worker's binding at task completion.
    pub fn unbind(&self, worker: WorkerId) {
        self.bindings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&worker);
    }
}
