//! Named locks with logical-thread reentrancy and deadlock detection.
//!
//! Locks are created on first reference and retained for the session.
//! Ownership is keyed by logical thread, not OS thread or task: a callback
//! that weaves back into the process on a different worker reenters the
//! locks its logical thread already holds. Every acquisition that would
//! block first runs a cycle check over the wait-for graph and raises
//! `deadlock` instead of blocking when the requester would be waiting,
//! transitively, on itself.
//!
//! All state changes go through one critical section; waiters park on
//! oneshot channels outside it. Dropping a pending acquisition future
//! (timeout, session close) rolls its bookkeeping back, including the
//! race where the grant lands just before the drop.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

use crate::logical::LogicalId;

/// Name of the optional process-wide lock held across top-level requests.
pub const GLOBAL_LOCK_NAME: &str = "global";

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockMode {
    /// Sole ownership.
    Exclusive = 0,
    /// Ownership shared with other readers.
    Shared = 1,
}

impl LockMode {
    /// Decode a mode byte.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Exclusive),
            1 => Some(Self::Shared),
            _ => None,
        }
    }

    /// Wire code for this mode.
    #[must_use]
    pub const fn code(self) -> u8 { self as u8 }
}

/// Errors raised by lock operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// Granting the request would close a cycle in the wait-for graph.
    #[error("deadlock acquiring lock '{0}'")]
    Deadlock(String),
    /// A non-blocking or timed acquire could not take the lock.
    #[error("could not acquire lock '{0}'")]
    AcquireFailed(String),
    /// Release by a logical thread that does not hold the lock.
    #[error("lock '{0}' is not held by this logical thread")]
    NotHeld(String),
}

#[derive(Debug)]
enum Hold {
    Free,
    Exclusive { lt: LogicalId, depth: u32 },
    Shared { holders: HashMap<LogicalId, u32> },
}

impl Hold {
    fn holders(&self) -> Vec<LogicalId> {
        match self {
            Self::Free => Vec::new(),
            Self::Exclusive { lt, .. } => vec![*lt],
            Self::Shared { holders } => holders.keys().copied().collect(),
        }
    }

    fn depth_for(&self, lt: LogicalId) -> u32 {
        match self {
            Self::Free => 0,
            Self::Exclusive { lt: holder, depth } => {
                if *holder == lt {
                    *depth
                } else {
                    0
                }
            }
            Self::Shared { holders } => holders.get(&lt).copied().unwrap_or(0),
        }
    }

    /// Grant immediately if the rules allow; returns whether it did.
    fn try_grant(&mut self, lt: LogicalId, mode: LockMode) -> bool {
        match self {
            Self::Free => {
                *self = match mode {
                    LockMode::Exclusive => Self::Exclusive { lt, depth: 1 },
                    LockMode::Shared => Self::Shared {
                        holders: HashMap::from([(lt, 1)]),
                    },
                };
                true
            }
            Self::Exclusive { lt: holder, depth } => {
                // Reentry; a shared request on an exclusively-held lock
                // keeps the exclusive hold with the same depth semantics.
                if *holder == lt {
                    *depth += 1;
                    true
                } else {
                    false
                }
            }
            Self::Shared { holders } => match mode {
                LockMode::Shared => {
                    *holders.entry(lt).or_insert(0) += 1;
                    true
                }
                LockMode::Exclusive => {
                    // Sole-holder upgrade only.
                    if holders.len() == 1 && holders.contains_key(&lt) {
                        let depth = holders.values().sum::<u32>() + 1;
                        *self = Self::Exclusive { lt, depth };
                        true
                    } else {
                        false
                    }
                }
            },
        }
    }
}

#[derive(Debug)]
struct Waiter {
    id: u64,
    lt: LogicalId,
    mode: LockMode,
    tx: oneshot::Sender<()>,
}

#[derive(Debug)]
struct LockState {
    hold: Hold,
    queue: VecDeque<Waiter>,
}

#[derive(Debug, Default)]
struct Inner {
    locks: HashMap<String, LockState>,
    /// Lock each logical thread is currently blocked on, if any.
    waiting: HashMap<LogicalId, String>,
    next_waiter: u64,
}

impl Inner {
    fn state(&mut self, name: &str) -> &mut LockState {
        self.locks.entry(name.to_owned()).or_insert_with(|| LockState {
            hold: Hold::Free,
            queue: VecDeque::new(),
        })
    }

    /// Walk the wait-for graph from the holders of `want`; a path back to
    /// `candidate` is a cycle. The candidate's own hold on `want` is not an
    /// edge; a sole shared holder waiting to upgrade is blocked on the
    /// other holders, not on itself.
    fn would_deadlock(&self, candidate: LogicalId, want: &str) -> bool {
        let Some(state) = self.locks.get(want) else {
            return false;
        };
        let mut stack: Vec<LogicalId> = state
            .hold
            .holders()
            .into_iter()
            .filter(|h| *h != candidate)
            .collect();
        let mut seen = stack.clone();
        while let Some(lt) = stack.pop() {
            let Some(next_lock) = self.waiting.get(&lt) else {
                continue;
            };
            let Some(next_state) = self.locks.get(next_lock) else {
                continue;
            };
            for holder in next_state.hold.holders() {
                if holder == candidate {
                    return true;
                }
                if !seen.contains(&holder) {
                    seen.push(holder);
                    stack.push(holder);
                }
            }
        }
        false
    }

    /// Grant as many queued waiters as the hold now allows: either one
    /// exclusive head, or every shared waiter ahead of the first
    /// exclusive one.
    fn wake(&mut self, name: &str) {
        loop {
            let Some(state) = self.locks.get_mut(name) else {
                return;
            };
            let Some(head) = state.queue.front() else {
                return;
            };
            let (lt, mode) = (head.lt, head.mode);
            if !state.hold.try_grant(lt, mode) {
                return;
            }
            let waiter = state
                .queue
                .pop_front()
                .unwrap_or_else(|| unreachable!("front checked above"));
            self.waiting.remove(&waiter.lt);
            trace!(lock = name, lt = waiter.lt, "granted queued waiter");
            let _ = waiter.tx.send(());
        }
    }

    /// Decrement and, at depth zero, free the hold and wake the queue.
    fn release(&mut self, name: &str, lt: LogicalId) -> Result<(), LockError> {
        let Some(state) = self.locks.get_mut(name) else {
            return Err(LockError::NotHeld(name.to_owned()));
        };
        let freed = match &mut state.hold {
            Hold::Exclusive { lt: holder, depth } if *holder == lt => {
                *depth -= 1;
                *depth == 0
            }
            Hold::Shared { holders } if holders.contains_key(&lt) => {
                if let Some(depth) = holders.get_mut(&lt) {
                    *depth -= 1;
                    if *depth == 0 {
                        holders.remove(&lt);
                    }
                }
                holders.is_empty()
            }
            _ => return Err(LockError::NotHeld(name.to_owned())),
        };
        if freed {
            state.hold = Hold::Free;
            self.wake(name);
        }
        Ok(())
    }
}

/// Snapshot of one logical thread's holdings, for scoped restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockSnapshot {
    depths: HashMap<String, u32>,
}

/// The named-lock registry for one process.
#[derive(Debug, Default)]
pub struct LockManager {
    inner: Mutex<Inner>,
}

impl LockManager {
    /// Create (on first reference) the named lock; locks persist for the
    /// session.
    pub fn ensure(&self, name: &str) {
        let mut inner = self.lock_inner();
        let _ = inner.state(name);
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Depth of `lt`'s hold on `name` (0 when not held).
    #[must_use]
    pub fn held_depth(&self, name: &str, lt: LogicalId) -> u32 {
        self.lock_inner()
            .locks
            .get(name)
            .map_or(0, |s| s.hold.depth_for(lt))
    }

    /// Acquire, blocking until granted.
    ///
    /// # Errors
    /// Returns [`LockError::Deadlock`] when blocking would close a cycle
    /// in the wait-for graph, and [`LockError::AcquireFailed`] when the
    /// manager shuts down while the request is parked.
    pub async fn acquire(
        &self,
        name: &str,
        mode: LockMode,
        lt: LogicalId,
    ) -> Result<(), LockError> {
        let (waiter_id, rx) = {
            let mut inner = self.lock_inner();
            let state = inner.state(name);
            if state.hold.try_grant(lt, mode) {
                trace!(lock = name, lt, ?mode, "acquired immediately");
                return Ok(());
            }
            if inner.would_deadlock(lt, name) {
                trace!(lock = name, lt, "deadlock detected at acquire");
                return Err(LockError::Deadlock(name.to_owned()));
            }
            inner.next_waiter += 1;
            let waiter_id = inner.next_waiter;
            let (tx, rx) = oneshot::channel();
            inner.state(name).queue.push_back(Waiter {
                id: waiter_id,
                lt,
                mode,
                tx,
            });
            inner.waiting.insert(lt, name.to_owned());
            (waiter_id, rx)
        };
        let mut ticket = WaitTicket {
            manager: self,
            name,
            waiter_id,
            lt,
            armed: true,
        };
        match rx.await {
            Ok(()) => {
                ticket.armed = false;
                Ok(())
            }
            Err(_) => {
                // Sender dropped: the manager cleared its queues.
                ticket.armed = false;
                let mut inner = self.lock_inner();
                inner.waiting.remove(&lt);
                Err(LockError::AcquireFailed(name.to_owned()))
            }
        }
    }

    /// Acquire with a deadline; expiry counts as a failed try-acquire.
    ///
    /// # Errors
    /// As [`LockManager::acquire`], plus [`LockError::AcquireFailed`] on
    /// timeout.
    pub async fn acquire_timeout(
        &self,
        name: &str,
        mode: LockMode,
        lt: LogicalId,
        timeout: Duration,
    ) -> Result<(), LockError> {
        match tokio::time::timeout(timeout, self.acquire(name, mode, lt)).await {
            Ok(result) => result,
            Err(_) => Err(LockError::AcquireFailed(name.to_owned())),
        }
    }

    /// Acquire without ever blocking.
    ///
    /// The deadlock check still runs first so callers see `deadlock`
    /// rather than `acquire_failed` when both apply.
    ///
    /// # Errors
    /// Returns [`LockError::Deadlock`] or [`LockError::AcquireFailed`].
    pub fn try_acquire(&self, name: &str, mode: LockMode, lt: LogicalId) -> Result<(), LockError> {
        let mut inner = self.lock_inner();
        if inner.would_deadlock(lt, name) {
            return Err(LockError::Deadlock(name.to_owned()));
        }
        let state = inner.state(name);
        if state.hold.try_grant(lt, mode) {
            Ok(())
        } else {
            Err(LockError::AcquireFailed(name.to_owned()))
        }
    }

    /// Release one acquisition.
    ///
    /// # Errors
    /// Returns [`LockError::NotHeld`] when `lt` does not hold the lock.
    pub fn release(&self, name: &str, lt: LogicalId) -> Result<(), LockError> {
        self.lock_inner().release(name, lt)
    }

    /// Snapshot `lt`'s current holdings.
    #[must_use]
    pub fn save(&self, lt: LogicalId) -> LockSnapshot {
        let inner = self.lock_inner();
        let depths = inner
            .locks
            .iter()
            .filter_map(|(name, state)| {
                let depth = state.hold.depth_for(lt);
                (depth > 0).then(|| (name.clone(), depth))
            })
            .collect();
        LockSnapshot { depths }
    }

    /// Release everything acquired since `snapshot` was taken, restoring
    /// `lt`'s holdings to the recorded depths.
    pub fn restore(&self, lt: LogicalId, snapshot: &LockSnapshot) {
        let held = self.save(lt);
        for (name, depth) in &held.depths {
            let target = snapshot.depths.get(name).copied().unwrap_or(0);
            for _ in target..*depth {
                let _ = self.release(name, lt);
            }
        }
    }

    /// Release every lock held by `lt`.
    pub fn drop_all(&self, lt: LogicalId) {
        self.restore(lt, &LockSnapshot::default());
    }

    /// Fail every parked waiter; used at session teardown.
    pub fn shutdown(&self) {
        let mut inner = self.lock_inner();
        for state in inner.locks.values_mut() {
            state.queue.clear();
        }
        inner.waiting.clear();
    }
}

struct WaitTicket<'a> {
    manager: &'a LockManager,
    name: &'a str,
    waiter_id: u64,
    lt: LogicalId,
    armed: bool,
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The acquire future was dropped (timeout or cancellation).
        let mut inner = self.manager.lock_inner();
        let still_queued = inner.locks.get_mut(self.name).is_some_and(|state| {
            let before = state.queue.len();
            state.queue.retain(|w| w.id != self.waiter_id);
            state.queue.len() != before
        });
        if still_queued {
            inner.waiting.remove(&self.lt);
            return;
        }
        // The grant raced the drop: the lock is held but nobody will use
        // it. Undo the grant so the queue keeps moving.
        let _ = inner.release(self.name, self.lt);
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use rstest::rstest;

    use super::*;

    const LT1: LogicalId = 1;
    const LT2: LogicalId = 2;
    const LT3: LogicalId = 3;

    #[tokio::test]
    async fn exclusive_reentry_counts_depth() {
        let mgr = LockManager::default();
        mgr.acquire("L", LockMode::Exclusive, LT1).await.unwrap();
        mgr.acquire("L", LockMode::Exclusive, LT1).await.unwrap();
        assert_eq!(mgr.held_depth("L", LT1), 2);
        mgr.release("L", LT1).unwrap();
        assert_eq!(mgr.held_depth("L", LT1), 1);
        // Still held: another logical thread cannot take it.
        assert_eq!(
            mgr.try_acquire("L", LockMode::Exclusive, LT2),
            Err(LockError::AcquireFailed("L".to_owned()))
        );
        mgr.release("L", LT1).unwrap();
        mgr.try_acquire("L", LockMode::Exclusive, LT2).unwrap();
    }

    #[tokio::test]
    async fn deadlock_detected_at_acquire_time() {
        let mgr = Arc::new(LockManager::default());
        mgr.acquire("A", LockMode::Exclusive, LT1).await.unwrap();
        mgr.acquire("B", LockMode::Exclusive, LT2).await.unwrap();
        // LT2 blocks on A (held by LT1).
        let pending = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("A", LockMode::Exclusive, LT2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // LT1 requesting B would close the cycle.
        assert_eq!(
            mgr.acquire("B", LockMode::Exclusive, LT1).await,
            Err(LockError::Deadlock("B".to_owned()))
        );
        // Unwind: LT1 releases A, LT2's pending acquire completes.
        mgr.release("A", LT1).unwrap();
        pending.await.unwrap().unwrap();
        assert_eq!(mgr.held_depth("A", LT2), 1);
    }

    #[tokio::test]
    async fn try_acquire_prefers_deadlock_over_failure() {
        let mgr = Arc::new(LockManager::default());
        mgr.acquire("A", LockMode::Exclusive, LT1).await.unwrap();
        mgr.acquire("B", LockMode::Exclusive, LT2).await.unwrap();
        let _pending = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("A", LockMode::Exclusive, LT2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            mgr.try_acquire("B", LockMode::Exclusive, LT1),
            Err(LockError::Deadlock("B".to_owned()))
        );
        // A third thread merely fails.
        assert_eq!(
            mgr.try_acquire("B", LockMode::Exclusive, LT3),
            Err(LockError::AcquireFailed("B".to_owned()))
        );
    }

    #[tokio::test]
    async fn shared_holders_coexist_and_block_writers() {
        let mgr = LockManager::default();
        mgr.acquire("L", LockMode::Shared, LT1).await.unwrap();
        mgr.acquire("L", LockMode::Shared, LT2).await.unwrap();
        assert_eq!(
            mgr.try_acquire("L", LockMode::Exclusive, LT3),
            Err(LockError::AcquireFailed("L".to_owned()))
        );
        mgr.release("L", LT1).unwrap();
        mgr.release("L", LT2).unwrap();
        mgr.try_acquire("L", LockMode::Exclusive, LT3).unwrap();
    }

    #[tokio::test]
    async fn sole_shared_holder_upgrades() {
        let mgr = LockManager::default();
        mgr.acquire("L", LockMode::Shared, LT1).await.unwrap();
        mgr.acquire("L", LockMode::Exclusive, LT1).await.unwrap();
        assert_eq!(mgr.held_depth("L", LT1), 2);
        // Both acquisitions must be balanced by releases.
        mgr.release("L", LT1).unwrap();
        mgr.release("L", LT1).unwrap();
        assert_eq!(mgr.held_depth("L", LT1), 0);
    }

    #[tokio::test]
    async fn release_wakes_shared_waiters_together() {
        let mgr = Arc::new(LockManager::default());
        mgr.acquire("L", LockMode::Exclusive, LT1).await.unwrap();
        let r1 = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("L", LockMode::Shared, LT2).await })
        };
        let r2 = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("L", LockMode::Shared, LT3).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.release("L", LT1).unwrap();
        r1.await.unwrap().unwrap();
        r2.await.unwrap().unwrap();
        assert_eq!(mgr.held_depth("L", LT2), 1);
        assert_eq!(mgr.held_depth("L", LT3), 1);
    }

    #[tokio::test]
    async fn timeout_rolls_back_the_waiter() {
        let mgr = LockManager::default();
        mgr.acquire("L", LockMode::Exclusive, LT1).await.unwrap();
        let err = mgr
            .acquire_timeout("L", LockMode::Exclusive, LT2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, LockError::AcquireFailed("L".to_owned()));
        // The abandoned waiter must not absorb the next grant.
        mgr.release("L", LT1).unwrap();
        mgr.try_acquire("L", LockMode::Exclusive, LT3).unwrap();
    }

    #[tokio::test]
    async fn save_restore_releases_interim_acquisitions() {
        let mgr = LockManager::default();
        mgr.acquire("A", LockMode::Exclusive, LT1).await.unwrap();
        let snapshot = mgr.save(LT1);
        mgr.acquire("A", LockMode::Exclusive, LT1).await.unwrap();
        mgr.acquire("B", LockMode::Exclusive, LT1).await.unwrap();
        mgr.restore(LT1, &snapshot);
        assert_eq!(mgr.held_depth("A", LT1), 1);
        assert_eq!(mgr.held_depth("B", LT1), 0);
        mgr.drop_all(LT1);
        assert_eq!(mgr.held_depth("A", LT1), 0);
    }

    #[tokio::test]
    async fn competing_upgrades_deadlock() {
        let mgr = Arc::new(LockManager::default());
        mgr.acquire("L", LockMode::Shared, LT1).await.unwrap();
        mgr.acquire("L", LockMode::Shared, LT2).await.unwrap();
        // LT1 parks on the upgrade, waiting for LT2 to release.
        let _pending = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("L", LockMode::Exclusive, LT1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // A second upgrade attempt closes the cycle.
        assert_eq!(
            mgr.acquire("L", LockMode::Exclusive, LT2).await,
            Err(LockError::Deadlock("L".to_owned()))
        );
    }

    #[rstest]
    fn mode_codes_round_trip() {
        assert_eq!(LockMode::from_code(0), Some(LockMode::Exclusive));
        assert_eq!(LockMode::from_code(1), Some(LockMode::Shared));
        assert_eq!(LockMode::from_code(2), None);
    }
}
