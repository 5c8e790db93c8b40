//! Client-exported callables.
//!
//! When a callable crosses the wire it is parked here under a numeric
//! handle; the peer's dynamic proxy routes every invocation back through
//! INVOKE_PROXY_CALLBACK to the registered closure. Entries are
//! reference-counted the same way object exports are: each transmission
//! bumps the count, and a count-carrying release frees the slot.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::future::BoxFuture;

use super::ClientValue;

/// A registered callable: the interface method name (empty for bare
/// callables) plus the decoded arguments. The body may itself make
/// nested bridge calls; it runs under the logical thread of the call
/// that provoked it, so locks held by that thread are reentrant here.
pub type CallbackFn = Arc<
    dyn Fn(&str, Vec<ClientValue>) -> BoxFuture<'static, Result<ClientValue, String>>
        + Send
        + Sync,
>;

struct Entry {
    f: CallbackFn,
    arity: u8,
    refs: u64,
}

/// Table of callables this side has exported to the peer.
#[derive(Default)]
pub struct CallbackTable {
    next: AtomicU64,
    map: Mutex<HashMap<u64, Entry>>,
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl CallbackTable {
    /// Park a callable and return its wire handle.
    pub fn register(&self, f: CallbackFn, arity: u8) -> u64 {
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(handle, Entry { f, arity, refs: 1 });
        handle
    }

    /// Look up a callable for an incoming invocation.
    #[must_use]
    pub fn get(&self, handle: u64) -> Option<(CallbackFn, u8)> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&handle)
            .map(|e| (Arc::clone(&e.f), e.arity))
    }

    /// Apply a count-carrying release from the peer.
    pub fn release(&self, handle: u64, count: u64) {
        let mut map = self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(entry) = map.get_mut(&handle) {
            entry.refs = entry.refs.saturating_sub(count);
            if entry.refs == 0 {
                map.remove(&handle);
            }
        }
    }

    /// Live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop everything at session end.
    pub fn clear(&self) {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn refcounted_release() {
        let table = CallbackTable::default();
        let h = table.register(
            Arc::new(|_, _| Box::pin(async { Ok(ClientValue::Null) }) as BoxFuture<'static, _>),
            1,
        );
        assert!(table.get(h).is_some());
        table.release(h, 1);
        assert!(table.get(h).is_none());
        assert!(table.is_empty());
    }
}
