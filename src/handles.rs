//! Per-session handle tables.
//!
//! The export table maps each object sent across the wire to a stable
//! numeric handle with a reference count; ids are never reused within a
//! session, and exporting the same object twice (by identity, not by
//! structure) yields the same handle with the count bumped. The import
//! side keeps a weak cache of shims so that a handle seen twice reuses the
//! live shim instead of growing a second one.
//!
//! A RELEASE_HANDLE can cross a re-export of the same object in flight.
//! Decrefs therefore carry the count observed by the releasing side and
//! the arithmetic is applied strictly in dispatch order: a decref landing
//! after a re-incref nets positive and the export survives.

use std::{
    collections::HashMap,
    sync::{
        Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::trace;

use crate::runtime::ObjectInstance;

/// Refcounted table of locally-owned objects visible to the peer.
#[derive(Debug, Default)]
pub struct ExportTable {
    next: AtomicU64,
    inner: Mutex<ExportInner>,
}

#[derive(Debug, Default)]
struct ExportInner {
    by_handle: HashMap<u64, Export>,
    by_identity: HashMap<usize, u64>,
}

#[derive(Debug)]
struct Export {
    obj: ObjectInstance,
    refs: u64,
}

impl ExportTable {
    fn identity(obj: &ObjectInstance) -> usize {
        std::sync::Arc::as_ptr(&obj.inner).cast::<u8>() as usize
    }

    /// Export an object, bumping the count when it is already exported.
    ///
    /// Returns the session-unique handle.
    pub fn export(&self, obj: ObjectInstance) -> u64 {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let identity = Self::identity(&obj);
        if let Some(&handle) = inner.by_identity.get(&identity) {
            if let Some(export) = inner.by_handle.get_mut(&handle) {
                export.refs += 1;
                trace!(handle, refs = export.refs, "re-exported object");
                return handle;
            }
        }
        let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        inner.by_identity.insert(identity, handle);
        inner.by_handle.insert(handle, Export { obj, refs: 1 });
        trace!(handle, "exported object");
        handle
    }

    /// Look up a live export.
    #[must_use]
    pub fn get(&self, handle: u64) -> Option<ObjectInstance> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_handle
            .get(&handle)
            .map(|e| e.obj.clone())
    }

    /// Bump the count for an additional transmission of the handle.
    pub fn incref(&self, handle: u64) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(export) = inner.by_handle.get_mut(&handle) {
            export.refs += 1;
        }
    }

    /// Apply a count-carrying decref; frees the export when the count
    /// reaches zero. Returns whether the export was freed.
    pub fn decref(&self, handle: u64, count: u64) -> bool {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(export) = inner.by_handle.get_mut(&handle) else {
            return false;
        };
        export.refs = export.refs.saturating_sub(count);
        if export.refs > 0 {
            return false;
        }
        let identity = Self::identity(&export.obj);
        inner.by_handle.remove(&handle);
        inner.by_identity.remove(&identity);
        trace!(handle, "released export");
        true
    }

    /// Number of live exports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .by_handle
            .len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop every export at session end.
    pub fn release_all(&self) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.by_handle.clear();
        inner.by_identity.clear();
    }
}

/// Weak cache of shims wrapping remote handles.
#[derive(Debug)]
pub struct ImportTable<T> {
    inner: Mutex<HashMap<u64, Weak<T>>>,
}

impl<T> Default for ImportTable<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ImportTable<T> {
    /// Fetch the live shim for a handle, pruning a dead cache slot.
    #[must_use]
    pub fn get(&self, handle: u64) -> Option<std::sync::Arc<T>> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match inner.get(&handle).and_then(Weak::upgrade) {
            Some(shim) => Some(shim),
            None => {
                inner.remove(&handle);
                None
            }
        }
    }

    /// Cache a freshly-built shim.
    pub fn insert(&self, handle: u64, shim: &std::sync::Arc<T>) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(handle, std::sync::Arc::downgrade(shim));
    }

    /// Forget a handle (shim finalised or session closing).
    pub fn remove(&self, handle: u64) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&handle);
    }

    /// Drop the whole cache at session end.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rstest::rstest;

    use super::*;
    use crate::types::TypeId;

    fn obj() -> ObjectInstance {
        ObjectInstance {
            type_id: TypeId(40),
            inner: Arc::new(5i64),
        }
    }

    #[rstest]
    fn export_is_identity_idempotent() {
        let table = ExportTable::default();
        let shared = obj();
        let h1 = table.export(shared.clone());
        let h2 = table.export(shared);
        assert_eq!(h1, h2);
        assert_eq!(table.len(), 1);
        let other = obj();
        assert_ne!(table.export(other), h1);
    }

    #[rstest]
    fn handles_are_never_reused() {
        let table = ExportTable::default();
        let h1 = table.export(obj());
        assert!(table.decref(h1, 1));
        let h2 = table.export(obj());
        assert_ne!(h1, h2);
    }

    #[rstest]
    fn decref_carries_count_across_reexport() {
        let table = ExportTable::default();
        let shared = obj();
        let h = table.export(shared.clone()); // refs = 1
        table.incref(h); // refs = 2, second transmission
        // A release of the first transmission crosses a re-export.
        let h2 = table.export(shared); // refs = 3
        assert_eq!(h, h2);
        assert!(!table.decref(h, 2), "net count stays positive");
        assert!(table.get(h).is_some());
        assert!(table.decref(h, 1));
        assert!(table.get(h).is_none());
    }

    #[rstest]
    fn import_cache_is_weak() {
        let table: ImportTable<String> = ImportTable::default();
        let shim = Arc::new("shim".to_owned());
        table.insert(7, &shim);
        assert_eq!(table.get(7).as_deref(), Some(&"shim".to_owned()));
        drop(shim);
        assert!(table.get(7).is_none(), "dead weak entries are pruned");
    }
}
