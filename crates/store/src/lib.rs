//! Archivist store: indexed local mirrors kept current by watch subscriptions.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use archivist_core::{ArchivistError, ArchivistResult};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::debug;

pub mod source;
pub mod subscription;

pub use source::{EventStream, FakeSource, Listing, ResourceSource, SourceError, WatchItem};
pub use subscription::{Subscription, SubscriptionConfig};

/// Extracts the unique key of an object.
pub type KeyFn<K> = fn(&K) -> String;
/// Extracts the namespace an object is indexed under; `None` for cluster scoped kinds.
pub type NamespaceFn<K> = fn(&K) -> Option<&str>;

struct MirrorState<K> {
    items: FxHashMap<String, Arc<K>>,
    by_namespace: FxHashMap<String, FxHashSet<String>>,
}

impl<K> Default for MirrorState<K> {
    fn default() -> Self {
        Self { items: FxHashMap::default(), by_namespace: FxHashMap::default() }
    }
}

impl<K> MirrorState<K> {
    fn unindex(&mut self, namespace: Option<&str>, key: &str) {
        if let Some(ns) = namespace {
            if let Some(keys) = self.by_namespace.get_mut(ns) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_namespace.remove(ns);
                }
            }
        }
    }
}

/// Key-addressed copy of one remote collection with a secondary index by namespace.
///
/// Written by a single [`Subscription`], read by anyone holding an `Arc<Mirror<K>>`.
/// Reads hand out `Arc<K>` clones so no lock is held past the call.
pub struct Mirror<K> {
    kind: &'static str,
    key_fn: KeyFn<K>,
    namespace_fn: NamespaceFn<K>,
    state: RwLock<MirrorState<K>>,
    synced: AtomicBool,
    epoch_tx: watch::Sender<u64>,
}

impl<K> Mirror<K> {
    pub fn new(kind: &'static str, key_fn: KeyFn<K>, namespace_fn: NamespaceFn<K>) -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self {
            kind,
            key_fn,
            namespace_fn,
            state: RwLock::new(MirrorState::default()),
            synced: AtomicBool::new(false),
            epoch_tx,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn read(&self) -> ArchivistResult<RwLockReadGuard<'_, MirrorState<K>>> {
        self.state
            .read()
            .map_err(|_| ArchivistError::Lookup(format!("{} mirror lock poisoned", self.kind)))
    }

    fn write(&self) -> ArchivistResult<RwLockWriteGuard<'_, MirrorState<K>>> {
        self.state
            .write()
            .map_err(|_| ArchivistError::Lookup(format!("{} mirror lock poisoned", self.kind)))
    }

    fn bump(&self, len: usize) {
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
        metrics::gauge!("mirror_objects", len as f64, "kind" => self.kind);
    }

    /// Insert or replace the object stored under its key.
    pub fn upsert(&self, obj: K) -> ArchivistResult<()> {
        let key = (self.key_fn)(&obj);
        let ns = (self.namespace_fn)(&obj).map(str::to_string);
        let len = {
            let mut st = self.write()?;
            if let Some(prev) = st.items.get(&key).cloned() {
                let prev_ns = (self.namespace_fn)(&prev);
                if prev_ns != ns.as_deref() {
                    st.unindex(prev_ns, &key);
                }
            }
            if let Some(ns) = ns {
                st.by_namespace.entry(ns).or_default().insert(key.clone());
            }
            st.items.insert(key, Arc::new(obj));
            st.items.len()
        };
        self.bump(len);
        Ok(())
    }

    /// Remove the entry stored under `key`, returning it if present.
    pub fn remove(&self, key: &str) -> ArchivistResult<Option<Arc<K>>> {
        let (prev, len) = {
            let mut st = self.write()?;
            let prev = st.items.remove(key);
            if let Some(p) = prev.as_ref() {
                st.unindex((self.namespace_fn)(p), key);
            }
            (prev, st.items.len())
        };
        if prev.is_some() {
            self.bump(len);
        }
        Ok(prev)
    }

    /// Remove the entry addressed by an object's key (delete events carry the last known object).
    pub fn remove_object(&self, obj: &K) -> ArchivistResult<Option<Arc<K>>> {
        self.remove(&(self.key_fn)(obj))
    }

    /// Swap the whole contents for a fresh listing and mark the mirror synced.
    pub fn replace(&self, items: Vec<K>) -> ArchivistResult<()> {
        let mut next = MirrorState::default();
        for obj in items {
            let key = (self.key_fn)(&obj);
            if let Some(ns) = (self.namespace_fn)(&obj) {
                next.by_namespace.entry(ns.to_string()).or_default().insert(key.clone());
            }
            next.items.insert(key, Arc::new(obj));
        }
        let len = next.items.len();
        {
            let mut st = self.write()?;
            let dropped = st.items.keys().filter(|k| !next.items.contains_key(*k)).count();
            debug!(kind = self.kind, objects = len, dropped, "mirror replaced from listing");
            *st = next;
        }
        self.synced.store(true, Ordering::Release);
        self.bump(len);
        Ok(())
    }

    pub fn get(&self, key: &str) -> ArchivistResult<Option<Arc<K>>> {
        Ok(self.read()?.items.get(key).cloned())
    }

    pub fn contains(&self, key: &str) -> ArchivistResult<bool> {
        Ok(self.read()?.items.contains_key(key))
    }

    pub fn list_all(&self) -> ArchivistResult<Vec<Arc<K>>> {
        Ok(self.read()?.items.values().cloned().collect())
    }

    pub fn list_by_namespace(&self, namespace: &str) -> ArchivistResult<Vec<Arc<K>>> {
        let st = self.read()?;
        let Some(keys) = st.by_namespace.get(namespace) else {
            return Ok(Vec::new());
        };
        Ok(keys.iter().filter_map(|k| st.items.get(k).cloned()).collect())
    }

    pub fn len(&self) -> ArchivistResult<usize> {
        Ok(self.read()?.items.len())
    }

    pub fn is_empty(&self) -> ArchivistResult<bool> {
        Ok(self.len()? == 0)
    }

    /// True once a full listing has been applied.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Number of mutations applied so far.
    pub fn epoch(&self) -> u64 {
        *self.epoch_tx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Obj {
        ns: Option<String>,
        name: String,
        v: u32,
    }

    fn key(o: &Obj) -> String {
        match &o.ns {
            Some(ns) => format!("{}/{}", ns, o.name),
            None => o.name.clone(),
        }
    }

    fn ns(o: &Obj) -> Option<&str> {
        o.ns.as_deref()
    }

    fn obj(ns: &str, name: &str, v: u32) -> Obj {
        Obj { ns: Some(ns.to_string()), name: name.to_string(), v }
    }

    fn mirror() -> Mirror<Obj> {
        Mirror::new("obj", key, ns)
    }

    fn names(mut v: Vec<Arc<Obj>>) -> Vec<String> {
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v.iter().map(|o| o.name.clone()).collect()
    }

    #[test]
    fn upsert_replaces_by_key_and_indexes_namespace() {
        let m = mirror();
        m.upsert(obj("a", "x", 1)).unwrap();
        m.upsert(obj("a", "y", 1)).unwrap();
        m.upsert(obj("b", "x", 1)).unwrap();
        m.upsert(obj("a", "x", 2)).unwrap();

        assert_eq!(m.len().unwrap(), 3);
        assert_eq!(m.get("a/x").unwrap().unwrap().v, 2);
        assert_eq!(names(m.list_by_namespace("a").unwrap()), vec!["x", "y"]);
        assert_eq!(names(m.list_by_namespace("b").unwrap()), vec!["x"]);
        assert!(m.list_by_namespace("c").unwrap().is_empty());
        assert_eq!(m.epoch(), 4);
    }

    #[test]
    fn remove_drops_from_namespace_index() {
        let m = mirror();
        m.upsert(obj("a", "x", 1)).unwrap();
        m.upsert(obj("a", "y", 1)).unwrap();
        let gone = m.remove("a/x").unwrap();
        assert_eq!(gone.map(|o| o.name.clone()), Some("x".to_string()));
        assert_eq!(names(m.list_by_namespace("a").unwrap()), vec!["y"]);
        assert!(m.remove("a/x").unwrap().is_none());
        m.remove_object(&obj("a", "y", 9)).unwrap();
        assert!(m.list_by_namespace("a").unwrap().is_empty());
        assert!(m.is_empty().unwrap());
    }

    #[test]
    fn cluster_scoped_objects_are_not_indexed() {
        let m = mirror();
        m.upsert(Obj { ns: None, name: "n1".into(), v: 0 }).unwrap();
        assert_eq!(m.list_all().unwrap().len(), 1);
        assert!(m.contains("n1").unwrap());
        assert!(m.list_by_namespace("").unwrap().is_empty());
    }

    #[test]
    fn replace_swaps_contents_and_marks_synced() {
        let m = mirror();
        assert!(!m.has_synced());
        m.upsert(obj("a", "stale", 1)).unwrap();
        m.replace(vec![obj("a", "x", 1), obj("b", "y", 1)]).unwrap();
        assert!(m.has_synced());
        assert!(m.get("a/stale").unwrap().is_none());
        assert_eq!(names(m.list_by_namespace("a").unwrap()), vec!["x"]);
        assert_eq!(m.len().unwrap(), 2);
    }

    thread_local! {
        static NS_CALLS: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
    }

    // Panics on the third call, which upsert makes on the stored object while holding the write lock.
    fn ns_panics_third_call(o: &Obj) -> Option<&str> {
        let n = NS_CALLS.with(|c| {
            c.set(c.get() + 1);
            c.get()
        });
        assert!(n != 3, "namespace extractor failed");
        o.ns.as_deref()
    }

    #[test]
    fn poisoned_lock_surfaces_as_lookup_error() {
        NS_CALLS.with(|c| c.set(0));
        let m = Mirror::new("obj", key, ns_panics_third_call);
        m.upsert(obj("a", "x", 1)).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| m.upsert(obj("a", "x", 2))));
        assert!(res.is_err());

        assert!(matches!(m.len(), Err(ArchivistError::Lookup(_))));
        assert!(matches!(m.is_empty(), Err(ArchivistError::Lookup(_))));
        assert!(matches!(m.get("a/x"), Err(ArchivistError::Lookup(_))));
    }

    #[test]
    fn epoch_subscribers_observe_mutations() {
        let m = mirror();
        let rx = m.subscribe_epoch();
        m.upsert(obj("a", "x", 1)).unwrap();
        assert_eq!(*rx.borrow(), 1);
        // Removing a missing key is not a mutation.
        m.remove("a/missing").unwrap();
        assert_eq!(*rx.borrow(), 1);
    }
}
