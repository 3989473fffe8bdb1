use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use arc_swap::ArcSwap;
use metrics::counter;
use roster_core::{Action, DynPayload, Manifest, ManifestKey};
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::inflight::InFlight;

/// Bounds every spec/status type stored in a pool must meet.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<P: Clone + Send + Sync + 'static> Payload for P {}

/// Callback invoked with the pool, the lifecycle action and a private copy of
/// the affected manifest.
pub type Observer<S, T> = dyn Fn(&Pool<S, T>, Action, Manifest<S, T>) + Send + Sync;

/// Stable handle for a registered observer, used by [`Pool::apply_except`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "observer-{}", self.0) }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no tokio runtime available to dispatch notifications; use Pool::with_handle")]
    NoRuntime,
}

struct Registered<S, T> {
    id: ObserverId,
    observer: Arc<Observer<S, T>>,
}

impl<S, T> Clone for Registered<S, T> {
    fn clone(&self) -> Self { Self { id: self.id, observer: Arc::clone(&self.observer) } }
}

struct Shared<S, T> {
    manifests: RwLock<FxHashMap<ManifestKey, Manifest<S, T>>>,
    // Copy-on-write so dispatch reads a consistent list without locking
    observers: ArcSwap<Vec<Registered<S, T>>>,
    next_id: AtomicU64,
    in_flight: Arc<InFlight>,
    runtime: Handle,
}

/// Concurrent keyed registry of manifests plus its observers.
///
/// `Pool` is a cheap handle; clones share the same state. Stored manifests
/// are whole values: an apply replaces the entry, it never merges fields.
pub struct Pool<S = DynPayload, T = DynPayload> {
    shared: Arc<Shared<S, T>>,
}

impl<S, T> Clone for Pool<S, T> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

impl<S: Payload, T: Payload> Pool<S, T> {
    /// Pool dispatching on the runtime of the calling context.
    pub fn new() -> Result<Self, PoolError> {
        Handle::try_current().map(Self::with_handle).map_err(|_| PoolError::NoRuntime)
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            shared: Arc::new(Shared {
                manifests: RwLock::new(FxHashMap::default()),
                observers: ArcSwap::from_pointee(Vec::new()),
                next_id: AtomicU64::new(1),
                in_flight: InFlight::new(),
                runtime,
            }),
        }
    }

    /// Register an observer. Observers are notified for every later apply or
    /// delete; there is no way to remove one.
    pub fn listen<F>(&self, observer: F) -> ObserverId
    where
        F: Fn(&Pool<S, T>, Action, Manifest<S, T>) + Send + Sync + 'static,
    {
        self.listen_with_id(|_| observer)
    }

    /// Like [`Pool::listen`], but the observer is built knowing its own id, so
    /// it can re-apply manifests through [`Pool::apply_except`] without being
    /// woken by its own change.
    pub fn listen_with_id<F>(&self, make: impl FnOnce(ObserverId) -> F) -> ObserverId
    where
        F: Fn(&Pool<S, T>, Action, Manifest<S, T>) + Send + Sync + 'static,
    {
        let id = ObserverId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let observer: Arc<Observer<S, T>> = Arc::new(make(id));
        self.shared.observers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Registered { id, observer: Arc::clone(&observer) });
            next
        });
        debug!(observer = %id, "observer registered");
        id
    }

    /// Store the manifest and notify every observer with `Created` or
    /// `Updated`. Returns once the notifications are dispatched.
    pub fn apply(&self, manifest: Manifest<S, T>) -> Action {
        self.apply_and_notify(manifest, None)
    }

    /// Like [`Pool::apply`] but skips the `except` observer, whether the
    /// manifest is created or updated.
    pub fn apply_except(&self, except: ObserverId, manifest: Manifest<S, T>) -> Action {
        self.apply_and_notify(manifest, Some(except))
    }

    /// Store the manifest without notifying anyone.
    pub fn apply_silent(&self, manifest: Manifest<S, T>) -> Action {
        self.store(manifest)
    }

    /// Remove the manifest and notify every observer with `Deleted` and the
    /// removed value. Deleting an absent key does nothing.
    pub fn delete(&self, key: &ManifestKey) -> Option<Manifest<S, T>> {
        let removed = self.shared.manifests.write().unwrap_or_else(PoisonError::into_inner).remove(key)?;
        counter!("roster_pool_delete_total", 1u64);
        debug!(key = %key, "manifest deleted");
        self.notify(Action::Deleted, &removed, None);
        Some(removed)
    }

    pub fn get_by_key(&self, key: &ManifestKey) -> Option<Manifest<S, T>> {
        self.shared.manifests.read().unwrap_or_else(PoisonError::into_inner).get(key).cloned()
    }

    pub fn contains_key(&self, key: &ManifestKey) -> bool {
        self.shared.manifests.read().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    /// All stored manifests matching `predicate`, in no particular order.
    ///
    /// The predicate sees a snapshot taken before it runs and is called with
    /// no lock held, so it may use this pool.
    pub fn find<F>(&self, predicate: F) -> Vec<Manifest<S, T>>
    where
        F: Fn(&Manifest<S, T>) -> bool,
    {
        let snapshot: Vec<Manifest<S, T>> =
            self.shared.manifests.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        snapshot.into_iter().filter(|m| predicate(m)).collect()
    }

    /// Stored keys, sorted.
    pub fn keys(&self) -> Vec<ManifestKey> {
        let mut keys: Vec<ManifestKey> =
            self.shared.manifests.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize { self.shared.manifests.read().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn observer_count(&self) -> usize { self.shared.observers.load().len() }

    /// Notifications dispatched but not yet finished.
    pub fn in_flight(&self) -> usize { self.shared.in_flight.current() }

    /// Block the current thread until the in-flight count drops to zero. New
    /// notifications started after that moment are not waited for. Must not
    /// be called from inside an observer.
    pub fn wait(&self) { self.shared.in_flight.wait_blocking() }

    /// Async form of [`Pool::wait`].
    pub async fn settled(&self) { self.shared.in_flight.settled().await }

    fn store(&self, manifest: Manifest<S, T>) -> Action {
        let key = manifest.key();
        let mut manifests = self.shared.manifests.write().unwrap_or_else(PoisonError::into_inner);
        let action = match manifests.insert(key, manifest) {
            Some(_) => Action::Updated,
            None => Action::Created,
        };
        counter!("roster_pool_apply_total", 1u64);
        action
    }

    fn apply_and_notify(&self, manifest: Manifest<S, T>, except: Option<ObserverId>) -> Action {
        let snapshot = manifest.clone();
        let action = self.store(manifest);
        debug!(key = %snapshot.key(), action = %action, "manifest applied");
        self.notify(action, &snapshot, except);
        action
    }

    fn notify(&self, action: Action, manifest: &Manifest<S, T>, except: Option<ObserverId>) {
        let observers = self.shared.observers.load_full();
        for registered in observers.iter().filter(|r| Some(r.id) != except) {
            self.dispatch(registered, action, manifest.clone());
        }
    }

    fn dispatch(&self, registered: &Registered<S, T>, action: Action, manifest: Manifest<S, T>) {
        let guard = self.shared.in_flight.enter();
        let pool = self.clone();
        let observer = Arc::clone(&registered.observer);
        let id = registered.id;
        counter!("roster_pool_notify_total", 1u64);
        // The join handle is dropped; completion is tracked by the guard.
        drop(self.shared.runtime.spawn_blocking(move || {
            let _guard = guard;
            trace!(observer = %id, action = %action, key = %manifest.key(), "notifying observer");
            if catch_unwind(AssertUnwindSafe(|| observer(&pool, action, manifest))).is_err() {
                warn!(observer = %id, action = %action, "observer panicked");
            }
        }));
    }
}

impl<S, T> fmt::Debug for Pool<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.shared.manifests.read().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("Pool")
            .field("manifests", &len)
            .field("observers", &self.shared.observers.load().len())
            .field("in_flight", &self.shared.in_flight.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    type Events = Arc<Mutex<Vec<(Action, String)>>>;

    fn manifest(name: &str, message: &str) -> Manifest<String, String> {
        let mut m: Manifest<String, String> = Manifest::new("example.com/v1alpha1", "MyManifest", name);
        m.spec = message.to_string();
        m
    }

    fn recorder(pool: &Pool<String, String>) -> (ObserverId, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let id = pool.listen(move |_, action, m| sink.lock().unwrap().push((action, m.spec.clone())));
        (id, events)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_twice_creates_then_updates() {
        let pool: Pool<String, String> = Pool::new().unwrap();
        let (_, events) = recorder(&pool);
        let m = manifest("m1", "hello");
        assert_eq!(pool.apply(m.clone()), Action::Created);
        pool.settled().await;
        assert_eq!(pool.apply(m.clone()), Action::Updated);
        pool.settled().await;
        assert_eq!(pool.len(), 1);
        let got = events.lock().unwrap().clone();
        assert_eq!(got, vec![(Action::Created, "hello".to_string()), (Action::Updated, "hello".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn apply_silent_changes_membership_only() {
        let pool: Pool<String, String> = Pool::new().unwrap();
        let (_, events) = recorder(&pool);
        assert_eq!(pool.apply_silent(manifest("m1", "quiet")), Action::Created);
        assert_eq!(pool.apply(manifest("m1", "loud")), Action::Updated);
        pool.settled().await;
        assert_eq!(events.lock().unwrap().clone(), vec![(Action::Updated, "loud".to_string())]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_observer_does_not_block_wait() {
        let pool: Pool<String, String> = Pool::new().unwrap();
        pool.listen(|_, _, _| panic!("boom"));
        let (_, events) = recorder(&pool);
        pool.apply(manifest("m1", "hello"));
        pool.settled().await;
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[test]
    fn new_outside_runtime_fails() {
        assert!(matches!(Pool::<String, String>::new(), Err(PoolError::NoRuntime)));
    }

    #[test]
    fn observer_ids_are_distinct() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool: Pool<String, String> = Pool::with_handle(rt.handle().clone());
        let a = pool.listen(|_, _, _| {});
        let b = pool.listen(|_, _, _| {});
        assert_ne!(a, b);
        assert_eq!(pool.observer_count(), 2);
    }
}
