//! Shared values: counters, booleans, and tri-state flags.
//!
//! The three kinds are structurally identical (a versioned backend node, a
//! local read-through cache, change notification, and a re-register hook for
//! session loss), so one generic store carries all of them, parameterized by
//! [`SharedKind`].
//!
//! The backend node is the authority. The local cache is a best-effort
//! mirror updated on every successful read, write, and change notification,
//! and it is all that `check` consults: `check(name, expected)` compares
//! `expected` against the cache, then unconditionally overwrites the cache
//! with `expected`, returning whether they already matched. Callers use the
//! result to decide whether local state was already current.

use std::fmt;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backend::{BackendError, CreateMode};
use crate::util::lock::mutex_lock;

use super::connection::Connection;
use super::error::CoordinationError;

const SOURCE: &str = "coordination::shared";

pub(crate) const METRIC_RETRY_EXHAUSTED: &str = "stormo_shared_value_retry_exhausted_total";

/// Listener invoked with each new value observed on the backend node.
pub type ValueListener<V> = Arc<dyn Fn(V) + Send + Sync>;

/// A value type that can live in a shared node.
pub trait SharedKind: Send + Sync + 'static {
    type Value: Copy + PartialEq + Send + Sync + fmt::Debug + 'static;

    /// Label used in errors and logs.
    const LABEL: &'static str;
    /// Subtree under the namespace holding nodes of this kind.
    const SUBTREE: &'static str;

    /// Value a node is seeded with on first registration.
    fn seed() -> Self::Value;
    fn encode(value: Self::Value) -> Vec<u8>;
    fn decode(path: &str, raw: &[u8]) -> Result<Self::Value, BackendError>;
}

fn decode_str<'a>(path: &str, raw: &'a [u8]) -> Result<&'a str, BackendError> {
    std::str::from_utf8(raw).map_err(|err| BackendError::Decode {
        path: path.to_string(),
        detail: err.to_string(),
    })
}

/// Shared counter: an `i64` seeded with 1.
pub struct CounterKind;

impl SharedKind for CounterKind {
    type Value = i64;

    const LABEL: &'static str = "counter";
    const SUBTREE: &'static str = "counters";

    fn seed() -> i64 {
        1
    }

    fn encode(value: i64) -> Vec<u8> {
        value.to_string().into_bytes()
    }

    fn decode(path: &str, raw: &[u8]) -> Result<i64, BackendError> {
        decode_str(path, raw)?
            .parse()
            .map_err(|err: std::num::ParseIntError| BackendError::Decode {
                path: path.to_string(),
                detail: err.to_string(),
            })
    }
}

/// Shared boolean, seeded with `false`.
pub struct BooleanKind;

impl SharedKind for BooleanKind {
    type Value = bool;

    const LABEL: &'static str = "boolean";
    const SUBTREE: &'static str = "booleans";

    fn seed() -> bool {
        false
    }

    fn encode(value: bool) -> Vec<u8> {
        if value { b"true".to_vec() } else { b"false".to_vec() }
    }

    fn decode(path: &str, raw: &[u8]) -> Result<bool, BackendError> {
        match decode_str(path, raw)? {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(BackendError::Decode {
                path: path.to_string(),
                detail: format!("not a boolean: `{other}`"),
            }),
        }
    }
}

/// Fleet-visible refresh flag carried by the tri-state kind.
///
/// `Updating` is reserved for consumer-defined transitions (for example
/// "reload in progress"); nothing in this crate sets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshState {
    NeedsUpdate,
    Updating,
    Updated,
}

impl RefreshState {
    pub fn ordinal(self) -> u8 {
        match self {
            Self::NeedsUpdate => 0,
            Self::Updating => 1,
            Self::Updated => 2,
        }
    }

    pub fn from_ordinal(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::NeedsUpdate),
            1 => Some(Self::Updating),
            2 => Some(Self::Updated),
            _ => None,
        }
    }
}

/// Shared tri-state flag, ordinal-encoded, seeded with `Updated`.
pub struct TriStateKind;

impl SharedKind for TriStateKind {
    type Value = RefreshState;

    const LABEL: &'static str = "tri-state";
    const SUBTREE: &'static str = "triStates";

    fn seed() -> RefreshState {
        RefreshState::Updated
    }

    fn encode(value: RefreshState) -> Vec<u8> {
        value.ordinal().to_string().into_bytes()
    }

    fn decode(path: &str, raw: &[u8]) -> Result<RefreshState, BackendError> {
        let ordinal: u8 = decode_str(path, raw)?.parse().map_err(
            |err: std::num::ParseIntError| BackendError::Decode {
                path: path.to_string(),
                detail: err.to_string(),
            },
        )?;
        RefreshState::from_ordinal(ordinal).ok_or_else(|| BackendError::Decode {
            path: path.to_string(),
            detail: format!("not a tri-state ordinal: {ordinal}"),
        })
    }
}

struct Handle<K: SharedKind> {
    name: String,
    path: String,
    local: Mutex<K::Value>,
    listener: ValueListener<K::Value>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

/// Registry of shared values of one kind.
pub struct SharedValueStore<K: SharedKind> {
    connection: Arc<Connection>,
    max_retries: u32,
    handles: DashMap<String, Arc<Handle<K>>>,
}

impl<K: SharedKind> SharedValueStore<K> {
    pub(crate) fn new(connection: Arc<Connection>, max_retries: u32) -> Self {
        Self {
            connection,
            max_retries,
            handles: DashMap::new(),
        }
    }

    /// Register a shared value tracked by this process.
    ///
    /// Creates the backend node seeded with the kind default if it does not
    /// exist yet, attaches the listener, and caches the initial value.
    pub async fn register(
        &self,
        name: &str,
        listener: ValueListener<K::Value>,
    ) -> Result<(), CoordinationError> {
        self.connection.guard_available()?;

        let handle = Arc::new(Handle {
            name: name.to_string(),
            path: self
                .connection
                .full_path(&format!("{}/{}", K::SUBTREE, name)),
            local: Mutex::new(K::seed()),
            listener,
            watch_task: Mutex::new(None),
        });

        match self.handles.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(CoordinationError::already_registered(K::LABEL, name));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&handle));
            }
        }

        if let Err(err) = self.rebind(&handle, K::seed()).await {
            self.handles.remove(name);
            return Err(err);
        }
        Ok(())
    }

    /// Compare `expected` against the locally cached value, then overwrite
    /// the cache with `expected`. Returns whether they already matched.
    pub fn check(&self, name: &str, expected: K::Value) -> Result<bool, CoordinationError> {
        let handle = self.handle(name)?;
        let mut local = mutex_lock(&handle.local, SOURCE, "check");
        let matched = *local == expected;
        *local = expected;
        Ok(matched)
    }

    /// Locally cached value, for observability.
    pub fn cached(&self, name: &str) -> Result<K::Value, CoordinationError> {
        let handle = self.handle(name)?;
        let local = mutex_lock(&handle.local, SOURCE, "cached");
        Ok(*local)
    }

    /// Overwrite the shared value, retrying on version conflicts.
    pub async fn set(&self, name: &str, value: K::Value) -> Result<(), CoordinationError> {
        self.update(name, move |_| value).await.map(|_| ())
    }

    /// Compare-and-swap update loop.
    ///
    /// Reads the versioned backend value, applies `apply`, and attempts a
    /// conditional write; a conflict re-reads and retries. After
    /// `max_retries` consecutive conflicts the handle is re-registered
    /// seeded with the last computed value and `ExhaustedRetries` is
    /// returned; the caller must treat the write as unconfirmed.
    ///
    /// Blocks for the duration of the loop; do not call from the backend
    /// event task.
    pub async fn update(
        &self,
        name: &str,
        apply: impl Fn(K::Value) -> K::Value + Send,
    ) -> Result<K::Value, CoordinationError> {
        self.connection.guard_available()?;
        let handle = self.handle(name)?;
        let backend = self.connection.backend();

        let mut attempts: u32 = 0;
        loop {
            let current = backend.read(&handle.path).await?;
            let next = apply(K::decode(&handle.path, &current.data)?);
            if backend
                .compare_and_set(&handle.path, current.version, &K::encode(next))
                .await?
            {
                *mutex_lock(&handle.local, SOURCE, "update") = next;
                return Ok(next);
            }

            attempts += 1;
            if attempts >= self.max_retries {
                counter!(METRIC_RETRY_EXHAUSTED, "kind" => K::LABEL).increment(1);
                warn!(
                    kind = K::LABEL,
                    name = %handle.name,
                    attempts,
                    "shared value update exhausted retries; re-registering"
                );
                if let Err(rebind_err) = self.rebind(&handle, next).await {
                    error!(
                        kind = K::LABEL,
                        name = %handle.name,
                        error = %rebind_err,
                        "unable to re-register shared value after exhausted retries"
                    );
                }
                return Err(CoordinationError::exhausted_retries(K::LABEL, name, attempts));
            }
        }
    }

    /// Detach every handle from the backend, keeping the local caches.
    ///
    /// Invoked on session loss: the caches become the snapshot that
    /// [`SharedValueStore::restore_all`] re-registers from.
    pub(crate) fn release_all(&self) {
        for entry in self.handles.iter() {
            let handle = entry.value();
            if let Some(task) = mutex_lock(&handle.watch_task, SOURCE, "release_all").take() {
                task.abort();
            }
        }
    }

    /// Re-register every handle from its local snapshot, seeding the backend
    /// node with the locally remembered value.
    pub(crate) async fn restore_all(&self) {
        let handles: Vec<Arc<Handle<K>>> = self
            .handles
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for handle in handles {
            let seed = *mutex_lock(&handle.local, SOURCE, "restore_all");
            debug!(
                kind = K::LABEL,
                name = %handle.name,
                seed = ?seed,
                "re-registering shared value after reconnect"
            );
            if let Err(err) = self.rebind(&handle, seed).await {
                error!(
                    kind = K::LABEL,
                    name = %handle.name,
                    error = %err,
                    "unable to re-register shared value"
                );
            }
        }
    }

    fn handle(&self, name: &str) -> Result<Arc<Handle<K>>, CoordinationError> {
        self.handles
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoordinationError::invalid_name(K::LABEL, name))
    }

    /// (Re-)attach a handle to its backend node: create-if-absent seeded
    /// with `seed`, mirror the current value, and restart the watch task.
    async fn rebind(
        &self,
        handle: &Arc<Handle<K>>,
        seed: K::Value,
    ) -> Result<(), CoordinationError> {
        if let Some(task) = mutex_lock(&handle.watch_task, SOURCE, "rebind").take() {
            task.abort();
        }

        let backend = self.connection.backend();
        match backend
            .create(&handle.path, &K::encode(seed), CreateMode::Persistent)
            .await
        {
            Ok(_) => {}
            Err(BackendError::AlreadyExists(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let current = backend.read(&handle.path).await?;
        let value = K::decode(&handle.path, &current.data)?;
        *mutex_lock(&handle.local, SOURCE, "rebind") = value;

        let mut watch = backend.watch_value(&handle.path);
        let task_handle = Arc::clone(handle);
        let task = tokio::spawn(async move {
            loop {
                match watch.recv().await {
                    Ok(event) => match K::decode(&task_handle.path, &event.data) {
                        // Listener first: it may consult `check`, which must
                        // still see the pre-event cache to detect staleness.
                        Ok(value) => {
                            (task_handle.listener)(value);
                            *mutex_lock(&task_handle.local, SOURCE, "watch") = value;
                        }
                        Err(err) => warn!(
                            kind = K::LABEL,
                            name = %task_handle.name,
                            error = %err,
                            "discarding undecodable shared value event"
                        ),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            kind = K::LABEL,
                            name = %task_handle.name,
                            skipped,
                            "shared value watch lagged; local cache may be briefly stale"
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        *mutex_lock(&handle.watch_task, SOURCE, "rebind") = Some(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::backend::{
        ChildEvent, CoordinationBackend, MemoryCoordination, MemorySession, NodeStat, NodeVersion,
        SessionEvent, ValueEvent,
    };

    fn noop<V>() -> ValueListener<V> {
        Arc::new(|_| {})
    }

    fn store<K: SharedKind>(
        backend: Arc<dyn CoordinationBackend>,
        max_retries: u32,
    ) -> SharedValueStore<K> {
        SharedValueStore::new(Arc::new(Connection::new(backend, "ns")), max_retries)
    }

    #[tokio::test]
    async fn register_seeds_and_caches_the_default() {
        let counters: SharedValueStore<CounterKind> =
            store(MemoryCoordination::new().session(), 3);
        counters.register("t1", noop()).await.expect("register");

        assert_eq!(counters.cached("t1").expect("cached"), 1);
        // check against the seed matches, and the cache is reconciled.
        assert!(counters.check("t1", 1).expect("check"));
    }

    #[tokio::test]
    async fn register_twice_fails() {
        let counters: SharedValueStore<CounterKind> =
            store(MemoryCoordination::new().session(), 3);
        counters.register("t1", noop()).await.expect("register");

        let err = counters.register("t1", noop()).await;
        assert!(matches!(
            err,
            Err(CoordinationError::AlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn operations_on_unregistered_names_fail() {
        let counters: SharedValueStore<CounterKind> =
            store(MemoryCoordination::new().session(), 3);
        assert!(matches!(
            counters.check("nope", 1),
            Err(CoordinationError::InvalidName { .. })
        ));
        assert!(matches!(
            counters.update("nope", |v| v + 1).await,
            Err(CoordinationError::InvalidName { .. })
        ));
    }

    #[tokio::test]
    async fn check_reconciles_the_local_cache() {
        let counters: SharedValueStore<CounterKind> =
            store(MemoryCoordination::new().session(), 3);
        counters.register("t1", noop()).await.expect("register");

        // Local cache is 1; a mismatching expectation reports false and
        // reconciles.
        assert!(!counters.check("t1", 5).expect("check"));
        assert!(counters.check("t1", 5).expect("check"));
    }

    #[tokio::test]
    async fn increment_is_visible_to_other_instances() {
        let coordination = MemoryCoordination::new();
        let a: SharedValueStore<CounterKind> = store(coordination.session(), 3);
        let b: SharedValueStore<CounterKind> = store(coordination.session(), 3);

        a.register("t1", noop()).await.expect("register");
        b.register("t1", noop()).await.expect("register");

        let next = a.update("t1", |v| v + 1).await.expect("increment");
        assert_eq!(next, 2);

        // The other instance's cache is still stale until its watch fires or
        // it reconciles through check.
        assert!(!b.check("t1", 2).expect("check"));
        assert!(b.check("t1", 2).expect("check"));
    }

    #[tokio::test]
    async fn watch_delivers_changes_to_listener_and_cache() {
        let coordination = MemoryCoordination::new();
        let writer: SharedValueStore<CounterKind> = store(coordination.session(), 3);

        let observed = Arc::new(AtomicI64::new(0));
        let reader_backend = coordination.session();
        let reader: SharedValueStore<CounterKind> = store(reader_backend, 3);
        writer.register("t1", noop()).await.expect("register");

        let observed_in_listener = Arc::clone(&observed);
        reader
            .register(
                "t1",
                Arc::new(move |value| {
                    observed_in_listener.store(value, Ordering::SeqCst);
                }),
            )
            .await
            .expect("register");

        writer.set("t1", 9).await.expect("set");

        // Give the watch task a beat to deliver.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 9);
        assert_eq!(reader.cached("t1").expect("cached"), 9);
    }

    #[tokio::test]
    async fn boolean_and_tri_state_round_trip() {
        let coordination = MemoryCoordination::new();
        let booleans: SharedValueStore<BooleanKind> = store(coordination.session(), 3);
        let tri_states: SharedValueStore<TriStateKind> = store(coordination.session(), 3);

        booleans.register("flush", noop()).await.expect("register");
        tri_states.register("t1", noop()).await.expect("register");

        assert!(booleans.check("flush", false).expect("check"));
        booleans.set("flush", true).await.expect("set");
        assert!(booleans.check("flush", true).expect("check"));

        assert!(tri_states.check("t1", RefreshState::Updated).expect("check"));
        tri_states
            .set("t1", RefreshState::NeedsUpdate)
            .await
            .expect("set");
        assert!(
            tri_states
                .check("t1", RefreshState::NeedsUpdate)
                .expect("check")
        );
    }

    #[tokio::test]
    async fn snapshot_survives_loss_and_reconnect() {
        let coordination = MemoryCoordination::new();
        let session = coordination.session();
        let counters: SharedValueStore<CounterKind> =
            store(Arc::clone(&session) as Arc<dyn CoordinationBackend>, 3);

        counters.register("t1", noop()).await.expect("register");
        counters.set("t1", 41).await.expect("set");

        session.expire();
        counters.release_all();

        // Local-only reads still work while lost; writes fail fast.
        assert_eq!(counters.cached("t1").expect("cached"), 41);
        assert!(matches!(
            counters.set("t1", 99).await,
            Err(CoordinationError::Unavailable)
        ));

        session.reconnect();
        counters.restore_all().await;

        assert_eq!(counters.cached("t1").expect("cached"), 41);
        assert_eq!(counters.update("t1", |v| v + 1).await.expect("increment"), 42);
    }

    /// Delegates to a real session but loses every compare-and-set race.
    struct ContendedBackend {
        inner: Arc<MemorySession>,
    }

    #[async_trait]
    impl CoordinationBackend for ContendedBackend {
        async fn create(
            &self,
            path: &str,
            data: &[u8],
            mode: crate::backend::CreateMode,
        ) -> Result<String, BackendError> {
            self.inner.create(path, data, mode).await
        }

        async fn stat(&self, path: &str) -> Result<Option<NodeStat>, BackendError> {
            self.inner.stat(path).await
        }

        async fn read(&self, path: &str) -> Result<crate::backend::VersionedValue, BackendError> {
            self.inner.read(path).await
        }

        async fn compare_and_set(
            &self,
            _path: &str,
            _expected: NodeVersion,
            _data: &[u8],
        ) -> Result<bool, BackendError> {
            Ok(false)
        }

        async fn children(&self, path: &str) -> Result<Vec<String>, BackendError> {
            self.inner.children(path).await
        }

        async fn delete(&self, path: &str) -> Result<(), BackendError> {
            self.inner.delete(path).await
        }

        async fn delete_recursive(&self, path: &str) -> Result<(), BackendError> {
            self.inner.delete_recursive(path).await
        }

        fn watch_children(&self, path: &str) -> broadcast::Receiver<ChildEvent> {
            self.inner.watch_children(path)
        }

        fn watch_value(&self, path: &str) -> broadcast::Receiver<ValueEvent> {
            self.inner.watch_value(path)
        }

        fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
            self.inner.session_events()
        }

        fn is_lost(&self) -> bool {
            self.inner.is_lost()
        }
    }

    #[tokio::test]
    async fn exhausted_retries_reseeds_from_the_backend() {
        let coordination = MemoryCoordination::new();
        let contended = Arc::new(ContendedBackend {
            inner: coordination.session(),
        });
        let counters: SharedValueStore<CounterKind> = store(contended, 3);
        counters.register("t1", noop()).await.expect("register");

        // Another instance has meanwhile moved the shared value to 42.
        let other = coordination.session();
        assert!(
            other
                .compare_and_set("/ns/counters/t1", 0, b"42")
                .await
                .expect("cas")
        );

        let err = counters.update("t1", |v| v + 1).await;
        assert!(matches!(
            err,
            Err(CoordinationError::ExhaustedRetries { attempts: 3, .. })
        ));

        // The re-registered handle mirrors the current shared value, not the
        // kind default.
        assert!(counters.check("t1", 42).expect("check"));
    }
}
