//! The per-namespace coordinator facade.
//!
//! Composes the connection, shared values, mutex pool, membership registry,
//! and eviction protocol behind one start/stop lifecycle. One instance binds
//! to exactly one namespace and one backend session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::CoordinationBackend;
use crate::config::CoordinationSettings;
use crate::util::lock::mutex_lock;

use super::connection::{Connection, ReconnectAction, ReconnectTracker};
use super::error::CoordinationError;
use super::eviction::EvictionProtocol;
use super::membership::MembershipRegistry;
use super::mutex::{DistributedMutex, MutexPool};
use super::shared::{
    BooleanKind, CounterKind, RefreshState, SharedValueStore, TriStateKind,
};

const SOURCE: &str = "coordination::coordinator";

pub struct SharedCacheCoordinator {
    connection: Arc<Connection>,
    server_id: String,
    counters: Arc<SharedValueStore<CounterKind>>,
    booleans: Arc<SharedValueStore<BooleanKind>>,
    tri_states: Arc<SharedValueStore<TriStateKind>>,
    mutexes: MutexPool,
    membership: Arc<MembershipRegistry>,
    evictions: Arc<EvictionProtocol>,
    reap_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl SharedCacheCoordinator {
    pub fn new(backend: Arc<dyn CoordinationBackend>, settings: &CoordinationSettings) -> Self {
        let connection = Arc::new(Connection::new(backend, settings.namespace.clone()));
        let server_id = Uuid::new_v4().to_string();
        Self {
            counters: Arc::new(SharedValueStore::new(
                Arc::clone(&connection),
                settings.max_retries,
            )),
            booleans: Arc::new(SharedValueStore::new(
                Arc::clone(&connection),
                settings.max_retries,
            )),
            tri_states: Arc::new(SharedValueStore::new(
                Arc::clone(&connection),
                settings.max_retries,
            )),
            mutexes: MutexPool::new(Arc::clone(&connection), settings.num_locks),
            membership: Arc::new(MembershipRegistry::new(
                Arc::clone(&connection),
                server_id.clone(),
            )),
            evictions: Arc::new(EvictionProtocol::new(
                Arc::clone(&connection),
                server_id.clone(),
            )),
            reap_interval: settings.reaper_interval(),
            connection,
            server_id,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn namespace(&self) -> &str {
        self.connection.namespace()
    }

    /// Bring the coordinator online: create the shared roots, join the
    /// membership registry, and start the session listener, eviction
    /// observer, and reap timer.
    ///
    /// Session-level failures here are fatal and abort initialization.
    pub async fn start(&self) -> Result<(), CoordinationError> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!(server_id = %self.server_id, "coordinator already started");
            return Ok(());
        }
        if let Err(err) = self.try_start().await {
            self.started.store(false, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    async fn try_start(&self) -> Result<(), CoordinationError> {
        self.connection.guard_available()?;
        self.evictions.ensure_root().await?;
        self.membership.join().await?;

        let spawned = vec![
            self.spawn_session_listener(),
            self.evictions.spawn_observer(),
            self.spawn_reaper(),
        ];
        mutex_lock(&self.tasks, SOURCE, "start").extend(spawned);

        info!(
            namespace = %self.connection.namespace(),
            server_id = %self.server_id,
            "cache coordinator started"
        );
        Ok(())
    }

    /// Take the coordinator offline. Idempotent.
    ///
    /// Cancels the timers and watches and releases the membership marker and
    /// shared-value resources; backend calls already in flight complete or
    /// fail naturally.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for task in mutex_lock(&self.tasks, SOURCE, "stop").drain(..) {
            task.abort();
        }
        self.membership.leave().await;
        self.counters.release_all();
        self.booleans.release_all();
        self.tri_states.release_all();
        info!(server_id = %self.server_id, "cache coordinator stopped");
    }

    // Counters ----------------------------------------------------------

    pub async fn register_counter(
        &self,
        name: &str,
        listener: impl Fn(i64) + Send + Sync + 'static,
    ) -> Result<(), CoordinationError> {
        self.counters.register(name, Arc::new(listener)).await
    }

    /// Increment the shared counter by one via a compare-and-swap loop.
    ///
    /// Blocks for the duration of the loop; do not call from a value
    /// listener.
    pub async fn increment_counter(&self, name: &str) -> Result<(), CoordinationError> {
        self.counters.update(name, |value| value + 1).await.map(|_| ())
    }

    pub async fn decrement_counter(&self, name: &str) -> Result<(), CoordinationError> {
        self.counters.update(name, |value| value - 1).await.map(|_| ())
    }

    pub async fn set_counter(&self, name: &str, value: i64) -> Result<(), CoordinationError> {
        self.counters.set(name, value).await
    }

    /// Compare `expected` against the locally cached counter, reconciling
    /// the cache to `expected`. Returns whether they already matched.
    pub fn check_counter(&self, name: &str, expected: i64) -> Result<bool, CoordinationError> {
        self.counters.check(name, expected)
    }

    // Booleans ----------------------------------------------------------

    pub async fn register_boolean(
        &self,
        name: &str,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> Result<(), CoordinationError> {
        self.booleans.register(name, Arc::new(listener)).await
    }

    pub async fn set_boolean(&self, name: &str, value: bool) -> Result<(), CoordinationError> {
        self.booleans.set(name, value).await
    }

    pub fn check_boolean(&self, name: &str, expected: bool) -> Result<bool, CoordinationError> {
        self.booleans.check(name, expected)
    }

    // Tri-states --------------------------------------------------------

    pub async fn register_tri_state(
        &self,
        name: &str,
        listener: impl Fn(RefreshState) + Send + Sync + 'static,
    ) -> Result<(), CoordinationError> {
        self.tri_states.register(name, Arc::new(listener)).await
    }

    pub async fn set_tri_state(
        &self,
        name: &str,
        value: RefreshState,
    ) -> Result<(), CoordinationError> {
        self.tri_states.set(name, value).await
    }

    pub fn check_tri_state(
        &self,
        name: &str,
        expected: RefreshState,
    ) -> Result<bool, CoordinationError> {
        self.tri_states.check(name, expected)
    }

    // Locks, membership, evictions --------------------------------------

    /// The distributed mutex guarding `resource`'s bucket.
    pub fn mutex(&self, resource: &str) -> Arc<DistributedMutex> {
        self.mutexes.mutex(resource)
    }

    pub async fn live_members(&self) -> Result<Vec<String>, CoordinationError> {
        self.membership.live_members().await
    }

    /// Broadcast "invalidate `resource_key`" to every listening coordinator.
    pub async fn announce_eviction(&self, resource_key: &str) -> Result<(), CoordinationError> {
        self.evictions.announce(resource_key).await
    }

    /// Register a local eviction callback, invoked once per observed
    /// request with the resource key.
    pub fn on_eviction(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.evictions.on_eviction(Arc::new(callback));
    }

    /// Run one reap pass immediately, in addition to the interval timer.
    /// Idempotent against concurrent reaps on other instances.
    pub async fn reap_evictions(&self) {
        self.evictions.reap(&self.membership).await;
    }

    // Internals ---------------------------------------------------------

    fn spawn_session_listener(&self) -> JoinHandle<()> {
        let mut events = self.connection.backend().session_events();
        let counters = Arc::clone(&self.counters);
        let booleans = Arc::clone(&self.booleans);
        let tri_states = Arc::clone(&self.tri_states);
        tokio::spawn(async move {
            let mut tracker = ReconnectTracker::new();
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                match tracker.observe(event) {
                    ReconnectAction::Snapshot => {
                        warn!(?event, "coordination session lost; releasing shared values");
                        counters.release_all();
                        booleans.release_all();
                        tri_states.release_all();
                    }
                    ReconnectAction::Restore => {
                        info!("coordination session re-established; re-registering shared values");
                        counters.restore_all().await;
                        booleans.restore_all().await;
                        tri_states.restore_all().await;
                    }
                    ReconnectAction::Nothing => {
                        debug!(?event, "session state changed");
                    }
                }
            }
        })
    }

    fn spawn_reaper(&self) -> JoinHandle<()> {
        let evictions = Arc::clone(&self.evictions);
        let membership = Arc::clone(&self.membership);
        let period = self.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; the first reap waits a full
            // period like the rest.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                evictions.reap(&membership).await;
            }
        })
    }
}
