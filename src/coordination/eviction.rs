//! Eviction broadcast & reap protocol.
//!
//! Any instance announces "invalidate resource X" by creating a request node
//! under `/evictions`. Every live instance observes the request through a
//! child watch, runs its local eviction callbacks, and acknowledges by
//! creating a responder marker named after itself under the request. The
//! reap step, run on a timer by every instance with no leader, deletes a
//! request once the responders cover the current live-server set. All
//! instances may try the delete; only one wins, and losing is fine.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use metrics::{counter, histogram};
use time::{Duration, OffsetDateTime};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::backend::{BackendError, ChildEvent, CreateMode, join_path};
use crate::util::lock::{rw_read, rw_write};

use super::connection::Connection;
use super::error::CoordinationError;
use super::membership::MembershipRegistry;

const SOURCE: &str = "coordination::eviction";
const EVICTIONS: &str = "evictions";

/// A request younger than this is never re-created by `announce`; duplicate
/// broadcasts collapse into the in-flight one.
const DEDUP_WINDOW: Duration = Duration::seconds(60);
/// Delete attempts per reap cycle before leaving the request to a later
/// cycle or another instance.
const REAP_DELETE_ATTEMPTS: u32 = 5;

pub(crate) const METRIC_ANNOUNCED: &str = "stormo_eviction_announced_total";
pub(crate) const METRIC_OBSERVED: &str = "stormo_eviction_observed_total";
pub(crate) const METRIC_REAPED: &str = "stormo_eviction_reaped_total";
pub(crate) const METRIC_REAP_MS: &str = "stormo_eviction_reap_ms";

/// Local eviction side effect, invoked with the resource key.
pub type EvictionCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct EvictionProtocol {
    connection: Arc<Connection>,
    server_id: String,
    dedup_window: Duration,
    callbacks: RwLock<Vec<EvictionCallback>>,
}

impl EvictionProtocol {
    pub(crate) fn new(connection: Arc<Connection>, server_id: impl Into<String>) -> Self {
        Self {
            connection,
            server_id: server_id.into(),
            dedup_window: DEDUP_WINDOW,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    #[cfg(test)]
    fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    /// Create the eviction root so the child watch has something to hang
    /// off. Invoked once at coordinator start.
    pub(crate) async fn ensure_root(&self) -> Result<(), BackendError> {
        self.connection.ensure(EVICTIONS).await
    }

    /// Broadcast "invalidate `resource_key`" to the fleet.
    pub async fn announce(&self, resource_key: &str) -> Result<(), CoordinationError> {
        self.connection.guard_available()?;
        let backend = self.connection.backend();
        let path = self.request_path(resource_key);

        if let Some(stat) = backend.stat(&path).await? {
            let age = OffsetDateTime::now_utc() - stat.created_at;
            if age <= self.dedup_window {
                debug!(
                    resource_key,
                    age_ms = age.whole_milliseconds() as i64,
                    "in-flight eviction request already covers this key"
                );
                return Ok(());
            }
            // A request this old means an earlier reap failed; clear it out
            // and start a fresh lifecycle. Best-effort: a losing race here
            // just means someone else cleaned it up.
            debug!(
                resource_key,
                age_ms = age.whole_milliseconds() as i64,
                "deleting stale eviction request before re-announcing"
            );
            if let Err(err) = backend.delete_recursive(&path).await {
                warn!(resource_key, error = %err, "unable to delete stale eviction request");
            }
        }

        match backend.create(&path, &[], CreateMode::Persistent).await {
            Ok(_) => {
                counter!(METRIC_ANNOUNCED).increment(1);
                info!(resource_key, "eviction announced");
                Ok(())
            }
            // A racing announcer beat us; their request covers ours.
            Err(BackendError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Register a local eviction callback.
    ///
    /// Requests arriving while no callback is registered are not
    /// acknowledged by this instance.
    pub fn on_eviction(&self, callback: EvictionCallback) {
        rw_write(&self.callbacks, SOURCE, "on_eviction").push(callback);
    }

    /// Watch the request subtree; for each new request run the callbacks and
    /// acknowledge.
    pub(crate) fn spawn_observer(self: &Arc<Self>) -> JoinHandle<()> {
        let root = self.connection.full_path(EVICTIONS);
        let mut requests = self.connection.backend().watch_children(&root);
        let protocol = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Ok(ChildEvent::Added { name, .. }) => protocol.observe_request(&name).await,
                    Ok(ChildEvent::Removed { .. }) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "eviction watch lagged; some requests may be missed");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn observe_request(&self, resource_key: &str) {
        let callbacks: Vec<EvictionCallback> =
            rw_read(&self.callbacks, SOURCE, "observe_request").clone();
        if callbacks.is_empty() {
            return;
        }

        debug!(resource_key, "eviction request observed");
        counter!(METRIC_OBSERVED).increment(1);
        for callback in &callbacks {
            callback(resource_key);
        }

        let marker = join_path(&self.request_path(resource_key), &self.server_id);
        match self
            .connection
            .backend()
            .create(&marker, &[], CreateMode::Persistent)
            .await
        {
            Ok(_) => {}
            // Re-delivery; our acknowledgment is already there.
            Err(BackendError::AlreadyExists(_)) => {}
            Err(err) => {
                warn!(resource_key, error = %err, "unable to acknowledge eviction request");
            }
        }
    }

    /// One cleanup pass: delete every request whose responders cover the
    /// current live-server set.
    ///
    /// Superset, not equality: a server may acknowledge and then leave the
    /// fleet before this check, and that still counts. Errors are logged,
    /// never escalated; a later cycle, here or on another instance, retries.
    pub async fn reap(&self, membership: &MembershipRegistry) {
        debug!("reaping eviction requests");
        let started = Instant::now();
        if let Err(err) = self.reap_inner(membership).await {
            warn!(error = %err, "error cleaning up eviction requests");
        }
        histogram!(METRIC_REAP_MS).record(started.elapsed().as_secs_f64() * 1000.0);
    }

    async fn reap_inner(&self, membership: &MembershipRegistry) -> Result<(), CoordinationError> {
        let backend = self.connection.backend();
        let live = membership.live_members().await?;
        let root = self.connection.full_path(EVICTIONS);

        for request in backend.children(&root).await? {
            let path = join_path(&root, &request);
            let responders = match backend.children(&path).await {
                Ok(responders) => responders,
                // Another instance reaped it first.
                Err(BackendError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };

            let outstanding: Vec<&String> = live
                .iter()
                .filter(|server| !responders.contains(server))
                .collect();
            if !outstanding.is_empty() {
                debug!(
                    request = %request,
                    live = ?live,
                    responders = ?responders,
                    "eviction request cannot be cleaned up yet"
                );
                continue;
            }

            debug!(request = %request, "eviction request fully acknowledged; cleaning up");
            for attempt in 1..=REAP_DELETE_ATTEMPTS {
                match backend.delete_recursive(&path).await {
                    Ok(()) => {
                        counter!(METRIC_REAPED).increment(1);
                        break;
                    }
                    Err(err) if attempt == REAP_DELETE_ATTEMPTS => {
                        warn!(
                            request = %request,
                            error = %err,
                            "giving up deleting eviction request; a later cycle will retry"
                        );
                    }
                    Err(err) => {
                        trace!(request = %request, attempt, error = %err, "problem deleting eviction request");
                    }
                }
            }
        }
        Ok(())
    }

    fn request_path(&self, resource_key: &str) -> String {
        self.connection.full_path(&format!("{EVICTIONS}/{resource_key}"))
    }
}
