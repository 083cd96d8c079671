//! Namespace-scoped session wrapper and reconnect tracking.

use std::sync::Arc;

use crate::backend::{BackendError, CoordinationBackend, CreateMode, SessionEvent};

use super::error::CoordinationError;

/// One coordinator's view of the coordination service.
///
/// Every path a coordinator touches is rooted under its namespace; this is
/// the single place that prefix is applied.
pub struct Connection {
    backend: Arc<dyn CoordinationBackend>,
    namespace: String,
}

impl Connection {
    pub fn new(backend: Arc<dyn CoordinationBackend>, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into().trim_matches('/').to_string();
        Self { backend, namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn backend(&self) -> &Arc<dyn CoordinationBackend> {
        &self.backend
    }

    /// Absolute backend path for a namespace-relative one.
    pub fn full_path(&self, relative: &str) -> String {
        let relative = relative.trim_start_matches('/');
        format!("/{}/{}", self.namespace, relative)
    }

    /// Create a persistent node if absent, tolerating a concurrent creator.
    pub async fn ensure(&self, relative: &str) -> Result<(), BackendError> {
        let path = self.full_path(relative);
        match self.backend.create(&path, &[], CreateMode::Persistent).await {
            Ok(_) => Ok(()),
            // Someone beat us to creating the node.
            Err(BackendError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Fail fast instead of queueing work against a lost session.
    pub fn guard_available(&self) -> Result<(), CoordinationError> {
        if self.backend.is_lost() {
            Err(CoordinationError::Unavailable)
        } else {
            Ok(())
        }
    }
}

/// What the coordinator must do in response to a session transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectAction {
    /// Nothing; transient state with no local consequence.
    Nothing,
    /// Snapshot every registered shared value locally and release its
    /// backend resources.
    Snapshot,
    /// Re-register every shared value from its local snapshot.
    Restore,
}

/// Typed transition table for session events.
///
/// A `Restore` is produced only for a `Reconnected` that follows a `Lost`;
/// a reconnect after a mere suspension leaves the registered values alone.
#[derive(Debug, Default)]
pub(crate) struct ReconnectTracker {
    last: Option<SessionEvent>,
}

impl ReconnectTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn observe(&mut self, event: SessionEvent) -> ReconnectAction {
        let action = match event {
            SessionEvent::Lost => ReconnectAction::Snapshot,
            SessionEvent::Reconnected if self.last == Some(SessionEvent::Lost) => {
                ReconnectAction::Restore
            }
            SessionEvent::Connected | SessionEvent::Suspended | SessionEvent::Reconnected => {
                ReconnectAction::Nothing
            }
        };
        self.last = Some(event);
        action
    }
}
