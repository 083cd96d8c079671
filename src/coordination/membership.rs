//! Cluster membership registry.
//!
//! Each coordinator registers an ephemeral "I am alive" marker under
//! `/liveServers`; the backend removes it when the owning session dies. The
//! registry's children enumerate the currently-live fleet, and the eviction
//! reap step is the only consumer of that view.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::backend::{BackendError, CreateMode};
use crate::util::lock::mutex_lock;

use super::connection::Connection;
use super::error::CoordinationError;

const SOURCE: &str = "coordination::membership";
const LIVE_SERVERS: &str = "liveServers";

pub struct MembershipRegistry {
    connection: Arc<Connection>,
    server_id: String,
    marker: Mutex<Option<String>>,
}

impl MembershipRegistry {
    pub(crate) fn new(connection: Arc<Connection>, server_id: impl Into<String>) -> Self {
        Self {
            connection,
            server_id: server_id.into(),
            marker: Mutex::new(None),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Register this instance's liveness marker.
    pub async fn join(&self) -> Result<(), CoordinationError> {
        self.connection.guard_available()?;
        self.connection.ensure(LIVE_SERVERS).await?;

        let path = self
            .connection
            .full_path(&format!("{LIVE_SERVERS}/{}", self.server_id));
        match self
            .connection
            .backend()
            .create(&path, &[], CreateMode::Ephemeral)
            .await
        {
            Ok(created) => {
                debug!(server_id = %self.server_id, "joined membership registry");
                *mutex_lock(&self.marker, SOURCE, "join") = Some(created);
                Ok(())
            }
            // A marker left over from a previous incarnation of this id.
            Err(BackendError::AlreadyExists(existing)) => {
                *mutex_lock(&self.marker, SOURCE, "join") = Some(existing);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Currently-live server ids.
    pub async fn live_members(&self) -> Result<Vec<String>, CoordinationError> {
        self.connection.guard_available()?;
        Ok(self
            .connection
            .backend()
            .children(&self.connection.full_path(LIVE_SERVERS))
            .await?)
    }

    /// Remove the liveness marker on graceful stop. Best-effort: a failure
    /// is logged, and the backend will clean up when the session dies.
    pub async fn leave(&self) {
        let Some(path) = mutex_lock(&self.marker, SOURCE, "leave").take() else {
            return;
        };
        match self.connection.backend().delete(&path).await {
            Ok(()) | Err(BackendError::NotFound(_)) => {
                debug!(server_id = %self.server_id, "left membership registry");
            }
            Err(err) => {
                warn!(
                    server_id = %self.server_id,
                    path = %path,
                    error = %err,
                    "error removing server identifier"
                );
            }
        }
    }
}
