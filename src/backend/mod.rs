//! Coordination-service seam.
//!
//! Stormo consumes a hierarchical coordination service with ZooKeeper-style
//! semantics: ordered nodes addressed by slash-separated paths, versioned
//! values with compare-and-set writes, child and value watches, and ephemeral
//! nodes that disappear when the owning session dies. The
//! [`CoordinationBackend`] trait is that boundary; [`memory`] provides an
//! in-process implementation used by tests and embedded deployments.

mod memory;

pub use memory::{MemoryCoordination, MemorySession};

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::broadcast;

/// Monotonic per-node write version, starting at 0 on creation.
pub type NodeVersion = u64;

/// How a node is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session.
    Persistent,
    /// Removed by the backend when the creating session dies.
    Ephemeral,
    /// Ephemeral, with a monotonically increasing suffix appended to the
    /// requested path. Used for lock queues.
    EphemeralSequential,
}

/// Node metadata returned by [`CoordinationBackend::stat`].
#[derive(Debug, Clone)]
pub struct NodeStat {
    pub created_at: OffsetDateTime,
    pub version: NodeVersion,
}

/// A node's value together with the version it was read at.
#[derive(Debug, Clone)]
pub struct VersionedValue {
    pub data: Vec<u8>,
    pub version: NodeVersion,
}

/// Child membership change under a watched parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEvent {
    Added { parent: String, name: String },
    Removed { parent: String, name: String },
}

/// Value change on a watched node.
#[derive(Debug, Clone)]
pub struct ValueEvent {
    pub path: String,
    pub data: Vec<u8>,
    pub version: NodeVersion,
}

/// Connection-state transitions delivered by the backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Suspended,
    Lost,
    Reconnected,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("node not found: {0}")]
    NotFound(String),
    #[error("node already exists: {0}")]
    AlreadyExists(String),
    #[error("node has children: {0}")]
    NotEmpty(String),
    #[error("session expired")]
    SessionExpired,
    #[error("value decode failed at {path}: {detail}")]
    Decode { path: String, detail: String },
}

/// One session against the coordination service.
///
/// All paths are absolute (`/`-rooted). Implementations must deliver value
/// events for a single node in write order; no ordering is guaranteed across
/// nodes.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    /// Create a node, creating missing parents as persistent nodes.
    ///
    /// Returns the path actually created, which differs from the requested
    /// path only for [`CreateMode::EphemeralSequential`].
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, BackendError>;

    /// Node metadata, or `None` if the node does not exist.
    async fn stat(&self, path: &str) -> Result<Option<NodeStat>, BackendError>;

    /// Read a node's value and version.
    async fn read(&self, path: &str) -> Result<VersionedValue, BackendError>;

    /// Conditionally overwrite a node's value.
    ///
    /// Returns `false` when `expected` no longer matches the node's current
    /// version; the caller re-reads and retries.
    async fn compare_and_set(
        &self,
        path: &str,
        expected: NodeVersion,
        data: &[u8],
    ) -> Result<bool, BackendError>;

    /// Names (not full paths) of a node's children, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, BackendError>;

    /// Delete a single childless node. `NotFound` if absent.
    async fn delete(&self, path: &str) -> Result<(), BackendError>;

    /// Delete a subtree. Succeeds if the subtree is already gone.
    async fn delete_recursive(&self, path: &str) -> Result<(), BackendError>;

    /// Subscribe to child additions/removals directly under `path`.
    fn watch_children(&self, path: &str) -> broadcast::Receiver<ChildEvent>;

    /// Subscribe to value changes on `path`.
    fn watch_value(&self, path: &str) -> broadcast::Receiver<ValueEvent>;

    /// Subscribe to this session's connection-state transitions.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Whether the session is currently lost. Callers use this to fail fast
    /// instead of queueing work against a dead session.
    fn is_lost(&self) -> bool;
}

/// Join two path segments the way the backend expects.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Final segment of a path.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
