//! In-process coordination service.
//!
//! One [`MemoryCoordination`] plays the role of the external service: it owns
//! the node tree and hands out [`MemorySession`]s, each of which behaves like
//! an independent client session. Ephemeral nodes are tied to the creating
//! session and disappear when it expires. Tests use [`MemorySession::expire`]
//! and [`MemorySession::reconnect`] to script loss/recovery sequences.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;

use crate::util::lock::mutex_lock;

use super::{
    BackendError, ChildEvent, CoordinationBackend, CreateMode, NodeStat, NodeVersion,
    SessionEvent, ValueEvent, VersionedValue, node_name,
};

const SOURCE: &str = "backend::memory";
const WATCH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: NodeVersion,
    created_at: OffsetDateTime,
    ephemeral_owner: Option<u64>,
    sequence_counter: u64,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data,
            version: 0,
            created_at: OffsetDateTime::now_utc(),
            ephemeral_owner,
            sequence_counter: 0,
        }
    }
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, broadcast::Sender<ChildEvent>>,
    value_watches: HashMap<String, broadcast::Sender<ValueEvent>>,
}

impl TreeState {
    fn notify_child(&self, event: ChildEvent) {
        let parent = match &event {
            ChildEvent::Added { parent, .. } | ChildEvent::Removed { parent, .. } => parent,
        };
        if let Some(sender) = self.child_watches.get(parent) {
            // Errors just mean nobody is listening right now.
            let _ = sender.send(event);
        }
    }

    fn notify_value(&self, event: ValueEvent) {
        if let Some(sender) = self.value_watches.get(&event.path) {
            let _ = sender.send(event);
        }
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(idx) => path[..idx].to_string(),
        }
    }

    /// Create missing ancestors of `path` as persistent empty nodes.
    fn ensure_parents(&mut self, path: &str) {
        let mut ancestors = Vec::new();
        let mut current = Self::parent_of(path);
        while current != "/" && !self.nodes.contains_key(&current) {
            ancestors.push(current.clone());
            current = Self::parent_of(&current);
        }
        for ancestor in ancestors.into_iter().rev() {
            self.nodes.insert(ancestor.clone(), Node::new(Vec::new(), None));
            self.notify_child(ChildEvent::Added {
                parent: Self::parent_of(&ancestor),
                name: node_name(&ancestor).to_string(),
            });
        }
    }

    fn remove_subtree(&mut self, path: &str) -> usize {
        let prefix = format!("{path}/");
        let doomed: Vec<String> = self
            .nodes
            .keys()
            .filter(|key| key.as_str() == path || key.starts_with(&prefix))
            .cloned()
            .collect();
        for key in doomed.iter().rev() {
            self.nodes.remove(key);
            self.notify_child(ChildEvent::Removed {
                parent: Self::parent_of(key),
                name: node_name(key).to_string(),
            });
        }
        doomed.len()
    }
}

/// The shared service: one node tree, many sessions.
pub struct MemoryCoordination {
    state: Arc<Mutex<TreeState>>,
    next_session_id: AtomicU64,
}

impl MemoryCoordination {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TreeState::default())),
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Open a new client session against this service.
    pub fn session(&self) -> Arc<MemorySession> {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Arc::new(MemorySession {
            id: self.next_session_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            alive: AtomicBool::new(true),
            events,
        })
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session. Implements [`CoordinationBackend`].
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<TreeState>>,
    alive: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    fn guard_alive(&self) -> Result<(), BackendError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::SessionExpired)
        }
    }

    /// Expire this session: every ephemeral node it owns is removed and a
    /// `Lost` event is delivered to its subscribers.
    pub fn expire(&self) {
        {
            let mut state = mutex_lock(&self.state, SOURCE, "expire");
            let owned: Vec<String> = state
                .nodes
                .iter()
                .filter(|(_, node)| node.ephemeral_owner == Some(self.id))
                .map(|(path, _)| path.clone())
                .collect();
            for path in owned {
                state.remove_subtree(&path);
            }
        }
        self.alive.store(false, Ordering::SeqCst);
        debug!(session_id = self.id, "memory session expired");
        let _ = self.events.send(SessionEvent::Lost);
    }

    /// Deliver a `Suspended` event without dropping the session.
    pub fn suspend(&self) {
        let _ = self.events.send(SessionEvent::Suspended);
    }

    /// Revive an expired session and deliver a `Reconnected` event.
    pub fn reconnect(&self) {
        self.alive.store(true, Ordering::SeqCst);
        debug!(session_id = self.id, "memory session reconnected");
        let _ = self.events.send(SessionEvent::Reconnected);
    }
}

#[async_trait]
impl CoordinationBackend for MemorySession {
    async fn create(
        &self,
        path: &str,
        data: &[u8],
        mode: CreateMode,
    ) -> Result<String, BackendError> {
        self.guard_alive()?;
        let mut state = mutex_lock(&self.state, SOURCE, "create");
        state.ensure_parents(path);

        let actual = match mode {
            CreateMode::EphemeralSequential => {
                let parent = TreeState::parent_of(path);
                // The root is implicit in the tree; materialize it on first
                // use so it can carry the sequence counter.
                let node = state
                    .nodes
                    .entry(parent)
                    .or_insert_with(|| Node::new(Vec::new(), None));
                let sequence = node.sequence_counter;
                node.sequence_counter += 1;
                format!("{path}{sequence:010}")
            }
            CreateMode::Persistent | CreateMode::Ephemeral => path.to_string(),
        };

        if state.nodes.contains_key(&actual) {
            return Err(BackendError::AlreadyExists(actual));
        }

        let owner = match mode {
            CreateMode::Persistent => None,
            CreateMode::Ephemeral | CreateMode::EphemeralSequential => Some(self.id),
        };
        state.nodes.insert(actual.clone(), Node::new(data.to_vec(), owner));
        state.notify_child(ChildEvent::Added {
            parent: TreeState::parent_of(&actual),
            name: node_name(&actual).to_string(),
        });
        Ok(actual)
    }

    async fn stat(&self, path: &str) -> Result<Option<NodeStat>, BackendError> {
        self.guard_alive()?;
        let state = mutex_lock(&self.state, SOURCE, "stat");
        Ok(state.nodes.get(path).map(|node| NodeStat {
            created_at: node.created_at,
            version: node.version,
        }))
    }

    async fn read(&self, path: &str) -> Result<VersionedValue, BackendError> {
        self.guard_alive()?;
        let state = mutex_lock(&self.state, SOURCE, "read");
        state
            .nodes
            .get(path)
            .map(|node| VersionedValue {
                data: node.data.clone(),
                version: node.version,
            })
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }

    async fn compare_and_set(
        &self,
        path: &str,
        expected: NodeVersion,
        data: &[u8],
    ) -> Result<bool, BackendError> {
        self.guard_alive()?;
        let mut state = mutex_lock(&self.state, SOURCE, "compare_and_set");
        let node = state
            .nodes
            .get_mut(path)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;
        if node.version != expected {
            return Ok(false);
        }
        node.data = data.to_vec();
        node.version += 1;
        let event = ValueEvent {
            path: path.to_string(),
            data: data.to_vec(),
            version: node.version,
        };
        state.notify_value(event);
        Ok(true)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.guard_alive()?;
        let state = mutex_lock(&self.state, SOURCE, "children");
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut names: Vec<String> = state
            .nodes
            .keys()
            .filter(|key| {
                key.starts_with(&prefix) && !key[prefix.len()..].contains('/')
                    && key.len() > prefix.len()
            })
            .map(|key| key[prefix.len()..].to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.guard_alive()?;
        let mut state = mutex_lock(&self.state, SOURCE, "delete");
        if !state.nodes.contains_key(path) {
            return Err(BackendError::NotFound(path.to_string()));
        }
        let child_prefix = format!("{path}/");
        if state.nodes.keys().any(|key| key.starts_with(&child_prefix)) {
            return Err(BackendError::NotEmpty(path.to_string()));
        }
        state.nodes.remove(path);
        state.notify_child(ChildEvent::Removed {
            parent: TreeState::parent_of(path),
            name: node_name(path).to_string(),
        });
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), BackendError> {
        self.guard_alive()?;
        let mut state = mutex_lock(&self.state, SOURCE, "delete_recursive");
        let removed = state.remove_subtree(path);
        debug!(path, removed, "recursive delete");
        Ok(())
    }

    fn watch_children(&self, path: &str) -> broadcast::Receiver<ChildEvent> {
        let mut state = mutex_lock(&self.state, SOURCE, "watch_children");
        state
            .child_watches
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn watch_value(&self, path: &str) -> broadcast::Receiver<ValueEvent> {
        let mut state = mutex_lock(&self.state, SOURCE, "watch_value");
        state
            .value_watches
            .entry(path.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn is_lost(&self) -> bool {
        !self.alive.load(Ordering::SeqCst)
    }
}
