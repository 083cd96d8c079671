//! Bucketed distributed mutex pool.
//!
//! Resource names hash into a fixed number of buckets, one backend lock
//! object per bucket. Many resources sharing a bucket serialize through the
//! same lock; the trade bounds the number of live lock objects per
//! namespace.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::backend::{BackendError, CreateMode, join_path, node_name};
use crate::util::lock::mutex_lock;

use super::connection::Connection;
use super::error::CoordinationError;

const SOURCE: &str = "coordination::mutex";
const CLAIM_PREFIX: &str = "claim-";

/// Stable bucket for a resource name.
///
/// A pure function of the name and the pool size: the same resource maps to
/// the same bucket across calls and across process restarts.
pub fn bucket_for(resource: &str, num_locks: u32) -> u32 {
    let digest = Sha256::digest(resource.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % u64::from(num_locks)) as u32
}

/// Lazily-created pool of [`DistributedMutex`]es, cached for the life of the
/// coordinator.
pub struct MutexPool {
    connection: Arc<Connection>,
    num_locks: u32,
    locks: Mutex<HashMap<u32, Arc<DistributedMutex>>>,
}

impl MutexPool {
    pub(crate) fn new(connection: Arc<Connection>, num_locks: u32) -> Self {
        Self {
            connection,
            num_locks: num_locks.max(1),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// The mutex guarding `resource`'s bucket.
    pub fn mutex(&self, resource: &str) -> Arc<DistributedMutex> {
        let bucket = bucket_for(resource, self.num_locks);
        let mut locks = mutex_lock(&self.locks, SOURCE, "mutex");
        Arc::clone(locks.entry(bucket).or_insert_with(|| {
            Arc::new(DistributedMutex {
                connection: Arc::clone(&self.connection),
                bucket,
                path: self.connection.full_path(&format!("locks/lock-{bucket}")),
            })
        }))
    }
}

/// One bucket's backend lock, implemented as an ephemeral-sequential claim
/// queue: the lowest outstanding claim holds the lock.
pub struct DistributedMutex {
    connection: Arc<Connection>,
    bucket: u32,
    path: String,
}

impl DistributedMutex {
    pub fn bucket(&self) -> u32 {
        self.bucket
    }

    /// Block until the lock is held.
    ///
    /// No built-in timeout; callers compose their own (e.g.
    /// `tokio::time::timeout`). Dropping the returned guard without calling
    /// [`DistributedMutexGuard::release`] leaves the claim to the session
    /// lifetime.
    pub async fn acquire(&self) -> Result<DistributedMutexGuard, CoordinationError> {
        self.connection.guard_available()?;
        let backend = self.connection.backend();
        let claim = backend
            .create(
                &join_path(&self.path, CLAIM_PREFIX),
                &[],
                CreateMode::EphemeralSequential,
            )
            .await?;
        let claim_name = node_name(&claim).to_string();

        loop {
            // Subscribe before inspecting the queue so a release between the
            // two cannot be missed.
            let mut queue_changes = backend.watch_children(&self.path);
            let queue = backend.children(&self.path).await?;
            if queue.first().map(String::as_str) == Some(claim_name.as_str()) {
                debug!(bucket = self.bucket, claim = %claim_name, "distributed mutex acquired");
                return Ok(DistributedMutexGuard {
                    connection: Arc::clone(&self.connection),
                    claim_path: claim,
                });
            }
            match queue_changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Err(CoordinationError::Unavailable),
            }
        }
    }
}

/// Held lock; releasing deletes the claim node.
pub struct DistributedMutexGuard {
    connection: Arc<Connection>,
    claim_path: String,
}

impl DistributedMutexGuard {
    pub async fn release(self) -> Result<(), CoordinationError> {
        match self.connection.backend().delete(&self.claim_path).await {
            // Already gone: the session died and the backend cleaned up.
            Ok(()) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::MemoryCoordination;

    fn pool(connection: Arc<Connection>) -> MutexPool {
        MutexPool::new(connection, 5)
    }

    #[test]
    fn bucketing_is_stable() {
        let first = bucket_for("shard-users", 30);
        let second = bucket_for("shard-users", 30);
        assert_eq!(first, second);
        assert!(first < 30);
    }

    #[test]
    fn same_resource_returns_the_same_mutex() {
        let coordination = MemoryCoordination::new();
        let pool = pool(Arc::new(Connection::new(coordination.session(), "ns")));

        let a = pool.mutex("shard-users");
        let b = pool.mutex("shard-users");
        assert_eq!(a.bucket(), b.bucket());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn acquire_serializes_across_sessions() {
        let coordination = MemoryCoordination::new();
        let pool_a = pool(Arc::new(Connection::new(coordination.session(), "ns")));
        let pool_b = pool(Arc::new(Connection::new(coordination.session(), "ns")));

        let guard = pool_a.mutex("shard-users").acquire().await.expect("acquire");

        // The second claimant must wait until the first releases.
        let contender = pool_b.mutex("shard-users");
        let pending = tokio::spawn(async move { contender.acquire().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        guard.release().await.expect("release");
        let second = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("acquire completes")
            .expect("join")
            .expect("acquire");
        second.release().await.expect("release");
    }

    #[tokio::test]
    async fn session_loss_frees_the_claim() {
        let coordination = MemoryCoordination::new();
        let holder_session = coordination.session();
        let holder = MutexPool::new(
            Arc::new(Connection::new(
                Arc::clone(&holder_session) as Arc<dyn crate::backend::CoordinationBackend>,
                "ns",
            )),
            5,
        );
        let waiter = pool(Arc::new(Connection::new(coordination.session(), "ns")));

        let _held = holder.mutex("shard-users").acquire().await.expect("acquire");

        let contender = waiter.mutex("shard-users");
        let pending = tokio::spawn(async move { contender.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The holder's session dies; its ephemeral claim evaporates.
        holder_session.expire();

        let guard = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .expect("acquire completes")
            .expect("join")
            .expect("acquire");
        guard.release().await.expect("release");
    }
}
