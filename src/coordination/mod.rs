//! Fleet coordination layer.
//!
//! Everything here rides on one [`crate::backend::CoordinationBackend`]
//! session scoped to a namespace:
//!
//! - **Shared values**: named counters, booleans, and tri-state flags,
//!   mirrored locally and updated with compare-and-swap retry loops.
//! - **Distributed mutexes**: a fixed-size pool of backend locks, resource
//!   names hashed into buckets.
//! - **Membership**: an ephemeral liveness marker per instance.
//! - **Eviction broadcast & reap**: any instance announces "invalidate X",
//!   every live instance observes and acknowledges, and fully-acknowledged
//!   announcements are garbage-collected without a leader.
//!
//! [`SharedCacheCoordinator`] composes the pieces behind a start/stop
//! lifecycle.

mod connection;
mod coordinator;
mod error;
mod eviction;
mod membership;
mod mutex;
mod shared;

pub use connection::Connection;
pub use coordinator::SharedCacheCoordinator;
pub use error::CoordinationError;
pub use eviction::{EvictionCallback, EvictionProtocol};
pub use membership::MembershipRegistry;
pub use mutex::{DistributedMutex, DistributedMutexGuard, MutexPool};
pub use shared::{
    BooleanKind, CounterKind, RefreshState, SharedKind, SharedValueStore, TriStateKind,
    ValueListener,
};
