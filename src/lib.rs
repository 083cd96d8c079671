//! Stormo keeps a fleet of server processes, each holding a locally built
//! read cache over a slow shared data store, mutually consistent.
//!
//! Any instance can force the whole fleet to invalidate or reload a named
//! cache segment, and the fleet agrees, without a leader, when an
//! invalidation has been fully acknowledged and can be garbage-collected.
//!
//! The pieces, bottom up:
//!
//! - [`backend`]: the coordination-service seam (ZooKeeper-equivalent
//!   semantics) plus an in-process implementation.
//! - [`coordination`]: shared counters/booleans/tri-states, a bucketed
//!   distributed mutex pool, membership tracking, and the eviction
//!   broadcast-and-reap protocol, composed by
//!   [`coordination::SharedCacheCoordinator`].
//! - [`scheduler`]: the consumer, scheduling per-segment reloads driven by
//!   the shared change tokens.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use stormo::backend::MemoryCoordination;
//! use stormo::config::Settings;
//! use stormo::coordination::SharedCacheCoordinator;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load(None)?;
//! let service = MemoryCoordination::new();
//! let coordinator = Arc::new(SharedCacheCoordinator::new(
//!     service.session(),
//!     &settings.coordination,
//! ));
//! coordinator.start().await?;
//!
//! coordinator.on_eviction(|resource| {
//!     // Drop the local cache entry for `resource`.
//!     let _ = resource;
//! });
//! coordinator.announce_eviction("shard-users").await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod coordination;
pub mod infra;
pub mod scheduler;
mod util;

pub use config::Settings;
pub use coordination::{CoordinationError, RefreshState, SharedCacheCoordinator};
pub use scheduler::{ReloadJob, SegmentScheduler, SegmentStatus};
