//! Reload scheduler.
//!
//! Owns, per named cache segment, a last-refresh timestamp, a reload
//! interval, and an in-flight task handle. A segment's shared counter is its
//! fleet-wide change token: any instance that increments it forces every
//! other instance to treat its local copy as overdue. The scheduler itself
//! never inspects a reload's outcome: a successful job stamps the segment
//! refreshed as its last action, a failed one leaves the stamp untouched so
//! the next poll retries.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SchedulerSettings;
use crate::coordination::{CoordinationError, RefreshState, SharedCacheCoordinator};
use crate::util::lock::mutex_lock;

const SOURCE: &str = "scheduler";

pub(crate) const METRIC_RELOAD_SUBMITTED: &str = "stormo_reload_submitted_total";
pub(crate) const METRIC_RELOAD_FAILED: &str = "stormo_reload_failed_total";

/// Error type reload jobs report at the job boundary.
pub type ReloadError = Box<dyn std::error::Error + Send + Sync>;

/// The side-effecting reload: scan the shared backing store and materialize
/// the segment into the local cache. External collaborator; the scheduler
/// only submits it and logs failures.
#[async_trait]
pub trait ReloadJob: Send + Sync {
    async fn reload(&self, segment: &str) -> Result<(), ReloadError>;
}

/// Observability snapshot of one segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentStatus {
    pub name: String,
    pub reload_interval_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_refresh: OffsetDateTime,
    pub refreshing: bool,
}

struct SegmentEntry {
    name: String,
    reload_interval: time::Duration,
    last_refresh: Mutex<OffsetDateTime>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentEntry {
    fn new(name: String, reload_interval: time::Duration) -> Self {
        Self {
            name,
            reload_interval,
            // Every segment starts overdue: the first poll loads it.
            last_refresh: Mutex::new(OffsetDateTime::UNIX_EPOCH),
            in_flight: Mutex::new(None),
        }
    }

    fn mark_stale(&self) {
        *mutex_lock(&self.last_refresh, SOURCE, "mark_stale") = OffsetDateTime::UNIX_EPOCH;
    }

    fn mark_refreshed(&self) {
        *mutex_lock(&self.last_refresh, SOURCE, "mark_refreshed") = OffsetDateTime::now_utc();
    }

    fn last_refresh(&self) -> OffsetDateTime {
        *mutex_lock(&self.last_refresh, SOURCE, "last_refresh")
    }

    fn is_due(&self, now: OffsetDateTime) -> bool {
        now - self.last_refresh() > self.reload_interval
    }
}

/// Decides, per segment, whether a local reload is due, and submits reload
/// jobs to a bounded worker pool.
pub struct SegmentScheduler {
    coordinator: Arc<SharedCacheCoordinator>,
    job: Arc<dyn ReloadJob>,
    entries: DashMap<String, Arc<SegmentEntry>>,
    workers: Arc<Semaphore>,
}

impl SegmentScheduler {
    /// Build the scheduler and register each segment's shared counter and
    /// tri-state with the coordinator.
    ///
    /// The counter listener is the fleet-wide propagation path: a value this
    /// instance has not seen locally marks the segment overdue.
    pub async fn new(
        coordinator: Arc<SharedCacheCoordinator>,
        job: Arc<dyn ReloadJob>,
        settings: &SchedulerSettings,
    ) -> Result<Arc<Self>, CoordinationError> {
        let scheduler = Arc::new(Self {
            coordinator: Arc::clone(&coordinator),
            job,
            entries: DashMap::new(),
            workers: Arc::new(Semaphore::new(settings.worker_pool_size.max(1))),
        });

        for segment in &settings.segments {
            let entry = Arc::new(SegmentEntry::new(
                segment.name.clone(),
                segment.reload_interval(),
            ));
            scheduler.entries.insert(segment.name.clone(), Arc::clone(&entry));

            let listener_entry = Arc::clone(&entry);
            // Weak, so the listener does not keep the coordinator alive
            // through its own counter store.
            let listener_coordinator = Arc::downgrade(&coordinator);
            let listener_name = segment.name.clone();
            coordinator
                .register_counter(&segment.name, move |value| {
                    let Some(coordinator) = listener_coordinator.upgrade() else {
                        return;
                    };
                    match coordinator.check_counter(&listener_name, value) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(
                                segment = %listener_name,
                                value,
                                "segment change token advanced elsewhere; marking overdue"
                            );
                            listener_entry.mark_stale();
                        }
                        Err(err) => {
                            warn!(segment = %listener_name, error = %err, "counter check failed");
                        }
                    }
                })
                .await?;
            // The tri-state is an auxiliary "needs metadata refresh" flag;
            // transitions beyond NeedsUpdate are consumer-defined.
            coordinator.register_tri_state(&segment.name, |_| {}).await?;
        }

        Ok(scheduler)
    }

    /// Force a fleet-wide reload of `segment`.
    ///
    /// Advances the shared change token and flags the tri-state; locally the
    /// segment becomes overdue immediately, so the next [`Self::poll_once`]
    /// on this instance submits a job.
    pub async fn force_reload(&self, segment: &str) -> Result<(), CoordinationError> {
        let entry = self.entry(segment)?;
        self.coordinator.increment_counter(segment).await?;
        self.coordinator
            .set_tri_state(segment, RefreshState::NeedsUpdate)
            .await?;
        entry.mark_stale();
        info!(segment, "forced reload");
        Ok(())
    }

    /// One scheduler tick: reclaim finished reload tasks, then submit a job
    /// for every idle segment that is due. Returns the number submitted.
    pub fn poll_once(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut submitted = 0;

        for item in self.entries.iter() {
            let entry = Arc::clone(item.value());
            let mut in_flight = mutex_lock(&entry.in_flight, SOURCE, "poll_once");

            // Reclaim first; the job's outcome is not inspected here.
            if in_flight.as_ref().is_some_and(JoinHandle::is_finished) {
                *in_flight = None;
            }

            if in_flight.is_none() && entry.is_due(now) {
                *in_flight = Some(self.submit(Arc::clone(&entry)));
                submitted += 1;
            }
        }
        submitted
    }

    /// Status snapshots for external observability.
    pub fn list_segments(&self) -> Vec<SegmentStatus> {
        let mut statuses: Vec<SegmentStatus> = self
            .entries
            .iter()
            .map(|item| {
                let entry = item.value();
                let refreshing = mutex_lock(&entry.in_flight, SOURCE, "list_segments")
                    .as_ref()
                    .is_some_and(|task| !task.is_finished());
                SegmentStatus {
                    name: entry.name.clone(),
                    reload_interval_ms: entry.reload_interval.whole_milliseconds().max(0) as u64,
                    last_refresh: entry.last_refresh(),
                    refreshing,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Cancel pending reload work. In-flight backend calls complete or fail
    /// naturally.
    pub fn stop(&self) {
        for item in self.entries.iter() {
            if let Some(task) = mutex_lock(&item.value().in_flight, SOURCE, "stop").take() {
                task.abort();
            }
        }
    }

    fn submit(&self, entry: Arc<SegmentEntry>) -> JoinHandle<()> {
        let workers = Arc::clone(&self.workers);
        let job = Arc::clone(&self.job);
        counter!(METRIC_RELOAD_SUBMITTED).increment(1);
        debug!(segment = %entry.name, "reload job submitted");
        tokio::spawn(async move {
            // Closed only when the scheduler itself is dropped.
            let Ok(_permit) = workers.acquire().await else {
                return;
            };
            match job.reload(&entry.name).await {
                Ok(()) => {
                    entry.mark_refreshed();
                    info!(segment = %entry.name, "segment reloaded");
                }
                Err(err) => {
                    // Leave last_refresh untouched: the next poll retries on
                    // the segment's own cadence, and the segment keeps
                    // serving its last-good local cache meanwhile.
                    counter!(METRIC_RELOAD_FAILED).increment(1);
                    warn!(segment = %entry.name, error = %err, "segment reload failed");
                }
            }
        })
    }

    fn entry(&self, segment: &str) -> Result<Arc<SegmentEntry>, CoordinationError> {
        self.entries
            .get(segment)
            .map(|item| Arc::clone(item.value()))
            .ok_or_else(|| CoordinationError::invalid_name("segment", segment))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::backend::{CoordinationBackend, MemoryCoordination};
    use crate::config::{CoordinationSettings, SegmentSettings};

    struct CountingJob {
        reloads: AtomicUsize,
        fail: std::sync::atomic::AtomicBool,
        delay: StdDuration,
    }

    impl CountingJob {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                reloads: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
                delay: StdDuration::ZERO,
            })
        }

        fn slow(delay: StdDuration) -> Arc<Self> {
            Arc::new(Self {
                reloads: AtomicUsize::new(0),
                fail: std::sync::atomic::AtomicBool::new(false),
                delay,
            })
        }

        fn count(&self) -> usize {
            self.reloads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReloadJob for CountingJob {
        async fn reload(&self, _segment: &str) -> Result<(), ReloadError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.reloads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err("backing store unavailable".into());
            }
            Ok(())
        }
    }

    async fn coordinator(coordination: &MemoryCoordination) -> Arc<SharedCacheCoordinator> {
        let coordinator = Arc::new(SharedCacheCoordinator::new(
            coordination.session() as Arc<dyn CoordinationBackend>,
            &CoordinationSettings::default(),
        ));
        coordinator.start().await.expect("start");
        coordinator
    }

    fn settings(segments: Vec<SegmentSettings>) -> SchedulerSettings {
        SchedulerSettings {
            worker_pool_size: 2,
            segments,
        }
    }

    async fn settle() {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn due_segment_submits_exactly_one_job() {
        let coordination = MemoryCoordination::new();
        let coordinator = coordinator(&coordination).await;
        let job = CountingJob::slow(StdDuration::from_millis(200));
        let scheduler = SegmentScheduler::new(
            Arc::clone(&coordinator),
            job.clone(),
            &settings(vec![SegmentSettings::new("t1", 1000)]),
        )
        .await
        .expect("scheduler");

        // Entry starts at the epoch, so it is overdue now.
        assert_eq!(scheduler.poll_once(), 1);
        // A second poll before the job completes submits nothing.
        assert_eq!(scheduler.poll_once(), 0);
        assert!(scheduler.list_segments()[0].refreshing);

        tokio::time::sleep(StdDuration::from_millis(250)).await;
        assert_eq!(job.count(), 1);

        // The completed job stamped the segment fresh; nothing is due.
        assert_eq!(scheduler.poll_once(), 0);
        assert!(!scheduler.list_segments()[0].refreshing);

        scheduler.stop();
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn fresh_segment_is_not_due_until_the_interval_elapses() {
        let coordination = MemoryCoordination::new();
        let coordinator = coordinator(&coordination).await;
        let job = CountingJob::new();
        let scheduler = SegmentScheduler::new(
            Arc::clone(&coordinator),
            job.clone(),
            &settings(vec![SegmentSettings::new("t1", 100)]),
        )
        .await
        .expect("scheduler");

        assert_eq!(scheduler.poll_once(), 1);
        settle().await;
        assert_eq!(scheduler.poll_once(), 0);

        // After the interval the segment is due again.
        tokio::time::sleep(StdDuration::from_millis(150)).await;
        assert_eq!(scheduler.poll_once(), 1);
        settle().await;
        assert_eq!(job.count(), 2);

        scheduler.stop();
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn failed_reloads_leave_the_segment_overdue() {
        let coordination = MemoryCoordination::new();
        let coordinator = coordinator(&coordination).await;
        let job = CountingJob::new();
        job.fail.store(true, Ordering::SeqCst);
        let scheduler = SegmentScheduler::new(
            Arc::clone(&coordinator),
            job.clone(),
            &settings(vec![SegmentSettings::new("t1", 1000)]),
        )
        .await
        .expect("scheduler");

        assert_eq!(scheduler.poll_once(), 1);
        settle().await;
        assert_eq!(scheduler.list_segments()[0].last_refresh, OffsetDateTime::UNIX_EPOCH);

        // Still overdue: the next poll retries without any scheduler-side
        // bookkeeping.
        assert_eq!(scheduler.poll_once(), 1);
        settle().await;
        assert_eq!(job.count(), 2);

        scheduler.stop();
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn force_reload_advances_the_change_token() {
        let coordination = MemoryCoordination::new();
        let coordinator = coordinator(&coordination).await;
        let job = CountingJob::new();
        let scheduler = SegmentScheduler::new(
            Arc::clone(&coordinator),
            job.clone(),
            &settings(vec![SegmentSettings::new("t1", 60_000)]),
        )
        .await
        .expect("scheduler");

        // Load once so the segment is fresh.
        scheduler.poll_once();
        settle().await;
        assert_eq!(scheduler.poll_once(), 0);

        scheduler.force_reload("t1").await.expect("force");
        assert!(coordinator.check_tri_state("t1", RefreshState::NeedsUpdate).expect("check"));
        assert_eq!(scheduler.poll_once(), 1);
        settle().await;
        assert_eq!(job.count(), 2);

        scheduler.stop();
        coordinator.stop().await;
    }

    #[tokio::test]
    async fn force_reload_on_unknown_segment_fails() {
        let coordination = MemoryCoordination::new();
        let coordinator = coordinator(&coordination).await;
        let scheduler = SegmentScheduler::new(
            Arc::clone(&coordinator),
            CountingJob::new(),
            &settings(vec![]),
        )
        .await
        .expect("scheduler");

        assert!(matches!(
            scheduler.force_reload("nope").await,
            Err(CoordinationError::InvalidName { .. })
        ));

        coordinator.stop().await;
    }

    #[tokio::test]
    async fn remote_force_reload_marks_this_instance_overdue() {
        let coordination = MemoryCoordination::new();
        let coordinator_x = coordinator(&coordination).await;
        let coordinator_y = coordinator(&coordination).await;

        let job_x = CountingJob::new();
        let job_y = CountingJob::new();
        let scheduler_x = SegmentScheduler::new(
            Arc::clone(&coordinator_x),
            job_x.clone(),
            &settings(vec![SegmentSettings::new("t1", 60_000)]),
        )
        .await
        .expect("scheduler");
        let scheduler_y = SegmentScheduler::new(
            Arc::clone(&coordinator_y),
            job_y.clone(),
            &settings(vec![SegmentSettings::new("t1", 60_000)]),
        )
        .await
        .expect("scheduler");

        // Both instances load once and go fresh.
        scheduler_x.poll_once();
        scheduler_y.poll_once();
        settle().await;
        assert_eq!(scheduler_x.poll_once(), 0);
        assert_eq!(scheduler_y.poll_once(), 0);

        // X forces a reload; Y hears about it through the counter watch.
        scheduler_x.force_reload("t1").await.expect("force");
        settle().await;

        assert_eq!(
            scheduler_y.list_segments()[0].last_refresh,
            OffsetDateTime::UNIX_EPOCH
        );
        assert_eq!(scheduler_y.poll_once(), 1);
        settle().await;
        assert_eq!(job_y.count(), 2);

        scheduler_x.stop();
        scheduler_y.stop();
        coordinator_x.stop().await;
        coordinator_y.stop().await;
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let coordination = MemoryCoordination::new();
        let coordinator = coordinator(&coordination).await;
        let job = CountingJob::slow(StdDuration::from_millis(100));
        let scheduler = SegmentScheduler::new(
            Arc::clone(&coordinator),
            job.clone(),
            &SchedulerSettings {
                worker_pool_size: 1,
                segments: vec![
                    SegmentSettings::new("t1", 60_000),
                    SegmentSettings::new("t2", 60_000),
                    SegmentSettings::new("t3", 60_000),
                ],
            },
        )
        .await
        .expect("scheduler");

        // All three submit, but only one runs at a time.
        assert_eq!(scheduler.poll_once(), 3);
        tokio::time::sleep(StdDuration::from_millis(120)).await;
        assert!(job.count() <= 2);

        tokio::time::sleep(StdDuration::from_millis(400)).await;
        assert_eq!(job.count(), 3);

        scheduler.stop();
        coordinator.stop().await;
    }
}
