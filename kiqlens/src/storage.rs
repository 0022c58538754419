use std::future::Future;

use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    broker_version::BrokerVersion,
    error::KiqlensError,
    job_payload::JobPayload,
    metrics::{MetricsJobDetail, MetricsPeriod, MetricsTopJobs},
    process::{BusyData, Process},
    queue::Queue,
    sorted_set::{SortedEntry, SortedSet, SortedSetBounds},
    stats::{RedisInfo, Stats, StatsHistory},
    storage_builder::StorageBuilder,
    storage_internal::StorageInternal,
};

/// Storage is the entry point for reading and administering the broker.
///
/// Every method is a fresh read (or a write) against Redis; nothing is cached
/// except the detected [`BrokerVersion`]. Instances are created with
/// [`Storage::builder()`] and are cheap to clone.
///
/// # Examples
///
/// ```rust,no_run
/// use kiqlens::Storage;
///
/// async fn example() -> Result<(), kiqlens::KiqlensError> {
///     let storage = Storage::builder().from_env()?.build()?;
///
///     let stats = storage.stats().await?;
///     println!("{} busy, {} enqueued", stats.busy, stats.enqueued);
///
///     // Retry everything that is waiting in the retry set
///     let moved = storage.retry_all().await?;
///     println!("{moved} jobs re-enqueued");
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Storage {
    pub(crate) internal: StorageInternal,
    scope: CallScope,
}

/// Cancellation applied to every call made through one handle.
#[derive(Clone, Default)]
struct CallScope {
    cancel: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl Storage {
    pub(crate) fn new(internal: StorageInternal) -> Self {
        Self {
            internal,
            scope: CallScope::default(),
        }
    }

    /// Creates a new [`StorageBuilder`] for configuring and building a Storage instance.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use kiqlens::Storage;
    ///
    /// # fn example() -> Result<(), kiqlens::KiqlensError> {
    /// let storage = Storage::builder().url("redis://localhost:6379/0").build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn builder() -> StorageBuilder {
        StorageBuilder::new()
    }

    /// Returns a handle whose calls fail with [`KiqlensError::Cancelled`]
    /// as soon as `token` is cancelled.
    ///
    /// The handle shares the pool, version cache and clock with `self`.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        let mut storage = self.clone();
        storage.scope.cancel = Some(token);
        storage
    }

    /// Returns a handle whose calls fail with [`KiqlensError::DeadlineExceeded`]
    /// once `deadline` passes.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut storage = self.clone();
        storage.scope.deadline = Some(deadline);
        storage
    }

    /// Shorthand for [`Storage::with_deadline`] `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The broker URL with its password removed.
    pub fn display_url(&self) -> &str {
        self.internal.display_url()
    }

    /// Closes the connection pool. Later calls fail with a pool error.
    pub fn close(&self) {
        self.internal.close();
    }

    async fn guard<T, F>(&self, fut: F) -> Result<T, KiqlensError>
    where
        F: Future<Output = Result<T, KiqlensError>>,
    {
        let cancelled = async {
            match &self.scope.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        let deadline = async {
            match self.scope.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            () = cancelled => Err(KiqlensError::Cancelled),
            () = deadline => Err(KiqlensError::DeadlineExceeded),
            result = fut => result,
        }
    }

    /// Returns the broker's schema version.
    ///
    /// The first successful detection is cached for the lifetime of the
    /// storage; until rollup keys exist this keeps returning
    /// [`BrokerVersion::Unknown`].
    pub async fn broker_version(&self) -> BrokerVersion {
        self.guard(async { Ok(self.internal.detect_version().await) })
            .await
            .unwrap_or_default()
    }

    /// Returns the metrics period keys the broker can serve, e.g. `"1h"`.
    ///
    /// V7 brokers only keep minutely rollups so their list stops at `"8h"`.
    pub async fn metrics_periods(&self) -> &'static [&'static str] {
        self.broker_version().await.metrics_periods()
    }

    /// Returns the dashboard counters, read in a single round trip.
    ///
    /// # Returns
    ///
    /// The [`Stats`], or a [`KiqlensError`] if the broker cannot be reached.
    pub async fn stats(&self) -> Result<Stats, KiqlensError> {
        self.guard(self.internal.stats()).await
    }

    /// Returns a few fields of the broker's `INFO` output.
    pub async fn redis_info(&self) -> Result<RedisInfo, KiqlensError> {
        self.guard(self.internal.redis_info()).await
    }

    /// Returns processed and failed counts for the last `days` days
    /// (at least one), oldest first.
    ///
    /// # Arguments
    ///
    /// * `days` - Number of days to read, today included
    ///
    /// # Returns
    ///
    /// A [`StatsHistory`] with zeros for days that have no counters,
    /// or a [`KiqlensError`] if the operation fails.
    pub async fn stats_history(&self, days: usize) -> Result<StatsHistory, KiqlensError> {
        self.guard(self.internal.stats_history(days)).await
    }

    /// Returns all known queues sorted by name.
    pub async fn queues(&self) -> Result<Vec<Queue>, KiqlensError> {
        let names = self.guard(self.internal.queues()).await?;
        Ok(names
            .into_iter()
            .map(|name| Queue::new(name, self.clone()))
            .collect())
    }

    /// Returns a handle for the queue called `name`, whether or not it exists.
    pub fn queue(&self, name: impl Into<String>) -> Queue {
        Queue::new(name, self.clone())
    }

    /// Returns the number of jobs waiting in `queue`.
    pub async fn queue_size(&self, queue: &str) -> Result<usize, KiqlensError> {
        self.guard(self.internal.queue_size(queue)).await
    }

    /// Returns the age in seconds of the oldest job waiting in `queue`.
    ///
    /// # Returns
    ///
    /// `0.0` for an empty queue or an unreadable tail job, otherwise a
    /// non-negative number of seconds, or a [`KiqlensError`] if the operation fails.
    pub async fn queue_latency(&self, queue: &str) -> Result<f64, KiqlensError> {
        self.guard(self.internal.queue_latency(queue)).await
    }

    /// Returns a page of jobs from `queue`, newest first, and the queue size.
    ///
    /// # Arguments
    ///
    /// * `queue` - The queue name
    /// * `start` - Number of jobs to skip from the head
    /// * `count` - Maximum number of jobs to return
    pub async fn queue_jobs(
        &self,
        queue: &str,
        start: usize,
        count: usize,
    ) -> Result<(Vec<JobPayload>, usize), KiqlensError> {
        self.guard(self.internal.queue_jobs(queue, start, count))
            .await
    }

    /// Returns the identities of all registered processes, sorted.
    pub async fn processes(&self) -> Result<Vec<String>, KiqlensError> {
        self.guard(self.internal.processes()).await
    }

    /// Reads one process's hash.
    ///
    /// # Returns
    ///
    /// The [`Process`]; check [`Process::is_valid`] before listing it.
    /// [`KiqlensError::NotFound`] when the process hash has expired.
    pub async fn process(&self, identity: &str) -> Result<Process, KiqlensError> {
        self.guard(self.internal.refresh_process(identity)).await
    }

    /// Returns every valid process and the jobs they are running, oldest
    /// first.
    ///
    /// # Arguments
    ///
    /// * `filter` - When set, only jobs whose raw work entry contains it are kept
    pub async fn busy_data(&self, filter: Option<&str>) -> Result<BusyData, KiqlensError> {
        self.guard(self.internal.busy_data(filter)).await
    }

    /// Returns a page of a sorted set and the set's size.
    ///
    /// # Arguments
    ///
    /// * `set` - The set to read
    /// * `start` - Number of entries to skip
    /// * `count` - Maximum number of entries, `0` or less reads to the end
    /// * `reverse` - Newest first when `true`
    pub async fn sorted_range(
        &self,
        set: SortedSet,
        start: usize,
        count: isize,
        reverse: bool,
    ) -> Result<(Vec<SortedEntry>, usize), KiqlensError> {
        self.guard(self.internal.sorted_range(set, start, count, reverse))
            .await
    }

    /// Returns every entry of `set` matching `pattern`, ordered by score.
    ///
    /// A pattern without `*` matches anywhere in the payload.
    pub async fn sorted_scan(
        &self,
        set: SortedSet,
        pattern: &str,
        reverse: bool,
    ) -> Result<Vec<SortedEntry>, KiqlensError> {
        self.guard(self.internal.sorted_scan(set, pattern, reverse))
            .await
    }

    /// Returns the lowest and highest scored entries, `None` for an empty set.
    pub async fn sorted_bounds(
        &self,
        set: SortedSet,
    ) -> Result<Option<SortedSetBounds>, KiqlensError> {
        self.guard(self.internal.sorted_bounds(set)).await
    }

    /// Removes `entry` from `set`.
    ///
    /// # Returns
    ///
    /// [`KiqlensError::NotFound`] when the entry was no longer in the set.
    pub async fn delete(&self, set: SortedSet, entry: &SortedEntry) -> Result<(), KiqlensError> {
        self.guard(self.internal.delete(set, entry)).await
    }

    /// Moves a retrying job to the dead set.
    pub async fn kill(&self, entry: &SortedEntry) -> Result<(), KiqlensError> {
        self.guard(self.internal.kill(entry)).await
    }

    /// Pushes `entry` onto its queue right away.
    ///
    /// The payload keeps its timestamp format; `at` is dropped and
    /// `enqueued_at` is set to now.
    ///
    /// # Arguments
    ///
    /// * `set` - The set the entry is removed from
    /// * `entry` - The entry as read from the set
    /// * `decrement_retry_count` - Lowers `retry_count` by one, as a retry does
    ///
    /// # Returns
    ///
    /// [`KiqlensError::Malformed`] for a payload without a queue,
    /// [`KiqlensError::NotFound`] when the entry was no longer in the set.
    pub async fn move_to_queue(
        &self,
        set: SortedSet,
        entry: &SortedEntry,
        decrement_retry_count: bool,
    ) -> Result<(), KiqlensError> {
        self.guard(
            self.internal
                .move_to_queue(set, entry, decrement_retry_count),
        )
        .await
    }

    /// Drains `set` onto the queues, returning how many jobs were moved.
    pub async fn bulk_move_to_queue(
        &self,
        set: SortedSet,
        decrement_retry_count: bool,
    ) -> Result<usize, KiqlensError> {
        self.guard(self.internal.bulk_move_to_queue(set, decrement_retry_count))
            .await
    }

    /// Moves every retrying job to the dead set.
    pub async fn bulk_kill(&self) -> Result<usize, KiqlensError> {
        self.guard(self.internal.bulk_kill()).await
    }

    /// Deletes `set` entirely, returning how many jobs it held.
    pub async fn bulk_delete(&self, set: SortedSet) -> Result<usize, KiqlensError> {
        self.guard(self.internal.bulk_delete(set)).await
    }

    /// Retries every job in the retry set now.
    pub async fn retry_all(&self) -> Result<usize, KiqlensError> {
        self.bulk_move_to_queue(SortedSet::Retry, true).await
    }

    /// Kills every job in the retry set.
    pub async fn kill_all(&self) -> Result<usize, KiqlensError> {
        self.bulk_kill().await
    }

    /// Deletes every job in `set`.
    pub async fn delete_all(&self, set: SortedSet) -> Result<usize, KiqlensError> {
        self.bulk_delete(set).await
    }

    /// Returns per-class execution totals over `period`.
    ///
    /// # Arguments
    ///
    /// * `period` - How far back to read
    /// * `filter` - Case-insensitive substring a class must contain
    pub async fn metrics_top_jobs(
        &self,
        period: MetricsPeriod,
        filter: Option<&str>,
    ) -> Result<MetricsTopJobs, KiqlensError> {
        self.guard(self.internal.metrics_top_jobs(period, filter))
            .await
    }

    /// Returns one class's metrics bucket by bucket over `period`.
    pub async fn metrics_job_detail(
        &self,
        class: &str,
        period: MetricsPeriod,
    ) -> Result<MetricsJobDetail, KiqlensError> {
        self.guard(self.internal.metrics_job_detail(class, period))
            .await
    }
}
