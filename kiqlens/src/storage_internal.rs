use chrono::{Days, NaiveDate};
use deadpool_redis::redis::{self, AsyncCommands};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, OnceLock},
    time::Duration,
};

use crate::{
    KiqlensError,
    broker_version::{BrokerVersion, VersionCache, classify_rollup_key, merge_detected},
    clock::Clock,
    job_payload::JobPayload,
    metrics::{
        BucketPlan, Granularity, HISTOGRAM_BUCKETS, MetricsBucket, MetricsHistogram,
        MetricsJobDetail, MetricsJobTotals, MetricsPeriod, MetricsTopJobs, aggregate_rollups,
        bucket_label, totals_from_fields,
    },
    process::{ActiveJob, BusyData, Process, parse_identity},
    queue::{number_jobs, tail_latency},
    sorted_set::{
        BULK_BATCH_SIZE, SortedEntry, SortedSet, SortedSetBounds, ensure_payload, now_score,
        range_bounds, requeue_payload, scan_pattern, sort_by_score,
    },
    stats::{RedisInfo, Stats, StatsHistory},
    storage_keys::StorageKeys,
};

const VERSION_SCAN_COUNT: usize = 1_000;
const VERSION_SCAN_MAX_STEPS: usize = 50;
const SORTED_SCAN_COUNT: usize = 100;

/// Fields read from every process hash, in reply order.
const PROCESS_FIELDS: [&str; 6] = ["info", "busy", "beat", "quiet", "rss", "rtt_us"];

/// KEYS: processed, failed, retry, schedule, dead, processes, queues.
/// ARGV: queue key prefix including the trailing `:`.
const STATS_SCRIPT: &str = r"
local function count(key)
  local value = redis.call('GET', key)
  return tonumber(value or '0') or 0
end

local busy = 0
for _, identity in ipairs(redis.call('SMEMBERS', KEYS[6])) do
  local ok, value = pcall(redis.call, 'HGET', identity, 'busy')
  if ok and value then
    busy = busy + (tonumber(value) or 0)
  end
end

local enqueued = 0
for _, queue in ipairs(redis.call('SMEMBERS', KEYS[7])) do
  local ok, len = pcall(redis.call, 'LLEN', ARGV[1] .. queue)
  if ok and type(len) == 'number' then
    enqueued = enqueued + len
  end
end

return {
  count(KEYS[1]),
  count(KEYS[2]),
  busy,
  enqueued,
  redis.call('ZCARD', KEYS[3]),
  redis.call('ZCARD', KEYS[4]),
  redis.call('ZCARD', KEYS[5]),
}
";

#[derive(Clone)]
pub(crate) struct StorageInternal {
    pub(crate) pool: deadpool_redis::Pool,
    keys: StorageKeys,
    version: VersionCache,
    clock: Clock,
    display_url: String,
    response_timeout: Option<Duration>,
    stats_script_sha: Arc<OnceLock<String>>,
}

impl StorageInternal {
    pub fn new(
        pool: deadpool_redis::Pool,
        clock: Clock,
        display_url: String,
        response_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            keys: StorageKeys::new(),
            version: VersionCache::default(),
            clock,
            display_url,
            response_timeout,
            stats_script_sha: Arc::new(OnceLock::new()),
        }
    }

    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    pub fn close(&self) {
        self.pool.close();
    }

    /// A pooled connection whose commands fail once the broker has not
    /// answered within the response timeout.
    pub async fn connection(&self) -> Result<deadpool_redis::Connection, KiqlensError> {
        let mut redis = self.pool.get().await.map_err(KiqlensError::Pool)?;
        if let Some(timeout) = self.response_timeout {
            redis.set_response_timeout(timeout);
        }
        Ok(redis)
    }

    /// The cached broker version, scanning for rollup keys until one is found.
    ///
    /// Scan failures and an empty keyspace yield `Unknown` and leave the
    /// cache untouched so the next call tries again.
    pub async fn detect_version(&self) -> BrokerVersion {
        let cached = self.version.get();
        if cached != BrokerVersion::Unknown {
            return cached;
        }

        match self.scan_version().await {
            Ok(detected) => {
                let version = self.version.store(detected);
                tracing::debug!(?version, "Detected broker version");
                version
            }
            Err(e) => {
                tracing::warn!("Broker version detection failed: {e}");
                BrokerVersion::Unknown
            }
        }
    }

    async fn scan_version(&self) -> Result<BrokerVersion, KiqlensError> {
        let mut redis = self.connection().await?;
        let mut detected = BrokerVersion::Unknown;
        let mut cursor: u64 = 0;

        for _ in 0..VERSION_SCAN_MAX_STEPS {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg("j|*")
                .arg("COUNT")
                .arg(VERSION_SCAN_COUNT);
            let (new_cursor, keys): (u64, Vec<String>) = cmd.query_async(&mut redis).await?;

            for key in keys {
                if let Some(seen) = classify_rollup_key(&key) {
                    detected = merge_detected(detected, seen);
                }
            }

            cursor = new_cursor;

            if cursor == 0 || detected == BrokerVersion::V8 {
                break;
            }
        }

        Ok(detected)
    }

    pub async fn stats(&self) -> Result<Stats, KiqlensError> {
        let mut redis = self.connection().await?;
        let reply = self.run_stats_script(&mut redis).await?;
        Ok(Stats::from_script_reply(&reply))
    }

    /// Runs the stats script by digest, sending the source again when the
    /// broker's script cache was flushed.
    async fn run_stats_script(
        &self,
        redis: &mut deadpool_redis::Connection,
    ) -> Result<Vec<i64>, KiqlensError> {
        let sha = match self.stats_script_sha.get() {
            Some(sha) => sha.clone(),
            None => {
                let sha: String = redis::cmd("SCRIPT")
                    .arg("LOAD")
                    .arg(STATS_SCRIPT)
                    .query_async(&mut *redis)
                    .await?;
                self.stats_script_sha.get_or_init(|| sha).clone()
            }
        };

        let keys = [
            &self.keys.processed,
            &self.keys.failed,
            &self.keys.retry,
            &self.keys.schedule,
            &self.keys.dead,
            &self.keys.processes,
            &self.keys.queues,
        ];
        let queue_prefix = format!("{}:", self.keys.queue_prefix);

        let mut evalsha = redis::cmd("EVALSHA");
        evalsha
            .arg(&sha)
            .arg(keys.len())
            .arg(keys.as_slice())
            .arg(&queue_prefix);
        match evalsha.query_async(&mut *redis).await {
            Ok(reply) => Ok(reply),
            Err(e) if e.kind() == redis::ErrorKind::NoScriptError => {
                tracing::debug!("Stats script missing from broker cache, sending source");
                let mut eval = redis::cmd("EVAL");
                eval.arg(STATS_SCRIPT)
                    .arg(keys.len())
                    .arg(keys.as_slice())
                    .arg(&queue_prefix);
                Ok(eval.query_async(&mut *redis).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn redis_info(&self) -> Result<RedisInfo, KiqlensError> {
        let mut redis = self.connection().await?;
        let info: String = redis::cmd("INFO").query_async(&mut redis).await?;
        Ok(RedisInfo::from_info(&info))
    }

    pub async fn stats_history(&self, days: usize) -> Result<StatsHistory, KiqlensError> {
        let today = self.clock.now().date_naive();
        let dates: Vec<NaiveDate> = (0..days.max(1))
            .filter_map(|i| today.checked_sub_days(Days::new(i as u64)))
            .collect();
        let keys: Vec<String> = dates
            .iter()
            .flat_map(|date| [self.keys.processed_on(*date), self.keys.failed_on(*date)])
            .collect();

        let mut redis = self.connection().await?;
        let reply: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut redis)
            .await?;

        Ok(StatsHistory::from_reply(&dates, &reply))
    }

    pub async fn queues(&self) -> Result<Vec<String>, KiqlensError> {
        let mut redis = self.connection().await?;
        let mut names: Vec<String> = redis.smembers(&self.keys.queues).await?;
        names.sort();
        names.dedup();
        Ok(names)
    }

    pub async fn queue_size(&self, queue: &str) -> Result<usize, KiqlensError> {
        let mut redis = self.connection().await?;
        let size: usize = redis.llen(self.keys.queue(queue)).await?;
        Ok(size)
    }

    pub async fn queue_latency(&self, queue: &str) -> Result<f64, KiqlensError> {
        let mut redis = self.connection().await?;
        let tail: Option<String> = redis.lindex(self.keys.queue(queue), -1).await?;
        Ok(tail_latency(tail.as_deref(), self.clock.now()))
    }

    pub async fn queue_jobs(
        &self,
        queue: &str,
        start: usize,
        count: usize,
    ) -> Result<(Vec<JobPayload>, usize), KiqlensError> {
        let key = self.keys.queue(queue);
        let mut redis = self.connection().await?;

        if count == 0 {
            let size: usize = redis.llen(&key).await?;
            return Ok((vec![], size));
        }

        let (start_index, stop_index) =
            range_bounds(start, isize::try_from(count).unwrap_or(isize::MAX));
        let (size, raws): (usize, Vec<String>) = redis::pipe()
            .llen(&key)
            .lrange(&key, start_index, stop_index)
            .query_async(&mut redis)
            .await?;

        Ok((number_jobs(raws, queue, start, size), size))
    }

    pub async fn processes(&self) -> Result<Vec<String>, KiqlensError> {
        let mut redis = self.connection().await?;
        let mut identities: Vec<String> = redis.smembers(&self.keys.processes).await?;
        identities.sort();
        identities.dedup();
        Ok(identities)
    }

    /// Reads the process hash in one round trip. A missing hash is `NotFound`.
    pub async fn refresh_process(&self, identity: &str) -> Result<Process, KiqlensError> {
        let mut redis = self.connection().await?;
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(identity)
            .arg(PROCESS_FIELDS.as_slice())
            .query_async(&mut redis)
            .await?;

        if fields.iter().all(Option::is_none) {
            return Err(KiqlensError::NotFound(format!("process {identity}")));
        }

        let mut process = Process::new(identity);
        process.apply_fields(&fields);
        Ok(process)
    }

    /// Live processes and their running jobs. Entries whose inner JSON does
    /// not contain `filter` are dropped.
    pub async fn busy_data(&self, filter: Option<&str>) -> Result<BusyData, KiqlensError> {
        let filter = filter.filter(|f| !f.is_empty());
        let mut data = BusyData::default();

        for identity in self.processes().await? {
            if parse_identity(&identity).is_none() {
                tracing::warn!(identity, "Skipping process with unparseable identity");
                continue;
            }

            let process = match self.refresh_process(&identity).await {
                Ok(process) if process.is_valid() => process,
                Ok(_) => {
                    tracing::debug!(identity, "Skipping process without queues");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(identity, "Skipping process: {e}");
                    continue;
                }
            };

            let work: HashMap<String, String> = {
                let mut redis = self.connection().await?;
                match redis.hgetall(self.keys.work(&identity)).await {
                    Ok(work) => work,
                    Err(e) => {
                        tracing::warn!(identity, "Skipping work of process: {e}");
                        HashMap::new()
                    }
                }
            };

            for (thread_id, raw) in work {
                if let Some(filter) = filter
                    && !raw.contains(filter)
                {
                    continue;
                }
                match ActiveJob::decode(&identity, &thread_id, &raw) {
                    Some(job) => data.jobs.push(job),
                    None => tracing::warn!(identity, thread_id, "Skipping unreadable work entry"),
                }
            }

            data.processes.push(process);
        }

        data.jobs.sort_by(|a, b| {
            (a.run_at.is_none(), a.run_at, &a.process, &a.thread_id).cmp(&(
                b.run_at.is_none(),
                b.run_at,
                &b.process,
                &b.thread_id,
            ))
        });

        Ok(data)
    }

    pub async fn sorted_range(
        &self,
        set: SortedSet,
        start: usize,
        count: isize,
        reverse: bool,
    ) -> Result<(Vec<SortedEntry>, usize), KiqlensError> {
        let (start, stop) = range_bounds(start, count);
        let mut redis = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.zcard(set.key());
        if reverse {
            pipe.zrevrange_withscores(set.key(), start, stop);
        } else {
            pipe.zrange_withscores(set.key(), start, stop);
        }
        let (size, members): (usize, Vec<(String, f64)>) = pipe.query_async(&mut redis).await?;

        let entries = members
            .into_iter()
            .map(|(member, score)| SortedEntry::from_member(member, score))
            .collect();

        Ok((entries, size))
    }

    pub async fn sorted_scan(
        &self,
        set: SortedSet,
        pattern: &str,
        reverse: bool,
    ) -> Result<Vec<SortedEntry>, KiqlensError> {
        let pattern = scan_pattern(pattern);
        let mut redis = self.connection().await?;
        let mut seen = HashSet::new();
        let mut entries = vec![];
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("ZSCAN");
            cmd.arg(set.key())
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SORTED_SCAN_COUNT);
            let (new_cursor, items): (u64, Vec<String>) = cmd.query_async(&mut redis).await?;

            let mut iter = items.into_iter();
            while let (Some(member), Some(score)) = (iter.next(), iter.next()) {
                let Ok(score) = score.parse::<f64>() else {
                    continue;
                };
                if seen.insert(member.clone()) {
                    entries.push(SortedEntry::from_member(member, score));
                }
            }

            cursor = new_cursor;

            if cursor == 0 {
                break;
            }
        }

        sort_by_score(&mut entries, reverse);
        Ok(entries)
    }

    pub async fn sorted_bounds(
        &self,
        set: SortedSet,
    ) -> Result<Option<SortedSetBounds>, KiqlensError> {
        let mut redis = self.connection().await?;
        let (first, last): (Vec<(String, f64)>, Vec<(String, f64)>) = redis::pipe()
            .zrange_withscores(set.key(), 0, 0)
            .zrevrange_withscores(set.key(), 0, 0)
            .query_async(&mut redis)
            .await?;

        match (first.into_iter().next(), last.into_iter().next()) {
            (Some((first, first_score)), Some((last, last_score))) => Ok(Some(SortedSetBounds {
                first: SortedEntry::from_member(first, first_score),
                last: SortedEntry::from_member(last, last_score),
            })),
            _ => Ok(None),
        }
    }

    pub async fn delete(&self, set: SortedSet, entry: &SortedEntry) -> Result<(), KiqlensError> {
        ensure_payload(entry)?;
        let mut redis = self.connection().await?;
        let removed: usize = redis.zrem(set.key(), entry.payload.raw()).await?;

        if removed == 0 {
            return Err(KiqlensError::NotFound(format!("job in {set} set")));
        }

        tracing::info!(set = set.key(), jid = entry.payload.jid(), "Deleted job");
        Ok(())
    }

    /// Moves a retrying job to the dead set, scored now.
    pub async fn kill(&self, entry: &SortedEntry) -> Result<(), KiqlensError> {
        ensure_payload(entry)?;
        let score = now_score(self.clock.now());
        let mut redis = self.connection().await?;

        let (removed, _): (usize, usize) = redis::pipe()
            .atomic()
            .zrem(&self.keys.retry, entry.payload.raw())
            .zadd(&self.keys.dead, entry.payload.raw(), score)
            .query_async(&mut redis)
            .await?;

        if removed == 0 {
            tracing::warn!(jid = entry.payload.jid(), "Killed job was no longer retrying");
        }
        tracing::info!(jid = entry.payload.jid(), "Killed job");
        Ok(())
    }

    /// Pushes a sorted-set job back onto its queue with fresh timestamps.
    pub async fn move_to_queue(
        &self,
        set: SortedSet,
        entry: &SortedEntry,
        decrement_retry_count: bool,
    ) -> Result<(), KiqlensError> {
        ensure_payload(entry)?;
        let version = self.detect_version().await;
        let requeue = requeue_payload(
            entry.payload.raw(),
            version,
            self.clock.now(),
            decrement_retry_count,
        )?;

        let mut redis = self.connection().await?;
        let removed: usize = redis.zrem(set.key(), entry.payload.raw()).await?;
        if removed == 0 {
            return Err(KiqlensError::NotFound(format!("job in {set} set")));
        }

        let _: () = redis::pipe()
            .sadd(&self.keys.queues, &requeue.queue)
            .ignore()
            .lpush(self.keys.queue(&requeue.queue), &requeue.payload)
            .ignore()
            .query_async(&mut redis)
            .await?;

        tracing::info!(
            set = set.key(),
            queue = requeue.queue,
            jid = entry.payload.jid(),
            "Moved job to queue"
        );
        Ok(())
    }

    /// Drains a sorted set onto the queues.
    ///
    /// Entries that cannot be rewritten are parked in a holding set in the
    /// same round trip as their batch, and merged back into the origin set
    /// with their original score when the drain ends, whether it succeeded
    /// or not. A drain that never reached the merge (a dropped future) is
    /// merged back by the next bulk move of the same set.
    pub async fn bulk_move_to_queue(
        &self,
        set: SortedSet,
        decrement_retry_count: bool,
    ) -> Result<usize, KiqlensError> {
        let version = self.detect_version().await;
        let now = self.clock.now();
        let held = self.keys.held(set.key());
        let mut redis = self.connection().await?;

        restore_held(&mut redis, set, &held).await?;

        let drained = self
            .drain_to_queues(&mut redis, set, &held, version, now, decrement_retry_count)
            .await;
        let restored = restore_held(&mut redis, set, &held).await;

        match (drained, restored) {
            (Ok((moved, kept)), Ok(())) => {
                tracing::info!(set = set.key(), moved, kept, "Moved jobs to queues");
                Ok(moved)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), restored) => {
                if let Err(restore_err) = restored {
                    tracing::error!(
                        set = set.key(),
                        held,
                        "Jobs that cannot be moved are still parked: {restore_err}"
                    );
                }
                Err(e)
            }
        }
    }

    async fn drain_to_queues(
        &self,
        redis: &mut deadpool_redis::Connection,
        set: SortedSet,
        held: &str,
        version: BrokerVersion,
        now: chrono::DateTime<chrono::Utc>,
        decrement_retry_count: bool,
    ) -> Result<(usize, usize), KiqlensError> {
        let mut moved = 0;
        let mut kept = 0;

        loop {
            let batch: Vec<(String, f64)> =
                redis.zpopmin(set.key(), BULK_BATCH_SIZE as isize).await?;
            if batch.is_empty() {
                break;
            }

            let mut pipe = redis::pipe();
            let mut queued = 0;
            for (raw, score) in batch {
                match requeue_payload(&raw, version, now, decrement_retry_count) {
                    Ok(requeue) => {
                        pipe.sadd(&self.keys.queues, &requeue.queue)
                            .ignore()
                            .lpush(self.keys.queue(&requeue.queue), requeue.payload)
                            .ignore();
                        queued += 1;
                    }
                    Err(e) => {
                        tracing::warn!(set = set.key(), "Keeping job that cannot be moved: {e}");
                        pipe.zadd(held, raw, score).ignore();
                        kept += 1;
                    }
                }
            }

            let _: () = pipe.query_async(&mut *redis).await?;
            moved += queued;
        }

        Ok((moved, kept))
    }

    /// Drains the retry set into the dead set, scored now.
    pub async fn bulk_kill(&self) -> Result<usize, KiqlensError> {
        let score = now_score(self.clock.now());
        let mut redis = self.connection().await?;
        let mut killed = 0;

        loop {
            let batch: Vec<(String, f64)> =
                redis.zpopmin(&self.keys.retry, BULK_BATCH_SIZE as isize).await?;
            if batch.is_empty() {
                break;
            }

            let mut pipe = redis::pipe();
            for (raw, _) in &batch {
                pipe.zadd(&self.keys.dead, raw, score).ignore();
            }
            let _: () = pipe.query_async(&mut redis).await?;
            killed += batch.len();
        }

        tracing::info!(killed, "Killed retrying jobs");
        Ok(killed)
    }

    pub async fn bulk_delete(&self, set: SortedSet) -> Result<usize, KiqlensError> {
        let mut redis = self.connection().await?;
        let (size, _): (usize, usize) = redis::pipe()
            .atomic()
            .zcard(set.key())
            .unlink(set.key())
            .query_async(&mut redis)
            .await?;

        tracing::info!(set = set.key(), deleted = size, "Deleted all jobs");
        Ok(size)
    }

    /// Per-class totals over a period, reading both rollup key shapes.
    pub async fn metrics_top_jobs(
        &self,
        period: MetricsPeriod,
        filter: Option<&str>,
    ) -> Result<MetricsTopJobs, KiqlensError> {
        let plan = BucketPlan::new(period, self.clock.now());

        let mut seen = HashSet::new();
        let mut keys = vec![];
        for at in &plan.times {
            for version in rollup_versions(plan.granularity) {
                let key = self.keys.rollup(*version, *at, plan.granularity);
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }

        let mut redis = self.connection().await?;
        let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut redis).await?;

        tracing::debug!(buckets = plan.times.len(), keys = keys.len(), "Read metrics rollups");

        Ok(MetricsTopJobs {
            granularity: plan.granularity,
            starts_at: plan.starts_at,
            ends_at: plan.ends_at,
            jobs: aggregate_rollups(hashes, filter),
        })
    }

    /// One class's totals per bucket, with execution histograms for
    /// minutely buckets.
    pub async fn metrics_job_detail(
        &self,
        class: &str,
        period: MetricsPeriod,
    ) -> Result<MetricsJobDetail, KiqlensError> {
        let version = match self.detect_version().await {
            BrokerVersion::Unknown => BrokerVersion::V8,
            version => version,
        };
        let plan = BucketPlan::new(period, self.clock.now());
        if version == BrokerVersion::V7 && plan.granularity == Granularity::Hourly {
            return Err(KiqlensError::InvalidArgument(format!(
                "V7 brokers keep no ten-minute rollups, period {} is not available",
                period.key()
            )));
        }
        let with_histogram = plan.granularity == Granularity::Minutely;
        let fields = [
            format!("{class}|ms"),
            format!("{class}|p"),
            format!("{class}|f"),
        ];

        let mut pipe = redis::pipe();
        for at in &plan.times {
            pipe.cmd("HMGET")
                .arg(self.keys.rollup(version, *at, plan.granularity))
                .arg(fields.as_slice());
            if with_histogram {
                pipe.cmd("BITFIELD_RO")
                    .arg(self.keys.histogram(version, class, *at));
                for bucket in 0..HISTOGRAM_BUCKETS {
                    pipe.arg("GET").arg("u16").arg(format!("#{bucket}"));
                }
            }
        }

        let mut redis = self.connection().await?;
        let values: Vec<redis::Value> = pipe.query_async(&mut redis).await?;
        let mut values = values.into_iter();

        let mut totals = MetricsJobTotals::default();
        let mut buckets = BTreeMap::new();
        for at in &plan.times {
            let bucket_totals = match values.next() {
                Some(value) => {
                    let fields: Vec<Option<String>> = redis::from_redis_value(&value)?;
                    totals_from_fields(&fields)
                }
                None => MetricsJobTotals::default(),
            };
            let histogram = match (with_histogram, values.next()) {
                (true, Some(value)) => {
                    let counters: Vec<Option<i64>> = redis::from_redis_value(&value)?;
                    Some(MetricsHistogram::from_broker(&counters))
                }
                _ => None,
            };

            totals.merge(&bucket_totals);
            buckets.insert(
                bucket_label(*at, plan.granularity),
                MetricsBucket {
                    totals: bucket_totals,
                    histogram,
                },
            );
        }

        Ok(MetricsJobDetail {
            class: class.to_string(),
            granularity: plan.granularity,
            starts_at: plan.starts_at,
            ends_at: plan.ends_at,
            totals,
            buckets,
        })
    }
}

/// Merges entries parked by an earlier drain back into `set`, keeping the
/// lower score when a member is in both.
async fn restore_held(
    redis: &mut deadpool_redis::Connection,
    set: SortedSet,
    held: &str,
) -> Result<(), KiqlensError> {
    let (parked, _, _): (usize, usize, usize) = redis::pipe()
        .atomic()
        .zcard(held)
        .zunionstore_min(set.key(), &[set.key(), held])
        .unlink(held)
        .query_async(&mut *redis)
        .await?;
    if parked > 0 {
        tracing::debug!(set = set.key(), parked, "Merged parked jobs back");
    }
    Ok(())
}

/// Key shapes to read per bucket. V7 never wrote ten-minute rollups.
fn rollup_versions(granularity: Granularity) -> &'static [BrokerVersion] {
    match granularity {
        Granularity::Minutely => &[BrokerVersion::V7, BrokerVersion::V8],
        Granularity::Hourly => &[BrokerVersion::V8],
    }
}
