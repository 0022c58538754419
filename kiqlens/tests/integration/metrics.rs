use crate::shared::*;
use deadpool_redis::redis::{self, AsyncCommands};
use kiqlens::{BrokerVersion, Granularity, MetricsPeriod};
use serial_test::serial;
use testresult::TestResult;

async fn rollup(
    redis: &mut deadpool_redis::Connection,
    key: &str,
    class: &str,
    (ms, p, f): (i64, i64, i64),
) -> TestResult {
    let _: () = redis
        .hset_multiple(
            key,
            &[
                (format!("{class}|ms"), ms),
                (format!("{class}|p"), p),
                (format!("{class}|f"), f),
            ],
        )
        .await?;
    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_top_jobs_filter() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:30Z")).await?;
    let mut redis = pool.get().await?;
    rollup(&mut redis, "j|20250102|3:4", "App::FooJob", (1500, 10, 2)).await?;
    rollup(&mut redis, "j|250102|3:04", "App::BarJob", (3000, 20, 5)).await?;
    let _: () = redis.hset("j|250102|3:04", "Broken|p", "NaN").await?;
    drop(redis);

    let top = storage
        .metrics_top_jobs(MetricsPeriod::Minutes(1), Some("app"))
        .await?;
    assert_eq!(top.granularity, Granularity::Minutely);
    assert_eq!(top.jobs.len(), 2);
    let foo = &top.jobs["App::FooJob"];
    assert_eq!((foo.milliseconds, foo.processed, foo.failed), (1500, 10, 2));
    assert_eq!(foo.success(), 8);
    let bar = &top.jobs["App::BarJob"];
    assert_eq!((bar.milliseconds, bar.processed, bar.failed), (3000, 20, 5));

    let sorted: Vec<&str> = top.sorted().into_iter().map(|(class, _)| class).collect();
    assert_eq!(sorted, vec!["App::BarJob", "App::FooJob"]);

    let top = storage
        .metrics_top_jobs(MetricsPeriod::Minutes(1), Some("other"))
        .await?;
    assert!(top.jobs.is_empty());

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_top_jobs_sums_adjacent_minutes() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:30Z")).await?;
    let mut redis = pool.get().await?;
    rollup(&mut redis, "j|250102|3:04", "App::FooJob", (1500, 10, 2)).await?;
    rollup(&mut redis, "j|250102|3:03", "App::FooJob", (500, 5, 1)).await?;
    // outside a two minute window
    rollup(&mut redis, "j|250102|3:02", "App::FooJob", (9000, 90, 9)).await?;
    drop(redis);

    let top = storage.metrics_top_jobs(MetricsPeriod::Minutes(2), None).await?;
    let foo = &top.jobs["App::FooJob"];
    assert_eq!((foo.milliseconds, foo.processed, foo.failed), (2000, 15, 3));
    assert!((foo.avg_seconds() - 2.0 / 12.0).abs() < 1e-9);

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_top_jobs_hourly() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:30Z")).await?;
    let mut redis = pool.get().await?;
    rollup(&mut redis, "j|250102|3:0", "App::FooJob", (100, 1, 0)).await?;
    rollup(&mut redis, "j|250102|2:5", "App::FooJob", (200, 2, 0)).await?;
    // a V7 minute key at a ten-minute boundary is not an hourly rollup
    rollup(&mut redis, "j|20250102|3:0", "App::FooJob", (9000, 90, 0)).await?;
    drop(redis);

    let top = storage.metrics_top_jobs(MetricsPeriod::Hours(1), None).await?;
    assert_eq!(top.granularity, Granularity::Hourly);
    let foo = &top.jobs["App::FooJob"];
    assert_eq!((foo.milliseconds, foo.processed), (300, 3));

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_job_detail_with_histogram() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:30Z")).await?;
    let mut redis = pool.get().await?;
    rollup(&mut redis, "j|250102|3:04", "App::FooJob", (1500, 10, 2)).await?;
    rollup(&mut redis, "j|250102|3:03", "App::FooJob", (500, 5, 1)).await?;
    rollup(&mut redis, "j|250102|3:04", "App::BarJob", (3000, 20, 5)).await?;
    let _: Vec<i64> = redis::cmd("BITFIELD")
        .arg("h|App::FooJob-2-3:4")
        .arg("SET")
        .arg("u16")
        .arg("#0")
        .arg(3)
        .arg("SET")
        .arg("u16")
        .arg("#25")
        .arg(7)
        .query_async(&mut redis)
        .await?;
    drop(redis);
    assert_eq!(storage.broker_version().await, BrokerVersion::V8);

    let detail = storage
        .metrics_job_detail("App::FooJob", MetricsPeriod::Minutes(2))
        .await?;
    assert_eq!(detail.class, "App::FooJob");
    assert_eq!(
        (detail.totals.milliseconds, detail.totals.processed, detail.totals.failed),
        (2000, 15, 3)
    );
    assert_eq!(detail.buckets.len(), 2);

    let current = &detail.buckets["2025-01-02T03:04:00Z"];
    assert_eq!(current.totals.processed, 10);
    let histogram = current.histogram.expect("minutely buckets carry a histogram");
    assert_eq!(histogram.counts()[0], 7);
    assert_eq!(histogram.counts()[25], 3);
    assert_eq!(histogram.total(), 10);

    let previous = &detail.buckets["2025-01-02T03:03:00Z"];
    assert_eq!(previous.totals.processed, 5);
    assert_eq!(previous.histogram.map(|h| h.total()), Some(0));

    let hourly = storage
        .metrics_job_detail("App::FooJob", MetricsPeriod::Hours(1))
        .await?;
    assert_eq!(hourly.buckets.len(), 6);
    assert!(hourly.buckets.values().all(|b| b.histogram.is_none()));

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_job_detail_v7_has_no_hourly_buckets() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:30Z")).await?;
    let mut redis = pool.get().await?;
    rollup(&mut redis, "j|20250102|3:0", "App::FooJob", (900, 9, 0)).await?;
    rollup(&mut redis, "j|20250102|3:4", "App::FooJob", (100, 1, 0)).await?;
    drop(redis);
    assert_eq!(storage.broker_version().await, BrokerVersion::V7);

    let err = storage
        .metrics_job_detail("App::FooJob", MetricsPeriod::Hours(1))
        .await
        .unwrap_err();
    assert!(matches!(err, kiqlens::KiqlensError::InvalidArgument(_)));

    let detail = storage
        .metrics_job_detail("App::FooJob", MetricsPeriod::Minutes(5))
        .await?;
    assert_eq!(detail.totals.processed, 10);

    Ok(())
}
