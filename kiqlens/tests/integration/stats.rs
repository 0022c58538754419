use crate::shared::*;
use chrono::NaiveDate;
use deadpool_redis::redis::AsyncCommands;
use serial_test::serial;
use testresult::TestResult;

#[tokio::test]
#[serial]
pub async fn test_stats() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:05Z")).await?;
    let mut redis = pool.get().await?;

    let _: () = redis.set("stat:processed", 1234).await?;
    let _: () = redis.set("stat:failed", 56).await?;
    for (set, size) in [("retry", 3), ("schedule", 2), ("dead", 1)] {
        for i in 0..size {
            let _: () = redis.zadd(set, format!("{{\"jid\":\"{set}-{i}\"}}"), i).await?;
        }
    }
    for (identity, busy) in [("host:1:p1", 4), ("host:2:p2", 7)] {
        let _: () = redis.sadd("processes", identity).await?;
        let _: () = redis.hset(identity, "busy", busy).await?;
    }
    // stale reference without a hash
    let _: () = redis.sadd("processes", "host:3:gone").await?;
    for (queue, len) in [("default", 3), ("critical", 2), ("low", 1)] {
        let _: () = redis.sadd("queues", queue).await?;
        for i in 0..len {
            let _: () = redis.lpush(format!("queue:{queue}"), format!("{{\"jid\":\"{i}\"}}")).await?;
        }
    }
    let _: () = redis.sadd("queues", "empty").await?;
    drop(redis);

    let stats = storage.stats().await?;

    assert_eq!(
        stats,
        kiqlens::Stats {
            processed: 1234,
            failed: 56,
            busy: 11,
            enqueued: 6,
            retries: 3,
            scheduled: 2,
            dead: 1,
        }
    );

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_stats_on_empty_broker() -> TestResult {
    let (_pool, storage) = fresh_storage(at("2025-01-02T03:04:05Z")).await?;

    assert_eq!(storage.stats().await?, kiqlens::Stats::default());

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_stats_history() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-03T23:59:00Z")).await?;
    let mut redis = pool.get().await?;
    let _: () = redis.set("stat:processed:2025-01-03", 30).await?;
    let _: () = redis.set("stat:failed:2025-01-03", 3).await?;
    let _: () = redis.set("stat:processed:2025-01-01", 10).await?;
    let _: () = redis.set("stat:failed:2025-01-01", "garbage").await?;
    drop(redis);

    let history = storage.stats_history(3).await?;
    assert_eq!(
        history.dates,
        vec![
            NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2025, 1, 3).unwrap(),
        ]
    );
    assert_eq!(history.processed, vec![10, 0, 30]);
    assert_eq!(history.failed, vec![0, 0, 3]);

    let history = storage.stats_history(0).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history.processed, vec![30]);

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_redis_info() -> TestResult {
    let (_pool, storage) = fresh_storage(at("2025-01-02T03:04:05Z")).await?;

    let info = storage.redis_info().await?;
    assert!(!info.version.is_empty());
    assert!(info.connected_clients >= 1);
    assert!(!info.used_memory_human.is_empty());

    Ok(())
}
