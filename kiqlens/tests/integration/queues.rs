use crate::shared::*;
use deadpool_redis::redis::AsyncCommands;
use kiqlens::Clock;
use serde_json::json;
use serial_test::serial;
use testresult::TestResult;

#[tokio::test]
#[serial]
pub async fn test_latency_reads_milliseconds() -> TestResult {
    let (pool, storage) = fresh_storage_with(Clock::system()).await?;
    let queue = random_string();
    let now_ms = chrono::Utc::now().timestamp_millis();

    let mut redis = pool.get().await?;
    let _: () = redis.sadd("queues", &queue).await?;
    let _: () = redis
        .lpush(
            format!("queue:{queue}"),
            json!({"jid": "old", "enqueued_at": now_ms - 10_000}).to_string(),
        )
        .await?;
    let _: () = redis
        .lpush(
            format!("queue:{queue}"),
            json!({"jid": "new", "enqueued_at": now_ms}).to_string(),
        )
        .await?;
    drop(redis);

    let latency = storage.queue(&queue).latency().await?;
    assert!((9.0..=11.0).contains(&latency), "latency was {latency}");

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_latency_of_empty_or_unreadable_queue() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:05Z")).await?;

    assert_eq!(storage.queue("nothing").latency().await?, 0.0);

    let mut redis = pool.get().await?;
    let _: () = redis.lpush("queue:broken", "{not json").await?;
    drop(redis);
    assert_eq!(storage.queue("broken").latency().await?, 0.0);

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_queues_and_jobs() -> TestResult {
    let (pool, storage) = fresh_storage(at("2025-01-02T03:04:05Z")).await?;
    let mut redis = pool.get().await?;
    for queue in ["low", "critical", "default"] {
        let _: () = redis.sadd("queues", queue).await?;
    }
    for i in 1..=5 {
        let _: () = redis
            .lpush(
                "queue:default",
                json!({"jid": format!("j{i}"), "class": "HardJob", "args": [i]}).to_string(),
            )
            .await?;
    }
    drop(redis);

    let queues = storage.queues().await?;
    let names: Vec<&str> = queues.iter().map(|q| q.name()).collect();
    assert_eq!(names, vec!["critical", "default", "low"]);

    let default = &queues[1];
    assert_eq!(default.size().await?, 5);

    let (jobs, size) = default.jobs(0, 2).await?;
    assert_eq!(size, 5);
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].jid(), "j5");
    assert_eq!(jobs[0].position(), Some(5));
    assert_eq!(jobs[1].jid(), "j4");
    assert_eq!(jobs[1].position(), Some(4));
    assert_eq!(jobs[1].queue(), "default");

    let (jobs, _) = default.jobs(4, 10).await?;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].jid(), "j1");
    assert_eq!(jobs[0].position(), Some(1));

    Ok(())
}
