use crate::shared::*;
use deadpool_redis::redis::AsyncCommands;
use kiqlens::{BrokerVersion, SortedEntry, SortedSet};
use serde_json::{Value, json};
use serial_test::serial;
use testresult::TestResult;

fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp(1_700_000_000, 123_456_000).unwrap()
}

async fn only_entry(
    storage: &kiqlens::Storage,
    set: SortedSet,
) -> TestResult<SortedEntry> {
    let (mut entries, size) = storage.sorted_range(set, 0, 0, false).await?;
    assert_eq!(size, 1);
    Ok(entries.remove(0))
}

#[tokio::test]
#[serial]
pub async fn test_move_retry_to_queue_v7() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let raw = r#"{"queue":"default","class":"HardJob","jid":"abc","args":[1],"retry_count":2,"created_at":1700000000.5}"#;

    let mut redis = pool.get().await?;
    let _: () = redis.hset("j|20231114|22:13", "HardJob|p", 1).await?;
    let _: () = redis.zadd("retry", raw, 1_700_000_100.0).await?;
    drop(redis);
    assert_eq!(storage.broker_version().await, BrokerVersion::V7);

    let entry = only_entry(&storage, SortedSet::Retry).await?;
    storage.move_to_queue(SortedSet::Retry, &entry, true).await?;

    let mut redis = pool.get().await?;
    let retries: usize = redis.zcard("retry").await?;
    assert_eq!(retries, 0);
    let queues: Vec<String> = redis.smembers("queues").await?;
    assert_eq!(queues, vec!["default"]);
    let head: String = redis.lindex("queue:default", 0).await?;
    assert_eq!(
        head,
        r#"{"queue":"default","class":"HardJob","jid":"abc","args":[1],"retry_count":1,"created_at":1700000000.5,"enqueued_at":1700000000.123456}"#
    );

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_move_retry_to_queue_v8() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let raw = json!({
        "queue": "default",
        "class": "HardJob",
        "jid": "abc",
        "retry_count": 2,
        "created_at": 1_700_000_000_123_i64,
        "at": 1_700_000_100.0,
    })
    .to_string();

    let mut redis = pool.get().await?;
    let _: () = redis.hset("j|231114|22:13", "HardJob|p", 1).await?;
    let _: () = redis.zadd("schedule", &raw, 1_700_000_100.0).await?;
    drop(redis);
    assert_eq!(storage.broker_version().await, BrokerVersion::V8);

    let entry = only_entry(&storage, SortedSet::Schedule).await?;
    storage.move_to_queue(SortedSet::Schedule, &entry, false).await?;

    let mut redis = pool.get().await?;
    let head: String = redis.lindex("queue:default", 0).await?;
    let item: Value = serde_json::from_str(&head)?;
    assert_eq!(item["enqueued_at"].to_string(), "1700000000123");
    assert_eq!(item["created_at"].to_string(), "1700000000123");
    assert_eq!(item["retry_count"].to_string(), "2");
    assert!(item.get("at").is_none());

    // the entry is gone, so a second move reports it
    let err = storage
        .move_to_queue(SortedSet::Schedule, &entry, false)
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_move_without_queue_is_malformed() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let mut redis = pool.get().await?;
    let _: () = redis.zadd("dead", r#"{"jid":"x","class":"Lost"}"#, 1.0).await?;
    drop(redis);

    let entry = only_entry(&storage, SortedSet::Dead).await?;
    let err = storage
        .move_to_queue(SortedSet::Dead, &entry, true)
        .await
        .unwrap_err();
    assert!(err.is_malformed());

    // nothing was removed
    let (_, size) = storage.sorted_range(SortedSet::Dead, 0, 0, false).await?;
    assert_eq!(size, 1);

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_delete_and_kill() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let mut redis = pool.get().await?;
    let _: () = redis.zadd("retry", r#"{"jid":"a","queue":"q"}"#, 1.0).await?;
    let _: () = redis.zadd("retry", r#"{"jid":"b","queue":"q"}"#, 2.0).await?;
    drop(redis);

    let (entries, _) = storage.sorted_range(SortedSet::Retry, 0, 0, false).await?;
    storage.delete(SortedSet::Retry, &entries[0]).await?;
    storage.kill(&entries[1]).await?;

    let (retries, size) = storage.sorted_range(SortedSet::Retry, 0, 0, false).await?;
    assert!(retries.is_empty());
    assert_eq!(size, 0);

    let dead = only_entry(&storage, SortedSet::Dead).await?;
    assert_eq!(dead.payload.jid(), "b");
    assert!((dead.score - 1_700_000_000.123_456).abs() < 1e-3);

    let err = storage.delete(SortedSet::Retry, &entries[0]).await.unwrap_err();
    assert!(err.is_not_found());

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_retry_all_and_delete_all() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let mut redis = pool.get().await?;
    for i in 0..250 {
        let queue = if i % 2 == 0 { "even" } else { "odd" };
        let _: () = redis
            .zadd(
                "retry",
                json!({"jid": i, "queue": queue, "retry_count": 3}).to_string(),
                i,
            )
            .await?;
    }
    for i in 0..5 {
        let _: () = redis.zadd("dead", json!({"jid": i}).to_string(), i).await?;
    }
    drop(redis);

    assert_eq!(storage.retry_all().await?, 250);
    assert_eq!(storage.queue_size("even").await?, 125);
    assert_eq!(storage.queue_size("odd").await?, 125);

    let (jobs, _) = storage.queue("odd").jobs(0, 1).await?;
    assert_eq!(jobs[0].retry_count(), Some(2));

    assert_eq!(storage.delete_all(SortedSet::Dead).await?, 5);
    assert!(storage.sorted_bounds(SortedSet::Dead).await?.is_none());

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_scan_patterns() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let mut redis = pool.get().await?;
    let _: () = redis.zadd("retry", r#"{"jid":"a1","class":"FooJob"}"#, 3.0).await?;
    let _: () = redis.zadd("retry", r#"{"jid":"b1","class":"FooJob"}"#, 1.0).await?;
    let _: () = redis.zadd("retry", r#"{"jid":"a2","class":"BarJob"}"#, 2.0).await?;
    drop(redis);

    let jids = |entries: Vec<SortedEntry>| -> Vec<String> {
        entries.iter().map(|e| e.payload.jid().to_string()).collect()
    };

    // a bare term matches anywhere in the payload
    let found = storage.sorted_scan(SortedSet::Retry, "FooJob", false).await?;
    assert_eq!(jids(found), vec!["b1", "a1"]);

    // a pattern with a wildcard is used as given
    let found = storage
        .sorted_scan(SortedSet::Retry, r#"{"jid":"a*"#, false)
        .await?;
    assert_eq!(jids(found), vec!["a2", "a1"]);

    let found = storage.sorted_scan(SortedSet::Retry, "*FooJob", false).await?;
    assert!(found.is_empty());

    let found = storage.sorted_scan(SortedSet::Retry, "", true).await?;
    assert_eq!(jids(found), vec!["a1", "a2", "b1"]);

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_kill_entry_no_longer_retrying() -> TestResult {
    let (_pool, storage) = fresh_storage(now()).await?;
    let entry = SortedEntry::new(
        kiqlens::JobPayload::new(r#"{"jid":"gone","queue":"q"}"#, ""),
        5.0,
    );

    storage.kill(&entry).await?;

    let (retries, size) = storage.sorted_range(SortedSet::Retry, 0, 0, false).await?;
    assert!(retries.is_empty());
    assert_eq!(size, 0);
    let dead = only_entry(&storage, SortedSet::Dead).await?;
    assert_eq!(dead.payload.jid(), "gone");

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_failed_bulk_move_keeps_unmovable_entries() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let mut redis = pool.get().await?;
    let _: () = redis.zadd("schedule", "not json", 1.0).await?;
    let _: () = redis.zadd("schedule", r#"{"jid":"noqueue"}"#, 2.0).await?;
    for i in 0..100 {
        let _: () = redis
            .zadd("schedule", json!({"jid": i, "queue": "ok"}).to_string(), 10 + i)
            .await?;
    }
    // the second batch pushes onto a key that is not a list
    let _: () = redis.set("queue:broken", "oops").await?;
    let _: () = redis
        .zadd("schedule", r#"{"jid":"x","queue":"broken"}"#, 500.0)
        .await?;
    drop(redis);

    let err = storage
        .bulk_move_to_queue(SortedSet::Schedule, false)
        .await
        .unwrap_err();
    assert!(err.is_transport());

    let mut redis = pool.get().await?;
    let malformed: Option<f64> = redis.zscore("schedule", "not json").await?;
    assert_eq!(malformed, Some(1.0));
    let noqueue: Option<f64> = redis.zscore("schedule", r#"{"jid":"noqueue"}"#).await?;
    assert_eq!(noqueue, Some(2.0));
    let held: bool = redis.exists("schedule:held").await?;
    assert!(!held);

    Ok(())
}

#[tokio::test]
#[serial]
pub async fn test_bulk_move_merges_back_entries_parked_earlier() -> TestResult {
    let (pool, storage) = fresh_storage(now()).await?;
    let mut redis = pool.get().await?;
    let _: () = redis.zadd("retry:held", "not json", 5.0).await?;
    let _: () = redis
        .zadd("retry", json!({"jid": "ok", "queue": "q"}).to_string(), 9.0)
        .await?;
    drop(redis);

    assert_eq!(storage.retry_all().await?, 1);
    assert_eq!(storage.queue_size("q").await?, 1);

    let left = only_entry(&storage, SortedSet::Retry).await?;
    assert_eq!(left.payload.raw(), "not json");
    assert_eq!(left.score, 5.0);

    let mut redis = pool.get().await?;
    let held: bool = redis.exists("retry:held").await?;
    assert!(!held);

    Ok(())
}
