use chrono::{DateTime, Utc};
use deadpool_redis::redis;
use kiqlens::{Clock, Storage};
use rand::distr::{Alphanumeric, SampleString};
use testresult::TestResult;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn setup() -> deadpool_redis::Pool {
    dotenvy::from_filename(".env.test").ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    redis_pool()
}

pub fn redis_pool() -> deadpool_redis::Pool {
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL is not set");
    let mut cfg = deadpool_redis::Config::from_url(redis_url);
    cfg.pool = Some(deadpool_redis::PoolConfig {
        max_size: 4,
        timeouts: deadpool_redis::Timeouts {
            wait: Some(std::time::Duration::from_secs(2)),
            create: Some(std::time::Duration::from_secs(2)),
            recycle: Some(std::time::Duration::from_secs(2)),
        },
        ..Default::default()
    });
    cfg.create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .expect("Failed to create Redis pool")
}

/// A flushed database and a storage reading it at a fixed instant.
pub async fn fresh_storage(now: DateTime<Utc>) -> TestResult<(deadpool_redis::Pool, Storage)> {
    fresh_storage_with(Clock::fixed(now)).await
}

pub async fn fresh_storage_with(clock: Clock) -> TestResult<(deadpool_redis::Pool, Storage)> {
    let pool = setup();
    let mut redis = pool.get().await?;
    let _: () = redis::cmd("FLUSHDB").query_async(&mut redis).await?;
    drop(redis);

    let storage = Storage::builder()
        .clock(clock)
        .build_from_pool(redis_pool())?;
    Ok((pool, storage))
}

pub fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("valid timestamp")
        .with_timezone(&Utc)
}

pub fn random_string() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 16)
}
