use deadpool_redis::redis;

#[derive(Debug, thiserror::Error)]
pub enum KiqlensError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
    #[error("Redis pool could not be created: {0}")]
    CreatePool(#[from] deadpool_redis::CreatePoolError),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Deadline exceeded")]
    DeadlineExceeded,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Malformed payload: {0}")]
    Malformed(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KiqlensError {
    /// Broker unreachable, timed out or the call was abandoned.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Redis(_)
                | Self::Pool(_)
                | Self::CreatePool(_)
                | Self::Cancelled
                | Self::DeadlineExceeded
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Json(_))
    }
}
