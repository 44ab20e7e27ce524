//! Queue and infrastructure errors

use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue '{0}' is closed")]
    Closed(String),

    #[error("Clock error: {0}")]
    Clock(String),

    #[error("Job {0} is not reserved by this queue")]
    NotReserved(String),
}
