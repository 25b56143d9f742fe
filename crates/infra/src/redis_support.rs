//! Shared helpers for the Redis-backed bus and storage implementations:
//! connecting, and the error conversion every `redis::RedisError` funnels
//! through.

use signalq_core::{Error, Result};

pub fn redis_err(e: redis::RedisError) -> Error {
    Error::RedisConnectionFailed(e.to_string())
}

pub async fn connection_manager(redis_url: &str) -> Result<redis::aio::ConnectionManager> {
    let client = redis::Client::open(redis_url).map_err(redis_err)?;
    client.get_connection_manager().await.map_err(redis_err)
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
