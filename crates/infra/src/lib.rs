//! Redis-backed implementations of the pluggable contracts defined in
//! `signalq-events` and `signalq-queue`: a durable [`Storage`], and two
//! [`MessageBus`] backends with different durability/ordering tradeoffs.
//!
//! Everything here is gated behind the `redis` feature — consumers that
//! only need the in-process bus and in-memory storage don't pay for the
//! `redis` dependency.

#![cfg(feature = "redis")]

pub mod redis_pubsub_bus;
pub mod redis_storage;
pub mod redis_streams_bus;
pub mod redis_support;

pub use redis_pubsub_bus::{with_channel_prefix, RedisPubSubBus, RedisPubSubConfig};
pub use redis_pubsub_bus::with_subscriber_buffer as with_pubsub_subscriber_buffer;
pub use redis_storage::{with_lease_duration, with_namespace, RedisStorage, RedisStorageConfig};
pub use redis_streams_bus::{
    with_group, with_max_stream_len, with_stream_prefix, RedisStreamsBus, RedisStreamsConfig,
};
