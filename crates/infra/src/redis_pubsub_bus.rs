//! Redis pub/sub-backed [`MessageBus`] — not durable: a subscriber that is
//! offline, or whose connection briefly drops, misses whatever is published
//! while it's gone. For durable at-least-once delivery use
//! [`crate::redis_streams_bus::RedisStreamsBus`] instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::warn;

use signalq_core::options::{apply_options, OptionFn};
use signalq_core::{Error, Result};
use signalq_events::{Event, MessageBus, Subscription, SubscriptionId, SubscriptionIdGen, Topic};

use crate::redis_support::redis_err;

pub struct RedisPubSubConfig {
    /// Prepended to the topic name to form the Redis channel, so several
    /// applications can share one Redis instance without colliding.
    pub channel_prefix: String,
    pub subscriber_buffer: usize,
}

impl Default for RedisPubSubConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "signalq:events".to_string(),
            subscriber_buffer: 100,
        }
    }
}

pub fn with_channel_prefix(prefix: impl Into<String>) -> OptionFn<RedisPubSubConfig> {
    let prefix = prefix.into();
    Box::new(move |c| c.channel_prefix = prefix.clone())
}

pub fn with_subscriber_buffer(n: usize) -> OptionFn<RedisPubSubConfig> {
    Box::new(move |c| c.subscriber_buffer = n)
}

/// Shared flag a subscription's forwarding task polls each message; flipped
/// by [`RedisPubSubBus::unsubscribe`]. Kept separate from the task's own
/// `mpsc::Sender` so unsubscribing never has to touch (or close) the
/// caller's channel directly.
type ActiveFlags = Mutex<HashMap<SubscriptionId, Arc<AtomicBool>>>;

pub struct RedisPubSubBus {
    client: redis::Client,
    publisher: redis::aio::ConnectionManager,
    config: RedisPubSubConfig,
    closed: AtomicBool,
    ids: SubscriptionIdGen,
    active: ActiveFlags,
}

impl RedisPubSubBus {
    pub async fn connect(redis_url: &str, opts: Vec<OptionFn<RedisPubSubConfig>>) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::MessageBusClosed { cause: Some(e.to_string()) })?;
        let mut publisher = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::MessageBusClosed { cause: Some(e.to_string()) })?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut publisher)
            .await
            .map_err(|e| Error::MessageBusClosed { cause: Some(e.to_string()) })?;
        Ok(Self {
            client,
            publisher,
            config: apply_options(opts),
            closed: AtomicBool::new(false),
            ids: SubscriptionIdGen::default(),
            active: Mutex::new(HashMap::new()),
        })
    }

    fn channel_name(&self, topic: &Topic) -> String {
        format!("{}:{}", self.config.channel_prefix, topic.as_str())
    }
}

#[async_trait]
impl MessageBus for RedisPubSubBus {
    async fn publish(&self, topic: &Topic, event: Event) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::MessageBusClosed { cause: None });
        }
        event.validate()?;
        if event.is_expired() {
            return Ok(());
        }
        let payload = serde_json::to_string(&event.to_transport())
            .map_err(|e| Error::Other(e.into()))?;

        let mut conn = self.publisher.clone();
        let _: i64 = conn
            .publish(self.channel_name(topic), payload)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::MessageBusClosed { cause: None });
        }

        let mut pubsub = self.client.get_async_pubsub().await.map_err(redis_err)?;
        pubsub
            .subscribe(self.channel_name(topic))
            .await
            .map_err(redis_err)?;

        let id = self.ids.next();
        let active = Arc::new(AtomicBool::new(true));
        self.active.lock().expect("active-flag mutex poisoned").insert(id, active.clone());

        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                if tx.is_closed() {
                    break;
                }
                if !active.load(Ordering::Acquire) {
                    // Unsubscribed: keep draining Redis so the connection
                    // doesn't back up, but stop forwarding. The caller's
                    // channel stays open until they drop it themselves.
                    continue;
                }
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "dropping pub/sub message with unreadable payload");
                        continue;
                    }
                };
                let transport = match serde_json::from_str(&payload) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "dropping pub/sub message with malformed transport event");
                        continue;
                    }
                };
                let event = Event::from_transport(transport);
                if event.is_expired() {
                    continue;
                }
                let _ = tx.try_send(event);
            }
        });

        Ok(Subscription::new(id, topic.clone(), rx))
    }

    async fn unsubscribe(&self, _topic: &Topic, id: SubscriptionId) -> Result<()> {
        if let Some(flag) = self.active.lock().expect("active-flag mutex poisoned").remove(&id) {
            flag.store(false, Ordering::Release);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_prefixes_with_signalq() {
        let config = RedisPubSubConfig::default();
        assert_eq!(config.channel_prefix, "signalq:events");
        assert_eq!(config.subscriber_buffer, 100);
    }

    #[test]
    fn with_channel_prefix_overrides_default() {
        let config = apply_options(vec![with_channel_prefix("tenant-a")]);
        assert_eq!(config.channel_prefix, "tenant-a");
    }

    #[test]
    fn with_subscriber_buffer_overrides_default() {
        let config = apply_options(vec![with_subscriber_buffer(8)]);
        assert_eq!(config.subscriber_buffer, 8);
    }
}
