//! Redis Streams-backed [`MessageBus`] — durable, at-least-once delivery via
//! consumer groups: a subscriber that's offline when something is
//! published still sees it on reconnect, unlike
//! [`crate::redis_pubsub_bus::RedisPubSubBus`]. Deliberately carries no
//! dead-letter queue: a message this bus can't deliver is a transport
//! problem, not a job outcome, and the job queue already owns dead-lettering
//! for things that actually fail to execute.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, warn};

use signalq_core::options::{apply_options, OptionFn};
use signalq_core::{Error, Result};
use signalq_events::{Event, MessageBus, Subscription, SubscriptionId, SubscriptionIdGen, Topic};

use crate::redis_support::redis_err;

const FIELD: &str = "payload";

pub struct RedisStreamsConfig {
    /// Prepended to the topic name to form the stream key.
    pub stream_prefix: String,
    /// Prefix for each subscription's own consumer group name (suffixed
    /// with its `SubscriptionId` at subscribe time), so every subscriber
    /// gets a full copy of the stream instead of load-balancing it with
    /// whoever else is subscribed to the same topic.
    pub group: String,
    pub subscriber_buffer: usize,
    pub block: Duration,
    /// Cap on the stream's length; Redis trims the oldest entries past it
    /// so a quiet consumer group doesn't grow the stream unbounded.
    pub max_stream_len: usize,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "signalq:events".to_string(),
            group: "signalq-subscribers".to_string(),
            subscriber_buffer: 100,
            block: Duration::from_millis(2000),
            max_stream_len: 10_000,
        }
    }
}

pub fn with_stream_prefix(prefix: impl Into<String>) -> OptionFn<RedisStreamsConfig> {
    let prefix = prefix.into();
    Box::new(move |c| c.stream_prefix = prefix.clone())
}

pub fn with_group(group: impl Into<String>) -> OptionFn<RedisStreamsConfig> {
    let group = group.into();
    Box::new(move |c| c.group = group.clone())
}

pub fn with_max_stream_len(len: usize) -> OptionFn<RedisStreamsConfig> {
    Box::new(move |c| c.max_stream_len = len)
}

type ActiveFlags = Mutex<HashMap<SubscriptionId, Arc<AtomicBool>>>;

pub struct RedisStreamsBus {
    redis_url: String,
    conn: redis::aio::ConnectionManager,
    config: RedisStreamsConfig,
    closed: AtomicBool,
    ids: SubscriptionIdGen,
    active: ActiveFlags,
}

impl RedisStreamsBus {
    pub async fn connect(redis_url: &str, opts: Vec<OptionFn<RedisStreamsConfig>>) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(redis_err)?;
        let conn = client.get_connection_manager().await.map_err(redis_err)?;
        Ok(Self {
            redis_url: redis_url.to_string(),
            conn,
            config: apply_options(opts),
            closed: AtomicBool::new(false),
            ids: SubscriptionIdGen::default(),
            active: Mutex::new(HashMap::new()),
        })
    }

    fn stream_key(&self, topic: &Topic) -> String {
        format!("{}:{}", self.config.stream_prefix, topic.as_str())
    }

    async fn ensure_group(conn: &mut redis::aio::ConnectionManager, stream: &str, group: &str) -> Result<()> {
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(stream, group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            // BUSYGROUP: the group already exists, which is the steady state.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(redis_err(e)),
        }
    }
}

#[async_trait]
impl MessageBus for RedisStreamsBus {
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

        let mut conn = self.conn.clone();
        let stream = self.stream_key(topic);
        let _: String = conn
            .xadd_maxlen(
                &stream,
                redis::streams::StreamMaxlen::Approx(self.config.max_stream_len),
                "*",
                &[(FIELD, payload)],
            )
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::MessageBusClosed { cause: None });
        }

        let client = redis::Client::open(self.redis_url.as_str()).map_err(redis_err)?;
        let mut conn = client.get_connection_manager().await.map_err(redis_err)?;
        let stream = self.stream_key(topic);
        let sub_id = self.ids.next();
        // Every subscriber joins its own group so each gets a full copy of
        // the stream — sharing one group would load-balance entries across
        // subscribers instead of fanning them out to all of them.
        let group = format!("{}-{}", self.config.group, sub_id.as_u64());
        let consumer = signalq_core::id::generate_id("subscriber");
        let block = self.config.block;

        Self::ensure_group(&mut conn, &stream, &group).await?;

        let active = Arc::new(AtomicBool::new(true));
        self.active.lock().expect("active-flag mutex poisoned").insert(sub_id, active.clone());

        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        tokio::spawn(async move {
            let opts = StreamReadOptions::default()
                .group(&group, &consumer)
                .block(block.as_millis() as usize)
                .count(16);

            loop {
                if tx.is_closed() {
                    break;
                }

                let reply: redis::RedisResult<StreamReadReply> =
                    conn.xread_options(&[&stream], &[">"], &opts).await;

                let reply = match reply {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(stream = %stream, error = %e, "stream read failed, retrying");
                        sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                let forwarding = active.load(Ordering::Acquire);
                for stream_key in reply.keys {
                    for id in stream_key.ids {
                        if forwarding {
                            let payload = id
                                .map
                                .get(FIELD)
                                .and_then(|v| redis::from_redis_value::<String>(v).ok());

                            if let Some(payload) = payload {
                                if let Ok(transport) = serde_json::from_str(&payload) {
                                    let event = Event::from_transport(transport);
                                    if !event.is_expired() {
                                        let _ = tx.try_send(event);
                                    }
                                }
                            }
                        }
                        // Ack regardless of `forwarding`: once unsubscribed,
                        // this consumer still owns the message and must not
                        // leave it redelivering to the rest of the group.

                        if let Err(e) = conn.xack::<_, _, _, i64>(&stream_key.key, &group, &[&id.id]).await {
                            error!(stream = %stream_key.key, id = %id.id, error = %e, "failed to acknowledge message");
                        }
                    }
                }
            }
        });

        Ok(Subscription::new(sub_id, topic.clone(), rx))
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
