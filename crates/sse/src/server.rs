//! Bridges HTTP subscribers to a [`MessageBus`], enforcing heartbeats and
//! providing `publish` as a thin façade over the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use signalq_core::id::default_hostname;
use signalq_core::options::{apply_options, OptionFn};
use signalq_core::{Error, Result};
use signalq_events::{Event, MessageBus, Topic};

use crate::client::Client;

/// How many wire frames a connection's HTTP write loop may fall behind the
/// bus/heartbeat before frames start getting dropped for it — matched to
/// `InProcConfig`'s default subscriber buffer.
const CONNECTION_BUFFER: usize = 100;

pub struct ServerConfig {
    /// Interval between `:\n\n` heartbeat comments on an otherwise idle
    /// connection.
    pub heartbeat_interval: Duration,
    /// Used to auto-assign an event id (`"<unix-nanos>-<hostname>"`) when a
    /// publisher doesn't supply one.
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            hostname: default_hostname(),
        }
    }
}

pub fn with_heartbeat_interval(interval: Duration) -> OptionFn<ServerConfig> {
    Box::new(move |c| c.heartbeat_interval = interval)
}

pub fn with_hostname(hostname: impl Into<String>) -> OptionFn<ServerConfig> {
    let hostname = hostname.into();
    Box::new(move |c| c.hostname = hostname.clone())
}

/// Wire frames for one connection, ready to stream as an HTTP response body.
pub type WireStream = ReceiverStream<String>;

/// Bridges HTTP GET requests to a [`MessageBus`].
///
/// State machine for a connection: opened → streaming (on successful
/// subscribe) → closing (on cancellation, bus close, or a write failure) →
/// closed (once the client is marked closed and its channel drained). No
/// transition leaves a background task or subscription running past
/// `close()`.
pub struct Server<B> {
    bus: Arc<B>,
    config: ServerConfig,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl<B: MessageBus + 'static> Server<B> {
    pub fn new(bus: Arc<B>, opts: Vec<OptionFn<ServerConfig>>) -> Self {
        Self {
            bus,
            config: apply_options(opts),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Validate, stamp an id if missing, and forward to the bus.
    pub async fn publish(&self, topic: &Topic, event: Event) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ServerClosed);
        }
        let event = event.with_auto_id(&self.config.hostname);
        self.bus.publish(topic, event).await
    }

    /// Subscribe to `topic` and spawn the per-connection loop: concurrently
    /// select on bus events, the heartbeat tick, and server cancellation,
    /// forwarding each through a [`Client`] into the returned wire stream.
    pub async fn subscribe(&self, topic: &Topic) -> Result<WireStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ServerClosed);
        }

        let mut subscription = self.bus.subscribe(topic).await?;
        let (client, receiver) = Client::new(CONNECTION_BUFFER);
        let cancel = self.cancel.child_token();
        let heartbeat_interval = self.config.heartbeat_interval;
        let hostname = self.config.hostname.clone();
        let bus = self.bus.clone();
        let topic = topic.clone();

        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(heartbeat_interval);
            heartbeat.tick().await; // first tick is immediate; skip it

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = bus.unsubscribe(&topic, subscription.id()).await;
                        client.close();
                        break;
                    }
                    _ = heartbeat.tick() => {
                        if client.send_keepalive().await.is_err() {
                            let _ = bus.unsubscribe(&topic, subscription.id()).await;
                            break;
                        }
                    }
                    received = subscription.recv() => {
                        match received {
                            Some(event) => {
                                let event = event.with_auto_id(&hostname);
                                if client.send(&event).await.is_err() {
                                    let _ = bus.unsubscribe(&topic, subscription.id()).await;
                                    break;
                                }
                            }
                            None => {
                                client.close();
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(ReceiverStream::new(receiver))
    }

    /// Mark closed, cancel every in-flight connection, and close the bus.
    /// Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.bus.close().await
    }
}
