//! Pluggable publish/subscribe abstraction behind the SSE fan-out engine.
//!
//! At-least-once, best-effort delivery: a slow subscriber's buffer can fill
//! up, and when it does the bus drops the event for that subscriber rather
//! than blocking the publisher or buffering without bound. Consumers that
//! need every event must keep their subscription drained.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use signalq_core::Result;

use crate::event::{Event, Topic};

/// Opaque handle identifying one subscription to its owning bus, handed back
/// to [`MessageBus::unsubscribe`]. Carries no meaning outside the bus that
/// issued it — there are no back-pointers from a subscriber to its bus, per
/// the cyclic-pointer-graph guidance this crate follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Per-bus monotonic counter for minting [`SubscriptionId`]s. Kept as a
/// plain field on each bus implementation rather than a crate-level global.
#[derive(Default)]
pub struct SubscriptionIdGen(AtomicU64);

impl SubscriptionIdGen {
    pub fn next(&self) -> SubscriptionId {
        SubscriptionId::new(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

/// A live subscription to one topic.
///
/// Dropping the subscription (or letting its receiver close) releases it the
/// same way an explicit [`MessageBus::unsubscribe`] eventually does, just
/// without the intermediate "still open but no longer routed" state
/// `unsubscribe` leaves it in.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    topic: Topic,
    receiver: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn new(id: SubscriptionId, topic: Topic, receiver: mpsc::Receiver<Event>) -> Self {
        Self { id, topic, receiver }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Wait for the next event, or `None` once the bus has closed this
    /// subscription.
    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

/// A pluggable transport for publishing events to topic subscribers.
///
/// Implementations: [`crate::in_proc::InProcBus`] (single process, no IO),
/// and the Redis-backed pub/sub and streams buses in the infrastructure
/// crate (multi-process, durable-or-not per backend).
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish `event` to every current subscriber of `topic`.
    ///
    /// Non-blocking and best-effort: a full subscriber buffer causes that
    /// subscriber (and only that subscriber) to miss the event.
    async fn publish(&self, topic: &Topic, event: Event) -> Result<()>;

    /// Subscribe to `topic`, receiving every event published to it from this
    /// point on.
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription>;

    /// Remove a subscription without closing the caller-held channel: future
    /// publishes to `topic` skip it, but the receiver stays open until the
    /// caller drops it. Idempotent — unsubscribing an id twice, or one that
    /// no longer exists, is not an error.
    async fn unsubscribe(&self, topic: &Topic, id: SubscriptionId) -> Result<()>;

    /// Release all resources held by this bus (open connections, background
    /// tasks, subscriber registries). Further calls to `publish`/`subscribe`
    /// return `MessageBusClosed`.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn publish(&self, topic: &Topic, event: Event) -> Result<()> {
        (**self).publish(topic, event).await
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        (**self).subscribe(topic).await
    }

    async fn unsubscribe(&self, topic: &Topic, id: SubscriptionId) -> Result<()> {
        (**self).unsubscribe(topic, id).await
    }

    async fn close(&self) -> Result<()> {
        (**self).close().await
    }
}
