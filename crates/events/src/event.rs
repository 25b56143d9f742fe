//! The wire-level unit of the SSE fan-out engine: a topic name and an event
//! ready to be framed as `id:`/`event:`/`data:`/`retry:` lines.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use signalq_core::text::{render, Payload};
use signalq_core::{id, Error, Result};

/// Serializable cross-process form of an [`Event`], used by Redis-backed
/// buses to carry events between processes without going through SSE
/// text framing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Option<Payload>,
    pub retry_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
    pub ttl_ms: Option<u64>,
}

/// A non-empty publish/subscribe channel name.
///
/// Construction validates non-emptiness once, at the boundary, so every
/// consumer downstream (bus, server, client) can assume a valid topic rather
/// than re-checking it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::TopicEmpty);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single SSE event: the `id`, `event`, `data`, and `retry` fields of one
/// wire record.
///
/// At least one of `event` or `data` must be present; an event with neither
/// carries nothing worth sending. `id` defaults to `"<unix-nanos>-<hostname>"`
/// when not given explicitly, via [`Event::with_auto_id`].
#[derive(Debug, Clone)]
pub struct Event {
    id: Option<String>,
    event: Option<String>,
    data: Option<Payload>,
    retry: Option<Duration>,
    /// When this event was created. Defaults to construction time; only
    /// meaningful together with `ttl` — everything else (wire framing, the
    /// in-process bus) ignores it.
    timestamp: DateTime<Utc>,
    /// If set, the Redis-backed buses drop this event rather than deliver
    /// it once `now - timestamp > ttl` (silently, at publish and at
    /// receive). Left configurable rather than uniform: `InProcBus`
    /// subscribers are all in the same process as the publisher, so an
    /// event is either delivered near-instantly or not at all — there's no
    /// propagation delay for a ttl to meaningfully bound.
    ttl: Option<Duration>,
}

impl Event {
    /// Start an event carrying `data` with no `event:` field set.
    pub fn data(data: impl Into<Payload>) -> Self {
        Self {
            id: None,
            event: None,
            data: Some(data.into()),
            retry: None,
            timestamp: Utc::now(),
            ttl: None,
        }
    }

    /// Start a named event with no `data:` field set.
    pub fn named(event: impl Into<String>) -> Result<Self> {
        let event = event.into();
        if event.is_empty() {
            return Err(Error::MessageEmpty);
        }
        Ok(Self {
            id: None,
            event: Some(event),
            data: None,
            retry: None,
            timestamp: Utc::now(),
            ttl: None,
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Stamp an auto-generated id of the form `"<unix-nanos>-<hostname>"` if
    /// one hasn't been set explicitly.
    pub fn with_auto_id(mut self, hostname: &str) -> Self {
        if self.id.is_none() {
            self.id = Some(id::generate_id(hostname));
        }
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_data(mut self, data: impl Into<Payload>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set how long a Redis-backed bus should consider this event live
    /// after `timestamp` before silently dropping it.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Override the creation timestamp `ttl` is measured from. Only useful
    /// in tests that need to construct an already-stale event.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether `ttl` has elapsed since `timestamp`. Always `false` when no
    /// `ttl` was set.
    pub fn is_expired(&self) -> bool {
        match self.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => Utc::now() - self.timestamp > ttl,
            None => false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.event.is_none() && self.data.is_none() {
            return Err(Error::MessageEmpty);
        }
        Ok(())
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn event_name(&self) -> Option<&str> {
        self.event.as_deref()
    }

    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.data.as_ref()
    }

    /// Convert to a serializable form for cross-process transport (Redis
    /// pub/sub, Redis streams), preserving the distinction between a JSON
    /// payload and a string payload that [`Event::to_wire`]'s text
    /// rendering would otherwise erase.
    pub fn to_transport(&self) -> TransportEvent {
        TransportEvent {
            id: self.id.clone(),
            event: self.event.clone(),
            data: self.data.clone(),
            retry_ms: self.retry.map(|d| d.as_millis() as u64),
            timestamp: self.timestamp,
            ttl_ms: self.ttl.map(|d| d.as_millis() as u64),
        }
    }

    pub fn from_transport(transport: TransportEvent) -> Self {
        Self {
            id: transport.id,
            event: transport.event,
            data: transport.data,
            retry: transport.retry_ms.map(Duration::from_millis),
            timestamp: transport.timestamp,
            ttl: transport.ttl_ms.map(Duration::from_millis),
        }
    }

    /// Render this event's SSE wire framing: one `field: value` line per
    /// present field, each data line prefixed separately per the SSE grammar,
    /// terminated by the blank line that ends the record.
    pub fn to_wire(&self) -> Result<String> {
        self.validate()?;
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(data) = &self.data {
            let rendered = render(data)?;
            for line in rendered.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        if let Some(retry) = self.retry {
            if retry.as_millis() > 0 {
                out.push_str("retry: ");
                out.push_str(&retry.as_millis().to_string());
                out.push('\n');
            }
        }
        out.push('\n');
        Ok(out)
    }

    #[cfg(test)]
    fn empty() -> Self {
        Self {
            id: None,
            event: None,
            data: None,
            retry: None,
            timestamp: Utc::now(),
            ttl: None,
        }
    }
}
