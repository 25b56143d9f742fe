//! Single-process message bus: no IO, per-topic fan-out over bounded
//! channels.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use signalq_core::options::{apply_options, OptionFn};
use signalq_core::{Error, Result};

use crate::bus::{MessageBus, Subscription, SubscriptionId, SubscriptionIdGen};
use crate::event::{Event, Topic};

/// Configuration for [`InProcBus`], built via [`InProcBus::new`]'s option
/// list rather than a struct literal.
pub struct InProcConfig {
    /// Per-subscriber channel capacity. A full channel means that
    /// subscriber silently misses the next publish.
    pub subscriber_buffer: usize,
}

impl Default for InProcConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 100,
        }
    }
}

pub fn with_subscriber_buffer(n: usize) -> OptionFn<InProcConfig> {
    Box::new(move |c| c.subscriber_buffer = n)
}

/// One subscriber's slot within a topic's entry list. `active` flips to
/// `false` on [`InProcBus::unsubscribe`]; the sender itself is left alone so
/// the caller's receiver isn't force-closed. The entry is dropped — and with
/// it the sender, which does close the receiver — the next time the topic is
/// swept, either by a publish or explicitly.
struct Entry {
    id: SubscriptionId,
    sender: mpsc::Sender<Event>,
    active: bool,
}

struct State {
    subscribers: HashMap<Topic, Vec<Entry>>,
    closed: bool,
}

/// In-process [`MessageBus`]: one `Vec` of subscriber entries per topic,
/// guarded by a single mutex. Dead subscribers (closed receivers) and
/// unsubscribed ones are compacted the next time their topic is published to;
/// a topic whose entry list becomes empty is dropped entirely.
pub struct InProcBus {
    config: InProcConfig,
    state: Mutex<State>,
    ids: SubscriptionIdGen,
}

impl InProcBus {
    pub fn new(opts: Vec<OptionFn<InProcConfig>>) -> Self {
        Self {
            config: apply_options(opts),
            state: Mutex::new(State {
                subscribers: HashMap::new(),
                closed: false,
            }),
            ids: SubscriptionIdGen::default(),
        }
    }
}

impl Default for InProcBus {
    fn default() -> Self {
        Self::new(vec![])
    }
}

#[async_trait]
impl MessageBus for InProcBus {
    async fn publish(&self, topic: &Topic, event: Event) -> Result<()> {
        event.validate()?;
        let mut state = self.state.lock().expect("in-proc bus mutex poisoned");
        if state.closed {
            return Err(Error::MessageBusClosed { cause: None });
        }
        if let Some(entries) = state.subscribers.get_mut(topic) {
            // Compact as we go: drop inactive entries (unsubscribed) and
            // dead ones (receiver gone) in the same pass that delivers.
            entries.retain(|entry| {
                if !entry.active {
                    return false;
                }
                match entry.sender.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
            if entries.is_empty() {
                state.subscribers.remove(topic);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        let mut state = self.state.lock().expect("in-proc bus mutex poisoned");
        if state.closed {
            return Err(Error::MessageBusClosed { cause: None });
        }
        let id = self.ids.next();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        state.subscribers.entry(topic.clone()).or_default().push(Entry {
            id,
            sender: tx,
            active: true,
        });
        Ok(Subscription::new(id, topic.clone(), rx))
    }

    async fn unsubscribe(&self, topic: &Topic, id: SubscriptionId) -> Result<()> {
        let mut state = self.state.lock().expect("in-proc bus mutex poisoned");
        if let Some(entries) = state.subscribers.get_mut(topic) {
            for entry in entries.iter_mut() {
                if entry.id == id {
                    entry.active = false;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("in-proc bus mutex poisoned");
        state.closed = true;
        state.subscribers.clear();
        Ok(())
    }
}
