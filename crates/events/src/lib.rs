//! The SSE fan-out engine's transport-agnostic core: events, topics, and
//! the pluggable [`MessageBus`] contract. Backend implementations (in-process
//! here, Redis pub/sub and Redis streams in the infrastructure crate) plug
//! in behind this trait.

pub mod bus;
pub mod event;
pub mod in_proc;

pub use bus::{MessageBus, Subscription, SubscriptionId, SubscriptionIdGen};
pub use event::{Event, Topic, TransportEvent};
pub use in_proc::{with_subscriber_buffer, InProcBus, InProcConfig};
