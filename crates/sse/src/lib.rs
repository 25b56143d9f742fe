//! The HTTP-facing half of the SSE fan-out engine: a per-subscriber
//! [`Client`], a [`Server`] bridging GET requests to a `MessageBus`, and an
//! `axum` route factory.

pub mod client;
pub mod handler;
pub mod server;

pub use client::Client;
pub use handler::sse_route;
pub use server::{with_heartbeat_interval, with_hostname, Server, ServerConfig, WireStream};
