//! `axum` handler factory bridging GET requests to [`Server::subscribe`].
//!
//! Deliberately bypasses `axum::response::sse` — it re-frames each `data`
//! value itself, which would double-encode the bit-exact wire text
//! [`signalq_events::Event::to_wire`] already produces. Instead the
//! connection's wire frames stream straight through as the response body.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::Query;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, MethodRouter};
use bytes::Bytes;
use tokio_stream::StreamExt;

use signalq_core::Error;
use signalq_events::{MessageBus, Topic};

use crate::server::Server;

/// Build a GET route that subscribes each request to the topic named by its
/// `?topic=` query parameter. A non-GET request gets axum's default 405;
/// a missing or empty topic gets 400.
pub fn sse_route<B: MessageBus + 'static>(server: Arc<Server<B>>) -> MethodRouter {
    get(move |Query(params): Query<HashMap<String, String>>| {
        let server = server.clone();
        async move { handle(server, params).await }
    })
}

async fn handle<B: MessageBus + 'static>(
    server: Arc<Server<B>>,
    params: HashMap<String, String>,
) -> Response {
    let topic = match params
        .get("topic")
        .cloned()
        .filter(|t| !t.is_empty())
        .and_then(|t| Topic::new(t).ok())
    {
        Some(topic) => topic,
        None => return (StatusCode::BAD_REQUEST, "missing or empty topic").into_response(),
    };

    let stream = match server.subscribe(&topic).await {
        Ok(stream) => stream,
        Err(Error::ServerClosed) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "server closed").into_response()
        }
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };

    let body = Body::from_stream(stream.map(|frame| Ok::<_, Infallible>(Bytes::from(frame))));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(body)
        .expect("a streaming SSE response can't fail to build")
}
