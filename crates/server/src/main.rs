//! Thin binary wiring an SSE [`Server`] and a job [`Queue`] behind
//! `axum::serve`.
//!
//! Backend choice (in-process vs. Redis) is an environment variable, not a
//! compile-time feature: set `REDIS_URL` to run the distributed bus and
//! storage, leave it unset to run everything in one process. Both paths
//! share the same route wiring via [`build_app`], which is generic over the
//! concrete [`MessageBus`]/[`Storage`] pair.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use signalq_core::id::default_hostname;
use signalq_core::Error;
use signalq_events::{Event, MessageBus, Topic};
use signalq_infra::{RedisPubSubBus, RedisStorage};
use signalq_queue::{logging, recovery, MemoryStorage, Queue, Storage};
use signalq_sse::{sse_route, Server};

#[tokio::main]
async fn main() {
    signalq_observability::init();

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| default_hostname());

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown.cancel();
    });

    let app = match std::env::var("REDIS_URL") {
        Ok(redis_url) => {
            tracing::info!("using redis-backed message bus and job storage");
            let bus = Arc::new(
                RedisPubSubBus::connect(&redis_url, vec![])
                    .await
                    .expect("failed to connect to redis for the message bus"),
            );
            let storage = Arc::new(
                RedisStorage::connect(&redis_url, vec![])
                    .await
                    .expect("failed to connect to redis for job storage"),
            );
            build_app(bus, storage, hostname, cancel.clone())
        }
        Err(_) => {
            tracing::info!("no REDIS_URL set; using in-process message bus and job storage");
            let bus = Arc::new(signalq_events::InProcBus::default());
            let storage = Arc::new(MemoryStorage::new());
            build_app(bus, storage, hostname, cancel.clone())
        }
    };

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {bind_addr}: {e}"));

    tracing::info!("listening on {}", listener.local_addr().unwrap());

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .unwrap();
}

struct AppState<B, S> {
    server: Arc<Server<B>>,
    queue: Arc<Queue<S>>,
}

/// Assemble the routes shared by both backend wirings and spawn the queue's
/// worker pool in the background, stopping it when `cancel` fires.
///
/// Handlers reach the shared state through an [`Extension`] layer (the
/// teacher's `forgeerp-api` wires `Arc<AppServices>` the same way) rather
/// than `axum::extract::State`, so the `Router` itself stays `Router<()>`
/// regardless of which concrete `B`/`S` this binary was built with.
fn build_app<B, S>(
    bus: Arc<B>,
    storage: Arc<S>,
    hostname: String,
    cancel: CancellationToken,
) -> Router
where
    B: MessageBus + 'static,
    S: Storage + 'static,
{
    let server = Arc::new(Server::new(
        bus,
        vec![signalq_sse::with_hostname(hostname.clone())],
    ));

    let mut queue = Queue::new(storage, vec![]);
    queue.use_middleware(logging("log_event"));
    queue.use_middleware(recovery());

    let republish_server = server.clone();
    queue.register("log_event", move |payload: Value| {
        let server = republish_server.clone();
        async move {
            tracing::info!(?payload, "log_event job executed");
            if let Some(topic) = payload.get("topic").and_then(Value::as_str) {
                let topic = Topic::new(topic)?;
                let event = Event::data(payload.clone()).with_event("log_event");
                server.publish(&topic, event).await?;
            }
            Ok(())
        }
    });

    let queue = Arc::new(queue);
    tokio::spawn({
        let queue = queue.clone();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = queue.run(cancel).await {
                tracing::error!(error = %e, "job queue worker pool exited with an error");
            }
        }
    });

    let state = Arc::new(AppState { server: server.clone(), queue });

    Router::new()
        .route("/events", sse_route(server))
        .route("/publish", post(publish::<B, S>))
        .route("/jobs", post(enqueue_job::<B, S>))
        .route("/jobs/stats", get(job_stats::<B, S>))
        .layer(Extension(state))
}

#[derive(Deserialize)]
struct PublishRequest {
    topic: String,
    event: Option<String>,
    data: Option<Value>,
    retry_ms: Option<u64>,
}

async fn publish<B, S>(
    Extension(state): Extension<Arc<AppState<B, S>>>,
    Json(req): Json<PublishRequest>,
) -> Response
where
    B: MessageBus + 'static,
    S: Storage + 'static,
{
    let topic = match Topic::new(req.topic) {
        Ok(t) => t,
        Err(e) => return error_response(e),
    };

    let mut event = match req.data {
        Some(data) => Event::data(data),
        None => Event::data(Value::Null),
    };
    if let Some(name) = req.event {
        event = event.with_event(name);
    }
    if let Some(ms) = req.retry_ms {
        event = event.with_retry(std::time::Duration::from_millis(ms));
    }

    match state.server.publish(&topic, event).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
struct EnqueueRequest {
    task: String,
    payload: Value,
    delay_ms: Option<u64>,
}

async fn enqueue_job<B, S>(
    Extension(state): Extension<Arc<AppState<B, S>>>,
    Json(req): Json<EnqueueRequest>,
) -> Response
where
    B: MessageBus + 'static,
    S: Storage + 'static,
{
    let hostname = default_hostname();
    let mut job = signalq_queue::Job::new(&hostname, req.task, req.payload);
    if let Some(ms) = req.delay_ms {
        job = job.delayed(std::time::Duration::from_millis(ms));
    }

    match state.queue.enqueue(job).await {
        Ok(id) => (StatusCode::ACCEPTED, id.as_str().to_string()).into_response(),
        Err(e) => error_response(e),
    }
}

async fn job_stats<B, S>(Extension(state): Extension<Arc<AppState<B, S>>>) -> Response
where
    B: MessageBus + 'static,
    S: Storage + 'static,
{
    match state.queue.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::TopicEmpty | Error::MessageEmpty | Error::InvalidJobPayload(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::JobNotFound(_) | Error::HandlerNotFound(_) => StatusCode::NOT_FOUND,
        Error::ServerClosed | Error::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}
