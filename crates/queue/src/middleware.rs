//! Middleware wraps a [`Handler`] with cross-cutting behavior — logging,
//! metrics, panic recovery, timeouts — without the handler itself knowing
//! about any of it.
//!
//! Middlewares are applied outermost-first: the first entry in the list you
//! hand the queue is the outermost wrapper, so it sees every invocation
//! (including ones a later middleware aborts) and runs its after-call logic
//! last.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use signalq_core::{Error, Result};

use crate::handler::Handler;

pub type Middleware = Arc<dyn Fn(Arc<dyn Handler>) -> Arc<dyn Handler> + Send + Sync>;

/// Wrap `base` with `middlewares`, outermost first.
pub fn compose(base: Arc<dyn Handler>, middlewares: &[Middleware]) -> Arc<dyn Handler> {
    middlewares.iter().rev().fold(base, |acc, mw| mw(acc))
}

struct Logging {
    task: String,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Logging {
    async fn call(&self, payload: Value) -> Result<()> {
        info!(task = %self.task, "job started");
        let result = self.inner.call(payload).await;
        match &result {
            Ok(()) => info!(task = %self.task, "job completed"),
            Err(e) => warn!(task = %self.task, error = %e, "job failed"),
        }
        result
    }
}

/// Log a start/finish line around every invocation, tagged with `task`.
pub fn logging(task: impl Into<String>) -> Middleware {
    let task = task.into();
    Arc::new(move |inner| {
        Arc::new(Logging {
            task: task.clone(),
            inner,
        })
    })
}

#[derive(Default)]
struct Counters {
    started: std::sync::atomic::AtomicU64,
    succeeded: std::sync::atomic::AtomicU64,
    failed: std::sync::atomic::AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Shared counters a [`metrics`] middleware updates; clone the handle you
/// construct it with to read a live snapshot from elsewhere.
#[derive(Clone, Default)]
pub struct Metrics(Arc<Counters>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        use std::sync::atomic::Ordering::Relaxed;
        MetricsSnapshot {
            started: self.0.started.load(Relaxed),
            succeeded: self.0.succeeded.load(Relaxed),
            failed: self.0.failed.load(Relaxed),
        }
    }
}

struct MetricsHandler {
    metrics: Metrics,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for MetricsHandler {
    async fn call(&self, payload: Value) -> Result<()> {
        use std::sync::atomic::Ordering::Relaxed;
        self.metrics.0.started.fetch_add(1, Relaxed);
        let result = self.inner.call(payload).await;
        match &result {
            Ok(()) => self.metrics.0.succeeded.fetch_add(1, Relaxed),
            Err(_) => self.metrics.0.failed.fetch_add(1, Relaxed),
        };
        result
    }
}

/// Count started/succeeded/failed invocations into `metrics`.
pub fn metrics(metrics: Metrics) -> Middleware {
    Arc::new(move |inner| {
        Arc::new(MetricsHandler {
            metrics: metrics.clone(),
            inner,
        })
    })
}

struct Recovery {
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Recovery {
    async fn call(&self, payload: Value) -> Result<()> {
        let inner = self.inner.clone();
        match tokio::spawn(async move { inner.call(payload).await }).await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let msg = panic_message(join_err.into_panic());
                error!(error = %msg, "job handler panicked");
                Err(Error::JobPanicked(msg))
            }
            Err(join_err) => Err(Error::JobPanicked(join_err.to_string())),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job handler panicked with a non-string payload".to_string()
    }
}

/// Run the handler on a spawned task so a panic inside it becomes a
/// [`Error::JobPanicked`] instead of taking down the worker that was
/// executing it.
pub fn recovery() -> Middleware {
    Arc::new(|inner| Arc::new(Recovery { inner }))
}

struct Timeout {
    duration: Duration,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Timeout {
    async fn call(&self, payload: Value) -> Result<()> {
        match tokio::time::timeout(self.duration, self.inner.call(payload)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Other(anyhow::anyhow!(
                "job handler exceeded {:?} timeout",
                self.duration
            ))),
        }
    }
}

/// Fail an invocation that runs longer than `duration` rather than let a
/// hung handler occupy a worker slot indefinitely.
pub fn timeout(duration: Duration) -> Middleware {
    Arc::new(move |inner| {
        Arc::new(Timeout {
            duration,
            inner,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler;
    use serde_json::json;

    fn ok_handler() -> Arc<dyn Handler> {
        handler(|_: Value| async { Ok(()) })
    }

    fn panicking_handler() -> Arc<dyn Handler> {
        handler(|_: Value| async {
            panic!("boom");
            #[allow(unreachable_code)]
            Ok(())
        })
    }

    fn slow_handler(delay: Duration) -> Arc<dyn Handler> {
        handler(move |_: Value| {
            let delay = delay;
            async move {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn recovery_converts_panic_into_job_panicked_error() {
        let wrapped = compose(panicking_handler(), &[recovery()]);
        let err = wrapped.call(json!({})).await.unwrap_err();
        assert!(matches!(err, Error::JobPanicked(_)));
    }

    #[tokio::test]
    async fn timeout_fails_slow_handlers() {
        let wrapped = compose(
            slow_handler(Duration::from_millis(50)),
            &[timeout(Duration::from_millis(5))],
        );
        assert!(wrapped.call(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn timeout_passes_through_fast_handlers() {
        let wrapped = compose(ok_handler(), &[timeout(Duration::from_secs(1))]);
        assert!(wrapped.call(json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn metrics_middleware_counts_success_and_failure() {
        let m = Metrics::new();
        let ok = compose(ok_handler(), &[metrics(m.clone())]);
        ok.call(json!({})).await.unwrap();

        let failing = compose(
            handler(|_: Value| async { Err(Error::JobNotFound("x".into())) }),
            &[metrics(m.clone())],
        );
        let _ = failing.call(json!({})).await;

        let snap = m.snapshot();
        assert_eq!(snap.started, 2);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.failed, 1);
    }

    #[tokio::test]
    async fn compose_applies_outermost_middleware_first() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mk = |name: &'static str, order: Arc<std::sync::Mutex<Vec<&'static str>>>| -> Middleware {
            Arc::new(move |inner: Arc<dyn Handler>| {
                let order = order.clone();
                struct Wrap {
                    name: &'static str,
                    order: Arc<std::sync::Mutex<Vec<&'static str>>>,
                    inner: Arc<dyn Handler>,
                }
                #[async_trait]
                impl Handler for Wrap {
                    async fn call(&self, payload: Value) -> Result<()> {
                        self.order.lock().unwrap().push(self.name);
                        self.inner.call(payload).await
                    }
                }
                Arc::new(Wrap { name, order, inner })
            })
        };

        let wrapped = compose(ok_handler(), &[mk("outer", order.clone()), mk("inner", order.clone())]);
        wrapped.call(json!({})).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["outer", "inner"]);
    }
}
