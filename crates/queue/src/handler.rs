//! Type-erased task handlers: the queue core stores `Arc<dyn Handler>` per
//! task name, but application code registers ordinary `async fn(T) ->
//! Result<()>` functions over a deserializable payload type.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use signalq_core::{Error, Result};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A task handler, already erased to its JSON payload.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, payload: Value) -> Result<()>;
}

/// Wraps a typed async function as a [`Handler`], decoding the job's JSON
/// payload into `T` before invoking it.
struct TypedHandler<T, F> {
    func: F,
    _marker: PhantomData<fn(T)>,
}

#[async_trait]
impl<T, F, Fut> Handler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn call(&self, payload: Value) -> Result<()> {
        let decoded: T = serde_json::from_value(payload)
            .map_err(|e| Error::InvalidJobPayload(e.to_string()))?;
        (self.func)(decoded).await
    }
}

/// Erase a typed handler function into an `Arc<dyn Handler>`.
pub fn handler<T, F, Fut>(func: F) -> Arc<dyn Handler>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(TypedHandler {
        func,
        _marker: PhantomData,
    })
}

/// Maps task names to the handler that runs them.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: std::collections::HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T, F, Fut>(&mut self, task: impl Into<String>, func: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(task.into(), handler(func));
    }

    pub fn get(&self, task: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(task).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct SendEmail {
        to: String,
    }

    #[tokio::test]
    async fn registered_handler_decodes_payload_and_runs() {
        let mut registry = HandlerRegistry::new();
        registry.register("send_email", |payload: SendEmail| async move {
            assert_eq!(payload.to, "a@example.com");
            Ok(())
        });

        let handler = registry.get("send_email").unwrap();
        handler.call(json!({"to": "a@example.com"})).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_payload_yields_invalid_job_payload_error() {
        let mut registry = HandlerRegistry::new();
        registry.register("send_email", |_: SendEmail| async move { Ok(()) });

        let handler = registry.get("send_email").unwrap();
        let err = handler.call(json!({"wrong_field": 1})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidJobPayload(_)));
    }

    #[test]
    fn unknown_task_has_no_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("nope").is_none());
    }
}
