//! Fallbacks for graceful degradation.
//!
//! A fallback stands in for a service whose calls cannot be completed
//! (breaker open, no live endpoint, every attempt failed). It only runs for
//! services whose command has `fallback_enabled`.
//!
//! ## Example
//!
//! ```rust,ignore
//! invoker.fallbacks().register("recommendations.list", Fallback::value(json!([])));
//!
//! invoker.fallbacks().register(
//!     "user.get",
//!     Fallback::new(|message| async move {
//!         Ok(json!({ "id": message.parameters.get("id"), "name": "unknown" }))
//!     }),
//! );
//! ```

use crate::error::{Result, RpcError};
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;
use trellis_core::InvokeMessage;

/// Type alias for an async fallback function.
pub type FallbackFn = Arc<dyn Fn(InvokeMessage) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Alternative result source for one service.
#[derive(Clone)]
pub struct Fallback {
    fallback: FallbackFn,
    name: String,
}

impl Fallback {
    /// Create a fallback from an async function of the failed call.
    pub fn new<F, Fut>(fallback: F) -> Self
    where
        F: Fn(InvokeMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            fallback: Arc::new(move |message: InvokeMessage| -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> {
                Box::pin(fallback(message))
            }),
            name: "default".to_string(),
        }
    }

    /// Create a fallback that returns a constant value.
    pub fn value(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self::new(move |_| {
            let v = value.clone();
            async move { Ok(v) }
        })
        .with_name("constant")
    }

    /// Set the fallback name for logging.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Produce the substitute result for `message`.
    pub async fn call(&self, message: InvokeMessage) -> Result<Value> {
        (self.fallback)(message).await
    }

    /// Replace `error` with the fallback result if the error allows it.
    pub async fn recover(&self, message: InvokeMessage, error: RpcError) -> Result<Value> {
        if !error.allows_fallback() {
            return Err(error);
        }
        debug!(
            service_id = %message.service_id,
            name = %self.name,
            error = %error,
            "Call failed, using fallback"
        );
        self.call(message).await
    }
}

/// Fallbacks keyed by service id.
#[derive(Default)]
pub struct FallbackRegistry {
    fallbacks: DashMap<String, Fallback>,
}

impl FallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service_id: impl Into<String>, fallback: Fallback) {
        self.fallbacks.insert(service_id.into(), fallback);
    }

    pub fn remove(&self, service_id: &str) -> Option<Fallback> {
        self.fallbacks.remove(service_id).map(|(_, fallback)| fallback)
    }

    pub fn get(&self, service_id: &str) -> Option<Fallback> {
        self.fallbacks.get(service_id).map(|f| f.clone())
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.fallbacks.contains_key(service_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_constant_fallback() {
        let fallback = Fallback::value(json!([]));
        let result = fallback.call(InvokeMessage::new("list")).await.unwrap();
        assert_eq!(result, json!([]));
        assert_eq!(fallback.name(), "constant");
    }

    #[tokio::test]
    async fn test_fallback_sees_the_call() {
        let fallback = Fallback::new(|message: InvokeMessage| async move {
            Ok(json!({ "echo": message.parameters.get("id").cloned() }))
        });

        let mut message = InvokeMessage::new("user.get");
        message.parameters.insert("id".into(), json!(7));
        assert_eq!(fallback.call(message).await.unwrap(), json!({"echo": 7}));
    }

    #[tokio::test]
    async fn test_recover_only_for_unavailability() {
        let fallback = Fallback::value("cached");

        let recovered = fallback
            .recover(InvokeMessage::new("a"), RpcError::CircuitOpen("a".into()))
            .await;
        assert_eq!(recovered.unwrap(), json!("cached"));

        let recovered = fallback
            .recover(InvokeMessage::new("a"), RpcError::Timeout(Duration::from_millis(1)))
            .await;
        assert!(recovered.is_ok());

        let kept = fallback
            .recover(
                InvokeMessage::new("a"),
                RpcError::Remote {
                    code: 400,
                    message: "bad input".into(),
                },
            )
            .await;
        assert!(matches!(kept, Err(RpcError::Remote { code: 400, .. })));
    }

    #[test]
    fn test_registry() {
        let registry = FallbackRegistry::new();
        registry.register("a", Fallback::value(1));
        assert!(registry.contains("a"));
        assert!(registry.get("b").is_none());
        assert!(registry.remove("a").is_some());
        assert!(!registry.contains("a"));
    }
}
