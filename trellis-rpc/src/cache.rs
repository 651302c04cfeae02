//! Result cache for services with `request_cache_enabled`.

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;
use trellis_core::InvokeMessage;

struct CachedResult {
    value: Value,
    expires_at: Instant,
}

/// Bounded, time-limited cache of successful call results.
pub struct ResultCache {
    entries: Mutex<LruCache<String, CachedResult>>,
    ttl: Duration,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Cache key of a call: service id, routing key and parameters.
    pub fn key(message: &InvokeMessage) -> String {
        let parameters = serde_json::to_string(&message.parameters).unwrap_or_default();
        format!("{}|{}|{}", message.service_id, message.routing_key(), parameters)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => return Some(cached.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub fn insert(&self, key: String, value: Value) {
        let cached = CachedResult {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().put(key, cached);
    }

    /// Drop every cached result of one service.
    pub fn invalidate_service(&self, service_id: &str) {
        let prefix = format!("{}|", service_id);
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            entries.pop(&key);
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
