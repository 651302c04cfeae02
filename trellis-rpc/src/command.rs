//! Per-service command resolution.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::ServiceCommand;
use trellis_discovery::CoordinationBackend;
use trellis_discovery::backend::child_path;

/// Resolves the [`ServiceCommand`] for a service id.
///
/// Lookup order: local overrides, then the command node
/// `<command_root>/<service_id>` in the coordination backend, then the
/// default command. The first resolution per service id is cached, unless
/// the backend could not be read: that call gets the default and the next
/// one asks the backend again.
pub struct ServiceCommandProvider {
    default: ServiceCommand,
    overrides: HashMap<String, ServiceCommand>,
    backend: Option<(Arc<dyn CoordinationBackend>, String)>,
    cache: DashMap<String, Arc<ServiceCommand>>,
}

impl ServiceCommandProvider {
    pub fn new(default: ServiceCommand) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
            backend: None,
            cache: DashMap::new(),
        }
    }

    /// Add local per-service overrides.
    pub fn with_overrides(mut self, overrides: HashMap<String, ServiceCommand>) -> Self {
        self.overrides.extend(overrides);
        self
    }

    /// Add a single override.
    pub fn with_override(mut self, service_id: impl Into<String>, command: ServiceCommand) -> Self {
        self.overrides.insert(service_id.into(), command);
        self
    }

    /// Read commands published under `command_root`.
    pub fn with_backend(mut self, backend: Arc<dyn CoordinationBackend>, command_root: impl Into<String>) -> Self {
        self.backend = Some((backend, command_root.into()));
        self
    }

    pub fn default_command(&self) -> &ServiceCommand {
        &self.default
    }

    /// Command for a service id.
    pub async fn command(&self, service_id: &str) -> Arc<ServiceCommand> {
        if let Some(cached) = self.cache.get(service_id) {
            return cached.clone();
        }

        let command = match self.overrides.get(service_id) {
            Some(command) => command.clone(),
            None => match self.load_published(service_id).await {
                Published::Found(command) => command,
                Published::Absent => self.default.clone(),
                Published::Unavailable => {
                    debug!(service_id, "Using default command until the backend is readable");
                    return Arc::new(self.default.clone());
                }
            },
        };

        debug!(service_id, strategy = ?command.strategy, shunt = ?command.shunt_strategy, "Resolved service command");
        self.cache
            .entry(service_id.to_string())
            .or_insert_with(|| Arc::new(command))
            .clone()
    }

    async fn load_published(&self, service_id: &str) -> Published {
        let Some((backend, root)) = self.backend.as_ref() else {
            return Published::Absent;
        };
        let path = child_path(root, service_id);

        match backend.read(&path).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(command) => Published::Found(command),
                Err(err) => {
                    warn!(service_id, path = %path, error = %err, "Ignoring unreadable service command");
                    Published::Absent
                }
            },
            Ok(None) => Published::Absent,
            Err(err) => {
                warn!(service_id, path = %path, error = %err, "Failed to read service command");
                Published::Unavailable
            }
        }
    }

    /// Drop the cached command of one service.
    pub fn invalidate(&self, service_id: &str) {
        self.cache.remove(service_id);
    }

    /// Drop every cached command.
    pub fn clear(&self) {
        self.cache.clear();
    }
}

enum Published {
    Found(ServiceCommand),
    Absent,
    /// The backend read failed; nothing is known either way.
    Unavailable,
}

impl Default for ServiceCommandProvider {
    fn default() -> Self {
        Self::new(ServiceCommand::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{FailoverStrategy, ShuntStrategy};
    use trellis_discovery::InMemoryBackend;

    #[tokio::test]
    async fn test_default_command() {
        let provider = ServiceCommandProvider::default();
        let command = provider.command("user.get").await;
        assert_eq!(command.failover_cluster, 3);
        assert_eq!(command.shunt_strategy, ShuntStrategy::HashAlgorithm);
    }

    #[tokio::test]
    async fn test_lookup_order() {
        let backend = InMemoryBackend::new();
        let published = ServiceCommand::default().shunt_strategy(ShuntStrategy::Polling);
        backend
            .write("/trellis/commands/a", serde_json::to_vec(&published).unwrap())
            .await
            .unwrap();
        backend
            .write("/trellis/commands/b", serde_json::to_vec(&published).unwrap())
            .await
            .unwrap();

        let provider = ServiceCommandProvider::default()
            .with_override("b", ServiceCommand::default().strategy(FailoverStrategy::FailFast))
            .with_backend(Arc::new(backend), "/trellis/commands");

        assert_eq!(provider.command("a").await.shunt_strategy, ShuntStrategy::Polling);
        assert_eq!(provider.command("b").await.strategy, FailoverStrategy::FailFast);
        assert_eq!(provider.command("b").await.shunt_strategy, ShuntStrategy::HashAlgorithm);
        assert_eq!(provider.command("c").await.shunt_strategy, ShuntStrategy::HashAlgorithm);
    }

    #[tokio::test]
    async fn test_commands_are_cached() {
        let backend = InMemoryBackend::new();
        let provider =
            ServiceCommandProvider::default().with_backend(Arc::new(backend.clone()), "/trellis/commands");

        let first = provider.command("a").await;
        backend
            .write(
                "/trellis/commands/a",
                serde_json::to_vec(&ServiceCommand::default().failover_cluster(9)).unwrap(),
            )
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &provider.command("a").await));

        provider.invalidate("a");
        assert_eq!(provider.command("a").await.failover_cluster, 9);
    }

    #[tokio::test]
    async fn test_backend_outage_does_not_pin_default() {
        let backend = InMemoryBackend::new();
        backend
            .write(
                "/trellis/commands/a",
                serde_json::to_vec(&ServiceCommand::default().failover_cluster(7)).unwrap(),
            )
            .await
            .unwrap();
        let provider =
            ServiceCommandProvider::default().with_backend(Arc::new(backend.clone()), "/trellis/commands");

        backend.disconnect();
        assert_eq!(provider.command("a").await.failover_cluster, 3);

        backend.reconnect();
        let command = provider.command("a").await;
        assert_eq!(command.failover_cluster, 7);
        assert!(Arc::ptr_eq(&command, &provider.command("a").await));
    }

    #[tokio::test]
    async fn test_unreadable_command_falls_back_to_default() {
        let backend = InMemoryBackend::new();
        backend.write("/trellis/commands/a", b"not json".to_vec()).await.unwrap();
        let provider = ServiceCommandProvider::new(ServiceCommand::default().failover_cluster(5))
            .with_backend(Arc::new(backend), "/trellis/commands");

        assert_eq!(provider.command("a").await.failover_cluster, 5);
    }
}
