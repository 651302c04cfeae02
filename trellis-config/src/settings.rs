// Trellis settings tree

use crate::validation::{ConfigValidator, Validate};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use trellis_core::logging::LogConfig;
use trellis_core::ServiceCommand;

/// Where routes and commands live in the coordination backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Parent node of one child per published route.
    pub route_root: String,
    /// Parent node of one child per service command override.
    pub command_root: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            route_root: "/trellis/routes".to_string(),
            command_root: "/trellis/commands".to_string(),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// Time between probe cycles.
    pub probe_interval_ms: u64,
    /// Deadline for a single probe.
    pub probe_timeout_ms: u64,
    /// Consecutive failures after which an endpoint is evicted.
    pub eviction_threshold: u32,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_interval_ms: 10_000,
            probe_timeout_ms: 3_000,
            eviction_threshold: 6,
        }
    }
}

impl HealthSettings {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Hash ring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RingSettings {
    /// Virtual entries per endpoint.
    pub replication_factor: usize,
}

impl Default for RingSettings {
    fn default() -> Self {
        Self {
            replication_factor: trellis_core::selector::DEFAULT_REPLICATION_FACTOR,
        }
    }
}

/// Invocation pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvokerSettings {
    /// Lifetime of cached results.
    pub result_cache_ttl_ms: u64,
    /// Maximum cached results.
    pub result_cache_capacity: usize,
}

impl Default for InvokerSettings {
    fn default() -> Self {
        Self {
            result_cache_ttl_ms: 30_000,
            result_cache_capacity: 1024,
        }
    }
}

impl InvokerSettings {
    pub fn result_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.result_cache_ttl_ms)
    }
}

/// Service command defaults and per-service overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSettings {
    /// Command used for services without an override.
    pub default: ServiceCommand,
    /// Overrides keyed by service id.
    pub overrides: HashMap<String, ServiceCommand>,
}

impl CommandSettings {
    /// Command configured for a service id.
    pub fn command_for(&self, service_id: &str) -> &ServiceCommand {
        self.overrides.get(service_id).unwrap_or(&self.default)
    }
}

/// Complete settings for a Trellis node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrellisSettings {
    pub registry: RegistrySettings,
    pub health: HealthSettings,
    pub ring: RingSettings,
    pub invoker: InvokerSettings,
    pub commands: CommandSettings,
    pub logging: LogConfig,
}

fn validate_command(command: &ServiceCommand, field: &str) -> Result<()> {
    ConfigValidator::in_range(
        command.breaker_error_threshold_percentage,
        0,
        100,
        &format!("{}.breaker_error_threshold_percentage", field),
    )?;
    ConfigValidator::positive(command.execution_timeout_ms, &format!("{}.execution_timeout_ms", field))?;
    ConfigValidator::positive(command.failover_cluster, &format!("{}.failover_cluster", field))?;
    ConfigValidator::positive(
        command.max_concurrent_requests,
        &format!("{}.max_concurrent_requests", field),
    )?;
    ConfigValidator::not_both(
        command.breaker_force_open,
        command.breaker_force_closed,
        &format!("{}.breaker_force_open", field),
        &format!("{}.breaker_force_closed", field),
    )
}

impl Validate for TrellisSettings {
    fn validate(&self) -> Result<()> {
        ConfigValidator::is_node_path(&self.registry.route_root, "registry.route_root")?;
        ConfigValidator::is_node_path(&self.registry.command_root, "registry.command_root")?;

        ConfigValidator::positive(self.health.probe_interval_ms, "health.probe_interval_ms")?;
        ConfigValidator::positive(self.health.probe_timeout_ms, "health.probe_timeout_ms")?;
        ConfigValidator::positive(self.health.eviction_threshold, "health.eviction_threshold")?;

        ConfigValidator::in_range(self.ring.replication_factor, 1, 100_000, "ring.replication_factor")?;
        ConfigValidator::positive(self.invoker.result_cache_capacity, "invoker.result_cache_capacity")?;

        validate_command(&self.commands.default, "commands.default")?;
        for (id, command) in &self.commands.overrides {
            validate_command(command, &format!("commands.overrides.{}", id))?;
        }
        Ok(())
    }
}
