//! Layered settings for Trellis.
//!
//! Settings are assembled from, in increasing precedence:
//!
//! 1. built-in defaults ([`TrellisSettings::default`])
//! 2. a JSON or TOML file (format picked by extension)
//! 3. `TRELLIS_`-prefixed environment variables, `__` separating levels
//!    (`TRELLIS_HEALTH__PROBE_INTERVAL_MS=500`)
//!
//! and validated before use.
//!
//! ```rust,ignore
//! use trellis_config::{ConfigManager, TrellisSettings};
//!
//! let settings: TrellisSettings = ConfigManager::new()
//!     .load_file("trellis.toml")?
//!     .load_env()?
//!     .build()?;
//! ```

pub mod env;
pub mod error;
pub mod loader;
pub mod settings;
pub mod validation;

pub use env::{DEFAULT_PREFIX, EnvLoader};
pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FileFormat, merge_values};
pub use settings::{
    CommandSettings, HealthSettings, InvokerSettings, RegistrySettings, RingSettings, TrellisSettings,
};
pub use validation::{ConfigValidator, Validate};

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Accumulates settings layers and produces a validated settings value.
#[derive(Clone)]
pub struct ConfigManager {
    tree: Arc<RwLock<Value>>,
    env_prefix: String,
}

impl ConfigManager {
    /// Start from the built-in defaults.
    pub fn new() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }

    /// Start from the built-in defaults with a custom env prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        let defaults = serde_json::to_value(TrellisSettings::default())
            .unwrap_or_else(|_| Value::Object(Default::default()));
        Self {
            tree: Arc::new(RwLock::new(defaults)),
            env_prefix: prefix.into(),
        }
    }

    /// Merge a settings file on top of the current layers.
    pub fn load_file(self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = ConfigLoader::auto(path)?.load_file(path)?;
        info!(path = %path.display(), "Loaded settings file");
        self.merge(data);
        Ok(self)
    }

    /// Merge settings text in the given format.
    pub fn load_str(self, content: &str, format: FileFormat) -> Result<Self> {
        let data = ConfigLoader::new(format).parse(content)?;
        self.merge(data);
        Ok(self)
    }

    /// Merge overrides from the process environment.
    pub fn load_env(self) -> Result<Self> {
        let overlay = EnvLoader::new(self.env_prefix.clone()).load()?;
        self.merge(overlay);
        Ok(self)
    }

    /// Load a `.env` file, then merge environment overrides.
    pub fn load_dotenv(self, path: Option<&str>) -> Result<Self> {
        EnvLoader::load_dotenv(path)?;
        self.load_env()
    }

    /// Merge overrides from an explicit variable list.
    pub fn load_vars<I, K, V>(self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let overlay = EnvLoader::new(self.env_prefix.clone()).load_from(vars)?;
        self.merge(overlay);
        Ok(self)
    }

    /// Set one value by dotted path (`health.eviction_threshold`).
    pub fn set<T: Serialize>(&self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value).map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        let overlay = key
            .split('.')
            .rev()
            .fold(value, |inner, segment| {
                let mut map = serde_json::Map::new();
                map.insert(segment.to_string(), inner);
                Value::Object(map)
            });
        self.merge(overlay);
        Ok(())
    }

    /// Read one value by dotted path.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let tree = self.tree.read();
        let pointer = format!("/{}", key.replace('.', "/"));
        let value = tree
            .pointer(&pointer)
            .ok_or_else(|| ConfigError::LoadError(format!("Configuration key not found: {}", key)))?;

        serde_json::from_value(value.clone()).map_err(|e| ConfigError::DeserializationError(e.to_string()))
    }

    /// Whether a dotted path exists.
    pub fn has(&self, key: &str) -> bool {
        self.tree.read().pointer(&format!("/{}", key.replace('.', "/"))).is_some()
    }

    /// Deserialize and validate the accumulated tree.
    pub fn load_validated<T: DeserializeOwned + Validate>(&self) -> Result<T> {
        let tree = self.tree.read().clone();
        let settings: T =
            serde_json::from_value(tree).map_err(|e| ConfigError::DeserializationError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Produce validated [`TrellisSettings`].
    pub fn build(&self) -> Result<TrellisSettings> {
        let settings: TrellisSettings = self.load_validated()?;
        debug!(
            route_root = %settings.registry.route_root,
            probe_interval_ms = settings.health.probe_interval_ms,
            overrides = settings.commands.overrides.len(),
            "Settings resolved"
        );
        Ok(settings)
    }

    fn merge(&self, overlay: Value) {
        merge_values(&mut self.tree.write(), overlay);
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TrellisSettings {
    /// Defaults, then `path` (if any), then `TRELLIS_` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let manager = ConfigManager::new();
        let manager = match path {
            Some(path) => manager.load_file(path)?,
            None => manager,
        };
        manager.load_env()?.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use trellis_core::FailoverStrategy;

    #[test]
    fn test_defaults_only() {
        let settings = ConfigManager::new().build().unwrap();
        assert_eq!(settings, TrellisSettings::default());
    }

    #[test]
    fn test_layers_apply_in_order() {
        let toml = r#"
            [health]
            probe_interval_ms = 2000
            eviction_threshold = 3

            [commands.overrides."order.create"]
            strategy = "FailFast"
        "#;

        let settings = ConfigManager::new()
            .load_str(toml, FileFormat::Toml)
            .unwrap()
            .load_vars(vec![("TRELLIS_HEALTH__PROBE_INTERVAL_MS", "500")])
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(settings.health.probe_interval_ms, 500);
        assert_eq!(settings.health.eviction_threshold, 3);
        assert_eq!(settings.health.probe_timeout_ms, 3000);
        assert_eq!(
            settings.commands.command_for("order.create").strategy,
            FailoverStrategy::FailFast
        );
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let result = ConfigManager::new()
            .load_vars(vec![("TRELLIS_RING__REPLICATION_FACTOR", "0")])
            .unwrap()
            .build();

        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_wrong_type_is_a_deserialization_error() {
        let result = ConfigManager::new()
            .load_vars(vec![("TRELLIS_HEALTH__EVICTION_THRESHOLD", "many")])
            .unwrap()
            .build();

        assert!(matches!(result, Err(ConfigError::DeserializationError(_))));
    }

    #[test]
    fn test_set_and_get() {
        let manager = ConfigManager::new();
        manager.set("registry.route_root", "/x/routes").unwrap();

        let root: String = manager.get("registry.route_root").unwrap();
        assert_eq!(root, "/x/routes");
        assert_eq!(manager.get::<u64>("health.probe_interval_ms").unwrap(), 10_000);
        assert!(manager.has("ring.replication_factor"));
        assert!(!manager.has("ring.missing"));
        assert!(manager.get::<u64>("ring.missing").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"registry": {{"command_root": "/cmds"}}}}"#).unwrap();

        let settings = ConfigManager::new().load_file(file.path()).unwrap().build().unwrap();
        assert_eq!(settings.registry.command_root, "/cmds");
        assert_eq!(settings.registry.route_root, "/trellis/routes");
    }
}
