// Environment variable overrides

use crate::loader::merge_values;
use crate::{ConfigError, Result};
use serde_json::{Map, Value};
use std::env;

/// Default prefix for override variables.
pub const DEFAULT_PREFIX: &str = "TRELLIS";

/// Turns prefixed environment variables into a settings overlay.
///
/// `TRELLIS_HEALTH__PROBE_INTERVAL_MS=500` becomes
/// `{"health": {"probe_interval_ms": 500}}`: the prefix and one `_` are
/// stripped, `__` separates nesting levels, keys are lower-cased. Values
/// that parse as JSON (numbers, booleans, arrays, objects) keep their type;
/// anything else is a string.
pub struct EnvLoader {
    prefix: String,
}

impl EnvLoader {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Build the overlay from the process environment
    pub fn load(&self) -> Result<Value> {
        self.load_from(env::vars())
    }

    /// Build the overlay from an explicit variable list
    pub fn load_from<I, K, V>(&self, vars: I) -> Result<Value>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let marker = format!("{}_", self.prefix);
        let mut overlay = Value::Object(Map::new());

        for (key, value) in vars {
            let key = key.as_ref();
            let Some(path) = key.strip_prefix(&marker) else {
                continue;
            };

            let segments: Vec<String> = path.split("__").map(|s| s.to_lowercase()).collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(ConfigError::EnvOverride {
                    key: key.to_string(),
                    reason: "empty path segment".to_string(),
                });
            }

            merge_values(&mut overlay, nest(&segments, parse_scalar(value.as_ref())));
        }

        Ok(overlay)
    }

    /// Load a `.env` file into the process environment first
    pub fn load_dotenv(path: Option<&str>) -> Result<()> {
        match path {
            Some(path) => {
                dotenvy::from_path(path).map_err(|e| ConfigError::LoadError(e.to_string()))?;
            }
            None => {
                // A missing .env is fine
                dotenvy::dotenv().ok();
            }
        }
        Ok(())
    }
}

impl Default for EnvLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

fn parse_scalar(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn nest(segments: &[String], leaf: Value) -> Value {
    segments.iter().rev().fold(leaf, |inner, segment| {
        let mut map = Map::new();
        map.insert(segment.clone(), inner);
        Value::Object(map)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_override() {
        let loader = EnvLoader::default();
        let overlay = loader
            .load_from(vec![
                ("TRELLIS_HEALTH__PROBE_INTERVAL_MS", "500"),
                ("TRELLIS_REGISTRY__ROUTE_ROOT", "/svc/routes"),
                ("TRELLIS_COMMANDS__DEFAULT__FALLBACK_ENABLED", "true"),
                ("PATH", "/usr/bin"),
            ])
            .unwrap();

        assert_eq!(overlay["health"]["probe_interval_ms"], 500);
        assert_eq!(overlay["registry"]["route_root"], "/svc/routes");
        assert_eq!(overlay["commands"]["default"]["fallback_enabled"], true);
        assert!(overlay.get("path").is_none());
    }

    #[test]
    fn test_custom_prefix() {
        let loader = EnvLoader::new("MY_APP");
        let overlay = loader
            .load_from(vec![("MY_APP_RING__REPLICATION_FACTOR", "16"), ("TRELLIS_RING__REPLICATION_FACTOR", "1")])
            .unwrap();

        assert_eq!(overlay["ring"]["replication_factor"], 16);
    }

    #[test]
    fn test_empty_segment_is_rejected() {
        let loader = EnvLoader::default();
        let result = loader.load_from(vec![("TRELLIS_HEALTH____X", "1")]);
        assert!(matches!(result, Err(ConfigError::EnvOverride { .. })));
    }

    #[test]
    fn test_non_json_values_stay_strings() {
        assert_eq!(parse_scalar("hello world"), Value::String("hello world".into()));
        assert_eq!(parse_scalar("42"), Value::from(42));
        assert_eq!(parse_scalar("false"), Value::Bool(false));
    }
}
