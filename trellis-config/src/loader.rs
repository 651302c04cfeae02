// Settings file loaders

use crate::{ConfigError, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Supported settings file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Toml,
}

impl FileFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "json" => Some(FileFormat::Json),
            "toml" => Some(FileFormat::Toml),
            _ => None,
        }
    }
}

/// Settings file loader
pub struct ConfigLoader {
    format: FileFormat,
}

impl ConfigLoader {
    pub fn new(format: FileFormat) -> Self {
        Self { format }
    }

    /// Pick the format from the file extension
    pub fn auto(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ConfigError::LoadError(format!("No file extension on {}", path.display())))?;

        let format = FileFormat::from_extension(ext)
            .ok_or_else(|| ConfigError::LoadError(format!("Unsupported format: {}", ext)))?;

        Ok(Self::new(format))
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    /// Load a settings tree from file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Value> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::LoadError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        self.parse(&content)
    }

    /// Parse a settings tree from a string
    pub fn parse(&self, content: &str) -> Result<Value> {
        let value = match self.format {
            FileFormat::Json => serde_json::from_str(content)
                .map_err(|e| ConfigError::ParseError(format!("JSON parse error: {}", e)))?,
            FileFormat::Toml => {
                let toml_value: toml::Value = toml::from_str(content)
                    .map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;
                serde_json::to_value(toml_value)
                    .map_err(|e| ConfigError::ParseError(format!("TOML conversion error: {}", e)))?
            }
        };

        if !value.is_object() {
            return Err(ConfigError::ParseError(
                "settings document must be a table/object".to_string(),
            ));
        }
        Ok(value)
    }
}

/// Recursively merge `overlay` into `base`; objects merge key by key,
/// anything else is replaced.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_json() {
        let loader = ConfigLoader::new(FileFormat::Json);
        let result = loader.parse(r#"{"health": {"eviction_threshold": 4}}"#).unwrap();
        assert_eq!(result["health"]["eviction_threshold"], 4);
    }

    #[test]
    fn test_parse_toml() {
        let loader = ConfigLoader::new(FileFormat::Toml);
        let toml = r#"
            [registry]
            route_root = "/svc/routes"

            [ring]
            replication_factor = 64
        "#;

        let result = loader.parse(toml).unwrap();
        assert_eq!(result["registry"]["route_root"], "/svc/routes");
        assert_eq!(result["ring"]["replication_factor"], 64);
    }

    #[test]
    fn test_rejects_non_object_document() {
        let loader = ConfigLoader::new(FileFormat::Json);
        assert!(matches!(loader.parse("[1, 2]"), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(FileFormat::from_extension("JSON"), Some(FileFormat::Json));
        assert_eq!(FileFormat::from_extension("toml"), Some(FileFormat::Toml));
        assert_eq!(FileFormat::from_extension("yaml"), None);

        assert_eq!(ConfigLoader::auto("trellis.toml").unwrap().format(), FileFormat::Toml);
        assert!(ConfigLoader::auto("trellis").is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"ring": {{"replication_factor": 10}}}}"#).unwrap();

        let loader = ConfigLoader::auto(file.path()).unwrap();
        let value = loader.load_file(file.path()).unwrap();
        assert_eq!(value["ring"]["replication_factor"], 10);

        assert!(loader.load_file("/nonexistent/trellis.json").is_err());
    }

    #[test]
    fn test_merge_values() {
        let mut base = json!({"health": {"probe_interval_ms": 10000, "eviction_threshold": 6}});
        merge_values(&mut base, json!({"health": {"eviction_threshold": 3}, "ring": {"replication_factor": 8}}));

        assert_eq!(base["health"]["probe_interval_ms"], 10000);
        assert_eq!(base["health"]["eviction_threshold"], 3);
        assert_eq!(base["ring"]["replication_factor"], 8);
    }
}
