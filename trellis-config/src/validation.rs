// Settings validation

use crate::{ConfigError, Result};

/// Trait for validating settings
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reusable validation rules
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate that a value is not empty
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::validation(format!("{} cannot be empty", field)));
        }
        Ok(())
    }

    /// Validate that a registry path is absolute and has no trailing `/`
    pub fn is_node_path(value: &str, field: &str) -> Result<()> {
        Self::not_empty(value, field)?;
        if !value.starts_with('/') || (value.len() > 1 && value.ends_with('/')) {
            return Err(ConfigError::validation(format!(
                "{} must start with '/' and not end with '/': {}",
                field, value
            )));
        }
        Ok(())
    }

    /// Validate that a number is within range
    pub fn in_range<T>(value: T, min: T, max: T, field: &str) -> Result<()>
    where
        T: PartialOrd + std::fmt::Display,
    {
        if value < min || value > max {
            return Err(ConfigError::validation(format!(
                "{} must be between {} and {}, got {}",
                field, min, max, value
            )));
        }
        Ok(())
    }

    /// Validate that a number is at least 1
    pub fn positive<T>(value: T, field: &str) -> Result<()>
    where
        T: PartialOrd + Default + std::fmt::Display,
    {
        if value <= T::default() {
            return Err(ConfigError::validation(format!(
                "{} must be greater than zero, got {}",
                field, value
            )));
        }
        Ok(())
    }

    /// Validate that two flags are not both set
    pub fn not_both(a: bool, b: bool, field_a: &str, field_b: &str) -> Result<()> {
        if a && b {
            return Err(ConfigError::validation(format!(
                "{} and {} cannot both be set",
                field_a, field_b
            )));
        }
        Ok(())
    }
}
