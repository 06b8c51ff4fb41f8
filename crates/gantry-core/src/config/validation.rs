//! Configuration validation

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::types::{Config, ExecutionConfig};

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    debug!("validating configuration");
    validate_execution(&config.execution)?;
    validate_logging(config)?;
    debug!("configuration validation passed");
    Ok(())
}

/// Validate execution settings on their own (used after CLI overrides)
pub fn validate_execution(execution: &ExecutionConfig) -> Result<()> {
    if let Some(tag) = execution.tag_include.intersection(&execution.tag_exclude).next() {
        return Err(ConfigError::InvalidValue {
            field: "execution.tag_include".to_string(),
            message: format!("tag '{}' is both included and excluded", tag),
        }
        .into());
    }

    for (field, value) in [
        ("execution.unit_timeout", execution.unit_timeout),
        ("execution.partition_timeout", execution.partition_timeout),
    ] {
        if value == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "timeout must be greater than zero".to_string(),
            }
            .into());
        }
    }

    for (i, pattern) in execution.services.iter().enumerate() {
        if pattern.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: format!("execution.services[{}]", i),
                message: "service pattern cannot be empty".to_string(),
            }
            .into());
        }
    }

    Ok(())
}

fn validate_logging(config: &Config) -> Result<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", valid_levels.join(", ")),
        }
        .into());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        let config = Config::default();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_conflicting_tags() {
        let mut config = Config::default();
        config.execution.tag_include.insert("smoke".to_string());
        config.execution.tag_exclude.insert("smoke".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.execution.partition_timeout = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_empty_service_pattern() {
        let mut config = Config::default();
        config.execution.services.push("  ".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(validate_config(&config).is_err());
    }
}
