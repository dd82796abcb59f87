//! Configuration loading and validation.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::StepwiseConfig;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load and validate configuration from a YAML file.
pub fn load_config(path: &Path) -> Result<StepwiseConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(content: &str) -> Result<StepwiseConfig, ConfigError> {
    // An empty document deserializes to unit, not to an all-defaults struct.
    let config: StepwiseConfig = if content.trim().is_empty() {
        StepwiseConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &StepwiseConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.scheduler.max_parallel == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.max_parallel must be > 0".to_string(),
        ));
    }
    if config.scheduler.step_timeout_ms == Some(0) {
        return Err(ConfigError::Invalid(
            "scheduler.step_timeout_ms must be > 0 when set".to_string(),
        ));
    }

    let retry = &config.scheduler.retry;
    if retry.max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.retry.max_attempts must be > 0".to_string(),
        ));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ConfigError::Invalid(format!(
            "scheduler.retry.max_delay_ms ({}) must be >= base_delay_ms ({})",
            retry.max_delay_ms, retry.base_delay_ms
        )));
    }

    if config.pool.hard_ceiling == 0 {
        return Err(ConfigError::Invalid(
            "pool.hard_ceiling must be > 0".to_string(),
        ));
    }

    if config.approval.timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "approval.timeout_ms must be > 0".to_string(),
        ));
    }

    let channel = &config.channel;
    if channel.probe_interval_ms == 0 || channel.probe_timeout_ms == 0 {
        return Err(ConfigError::Invalid(
            "channel probe interval and timeout must be > 0".to_string(),
        ));
    }
    if channel.event_buffer == 0 || channel.outbound_buffer == 0 {
        return Err(ConfigError::Invalid(
            "channel buffers must be > 0".to_string(),
        ));
    }

    let level = config.observability.log_level.trim().to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(ConfigError::Invalid(format!(
            "observability.log_level '{}' is not one of {}",
            config.observability.log_level,
            LOG_LEVELS.join(", ")
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_validate_config_accepts_defaults() {
        let config = StepwiseConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.scheduler.max_parallel, 4);
        assert_eq!(config.scheduler.retry.max_attempts, 3);
        assert_eq!(config.approval.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_partial_config_fills_defaults() {
        let config = parse_config(
            r#"
scheduler:
  max_parallel: 3
  step_timeout_ms: 1500
  retry:
    max_attempts: 5
pool:
  hard_ceiling: 2
observability:
  log_level: DEBUG
"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.max_parallel, 3);
        assert_eq!(config.scheduler.step_timeout(), Some(Duration::from_millis(1500)));
        assert_eq!(config.scheduler.retry.max_attempts, 5);
        assert_eq!(config.scheduler.retry.base_delay_ms, 200);
        assert_eq!(config.pool.hard_ceiling, 2);
        assert_eq!(config.pool.shutdown_grace_ms, 5_000);
        assert_eq!(config.channel.probe_interval_ms, 10_000);
    }

    #[test]
    fn test_empty_document_is_default() {
        let config = parse_config("   \n").unwrap();
        assert_eq!(config.version, 1);
    }

    #[test]
    fn test_validate_config_rejects_zero_limits() {
        let mut config = StepwiseConfig::default();
        config.scheduler.max_parallel = 0;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = StepwiseConfig::default();
        config.scheduler.retry.max_delay_ms = 10;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::Invalid(_))
        ));

        assert!(matches!(
            parse_config("pool:\n  hard_ceiling: 0\n"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_config_rejects_unknown_log_level() {
        let err = parse_config("observability:\n  log_level: loud\n").unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_load_config_reads_file() {
        let path = std::env::temp_dir().join(format!("stepwise-config-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "approval:\n  timeout_ms: 1000").unwrap();
        drop(file);

        let config = load_config(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.approval.timeout_ms, 1000);

        assert!(matches!(
            load_config(Path::new("/nonexistent/stepwise.yaml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        assert!(matches!(
            parse_config("scheduler: [unclosed"),
            Err(ConfigError::Parse(_))
        ));
    }
}
