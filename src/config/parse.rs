use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::source::access_log::{is_access_log_group, ObjectLocation};
use crate::source::timestamp::TimestampExtractor;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let config = parse_config(&text).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;

    Ok(config)
}

/// Parse and validate config text. Environment variables are expanded first.
pub fn parse_config(text: &str) -> Result<Config, ConfigError> {
    let text = expand_env_vars(text);
    check_unexpanded_vars(&text)?;

    let mut config: Config = if text.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&text)?
    };

    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(text: &str) -> Result<(), ConfigError> {
    let mut unset: Vec<String> = env_var_pattern()
        .captures_iter(text)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unset.is_empty() {
        return Ok(());
    }
    unset.sort();
    unset.dedup();

    let message = if unset.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unset[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             Set them or replace them in the config file with actual values",
            unset.join(", ")
        )
    };

    Err(ConfigError::Validation(message))
}

fn expand_paths(config: &mut Config) {
    config.local.root = expand_tilde(&config.local.root);
    if let Some(access_logs) = config.access_logs.as_mut() {
        access_logs.root = expand_tilde(&access_logs.root);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_tail(&config.tail, &mut errors);
    validate_classifier(&config.classifier, &mut errors);

    if let Err(e) = TimestampExtractor::new(&config.local.timestamp.pattern, &config.local.timestamp.format) {
        errors.push(format!("local.timestamp: {}", e));
    }

    if let Some(access_logs) = &config.access_logs {
        if access_logs.listing_page_size == 0 {
            errors.push("access_logs.listing_page_size must be greater than 0".to_string());
        }
    }

    for (i, group) in config.groups.iter().enumerate() {
        validate_group(config, i, group, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

fn validate_tail(tail: &TailConfig, errors: &mut Vec<String>) {
    if tail.queue_capacity == 0 {
        errors.push("tail.queue_capacity must be greater than 0".to_string());
    }
    if tail.page_limit == 0 {
        errors.push("tail.page_limit must be greater than 0".to_string());
    }
    for (name, value) in [
        ("poll_interval", tail.poll_interval),
        ("not_found_retry_interval", tail.not_found_retry_interval),
        ("task_poll_interval", tail.task_poll_interval),
    ] {
        if value.is_zero() {
            errors.push(format!("tail.{} must be greater than 0", name));
        }
    }
}

fn validate_classifier(classifier: &ClassifierConfig, errors: &mut Vec<String>) {
    for (name, value) in [
        ("control_plane_prefix", &classifier.control_plane_prefix),
        ("lifecycle_suffix", &classifier.lifecycle_suffix),
        ("sidecar_marker", &classifier.sidecar_marker),
    ] {
        if value.is_empty() {
            errors.push(format!("classifier.{} must not be empty", name));
        }
    }
}

fn validate_group(config: &Config, index: usize, group: &GroupConfig, errors: &mut Vec<String>) {
    if group.group.trim().is_empty() {
        errors.push(format!("groups[{}]: group must not be empty", index));
        return;
    }
    if is_access_log_group(&group.group) {
        if let Err(e) = ObjectLocation::parse(&group.group) {
            errors.push(format!("groups[{}]: {}", index, e));
        }
        if config.access_logs.is_none() {
            errors.push(format!(
                "groups[{}]: '{}' needs an access_logs section",
                index, group.group
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.tail.queue_capacity, 100);
        assert!(config.groups.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "local:\n  root: /var/log/groups\ngroups:\n  - group: tenant\n    stream_prefix: web/\n"
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.local.root, Path::new("/var/log/groups"));
        assert_eq!(config.groups.len(), 1);
        assert_eq!(config.groups[0].stream_prefix.as_deref(), Some("web/"));
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/logfan.yml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/logfan.yml"));
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let err = parse_config(
            "tail:\n  queue_capacity: 0\n  page_limit: 0\nlocal:\n  timestamp:\n    pattern: '^\\d+'\n    format: epoch\ngroups:\n  - group: s3://bucket/lb\n",
        )
        .unwrap_err();

        match err {
            ConfigError::ValidationList(errors) => {
                assert_eq!(errors.len(), 4, "{:?}", errors);
                assert!(errors.iter().any(|e| e.contains("queue_capacity")));
                assert!(errors.iter().any(|e| e.contains("access_logs")));
            }
            other => panic!("expected validation list, got {:?}", other),
        }
    }

    #[test]
    fn test_env_expansion() {
        std::env::set_var("LOGFAN_TEST_ROOT", "/srv/logs");
        let config = parse_config("local:\n  root: $env{LOGFAN_TEST_ROOT}/groups\n").unwrap();
        assert_eq!(config.local.root, Path::new("/srv/logs/groups"));
        std::env::remove_var("LOGFAN_TEST_ROOT");

        let err = parse_config("local:\n  root: $env{LOGFAN_SURELY_UNSET}\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_bad_duration_is_a_parse_error() {
        assert!(matches!(
            parse_config("tail:\n  poll_interval: soon\n"),
            Err(ConfigError::YamlParse(_))
        ));
    }
}
