pub mod generate;
pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::info;

pub use parse::{load_config, parse_config, ConfigError};
pub use types::{ClassifierConfig, Config, TailConfig};

const APP_NAME: &str = "logfan";

/// `$env{VAR_NAME}` where VAR_NAME starts with a letter or underscore
pub(crate) fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Expands environment variables in a string.
/// Supports $env{VAR_NAME} syntax.
/// If an environment variable is not set, it's left unchanged.
pub fn expand_env_vars(text: &str) -> String {
    env_var_pattern()
        .replace_all(text, |caps: &regex::Captures| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            caps.get(1)
                .and_then(|name| std::env::var(name.as_str()).ok())
                .unwrap_or_else(|| whole.to_string())
        })
        .to_string()
}

/// Expands a leading `~` to the user's home directory.
/// Returns the path unchanged if the home directory cannot be determined.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

pub fn user_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join(APP_NAME).join("config.yml"))
}

pub fn system_config_path() -> PathBuf {
    PathBuf::from("/etc").join(APP_NAME).join("config.yml")
}

/// Resolves the config file path based on explicit argument or default locations.
/// Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/logfan/config.yml
/// 3. /etc/logfan/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = system_config_path();
    if system_config.exists() {
        return Some(system_config);
    }

    None
}

/// Load the resolved config file, or built-in defaults when there is none.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    match resolve_config_path(explicit) {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            load_config(&path)
        }
        None => {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("LOGFAN_EXPAND_A", "alpha");
        std::env::set_var("LOGFAN_EXPAND_B", "beta");
        assert_eq!(
            expand_env_vars("$env{LOGFAN_EXPAND_A}/middle/$env{LOGFAN_EXPAND_B}"),
            "alpha/middle/beta"
        );
        std::env::remove_var("LOGFAN_EXPAND_A");
        std::env::remove_var("LOGFAN_EXPAND_B");
    }

    #[test]
    fn test_expand_env_vars_unset_left_unchanged() {
        assert_eq!(
            expand_env_vars("path/$env{LOGFAN_NOT_SET_ANYWHERE}/file"),
            "path/$env{LOGFAN_NOT_SET_ANYWHERE}/file"
        );
        assert_eq!(expand_env_vars("${not_an_env_var}"), "${not_an_env_var}");
    }

    #[test]
    fn test_expand_tilde() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/logs")), home.join("logs"));
            assert_eq!(expand_tilde(Path::new("~")), home);
        }
        assert_eq!(expand_tilde(Path::new("/abs/path")), Path::new("/abs/path"));
        assert_eq!(expand_tilde(Path::new("rel/~path")), Path::new("rel/~path"));
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let resolved = resolve_config_path(Some(Path::new("/tmp/custom.yml")));
        assert_eq!(resolved, Some(PathBuf::from("/tmp/custom.yml")));
    }
}
