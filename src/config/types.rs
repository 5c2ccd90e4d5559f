use crate::classify::filter::UnknownFieldPolicy;
use crate::source::event::LogGroupHandle;
use crate::source::timestamp::DEFAULT_TIMESTAMP_PATTERN;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub local: LocalConfig,
    /// Required when any group is an `s3://` location
    #[serde(default)]
    pub access_logs: Option<AccessLogConfig>,
    /// Groups tailed when none are given on the command line
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Capacity of the queue between source workers and the consumer
    pub queue_capacity: usize,
    /// How often local live tails check for new lines
    #[serde(with = "duration_format")]
    pub poll_interval: Duration,
    /// Wait between attempts to open a group that does not exist yet
    #[serde(with = "duration_format")]
    pub not_found_retry_interval: Duration,
    #[serde(with = "duration_format")]
    pub task_poll_interval: Duration,
    /// Delay between the task stopping and the session closing
    #[serde(with = "duration_format")]
    pub task_stop_grace: Duration,
    /// Maximum events requested per provider page
    pub page_limit: usize,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            poll_interval: Duration::from_secs(1),
            not_found_retry_interval: Duration::from_secs(1),
            task_poll_interval: Duration::from_secs(1),
            task_stop_grace: Duration::from_secs(3),
            page_limit: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Group identifiers containing this are orchestrator output
    pub control_plane_prefix: String,
    /// Group identifiers ending in this hold lifecycle events
    pub lifecycle_suffix: String,
    /// Stream names containing this carry log-router envelopes
    pub sidecar_marker: String,
    /// Container whose stderr flag is derived from its log text
    pub error_scan_container: String,
    pub unknown_fields: UnknownFieldPolicy,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            control_plane_prefix: "defang-cd-".to_string(),
            lifecycle_suffix: "/ecs".to_string(),
            sidecar_marker: "-firelens-".to_string(),
            error_scan_container: "kaniko".to_string(),
            unknown_fields: UnknownFieldPolicy::Hide,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding one subdirectory per log group
    pub root: PathBuf,
    pub timestamp: TimestampConfig,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("logs"),
            timestamp: TimestampConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampConfig {
    /// Regex with a named capture group `ts`
    pub pattern: String,
    /// `iso8601`, `epoch`, `epoch_ms`, or a strftime pattern
    pub format: String,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_TIMESTAMP_PATTERN.to_string(),
            format: "iso8601".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogConfig {
    /// Local mirror of the buckets: `<root>/<bucket>/<key>`
    pub root: PathBuf,
    #[serde(default = "default_listing_page_size")]
    pub listing_page_size: usize,
}

fn default_listing_page_size() -> usize {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub group: String,
    #[serde(default)]
    pub stream_prefix: Option<String>,
    #[serde(default)]
    pub streams: Vec<String>,
    #[serde(default)]
    pub filter_pattern: Option<String>,
}

impl GroupConfig {
    pub fn to_handle(&self) -> LogGroupHandle {
        LogGroupHandle {
            group_identifier: self.group.clone(),
            stream_name_prefix: self.stream_prefix.clone(),
            stream_names: self.streams.clone(),
            filter_pattern: self.filter_pattern.clone(),
        }
    }
}

/// Parse `500ms`, `30s`, `5m` or `2h`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (value, unit) = if let Some(v) = s.strip_suffix("ms") {
        (v, "ms")
    } else if let Some(v) = s.strip_suffix('s') {
        (v, "s")
    } else if let Some(v) = s.strip_suffix('m') {
        (v, "m")
    } else if let Some(v) = s.strip_suffix('h') {
        (v, "h")
    } else {
        return Err(format!("invalid duration format: {}", s));
    };

    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid numeric value: {}", value))?;

    let scale = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        _ => 3600,
    };
    value
        .checked_mul(scale)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration out of range: {}", s))
}

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 || secs == 0 {
        format!("{}ms", d.as_millis())
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

// Custom serde module for duration strings
mod duration_format {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
