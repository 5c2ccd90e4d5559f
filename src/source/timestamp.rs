use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("regex compilation failed: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("pattern missing 'ts' capture group")]
    MissingTsGroup,

    #[error("failed to parse timestamp '{value}' as {format}: {reason}")]
    Parse {
        value: String,
        format: String,
        reason: String,
    },
}

/// How the captured `ts` text is interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampFormat {
    Iso8601,
    Epoch,
    EpochMs,
    /// chrono strftime pattern; naive patterns are taken as UTC
    Strftime(String),
}

impl TimestampFormat {
    pub fn from_name(name: &str) -> Self {
        match name {
            "iso8601" | "rfc3339" => TimestampFormat::Iso8601,
            "epoch" => TimestampFormat::Epoch,
            "epoch_ms" => TimestampFormat::EpochMs,
            other => TimestampFormat::Strftime(other.to_string()),
        }
    }

    fn name(&self) -> &str {
        match self {
            TimestampFormat::Iso8601 => "iso8601",
            TimestampFormat::Epoch => "epoch",
            TimestampFormat::EpochMs => "epoch_ms",
            TimestampFormat::Strftime(fmt) => fmt,
        }
    }

    /// Parse `value` into epoch milliseconds.
    pub fn parse_millis(&self, value: &str) -> Result<i64, TimestampError> {
        let fail = |reason: String| TimestampError::Parse {
            value: value.to_string(),
            format: self.name().to_string(),
            reason,
        };

        let datetime: DateTime<Utc> = match self {
            TimestampFormat::Iso8601 => DateTime::parse_from_rfc3339(value)
                .map_err(|e| fail(e.to_string()))?
                .with_timezone(&Utc),
            TimestampFormat::Epoch => {
                let secs: i64 = value.parse().map_err(|e: std::num::ParseIntError| fail(e.to_string()))?;
                Utc.timestamp_opt(secs, 0)
                    .single()
                    .ok_or_else(|| fail("timestamp out of range".into()))?
            }
            TimestampFormat::EpochMs => {
                let millis: i64 = value.parse().map_err(|e: std::num::ParseIntError| fail(e.to_string()))?;
                Utc.timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| fail("timestamp out of range".into()))?
            }
            TimestampFormat::Strftime(fmt) => {
                if fmt.contains("%z") || fmt.contains("%:z") || fmt.contains("%Z") {
                    DateTime::parse_from_str(value, fmt)
                        .map_err(|e| fail(e.to_string()))?
                        .with_timezone(&Utc)
                } else {
                    let naive = NaiveDateTime::parse_from_str(value, fmt).map_err(|e| fail(e.to_string()))?;
                    Utc.from_utc_datetime(&naive)
                }
            }
        };

        Ok(datetime.timestamp_millis())
    }
}

/// A log line split into its leading timestamp and the remaining message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedLine {
    pub timestamp: i64,
    pub message: String,
}

/// Pulls the timestamp out of a raw line using a regex with a `ts` capture group.
#[derive(Debug, Clone)]
pub struct TimestampExtractor {
    pattern: Regex,
    format: TimestampFormat,
}

impl TimestampExtractor {
    /// Create a new TimestampExtractor
    ///
    /// # Arguments
    /// * `pattern` - Regex with a named capture group `ts`
    /// * `format` - `iso8601`, `epoch`, `epoch_ms`, or a strftime pattern
    pub fn new(pattern: &str, format: &str) -> Result<Self, TimestampError> {
        let pattern = Regex::new(pattern)?;
        if !pattern.capture_names().any(|name| name == Some("ts")) {
            return Err(TimestampError::MissingTsGroup);
        }

        Ok(Self {
            pattern,
            format: TimestampFormat::from_name(format),
        })
    }

    /// Timestamp of `line` in epoch milliseconds, or `None` when the pattern
    /// does not match (e.g. a continuation line).
    pub fn extract_millis(&self, line: &str) -> Result<Option<i64>, TimestampError> {
        Ok(self.split_line(line)?.map(|stamped| stamped.timestamp))
    }

    /// Split `line` into timestamp and message. The message is whatever follows
    /// the whole pattern match, with leading whitespace removed.
    pub fn split_line(&self, line: &str) -> Result<Option<StampedLine>, TimestampError> {
        let Some(captures) = self.pattern.captures(line) else {
            return Ok(None);
        };
        let Some(ts) = captures.name("ts") else {
            return Ok(None);
        };

        let timestamp = self.format.parse_millis(ts.as_str())?;
        let rest_start = captures.get(0).map(|m| m.end()).unwrap_or(ts.end());

        Ok(Some(StampedLine {
            timestamp,
            message: line[rest_start..].trim_start().to_string(),
        }))
    }
}

impl Default for TimestampExtractor {
    /// Leading RFC 3339 timestamp followed by whitespace
    fn default() -> Self {
        Self {
            pattern: default_pattern().clone(),
            format: TimestampFormat::Iso8601,
        }
    }
}

pub const DEFAULT_TIMESTAMP_PATTERN: &str = r"^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))\s";

fn default_pattern() -> &'static Regex {
    static PATTERN: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(DEFAULT_TIMESTAMP_PATTERN).expect("default timestamp pattern is valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_splits_rfc3339_prefix() {
        let extractor = TimestampExtractor::default();
        let line = extractor
            .split_line("2025-12-04T02:42:11.011Z GET /healthz 200")
            .unwrap()
            .unwrap();

        assert_eq!(line.message, "GET /healthz 200");
        assert_eq!(
            line.timestamp,
            DateTime::parse_from_rfc3339("2025-12-04T02:42:11.011Z")
                .unwrap()
                .timestamp_millis()
        );
    }

    #[test]
    fn test_offset_is_normalized_to_utc() {
        let extractor = TimestampExtractor::default();
        let a = extractor.extract_millis("2025-12-04T02:42:11+05:30 x").unwrap().unwrap();
        let b = extractor.extract_millis("2025-12-03T21:12:11Z x").unwrap().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_epoch_formats() {
        let secs = TimestampExtractor::new(r"^(?P<ts>\d{10})", "epoch").unwrap();
        assert_eq!(secs.extract_millis("1733280131 started").unwrap(), Some(1_733_280_131_000));

        let millis = TimestampExtractor::new(r"^(?P<ts>\d{13})", "epoch_ms").unwrap();
        let line = millis.split_line("1733280131011 worker ready").unwrap().unwrap();
        assert_eq!(line.timestamp, 1_733_280_131_011);
        assert_eq!(line.message, "worker ready");
    }

    #[test]
    fn test_strftime_with_and_without_zone() {
        let naive = TimestampExtractor::new(
            r"^(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3})",
            "%Y-%m-%d %H:%M:%S,%3f",
        )
        .unwrap();
        let zoned = TimestampExtractor::new(
            r"\[(?P<ts>\d{2}/\w{3}/\d{4}:\d{2}:\d{2}:\d{2} [+-]\d{4})\]",
            "%d/%b/%Y:%H:%M:%S %z",
        )
        .unwrap();

        let a = naive.extract_millis("2025-12-04 02:42:11,011 INFO boot").unwrap().unwrap();
        let b = zoned
            .extract_millis("[04/Dec/2025:02:42:11 +0000] GET /")
            .unwrap()
            .unwrap();
        assert_eq!(a - b, 11);
    }

    #[test]
    fn test_continuation_line_has_no_timestamp() {
        let extractor = TimestampExtractor::default();
        assert!(extractor.split_line("    at main.rs:12").unwrap().is_none());
    }

    #[test]
    fn test_construction_errors() {
        assert!(matches!(
            TimestampExtractor::new(r"^\d{4}", "iso8601"),
            Err(TimestampError::MissingTsGroup)
        ));
        assert!(matches!(
            TimestampExtractor::new(r"(?P<ts>[oops", "iso8601"),
            Err(TimestampError::InvalidRegex(_))
        ));
    }

    #[test]
    fn test_unparseable_value() {
        let extractor = TimestampExtractor::new(r"^(?P<ts>\S+)", "epoch").unwrap();
        assert!(matches!(
            extractor.split_line("yesterday something happened"),
            Err(TimestampError::Parse { .. })
        ));
    }
}
