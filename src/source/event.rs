use crate::sequencer::merge::Timestamped;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use super::provider::SourceError;

/// A single provider-native log event.
///
/// Produced by provider adapters and never mutated downstream. `timestamp` and
/// `ingestion_time` are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLogEvent {
    /// Opaque identifier of the log group (empty for access-log objects)
    pub source_group_id: String,
    /// Sub-stream within the group; encodes tenant/service/tag/host by convention
    pub stream_name: String,
    pub message: String,
    pub timestamp: i64,
    pub ingestion_time: i64,
}

impl RawLogEvent {
    pub fn new(
        source_group_id: impl Into<String>,
        stream_name: impl Into<String>,
        message: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        Self {
            source_group_id: source_group_id.into(),
            stream_name: stream_name.into(),
            message: message.into(),
            timestamp,
            ingestion_time: Utc::now().timestamp_millis(),
        }
    }

    /// True when both events come from the same group and stream
    pub fn same_stream(&self, other: &RawLogEvent) -> bool {
        self.source_group_id == other.source_group_id && self.stream_name == other.stream_name
    }
}

impl Timestamped for RawLogEvent {
    fn timestamp_millis(&self) -> i64 {
        self.timestamp
    }
}

/// A batch of raw events as handed from a source worker to the consumer.
pub type RawBatch = Vec<RawLogEvent>;

/// Ascending stream of raw events, terminated by at most one error.
pub type EventStream = BoxStream<'static, Result<RawLogEvent, SourceError>>;

/// Describes one polling/tailing target. Immutable for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogGroupHandle {
    pub group_identifier: String,
    #[serde(default)]
    pub stream_name_prefix: Option<String>,
    #[serde(default)]
    pub stream_names: Vec<String>,
    #[serde(default)]
    pub filter_pattern: Option<String>,
}

impl LogGroupHandle {
    pub fn new(group_identifier: impl Into<String>) -> Self {
        Self {
            group_identifier: group_identifier.into(),
            ..Default::default()
        }
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_name_prefix = Some(prefix.into());
        self
    }

    pub fn with_streams(mut self, streams: Vec<String>) -> Self {
        self.stream_names = streams;
        self
    }

    pub fn with_filter_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.filter_pattern = Some(pattern.into());
        self
    }

    /// Whether a stream of this group is selected by the prefix / explicit list.
    pub fn selects_stream(&self, stream_name: &str) -> bool {
        if !self.stream_names.is_empty() && !self.stream_names.iter().any(|s| s == stream_name) {
            return false;
        }
        match &self.stream_name_prefix {
            Some(prefix) => stream_name.starts_with(prefix.as_str()),
            None => true,
        }
    }

    /// Whether a message passes the handle's filter pattern (plain substring).
    pub fn matches_pattern(&self, message: &str) -> bool {
        match &self.filter_pattern {
            Some(pattern) if !pattern.is_empty() => message.contains(pattern.as_str()),
            _ => true,
        }
    }
}

/// One item delivered by a live tail session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveTailEvent {
    /// The provider acknowledged the session; carries no events
    SessionStart { session_id: String },
    /// New events, ascending within the batch
    Events(RawBatch),
}

/// Converts epoch milliseconds to a UTC datetime, if representable.
pub fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
