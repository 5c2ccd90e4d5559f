//! Collaborator interfaces consumed by the tail pipeline.
//!
//! Every adapter receives its provider client through a constructor; nothing in
//! the pipeline reads process-wide client state.

use super::event::{LiveTailEvent, LogGroupHandle, RawLogEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The log group or stream has not been created yet
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("provider error: {0}")]
    Other(String),
}

impl ProviderError {
    /// The only error kind that the pipeline retries
    pub fn is_not_found(&self) -> bool {
        match self {
            ProviderError::NotFound(_) => true,
            ProviderError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// A fatal error raised by one source, tagged with the source's name.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source '{name}': {error}")]
    Provider {
        name: String,
        #[source]
        error: ProviderError,
    },

    #[error("source '{name}': task stopped before its log group appeared: {reason}")]
    TaskStopped { name: String, reason: String },
}

impl SourceError {
    pub fn provider(name: impl Into<String>, error: ProviderError) -> Self {
        SourceError::Provider {
            name: name.into(),
            error,
        }
    }
}

/// One request for a page of historical events in `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub start: i64,
    pub end: i64,
    /// Maximum number of events the provider should return
    pub limit: Option<usize>,
    /// Opaque cursor returned by the previous page
    pub cursor: Option<String>,
}

/// One page of historical events, ascending by timestamp.
///
/// A provider that stops at `limit` without handing out a cursor signals that
/// more events may exist at or after the last returned timestamp.
#[derive(Debug, Clone, Default)]
pub struct EventPage {
    pub events: Vec<RawLogEvent>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait LogProvider: Send + Sync {
    /// False for sources that only support bounded queries (e.g. object-store
    /// backed access logs).
    fn supports_live_tail(&self, _handle: &LogGroupHandle) -> bool {
        true
    }

    /// Width of the time buckets historical queries must be split into, aligned
    /// to multiples of the bucket since the epoch. `None` means one query.
    fn history_bucket_millis(&self, _handle: &LogGroupHandle) -> Option<i64> {
        None
    }

    async fn fetch_historical_page(
        &self,
        handle: &LogGroupHandle,
        request: &PageRequest,
    ) -> Result<EventPage, ProviderError>;

    /// Open a live tail. Returns `ProviderError::NotFound` while the group does
    /// not exist yet.
    ///
    /// With `from`, events already stored with a timestamp at or after it are
    /// delivered before new ones, so nothing written between the end of a
    /// history window and the open is lost. `None` means only new events.
    async fn open_live_tail(
        &self,
        handle: &LogGroupHandle,
        from: Option<i64>,
    ) -> Result<Box<dyn LiveTail>, ProviderError>;
}

/// A push-style live tail session.
#[async_trait]
pub trait LiveTail: Send {
    /// Next item, or `Ok(None)` once the provider has ended the session.
    async fn next(&mut self) -> Result<Option<LiveTailEvent>, ProviderError>;

    async fn close(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Optional capability: transports that report failures out of band (the
    /// session simply ends) expose them here. Consumers must consult it every
    /// time `next` returns `Ok(None)`; tails without one return `None`.
    fn error_source(&mut self) -> Option<&mut dyn ErrorSource> {
        None
    }
}

/// Secondary error slot of a live tail. Yields each stored error at most once.
pub trait ErrorSource: Send {
    fn take_error(&mut self) -> Option<ProviderError>;
}

/// The deployment task whose logs are being tailed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub id: String,
}

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskStatus {
    pub is_terminal: bool,
    /// Set when the task stopped because of a failure
    pub failure_detail: Option<String>,
}

impl TaskStatus {
    pub fn running() -> Self {
        Self::default()
    }

    pub fn stopped(failure_detail: Option<String>) -> Self {
        Self {
            is_terminal: true,
            failure_detail,
        }
    }
}

#[async_trait]
pub trait TaskStatusProvider: Send + Sync {
    async fn task_terminal_status(&self, task: &TaskHandle) -> Result<TaskStatus, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    /// Keys in ascending lexicographic order
    pub objects: Vec<ObjectSummary>,
    pub continuation_token: Option<String>,
}

/// Minimal object store used by the access-log adapter.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ObjectListing, ProviderError>;

    /// Full object body (gzip-compressed for access logs)
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(ProviderError::NotFound("group".into()).is_not_found());
        assert!(ProviderError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_not_found());
        assert!(!ProviderError::AccessDenied("nope".into()).is_not_found());
        assert!(!ProviderError::Other("boom".into()).is_not_found());
    }

    #[test]
    fn test_source_error_display_names_source() {
        let err = SourceError::provider("django", ProviderError::AccessDenied("logs:Filter".into()));
        assert_eq!(err.to_string(), "source 'django': access denied: logs:Filter");
    }
}
