//! Dispatch of raw provider events to canonical records.
//!
//! The kind of a run of events is decided once from its first event, by
//! looking at the group identifier and stream name in this order:
//!
//! 1. no group and no stream: load-balancer access log
//! 2. group ending in the lifecycle suffix: lifecycle event envelope
//! 3. group containing the control-plane prefix: orchestrator output
//! 4. `<service>-image/<service>_<tag>/<buildId>`: image build output
//! 5. stream containing the sidecar marker: log-router envelope
//! 6. `<tenant>/<service>_<tag>/<hostId>`: service container output
//!
//! Events matching none of these are dropped.

use super::envelope::{LifecycleEvent, SidecarEnvelope};
use super::record::{CanonicalLogRecord, ALB_SERVICE, CONTROL_PLANE_HOST, CONTROL_PLANE_SERVICE};
use crate::config::types::ClassifierConfig;
use crate::source::event::RawLogEvent;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("malformed {kind} envelope: {source}")]
    Envelope {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Marker the orchestrator puts in front of diagnostics
const CONTROL_PLANE_ERROR_MARKER: &str = " ** ";

fn correlation_tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9]{12}$").expect("correlation tag pattern is valid"))
}

fn error_signature_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\blevel=(error|fatal)\b|^error\b)").expect("error signature pattern is valid")
    })
}

pub fn is_valid_correlation_tag(tag: &str) -> bool {
    correlation_tag_pattern().is_match(tag)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    AccessLog,
    Lifecycle,
    ControlPlane,
    Build,
    Sidecar,
    Service,
    /// Matches no rule; every event is dropped
    Unmatched,
}

/// Batch-level identity decided from the first event of a run.
///
/// Lifecycle and sidecar batches fill in their fields per event, so their
/// header values may be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub kind: BatchKind,
    pub service: String,
    pub host: String,
    pub correlation_tag: String,
}

impl BatchHeader {
    fn new(kind: BatchKind, service: &str, host: &str, correlation_tag: &str) -> Self {
        Self {
            kind,
            service: service.to_string(),
            host: host.to_string(),
            correlation_tag: correlation_tag.to_string(),
        }
    }

    fn unknown(kind: BatchKind) -> Self {
        Self::new(kind, "", "", "")
    }
}

/// Per-session classification counters, logged when the session closes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifyStats {
    pub access_log: u64,
    pub lifecycle: u64,
    pub control_plane: u64,
    pub build: u64,
    pub sidecar: u64,
    pub service: u64,
    pub dropped_unmatched: u64,
    pub dropped_malformed: u64,
}

impl ClassifyStats {
    fn count(&mut self, kind: BatchKind) {
        match kind {
            BatchKind::AccessLog => self.access_log += 1,
            BatchKind::Lifecycle => self.lifecycle += 1,
            BatchKind::ControlPlane => self.control_plane += 1,
            BatchKind::Build => self.build += 1,
            BatchKind::Sidecar => self.sidecar += 1,
            BatchKind::Service => self.service += 1,
            BatchKind::Unmatched => self.dropped_unmatched += 1,
        }
    }

    pub fn classified(&self) -> u64 {
        self.access_log + self.lifecycle + self.control_plane + self.build + self.sidecar + self.service
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_unmatched + self.dropped_malformed
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
    stats: ClassifyStats,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            stats: ClassifyStats::default(),
        }
    }

    pub fn stats(&self) -> &ClassifyStats {
        &self.stats
    }

    /// Decide the kind and batch-level fields of a run from its first event.
    pub fn batch_header(&self, first: &RawLogEvent) -> BatchHeader {
        let group = first.source_group_id.as_str();
        let stream = first.stream_name.as_str();

        if group.is_empty() && stream.is_empty() {
            return BatchHeader::new(BatchKind::AccessLog, ALB_SERVICE, "", "");
        }

        if group.trim_end_matches(":*").ends_with(&self.config.lifecycle_suffix) {
            return BatchHeader::unknown(BatchKind::Lifecycle);
        }

        if group.contains(&self.config.control_plane_prefix) {
            return BatchHeader::new(BatchKind::ControlPlane, CONTROL_PLANE_SERVICE, CONTROL_PLANE_HOST, "");
        }

        if let Some((service, tag, build_id)) = parse_build_stream(stream) {
            return BatchHeader::new(BatchKind::Build, &format!("{}-image", service), build_id, tag);
        }

        if stream.contains(&self.config.sidecar_marker) {
            // Fields come from each envelope; the stream name is the fallback
            return match parse_service_stream(stream) {
                Some((service, tag, host)) => BatchHeader::new(BatchKind::Sidecar, service, host, tag),
                None => BatchHeader::unknown(BatchKind::Sidecar),
            };
        }

        match parse_service_stream(stream) {
            Some((service, tag, host)) => BatchHeader::new(BatchKind::Service, service, host, tag),
            None => BatchHeader::unknown(BatchKind::Unmatched),
        }
    }

    /// Classify one event of a run whose header is `header`. `None` means the
    /// event was dropped.
    pub fn classify_event(&mut self, header: &BatchHeader, event: &RawLogEvent) -> Option<CanonicalLogRecord> {
        let record = match header.kind {
            BatchKind::AccessLog => Some(self.access_log_record(header, event)),
            BatchKind::Lifecycle => match parse_lifecycle(&event.message) {
                Ok(lifecycle) => Some(CanonicalLogRecord {
                    service: lifecycle.service().to_string(),
                    host: lifecycle.host().to_string(),
                    correlation_tag: lifecycle.correlation_tag().to_string(),
                    stderr: lifecycle.is_failure(),
                    message: lifecycle.summary(),
                    timestamp: event.timestamp,
                }),
                Err(e) => {
                    debug!(group = %event.source_group_id, error = %e, "Dropping lifecycle event");
                    self.stats.dropped_malformed += 1;
                    return None;
                }
            },
            BatchKind::ControlPlane => Some(simple_record(header, event, is_control_plane_error(&event.message))),
            BatchKind::Build | BatchKind::Service => Some(simple_record(header, event, false)),
            BatchKind::Sidecar => match parse_sidecar(&event.message) {
                Ok(envelope) => Some(self.sidecar_record(header, event, envelope)),
                Err(e) => {
                    debug!(stream = %event.stream_name, error = %e, "Sidecar envelope unreadable, using stream name");
                    self.service_fallback(header, event)
                }
            },
            BatchKind::Unmatched => None,
        };

        match &record {
            Some(_) => self.stats.count(header.kind),
            None => {
                debug!(
                    group = %event.source_group_id,
                    stream = %event.stream_name,
                    "Dropping event that matches no classification rule"
                );
                self.stats.count(BatchKind::Unmatched);
            }
        }
        record
    }

    /// Classify a run of events from one stream.
    pub fn classify_batch(&mut self, events: &[RawLogEvent]) -> Vec<CanonicalLogRecord> {
        let Some(first) = events.first() else {
            return Vec::new();
        };
        let header = self.batch_header(first);
        events
            .iter()
            .filter_map(|event| self.classify_event(&header, event))
            .collect()
    }

    fn access_log_record(&self, header: &BatchHeader, event: &RawLogEvent) -> CanonicalLogRecord {
        // Field 9 is the status code the load balancer returned
        let server_error = event
            .message
            .split_whitespace()
            .nth(8)
            .and_then(|status| status.parse::<u16>().ok())
            .is_some_and(|status| status >= 500);
        simple_record(header, event, server_error)
    }

    fn sidecar_record(
        &self,
        header: &BatchHeader,
        event: &RawLogEvent,
        envelope: SidecarEnvelope,
    ) -> CanonicalLogRecord {
        let stderr = if envelope.container_name == self.config.error_scan_container {
            error_signature_pattern().is_match(&envelope.log)
        } else {
            envelope.source == "stderr"
        };
        let service = if envelope.container_name.is_empty() {
            header.service.clone()
        } else {
            envelope.container_name.clone()
        };
        let host = match envelope.task_id() {
            "" => header.host.clone(),
            id => id.to_string(),
        };

        CanonicalLogRecord {
            service,
            host,
            correlation_tag: header.correlation_tag.clone(),
            stderr,
            message: envelope.log,
            timestamp: event.timestamp,
        }
    }

    fn service_fallback(&self, header: &BatchHeader, event: &RawLogEvent) -> Option<CanonicalLogRecord> {
        if header.service.is_empty() {
            return None;
        }
        Some(simple_record(header, event, false))
    }
}

fn simple_record(header: &BatchHeader, event: &RawLogEvent, stderr: bool) -> CanonicalLogRecord {
    CanonicalLogRecord {
        service: header.service.clone(),
        host: header.host.clone(),
        correlation_tag: header.correlation_tag.clone(),
        stderr,
        message: event.message.clone(),
        timestamp: event.timestamp,
    }
}

fn parse_lifecycle(message: &str) -> Result<LifecycleEvent, ClassifyError> {
    LifecycleEvent::parse(message).map_err(|source| ClassifyError::Envelope {
        kind: "lifecycle",
        source,
    })
}

fn parse_sidecar(message: &str) -> Result<SidecarEnvelope, ClassifyError> {
    SidecarEnvelope::parse(message).map_err(|source| ClassifyError::Envelope {
        kind: "sidecar",
        source,
    })
}

fn is_control_plane_error(message: &str) -> bool {
    message.starts_with(CONTROL_PLANE_ERROR_MARKER) || message.to_lowercase().contains("error:")
}

fn three_segments(stream: &str) -> Option<(&str, &str, &str)> {
    let mut parts = stream.split('/');
    let first = parts.next()?;
    let second = parts.next()?;
    let third = parts.next()?;
    if parts.next().is_some() || first.is_empty() || second.is_empty() || third.is_empty() {
        return None;
    }
    Some((first, second, third))
}

/// `<service>-image/<service>_<tag>/<buildId>` → (service, tag, buildId)
fn parse_build_stream(stream: &str) -> Option<(&str, &str, &str)> {
    let (image, name_tag, build_id) = three_segments(stream)?;
    let service = image.strip_suffix("-image")?;
    let (name, tag) = name_tag.rsplit_once('_')?;
    if name != service || !is_valid_correlation_tag(tag) {
        return None;
    }
    Some((service, tag, build_id))
}

/// `<tenant>/<service>_<tag>/<hostId>` → (service, tag, hostId)
fn parse_service_stream(stream: &str) -> Option<(&str, &str, &str)> {
    let (_tenant, service_tag, host) = three_segments(stream)?;
    let (service, tag) = service_tag.rsplit_once('_')?;
    if service.is_empty() || !is_valid_correlation_tag(tag) {
        return None;
    }
    Some((service, tag, host))
}
