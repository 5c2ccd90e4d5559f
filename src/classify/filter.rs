use super::record::CanonicalLogRecord;
use super::rules::{BatchHeader, BatchKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What to do with a record whose service or correlation tag is unknown (empty)
/// while that filter dimension is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownFieldPolicy {
    /// Unknown values pass only when the dimension is not filtered
    #[default]
    Hide,
    /// Unknown values always pass
    Show,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub correlation_tag: Option<String>,
    /// Service allow-list; empty means every service
    pub services: BTreeSet<String>,
    pub unknown_fields: UnknownFieldPolicy,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.correlation_tag = (!tag.is_empty()).then_some(tag);
        self
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    /// Cheap early rejection of a whole run. Unknown values are never rejected
    /// here; the per-record check decides them.
    pub fn accepts_batch(&self, header: &BatchHeader) -> bool {
        if header.kind == BatchKind::Unmatched {
            return false;
        }

        if let Some(tag) = &self.correlation_tag {
            if !header.correlation_tag.is_empty() && header.correlation_tag != *tag {
                return false;
            }
        }

        // Sidecar records carry their own service, so the batch value is only a fallback
        if !self.services.is_empty()
            && header.kind != BatchKind::Sidecar
            && !header.service.is_empty()
            && !self.services.contains(&header.service)
        {
            return false;
        }

        true
    }

    pub fn accepts_record(&self, record: &CanonicalLogRecord) -> bool {
        let tag_ok = match &self.correlation_tag {
            None => true,
            Some(_) if record.correlation_tag.is_empty() => self.unknown_fields == UnknownFieldPolicy::Show,
            Some(tag) => record.correlation_tag == *tag,
        };

        let service_ok = if self.services.is_empty() {
            true
        } else if record.service.is_empty() {
            self.unknown_fields == UnknownFieldPolicy::Show
        } else {
            self.services.contains(&record.service)
        };

        tag_ok && service_ok
    }
}
