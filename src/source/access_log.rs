//! Load-balancer access logs stored as gzip objects under per-day prefixes.
//!
//! Group identifiers look like `s3://<bucket>/<prefix>`; objects for a UTC day
//! live under `<prefix>/YYYY/MM/DD/`. These groups cannot be live-tailed, so
//! queries are split into day buckets and each listing page becomes one
//! historical page.

use super::event::{millis_to_datetime, LogGroupHandle, RawLogEvent};
use super::provider::{
    EventPage, LiveTail, LogProvider, ObjectListing, ObjectStore, ObjectSummary, PageRequest,
    ProviderError,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

pub const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// The load balancer flushes roughly five minutes of requests per object.
pub const OBJECT_SKEW_MILLIS: i64 = 5 * 60 * 1000;

const SCHEME: &str = "s3://";

/// Bucket and key prefix parsed from an `s3://` group identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocation {
    pub bucket: String,
    pub prefix: String,
}

impl ObjectLocation {
    pub fn parse(group: &str) -> Result<Self, ProviderError> {
        let rest = group
            .strip_prefix(SCHEME)
            .ok_or_else(|| ProviderError::InvalidRequest(format!("'{}' is not an s3:// location", group)))?;

        let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(ProviderError::InvalidRequest(format!("'{}' has no bucket", group)));
        }

        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.trim_end_matches('/').to_string(),
        })
    }

    /// Key prefix of the UTC day containing `millis`.
    pub fn day_prefix(&self, millis: i64) -> String {
        let day = millis_to_datetime(millis)
            .unwrap_or_default()
            .format("%Y/%m/%d/")
            .to_string();
        if self.prefix.is_empty() {
            day
        } else {
            format!("{}/{}", self.prefix, day)
        }
    }
}

pub fn is_access_log_group(group: &str) -> bool {
    group.starts_with(SCHEME)
}

pub struct AccessLogProvider<S> {
    store: S,
}

impl<S: ObjectStore> AccessLogProvider<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    async fn read_object(
        &self,
        bucket: &str,
        object: &ObjectSummary,
        request: &PageRequest,
        handle: &LogGroupHandle,
    ) -> Result<Vec<RawLogEvent>, ProviderError> {
        let compressed = self.store.get_object(bucket, &object.key).await?;

        let mut text = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut text)?;

        let mut events = Vec::new();
        for line in text.lines() {
            let Some(timestamp) = line_timestamp(line) else {
                debug!(key = %object.key, "Skipping access log line without timestamp");
                continue;
            };
            if timestamp < request.start || timestamp >= request.end {
                continue;
            }
            if !handle.matches_pattern(line) {
                continue;
            }
            // Access-log events carry no group or stream
            events.push(RawLogEvent::new("", "", line, timestamp));
        }
        Ok(events)
    }
}

#[async_trait]
impl<S: ObjectStore> LogProvider for AccessLogProvider<S> {
    fn supports_live_tail(&self, _handle: &LogGroupHandle) -> bool {
        false
    }

    fn history_bucket_millis(&self, _handle: &LogGroupHandle) -> Option<i64> {
        Some(DAY_MILLIS)
    }

    async fn fetch_historical_page(
        &self,
        handle: &LogGroupHandle,
        request: &PageRequest,
    ) -> Result<EventPage, ProviderError> {
        let location = ObjectLocation::parse(&handle.group_identifier)?;
        let prefix = location.day_prefix(request.start);

        let listing = self
            .store
            .list_objects(&location.bucket, &prefix, request.cursor.as_deref())
            .await?;

        let mut events = Vec::new();
        let mut past_end = false;
        for object in &listing.objects {
            let modified = object.last_modified.timestamp_millis();
            if modified < request.start {
                continue;
            }
            if modified > request.end + OBJECT_SKEW_MILLIS {
                past_end = true;
                break;
            }
            events.extend(self.read_object(&location.bucket, object, request, handle).await?);
        }
        events.sort_by_key(|e| e.timestamp);

        let mut next_cursor = if past_end { None } else { listing.continuation_token };
        if let Some(limit) = request.limit {
            if events.len() > limit {
                // The caller re-queries from the last timestamp it saw
                events.truncate(limit);
                next_cursor = None;
            }
        }

        debug!(
            prefix = %prefix,
            objects = listing.objects.len(),
            events = events.len(),
            past_end = past_end,
            "Read access log listing page"
        );

        Ok(EventPage { events, next_cursor })
    }

    async fn open_live_tail(
        &self,
        handle: &LogGroupHandle,
        _from: Option<i64>,
    ) -> Result<Box<dyn LiveTail>, ProviderError> {
        Err(ProviderError::InvalidRequest(format!(
            "live tail is not supported for {}",
            handle.group_identifier
        )))
    }
}

/// Request time of an access log line: the second whitespace-separated field.
pub fn line_timestamp(line: &str) -> Option<i64> {
    let field = line.split_whitespace().nth(1)?;
    DateTime::parse_from_rfc3339(field)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

/// Filesystem-backed object store: `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct DirectoryObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl DirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: 1000,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, ProviderError> {
        let dir = self.root.join(bucket);
        if !dir.is_dir() {
            return Err(ProviderError::NotFound(format!("bucket '{}'", bucket)));
        }
        Ok(dir)
    }
}

#[async_trait]
impl ObjectStore for DirectoryObjectStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> Result<ObjectListing, ProviderError> {
        let dir = self.bucket_dir(bucket)?;
        let mut keys = Vec::new();
        collect_keys(&dir, &dir, &mut keys)?;
        keys.retain(|(key, _)| key.starts_with(prefix));
        keys.sort();

        // The token is the last key handed out
        let remaining: Vec<(String, PathBuf)> = keys
            .into_iter()
            .filter(|(key, _)| continuation_token.map_or(true, |after| key.as_str() > after))
            .collect();

        let mut objects = Vec::new();
        for (key, path) in remaining.iter().take(self.page_size) {
            let metadata = std::fs::metadata(path)?;
            let last_modified = key_timestamp(key)
                .or_else(|| metadata.modified().ok().map(DateTime::<Utc>::from))
                .unwrap_or_default();
            objects.push(ObjectSummary {
                key: key.clone(),
                last_modified,
                size: metadata.len(),
            });
        }

        let continuation_token = if remaining.len() > self.page_size {
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };

        Ok(ObjectListing {
            objects,
            continuation_token,
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ProviderError> {
        let path = self.bucket_dir(bucket)?.join(key);
        std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProviderError::NotFound(format!("object '{}/{}'", bucket, key))
            } else {
                ProviderError::Io(e)
            }
        })
    }
}

fn collect_keys(base: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<(), ProviderError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_keys(base, &path, out)?;
            continue;
        }
        let Ok(relative) = path.strip_prefix(base) else {
            continue;
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push((key, path));
    }
    Ok(())
}

/// Flush time encoded in load-balancer object names (`..._20250101T0005Z_...`).
/// Copied files lose their original modification time, so this takes precedence.
fn key_timestamp(key: &str) -> Option<DateTime<Utc>> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"_(\d{8}T\d{4})Z_").expect("key pattern is valid"));

    let captures = pattern.captures(key)?;
    match NaiveDateTime::parse_from_str(captures.get(1)?.as_str(), "%Y%m%dT%H%M") {
        Ok(naive) => Some(Utc.from_utc_datetime(&naive)),
        Err(e) => {
            warn!(key = %key, error = %e, "Unparseable timestamp in object key");
            None
        }
    }
}
