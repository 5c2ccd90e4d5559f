//! Log groups backed by a directory tree: `<root>/<group>/<stream path...>`.
//!
//! Each stream file holds timestamp-prefixed lines. Lines without a timestamp
//! are continuations of the previous line (stack traces and the like).

use super::event::{now_millis, LiveTailEvent, LogGroupHandle, RawLogEvent};
use super::provider::{EventPage, LiveTail, LogProvider, PageRequest, ProviderError};
use super::timestamp::TimestampExtractor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
    extractor: TimestampExtractor,
    poll_interval: Duration,
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>, extractor: TimestampExtractor) -> Self {
        Self {
            root: root.into(),
            extractor,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn group_dir(&self, handle: &LogGroupHandle) -> Result<PathBuf, ProviderError> {
        let dir = self.root.join(&handle.group_identifier);
        if !dir.is_dir() {
            return Err(ProviderError::NotFound(format!(
                "log group '{}' ({})",
                handle.group_identifier,
                dir.display()
            )));
        }
        Ok(dir)
    }

    /// All selected events of the group, ascending and stable across streams.
    fn scan_group(&self, handle: &LogGroupHandle) -> Result<Vec<RawLogEvent>, ProviderError> {
        let dir = self.group_dir(handle)?;
        let mut events = Vec::new();

        for (stream_name, path) in stream_files(&dir, handle)? {
            let mut text = String::new();
            File::open(&path)?.read_to_string(&mut text)?;
            events.extend(parse_lines(
                &self.extractor,
                &handle.group_identifier,
                &stream_name,
                &text,
                None,
            ));
        }

        events.retain(|e| handle.matches_pattern(&e.message));
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[async_trait]
impl LogProvider for DirectoryProvider {
    async fn fetch_historical_page(
        &self,
        handle: &LogGroupHandle,
        request: &PageRequest,
    ) -> Result<EventPage, ProviderError> {
        let offset: usize = match &request.cursor {
            Some(cursor) => cursor
                .parse()
                .map_err(|_| ProviderError::InvalidRequest(format!("bad cursor '{}'", cursor)))?,
            None => 0,
        };

        let matching: Vec<RawLogEvent> = self
            .scan_group(handle)?
            .into_iter()
            .filter(|e| e.timestamp >= request.start && e.timestamp < request.end)
            .collect();

        let limit = request.limit.unwrap_or(usize::MAX);
        let events: Vec<RawLogEvent> = matching.iter().skip(offset).take(limit).cloned().collect();
        let next = offset + events.len();

        debug!(
            group = %handle.group_identifier,
            offset = offset,
            count = events.len(),
            total = matching.len(),
            "Read directory page"
        );

        Ok(EventPage {
            events,
            next_cursor: (next < matching.len()).then(|| next.to_string()),
        })
    }

    async fn open_live_tail(
        &self,
        handle: &LogGroupHandle,
        from: Option<i64>,
    ) -> Result<Box<dyn LiveTail>, ProviderError> {
        let dir = self.group_dir(handle)?;

        // Without a start time only lines written after the tail opens are live;
        // with one, the first poll re-reads every stream from the beginning.
        let mut offsets = HashMap::new();
        if from.is_none() {
            for (_, path) in stream_files(&dir, handle)? {
                let len = std::fs::metadata(&path)?.len();
                offsets.insert(path, len);
            }
        }

        info!(
            group = %handle.group_identifier,
            streams = offsets.len(),
            from = ?from,
            "Opened directory tail"
        );

        Ok(Box::new(DirectoryTail {
            dir,
            handle: handle.clone(),
            extractor: self.extractor.clone(),
            poll_interval: self.poll_interval,
            offsets,
            backlog_from: from,
            started: false,
        }))
    }
}

/// Polling tail over the stream files of one group directory.
pub struct DirectoryTail {
    dir: PathBuf,
    handle: LogGroupHandle,
    extractor: TimestampExtractor,
    poll_interval: Duration,
    /// Bytes already consumed per stream file
    offsets: HashMap<PathBuf, u64>,
    /// Lower timestamp bound for lines stored before the first poll
    backlog_from: Option<i64>,
    started: bool,
}

impl DirectoryTail {
    /// Complete lines appended since the last poll, across all streams.
    fn poll(&mut self) -> Result<Vec<RawLogEvent>, ProviderError> {
        if !self.dir.is_dir() {
            return Err(ProviderError::NotFound(format!(
                "log group directory {} was removed",
                self.dir.display()
            )));
        }

        let mut events = Vec::new();
        for (stream_name, path) in stream_files(&self.dir, &self.handle)? {
            let len = std::fs::metadata(&path)?.len();
            let mut offset = self.offsets.get(&path).copied().unwrap_or(0);
            if len < offset {
                warn!(stream = %stream_name, "Stream file truncated, reading from start");
                offset = 0;
            }
            if len == offset {
                self.offsets.insert(path, offset);
                continue;
            }

            let mut file = File::open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut bytes = Vec::new();
            file.take(len - offset).read_to_end(&mut bytes)?;

            // Leave a partial trailing line for the next poll
            let Some(last_newline) = bytes.iter().rposition(|b| *b == b'\n') else {
                self.offsets.insert(path, offset);
                continue;
            };
            let complete = &bytes[..=last_newline];
            self.offsets.insert(path, offset + complete.len() as u64);

            let text = String::from_utf8_lossy(complete);
            events.extend(parse_lines(
                &self.extractor,
                &self.handle.group_identifier,
                &stream_name,
                &text,
                Some(now_millis()),
            ));
        }

        if let Some(from) = self.backlog_from.take() {
            events.retain(|e| e.timestamp >= from);
        }
        events.retain(|e| self.handle.matches_pattern(&e.message));
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

#[async_trait]
impl LiveTail for DirectoryTail {
    async fn next(&mut self) -> Result<Option<LiveTailEvent>, ProviderError> {
        if !self.started {
            self.started = true;
            return Ok(Some(LiveTailEvent::SessionStart {
                session_id: Uuid::new_v4().to_string(),
            }));
        }

        loop {
            let events = self.poll()?;
            if !events.is_empty() {
                return Ok(Some(LiveTailEvent::Events(events)));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Selected stream files of a group directory as `(stream name, path)`, sorted by name.
fn stream_files(dir: &Path, handle: &LogGroupHandle) -> Result<Vec<(String, PathBuf)>, ProviderError> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;

    let mut streams: Vec<(String, PathBuf)> = files
        .into_iter()
        .filter_map(|path| {
            let relative = path.strip_prefix(dir).ok()?;
            let name = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            Some((name, path))
        })
        .filter(|(name, _)| handle.selects_stream(name))
        .collect();

    streams.sort();
    Ok(streams)
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ProviderError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Turn raw text into events, folding continuation lines into the preceding
/// event. Continuations with nothing to attach to use `orphan_timestamp`, or
/// are skipped when it is `None`.
fn parse_lines(
    extractor: &TimestampExtractor,
    group: &str,
    stream: &str,
    text: &str,
    orphan_timestamp: Option<i64>,
) -> Vec<RawLogEvent> {
    let mut events: Vec<RawLogEvent> = Vec::new();

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match extractor.split_line(line) {
            Ok(Some(stamped)) => {
                events.push(RawLogEvent::new(group, stream, stamped.message, stamped.timestamp));
            }
            Ok(None) => match events.last_mut() {
                Some(previous) => {
                    previous.message.push('\n');
                    previous.message.push_str(line);
                }
                None => match orphan_timestamp {
                    Some(ts) => events.push(RawLogEvent::new(group, stream, line, ts)),
                    None => debug!(stream = %stream, "Skipping line without timestamp"),
                },
            },
            Err(e) => {
                warn!(stream = %stream, error = %e, "Skipping line with unparseable timestamp");
            }
        }
    }

    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_stream(root: &Path, group: &str, stream: &str, content: &str) -> PathBuf {
        let path = root.join(group).join(stream);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    fn provider(root: &Path) -> DirectoryProvider {
        DirectoryProvider::new(root, TimestampExtractor::default())
            .with_poll_interval(Duration::from_millis(10))
    }

    fn request(limit: Option<usize>, cursor: Option<String>) -> PageRequest {
        PageRequest {
            start: 0,
            end: i64::MAX,
            limit,
            cursor,
        }
    }

    #[tokio::test]
    async fn test_history_merges_streams_in_timestamp_order() {
        let dir = TempDir::new().unwrap();
        write_stream(
            dir.path(),
            "app",
            "web/web_hg2xsgvsldqk/host1",
            "2025-01-01T00:00:01Z first\n2025-01-01T00:00:03Z third\n",
        );
        write_stream(
            dir.path(),
            "app",
            "worker/worker_hg2xsgvsldqk/host2",
            "2025-01-01T00:00:02Z second\n",
        );

        let page = provider(dir.path())
            .fetch_historical_page(&LogGroupHandle::new("app"), &request(None, None))
            .await
            .unwrap();

        let messages: Vec<_> = page.events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(page.events[1].stream_name, "worker/worker_hg2xsgvsldqk/host2");
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_history_pagination_and_selection() {
        let dir = TempDir::new().unwrap();
        write_stream(
            dir.path(),
            "app",
            "web/a",
            "2025-01-01T00:00:01Z one\n2025-01-01T00:00:02Z two\n2025-01-01T00:00:03Z three\n",
        );
        write_stream(dir.path(), "app", "db/a", "2025-01-01T00:00:01Z other\n");

        let p = provider(dir.path());
        let handle = LogGroupHandle::new("app").with_stream_prefix("web/");

        let first = p.fetch_historical_page(&handle, &request(Some(2), None)).await.unwrap();
        assert_eq!(first.events.len(), 2);
        let second = p
            .fetch_historical_page(&handle, &request(Some(2), first.next_cursor.clone()))
            .await
            .unwrap();
        assert_eq!(second.events.len(), 1);
        assert_eq!(second.events[0].message, "three");
        assert!(second.next_cursor.is_none());

        let filtered = p
            .fetch_historical_page(&handle.clone().with_filter_pattern("tw"), &request(None, None))
            .await
            .unwrap();
        assert_eq!(filtered.events.len(), 1);
    }

    #[tokio::test]
    async fn test_continuation_lines_are_folded() {
        let dir = TempDir::new().unwrap();
        write_stream(
            dir.path(),
            "app",
            "web/a",
            "orphan before any timestamp\n2025-01-01T00:00:01Z panic\n  at main.rs:3\n",
        );

        let page = provider(dir.path())
            .fetch_historical_page(&LogGroupHandle::new("app"), &request(None, None))
            .await
            .unwrap();

        assert_eq!(page.events.len(), 1);
        assert_eq!(page.events[0].message, "panic\n  at main.rs:3");
    }

    #[tokio::test]
    async fn test_missing_group_is_not_found() {
        let dir = TempDir::new().unwrap();
        let p = provider(dir.path());
        let handle = LogGroupHandle::new("missing");

        let err = p.fetch_historical_page(&handle, &request(None, None)).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(p.open_live_tail(&handle, None).await.err().unwrap().is_not_found());
    }

    #[tokio::test]
    async fn test_live_tail_reads_appended_lines() {
        let dir = TempDir::new().unwrap();
        let path = write_stream(dir.path(), "app", "web/a", "2025-01-01T00:00:01Z old\n");

        let mut tail = provider(dir.path())
            .open_live_tail(&LogGroupHandle::new("app"), None)
            .await
            .unwrap();

        assert!(matches!(
            tail.next().await.unwrap(),
            Some(LiveTailEvent::SessionStart { .. })
        ));

        append(&path, "2025-01-01T00:00:05Z new\n2025-01-01T00:00:06Z partial");
        let batch = match tail.next().await.unwrap() {
            Some(LiveTailEvent::Events(batch)) => batch,
            other => panic!("expected events, got {:?}", other),
        };
        let messages: Vec<_> = batch.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["new"]);

        // Completing the partial line and adding a new stream
        append(&path, " line\n");
        write_stream(dir.path(), "app", "web/b", "2025-01-01T00:00:07Z fresh\n");
        let batch = match tail.next().await.unwrap() {
            Some(LiveTailEvent::Events(batch)) => batch,
            other => panic!("expected events, got {:?}", other),
        };
        let messages: Vec<_> = batch.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["partial line", "fresh"]);
    }

    #[tokio::test]
    async fn test_live_tail_from_delivers_stored_lines_at_or_after_start() {
        let dir = TempDir::new().unwrap();
        write_stream(
            dir.path(),
            "app",
            "web/a",
            "2025-01-01T00:00:01Z before\n2025-01-01T00:00:05Z at start\n2025-01-01T00:00:06Z after\n",
        );
        let from = chrono::DateTime::parse_from_rfc3339("2025-01-01T00:00:05Z")
            .unwrap()
            .timestamp_millis();

        let mut tail = provider(dir.path())
            .open_live_tail(&LogGroupHandle::new("app"), Some(from))
            .await
            .unwrap();
        tail.next().await.unwrap();

        let batch = match tail.next().await.unwrap() {
            Some(LiveTailEvent::Events(batch)) => batch,
            other => panic!("expected events, got {:?}", other),
        };
        let messages: Vec<_> = batch.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["at start", "after"]);

        // Later lines are not filtered by the start time
        write_stream(dir.path(), "app", "web/b", "2025-01-01T00:00:02Z late arrival\n");
        match tail.next().await.unwrap() {
            Some(LiveTailEvent::Events(batch)) => assert_eq!(batch[0].message, "late arrival"),
            other => panic!("expected events, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_live_tail_rereads_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = write_stream(
            dir.path(),
            "app",
            "web/a",
            "2025-01-01T00:00:01Z a fairly long old line\n",
        );

        let mut tail = provider(dir.path())
            .open_live_tail(&LogGroupHandle::new("app"), None)
            .await
            .unwrap();
        tail.next().await.unwrap();

        std::fs::write(&path, "2025-01-01T00:00:09Z short\n").unwrap();
        match tail.next().await.unwrap() {
            Some(LiveTailEvent::Events(batch)) => assert_eq!(batch[0].message, "short"),
            other => panic!("expected events, got {:?}", other),
        }
    }
}
