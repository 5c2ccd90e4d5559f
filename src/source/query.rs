use super::event::{EventStream, LogGroupHandle, RawLogEvent};
use super::provider::{LogProvider, PageRequest, ProviderError, SourceError};
use crate::sequencer::window::{take_first_n, take_last_n};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How far a capped request is widened when a full page made no progress past
/// the boundary timestamp.
pub const BOUNDARY_RELAX_STEP: usize = 100;

/// A bounded historical query over one log group.
#[derive(Clone)]
pub struct HistoricalQuery {
    provider: Arc<dyn LogProvider>,
    handle: LogGroupHandle,
    start: i64,
    end: i64,
    cap: Option<usize>,
    page_limit: usize,
}

impl HistoricalQuery {
    pub fn new(provider: Arc<dyn LogProvider>, handle: LogGroupHandle, start: i64, end: i64) -> Self {
        Self {
            provider,
            handle,
            start,
            end,
            cap: None,
            page_limit: 1000,
        }
    }

    /// Stop after `cap` events in total.
    pub fn with_cap(mut self, cap: Option<usize>) -> Self {
        self.cap = cap;
        self
    }

    /// Maximum events requested per provider call.
    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    pub fn pager(self) -> HistoricalPager {
        let start = self.start;
        HistoricalPager {
            query: self,
            start,
            cursor: None,
            emitted: 0,
            boundary_seen: 0,
            relax: 0,
            done: false,
        }
    }

    /// Deliver every page oldest-first to `on_page` until the window is
    /// exhausted, the cap is reached, the callback breaks, or `token` fires.
    pub async fn run<F>(self, token: &CancellationToken, mut on_page: F) -> Result<(), ProviderError>
    where
        F: FnMut(Vec<RawLogEvent>) -> ControlFlow<()>,
    {
        let mut pager = self.pager();
        loop {
            let page = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                page = pager.next_page() => page?,
            };
            match page {
                Some(events) => {
                    if on_page(events).is_break() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
        }
    }

    /// Lazily paginated event stream. Pages are fetched only as the consumer pulls.
    pub fn into_stream(self) -> EventStream {
        let name = self.handle.group_identifier.clone();
        let state = (self.pager(), VecDeque::new(), false);

        stream::unfold(state, move |(mut pager, mut buffered, failed)| {
            let name = name.clone();
            async move {
                if failed {
                    return None;
                }
                loop {
                    if let Some(event) = buffered.pop_front() {
                        return Some((Ok(event), (pager, buffered, false)));
                    }
                    match pager.next_page().await {
                        Ok(Some(events)) => buffered.extend(events),
                        Ok(None) => return None,
                        Err(e) => {
                            return Some((Err(SourceError::provider(name, e)), (pager, buffered, true)))
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

/// Page-by-page driver for a [`HistoricalQuery`].
pub struct HistoricalPager {
    query: HistoricalQuery,
    /// Lower bound of the next request; advances when re-querying by timestamp
    start: i64,
    cursor: Option<String>,
    emitted: usize,
    /// Events at `start` already delivered, skipped when the provider repeats them
    boundary_seen: usize,
    relax: usize,
    done: bool,
}

impl HistoricalPager {
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Next non-empty page, or `None` once the query is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<RawLogEvent>>, ProviderError> {
        loop {
            if self.done || self.start >= self.query.end {
                self.done = true;
                return Ok(None);
            }

            let remaining = self.query.cap.map(|cap| cap.saturating_sub(self.emitted));
            if remaining == Some(0) {
                self.done = true;
                return Ok(None);
            }

            let base = remaining.map_or(self.query.page_limit, |r| r.min(self.query.page_limit));
            let limit = base + self.boundary_seen + self.relax;
            let request = PageRequest {
                start: self.start,
                end: self.query.end,
                limit: Some(limit),
                cursor: self.cursor.clone(),
            };

            let page = match self
                .query
                .provider
                .fetch_historical_page(&self.query.handle, &request)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_not_found() => {
                    // Nothing to read yet; the group may be created later
                    debug!(
                        group = %self.query.handle.group_identifier,
                        error = %e,
                        "Group not found, treating history as empty"
                    );
                    self.done = true;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            let fetched = page.events.len();
            let full = fetched >= limit;
            let last_timestamp = page.events.last().map(|e| e.timestamp);
            let at_last = last_timestamp
                .map(|ts| page.events.iter().filter(|e| e.timestamp == ts).count())
                .unwrap_or(0);

            let mut events = page.events;
            if request.cursor.is_none() && self.boundary_seen > 0 {
                let repeated = events
                    .iter()
                    .take(self.boundary_seen)
                    .take_while(|e| e.timestamp == request.start)
                    .count();
                events.drain(..repeated);
            }
            if let Some(r) = remaining {
                events.truncate(r);
            }
            self.emitted += events.len();

            match page.next_cursor {
                Some(cursor) => {
                    self.cursor = Some(cursor);
                    self.boundary_seen = 0;
                    self.relax = 0;
                }
                None if full => {
                    // Provider stopped at the limit without a cursor: re-query from
                    // the last timestamp seen.
                    let Some(last) = last_timestamp else {
                        self.done = true;
                        continue;
                    };
                    self.cursor = None;
                    if last == request.start {
                        self.boundary_seen = fetched;
                        self.relax += BOUNDARY_RELAX_STEP;
                        warn!(
                            group = %self.query.handle.group_identifier,
                            boundary = last,
                            limit = limit,
                            "Page did not advance past boundary timestamp, widening request"
                        );
                    } else {
                        self.start = last;
                        self.boundary_seen = at_last;
                        self.relax = 0;
                    }
                }
                None => self.done = true,
            }

            if let Some(cap) = self.query.cap {
                if self.emitted >= cap {
                    self.done = true;
                }
            }

            debug!(
                group = %self.query.handle.group_identifier,
                fetched = fetched,
                delivered = events.len(),
                done = self.done,
                "Fetched historical page"
            );

            if !events.is_empty() {
                return Ok(Some(events));
            }
        }
    }
}

/// A historical window with optional "first N" / "last N" semantics.
///
/// With an explicit `start` the window yields the oldest `limit` events from
/// `start`; without one it yields the most recent `limit` events before `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryWindow {
    pub start: Option<i64>,
    pub end: i64,
    pub limit: Option<usize>,
}

impl HistoryWindow {
    pub fn new(start: Option<i64>, end: i64, limit: Option<usize>) -> Self {
        Self { start, end, limit }
    }

    fn limit_as_n(&self) -> i64 {
        self.limit.map(|n| n as i64).unwrap_or(0)
    }

    /// Raw ascending stream for one group, split into the provider's buckets,
    /// without the windowing decorator applied. A group that does not exist
    /// yet yields nothing.
    pub fn query_stream(
        &self,
        provider: &Arc<dyn LogProvider>,
        handle: &LogGroupHandle,
        page_limit: usize,
    ) -> EventStream {
        // First-N can be capped at the provider; last-N must scan the whole window.
        let cap = if self.start.is_some() { self.limit } else { None };

        let ranges = match provider.history_bucket_millis(handle) {
            Some(bucket) if bucket > 0 => {
                // Without an explicit start a bucketed provider only looks back one bucket
                let start = self.start.unwrap_or(self.end - bucket);
                bucket_ranges(start, self.end, bucket)
            }
            _ => vec![(self.start.unwrap_or(0), self.end)],
        };

        let provider = Arc::clone(provider);
        let handle = handle.clone();
        let queries = ranges.into_iter().map(move |(from, to)| {
            HistoricalQuery::new(Arc::clone(&provider), handle.clone(), from, to)
                .with_cap(cap)
                .with_page_limit(page_limit)
                .into_stream()
        });
        stream::iter(queries).flatten().boxed()
    }

    /// Apply the window's first-N / last-N decorator to an ascending stream.
    pub fn apply(&self, stream: EventStream) -> EventStream {
        match (self.start, self.limit) {
            (_, None) => stream,
            (Some(_), Some(_)) => take_first_n(stream, self.limit_as_n()),
            (None, Some(_)) => take_last_n(stream, self.limit_as_n()),
        }
    }

    /// Windowed stream for a single group.
    pub fn stream(
        &self,
        provider: &Arc<dyn LogProvider>,
        handle: &LogGroupHandle,
        page_limit: usize,
    ) -> EventStream {
        self.apply(self.query_stream(provider, handle, page_limit))
    }
}

/// Split `[start, end)` at multiples of `bucket`, e.g. UTC day boundaries.
pub fn bucket_ranges(start: i64, end: i64, bucket: i64) -> Vec<(i64, i64)> {
    let mut ranges = Vec::new();
    if start >= end || bucket <= 0 {
        return ranges;
    }
    let mut from = start;
    while from < end {
        let boundary = (from.div_euclid(bucket) + 1) * bucket;
        let to = boundary.min(end);
        ranges.push((from, to));
        from = to;
    }
    ranges
}
