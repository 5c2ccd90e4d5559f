//! Per-source workers that feed the aggregator: the history-then-live tail and
//! the plain drain of a bounded historical stream.

use super::event::{now_millis, EventStream, LiveTailEvent, LogGroupHandle, RawBatch};
use super::provider::{LiveTail, LogProvider, ProviderError, SourceError};
use super::query::HistoryWindow;
use super::retry::{AbortCheck, RetryOutcome, RetryPolicy};
use crate::pipeline::aggregator::{AggregatedSource, SourceSink};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Maximum number of historical events handed to the consumer in one batch.
pub const HISTORY_BATCH_SIZE: usize = 100;

/// Lifecycle of a single source worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailPhase {
    Created,
    WaitingForGroup,
    DrainingHistory,
    Live,
    Finished,
}

pub type PhaseSender = watch::Sender<TailPhase>;
pub type PhaseReceiver = watch::Receiver<TailPhase>;

pub fn phase_channel() -> (PhaseSender, PhaseReceiver) {
    watch::channel(TailPhase::Created)
}

fn set_phase(phase: &Option<PhaseSender>, name: &str, next: TailPhase) {
    if let Some(tx) = phase {
        let previous = tx.send_replace(next);
        if previous != next {
            debug!(source = %name, from = ?previous, to = ?next, "Source phase changed");
        }
    }
}

/// Forward `stream` to `sink` in batches, oldest-first.
///
/// Returns `Ok(true)` when the stream was exhausted and `Ok(false)` when the
/// worker should stop (cancelled or consumer gone). Events collected before a
/// terminal error are still delivered.
pub async fn forward_stream(
    stream: EventStream,
    sink: &SourceSink<RawBatch>,
    batch_size: usize,
) -> Result<bool, SourceError> {
    let mut chunks = stream.ready_chunks(batch_size.max(1));

    loop {
        let chunk = tokio::select! {
            biased;
            _ = sink.token().cancelled() => return Ok(false),
            chunk = chunks.next() => chunk,
        };
        let Some(chunk) = chunk else {
            return Ok(true);
        };

        let mut batch = Vec::with_capacity(chunk.len());
        let mut failure = None;
        for item in chunk {
            match item {
                Ok(event) => batch.push(event),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if !batch.is_empty() && !sink.send(batch).await {
            return Ok(false);
        }
        if let Some(e) = failure {
            return Err(e);
        }
    }
}

/// One ordered, cancellable source over a single log group: optional history
/// window first, then live events.
///
/// With a gate, live events are held back until the gating source (usually
/// the merged history of the whole session) reports [`TailPhase::Finished`].
pub struct LiveQueryAndTail {
    name: String,
    provider: Arc<dyn LogProvider>,
    handle: LogGroupHandle,
    history: Option<HistoryWindow>,
    live_from: Option<i64>,
    gate: Option<PhaseReceiver>,
    retry: RetryPolicy,
    abort_check: Option<Arc<dyn AbortCheck>>,
    page_limit: usize,
    phase: Option<PhaseSender>,
}

impl LiveQueryAndTail {
    pub fn new(provider: Arc<dyn LogProvider>, handle: LogGroupHandle) -> Self {
        Self {
            name: handle.group_identifier.clone(),
            provider,
            handle,
            history: None,
            live_from: None,
            gate: None,
            retry: RetryPolicy::default(),
            abort_check: None,
            page_limit: 1000,
            phase: None,
        }
    }

    pub fn with_history(mut self, window: Option<HistoryWindow>) -> Self {
        self.history = window;
        self
    }

    /// Ask the live tail for stored events from this timestamp on.
    pub fn with_live_from(mut self, from: Option<i64>) -> Self {
        self.live_from = from;
        self
    }

    pub fn after(mut self, gate: PhaseReceiver) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_abort_check(mut self, check: Option<Arc<dyn AbortCheck>>) -> Self {
        self.abort_check = check;
        self
    }

    pub fn with_page_limit(mut self, page_limit: usize) -> Self {
        self.page_limit = page_limit.max(1);
        self
    }

    pub fn with_phase(mut self, phase: PhaseSender) -> Self {
        self.phase = Some(phase);
        self
    }

    async fn drain_history(&self, sink: &SourceSink<RawBatch>) -> Result<bool, SourceError> {
        let Some(window) = self.history else {
            return Ok(true);
        };
        set_phase(&self.phase, &self.name, TailPhase::DrainingHistory);
        let stream = window.stream(&self.provider, &self.handle, self.page_limit);
        forward_stream(stream, sink, HISTORY_BATCH_SIZE).await
    }

    /// Returns `false` if cancelled before the gate opened.
    async fn wait_for_gate(&self, sink: &SourceSink<RawBatch>) -> bool {
        let Some(mut gate) = self.gate.clone() else {
            return true;
        };
        set_phase(&self.phase, &self.name, TailPhase::DrainingHistory);

        loop {
            if *gate.borrow_and_update() == TailPhase::Finished {
                return true;
            }
            tokio::select! {
                biased;
                _ = sink.token().cancelled() => return false,
                changed = gate.changed() => {
                    // Gating source dropped without finishing
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    /// Bounded-only providers: walk the window bucket by bucket and stop at its end.
    async fn poll_history_only(&self, sink: &SourceSink<RawBatch>) -> Result<(), SourceError> {
        let window = self
            .history
            .unwrap_or_else(|| HistoryWindow::new(None, now_millis(), None));
        set_phase(&self.phase, &self.name, TailPhase::DrainingHistory);
        info!(source = %self.name, "Live tail unsupported, polling history only");
        let stream = window.stream(&self.provider, &self.handle, self.page_limit);
        forward_stream(stream, sink, HISTORY_BATCH_SIZE).await?;
        Ok(())
    }

    async fn open_tail(&self, sink: &SourceSink<RawBatch>) -> Result<Option<Box<dyn LiveTail>>, SourceError> {
        set_phase(&self.phase, &self.name, TailPhase::WaitingForGroup);

        let provider = &self.provider;
        let handle = &self.handle;
        let from = self.live_from;
        let outcome = self
            .retry
            .retry_not_found(
                &self.name,
                sink.token(),
                self.abort_check.as_deref(),
                move || provider.open_live_tail(handle, from),
            )
            .await
            .map_err(|e| SourceError::provider(&self.name, e))?;

        match outcome {
            RetryOutcome::Ready(tail) => Ok(Some(tail)),
            RetryOutcome::Cancelled => Ok(None),
            RetryOutcome::Aborted(reason) => Err(SourceError::TaskStopped {
                name: self.name.clone(),
                reason,
            }),
        }
    }

    /// Forward live batches until the session ends, fails, or is cancelled.
    async fn forward_live(
        &self,
        tail: &mut Box<dyn LiveTail>,
        sink: &SourceSink<RawBatch>,
    ) -> Result<(), SourceError> {
        set_phase(&self.phase, &self.name, TailPhase::Live);

        loop {
            let item = tokio::select! {
                biased;
                _ = sink.token().cancelled() => return Ok(()),
                item = tail.next() => item,
            };

            match item {
                Ok(Some(LiveTailEvent::SessionStart { session_id })) => {
                    info!(source = %self.name, session_id = %session_id, "Live tail session started");
                }
                Ok(Some(LiveTailEvent::Events(batch))) => {
                    if batch.is_empty() {
                        continue;
                    }
                    debug!(source = %self.name, count = batch.len(), "Received live batch");
                    if !sink.send(batch).await {
                        return Ok(());
                    }
                }
                Ok(None) => {
                    let pending = tail.error_source().and_then(|source| source.take_error());
                    return match pending {
                        Some(e) => self.session_error(e),
                        None => {
                            info!(source = %self.name, "Live tail session ended");
                            Ok(())
                        }
                    };
                }
                Err(e) => return self.session_error(e),
            }
        }
    }

    fn session_error(&self, e: ProviderError) -> Result<(), SourceError> {
        if e.is_not_found() {
            // The group went away underneath an open session
            warn!(source = %self.name, error = %e, "Log group disappeared, ending live tail");
            return Ok(());
        }
        error!(source = %self.name, error = %e, "Live tail failed");
        Err(SourceError::provider(&self.name, e))
    }

    async fn run_inner(&self, sink: &SourceSink<RawBatch>) -> Result<(), SourceError> {
        if !self.provider.supports_live_tail(&self.handle) {
            return self.poll_history_only(sink).await;
        }

        let Some(mut tail) = self.open_tail(sink).await? else {
            return Ok(());
        };

        // History is drained in full before any live event is forwarded
        let result = match self.drain_history(sink).await {
            Ok(true) if self.wait_for_gate(sink).await => self.forward_live(&mut tail, sink).await,
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = tail.close().await {
            warn!(source = %self.name, error = %e, "Failed to close live tail");
            sink.record_close_error(e);
        }

        result
    }
}

#[async_trait]
impl AggregatedSource<RawBatch> for LiveQueryAndTail {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(self: Box<Self>, sink: SourceSink<RawBatch>) -> Result<(), SourceError> {
        let result = self.run_inner(&sink).await;
        set_phase(&self.phase, &self.name, TailPhase::Finished);
        result
    }
}

/// Drains an already-built (merged, windowed) historical stream.
pub struct HistoricalSource {
    name: String,
    stream: EventStream,
    batch_size: usize,
    phase: Option<PhaseSender>,
}

impl HistoricalSource {
    pub fn new(name: impl Into<String>, stream: EventStream) -> Self {
        Self {
            name: name.into(),
            stream,
            batch_size: HISTORY_BATCH_SIZE,
            phase: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_phase(mut self, phase: PhaseSender) -> Self {
        self.phase = Some(phase);
        self
    }
}

#[async_trait]
impl AggregatedSource<RawBatch> for HistoricalSource {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn run(self: Box<Self>, sink: SourceSink<RawBatch>) -> Result<(), SourceError> {
        let HistoricalSource {
            name,
            stream,
            batch_size,
            phase,
        } = *self;

        set_phase(&phase, &name, TailPhase::DrainingHistory);
        let result = forward_stream(stream, &sink, batch_size).await.map(|_| ());
        set_phase(&phase, &name, TailPhase::Finished);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::aggregator::SourceAggregator;
    use crate::source::event::RawLogEvent;
    use crate::source::provider::{EventPage, ErrorSource, PageRequest};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct ScriptedTail {
        items: VecDeque<Result<Option<LiveTailEvent>, ProviderError>>,
        pending_error: Option<ProviderError>,
        closed: Arc<AtomicUsize>,
    }

    impl ErrorSource for ScriptedTail {
        fn take_error(&mut self) -> Option<ProviderError> {
            self.pending_error.take()
        }
    }

    #[async_trait]
    impl LiveTail for ScriptedTail {
        async fn next(&mut self) -> Result<Option<LiveTailEvent>, ProviderError> {
            match self.items.pop_front() {
                Some(item) => item,
                None => Ok(None),
            }
        }

        async fn close(&mut self) -> Result<(), ProviderError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn error_source(&mut self) -> Option<&mut dyn ErrorSource> {
            Some(self)
        }
    }

    /// Reports "not found" for the first `missing_for` open attempts.
    struct FakeProvider {
        history: Vec<RawLogEvent>,
        live: Mutex<Option<ScriptedTail>>,
        missing_for: usize,
        opens: AtomicUsize,
        opened_from: Mutex<Option<i64>>,
        live_supported: bool,
    }

    impl FakeProvider {
        fn new(history: &[i64], live: Vec<Result<Option<LiveTailEvent>, ProviderError>>) -> Self {
            Self {
                history: history
                    .iter()
                    .map(|ts| RawLogEvent::new("group", "s", format!("h{}", ts), *ts))
                    .collect(),
                live: Mutex::new(Some(ScriptedTail {
                    items: live.into(),
                    pending_error: None,
                    closed: Arc::new(AtomicUsize::new(0)),
                })),
                missing_for: 0,
                opens: AtomicUsize::new(0),
                opened_from: Mutex::new(None),
                live_supported: true,
            }
        }
    }

    #[async_trait]
    impl LogProvider for FakeProvider {
        fn supports_live_tail(&self, _handle: &LogGroupHandle) -> bool {
            self.live_supported
        }

        async fn fetch_historical_page(
            &self,
            _handle: &LogGroupHandle,
            request: &PageRequest,
        ) -> Result<EventPage, ProviderError> {
            Ok(EventPage {
                events: self
                    .history
                    .iter()
                    .filter(|e| e.timestamp >= request.start && e.timestamp < request.end)
                    .cloned()
                    .collect(),
                next_cursor: None,
            })
        }

        async fn open_live_tail(
            &self,
            _handle: &LogGroupHandle,
            from: Option<i64>,
        ) -> Result<Box<dyn LiveTail>, ProviderError> {
            *self.opened_from.lock().unwrap() = from;
            let attempt = self.opens.fetch_add(1, Ordering::SeqCst);
            if attempt < self.missing_for {
                return Err(ProviderError::NotFound("group".into()));
            }
            match self.live.lock().unwrap().take() {
                Some(tail) => Ok(Box::new(tail)),
                None => Err(ProviderError::Other("tail already opened".into())),
            }
        }
    }

    fn live_batch(timestamps: &[i64]) -> Result<Option<LiveTailEvent>, ProviderError> {
        Ok(Some(LiveTailEvent::Events(
            timestamps
                .iter()
                .map(|ts| RawLogEvent::new("group", "s", format!("l{}", ts), *ts))
                .collect(),
        )))
    }

    async fn run_source(source: LiveQueryAndTail) -> (Vec<String>, Option<SourceError>) {
        let mut agg = SourceAggregator::new(vec![Box::new(source)], 8, CancellationToken::new());
        let mut messages = Vec::new();
        while let Some(batch) = agg.receive().await {
            messages.extend(batch.into_iter().map(|e| e.message));
        }
        let err = agg.take_error();
        let _ = agg.close().await;
        (messages, err)
    }

    #[tokio::test]
    async fn test_history_is_drained_before_live_events() {
        let provider = Arc::new(FakeProvider::new(
            &[1, 2, 3],
            vec![
                Ok(Some(LiveTailEvent::SessionStart {
                    session_id: "abc".into(),
                })),
                live_batch(&[10, 11]),
            ],
        ));
        let (phase_tx, phase_rx) = phase_channel();
        let source = LiveQueryAndTail::new(provider, LogGroupHandle::new("group"))
            .with_history(Some(HistoryWindow::new(Some(0), 5, None)))
            .with_phase(phase_tx);

        let (messages, err) = run_source(source).await;
        assert_eq!(messages, vec!["h1", "h2", "h3", "l10", "l11"]);
        assert!(err.is_none());
        assert_eq!(*phase_rx.borrow(), TailPhase::Finished);
    }

    #[tokio::test]
    async fn test_waits_for_group_to_appear() {
        let mut provider = FakeProvider::new(&[], vec![live_batch(&[7])]);
        provider.missing_for = 3;
        let provider = Arc::new(provider);

        let source = LiveQueryAndTail::new(provider.clone(), LogGroupHandle::new("group"))
            .with_retry(RetryPolicy::fixed(Duration::from_millis(2)));

        let (messages, err) = run_source(source).await;
        assert_eq!(messages, vec!["l7"]);
        assert!(err.is_none());
        assert_eq!(provider.opens.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_error_ends_source_once() {
        let provider = Arc::new(FakeProvider::new(
            &[],
            vec![
                live_batch(&[1]),
                Err(ProviderError::AccessDenied("denied".into())),
                live_batch(&[2]),
            ],
        ));
        let closed = provider.live.lock().unwrap().as_ref().unwrap().closed.clone();

        let (messages, err) = run_source(LiveQueryAndTail::new(provider, LogGroupHandle::new("group"))).await;
        assert_eq!(messages, vec!["l1"]);
        assert!(matches!(
            err,
            Some(SourceError::Provider {
                error: ProviderError::AccessDenied(_),
                ..
            })
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_out_of_band_error_is_consulted_on_end() {
        let provider = FakeProvider::new(&[], vec![live_batch(&[1])]);
        if let Some(tail) = provider.live.lock().unwrap().as_mut() {
            tail.pending_error = Some(ProviderError::Other("stream reset".into()));
        }

        let (messages, err) =
            run_source(LiveQueryAndTail::new(Arc::new(provider), LogGroupHandle::new("group"))).await;
        assert_eq!(messages, vec!["l1"]);
        assert!(err.unwrap().to_string().contains("stream reset"));
    }

    #[tokio::test]
    async fn test_abort_check_stops_waiting() {
        struct Stopped;

        #[async_trait]
        impl AbortCheck for Stopped {
            async fn abort_reason(&self) -> Option<String> {
                Some("essential container exited".into())
            }
        }

        let mut provider = FakeProvider::new(&[], vec![]);
        provider.missing_for = usize::MAX;

        let source = LiveQueryAndTail::new(Arc::new(provider), LogGroupHandle::new("group"))
            .with_retry(RetryPolicy::fixed(Duration::from_millis(1)))
            .with_abort_check(Some(Arc::new(Stopped)));

        let (messages, err) = run_source(source).await;
        assert!(messages.is_empty());
        assert!(matches!(err, Some(SourceError::TaskStopped { .. })));
    }

    #[tokio::test]
    async fn test_history_only_provider_ends_at_window_end() {
        let mut provider = FakeProvider::new(&[1, 2, 3, 50], vec![]);
        provider.live_supported = false;

        let source = LiveQueryAndTail::new(Arc::new(provider), LogGroupHandle::new("group"))
            .with_history(Some(HistoryWindow::new(Some(0), 10, None)));

        let (messages, err) = run_source(source).await;
        assert_eq!(messages, vec!["h1", "h2", "h3"]);
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn test_gated_live_events_follow_the_gating_history() {
        let provider = Arc::new(FakeProvider::new(&[], vec![live_batch(&[10])]));
        let slow_history = futures::stream::iter([1, 2, 3])
            .then(|ts| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, SourceError>(RawLogEvent::new("other", "s", format!("h{}", ts), ts))
            })
            .boxed();

        let (history_tx, history_rx) = phase_channel();
        let history = HistoricalSource::new("history", slow_history)
            .with_batch_size(1)
            .with_phase(history_tx);
        let live = LiveQueryAndTail::new(provider.clone(), LogGroupHandle::new("group"))
            .with_live_from(Some(4))
            .after(history_rx);

        let mut agg = SourceAggregator::new(
            vec![Box::new(history), Box::new(live)],
            8,
            CancellationToken::new(),
        );
        let mut messages = Vec::new();
        while let Some(batch) = agg.receive().await {
            messages.extend(batch.into_iter().map(|e| e.message));
        }
        agg.close().await.unwrap();

        assert_eq!(messages, vec!["h1", "h2", "h3", "l10"]);
        assert_eq!(*provider.opened_from.lock().unwrap(), Some(4));
    }

    #[tokio::test]
    async fn test_historical_source_delivers_events_before_error() {
        let items: Vec<Result<RawLogEvent, SourceError>> = vec![
            Ok(RawLogEvent::new("g", "s", "a", 1)),
            Ok(RawLogEvent::new("g", "s", "b", 2)),
            Err(SourceError::provider("g", ProviderError::Other("boom".into()))),
        ];
        let stream = futures::stream::iter(items).boxed();

        let mut agg = SourceAggregator::new(
            vec![Box::new(HistoricalSource::new("history", stream))],
            4,
            CancellationToken::new(),
        );
        let mut messages = Vec::new();
        while let Some(batch) = agg.receive().await {
            messages.extend(batch.into_iter().map(|e| e.message));
        }
        assert_eq!(messages, vec!["a", "b"]);
        assert!(agg.take_error().is_some());
        agg.close().await.unwrap();
    }
}
