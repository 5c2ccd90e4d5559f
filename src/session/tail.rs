//! Wires log groups through the sources, the aggregator, the classifier and
//! the filter into one pull-based stream of canonical records.

use super::state::{SessionState, StateTracker};
use super::watchdog::{TaskAbortCheck, Watchdog};
use crate::classify::filter::Filter;
use crate::classify::record::CanonicalLogRecord;
use crate::classify::rules::{ClassifyStats, Classifier};
use crate::config::types::{ClassifierConfig, TailConfig};
use crate::pipeline::aggregator::{AggregatedSource, AggregatorError, SourceAggregator};
use crate::sequencer::merge_all;
use crate::source::event::{now_millis, LogGroupHandle, RawBatch, RawLogEvent};
use crate::source::live::{phase_channel, HistoricalSource, LiveQueryAndTail, PhaseReceiver};
use crate::source::provider::{LogProvider, SourceError, TaskHandle, TaskStatusProvider};
use crate::source::query::HistoryWindow;
use crate::source::retry::{AbortCheck, RetryPolicy};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no log groups to tail")]
    NoLogGroups,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),

    #[error("task failed: {0}")]
    TaskFailed(String),
}

/// What to tail and how.
#[derive(Debug, Clone, Default)]
pub struct TailRequest {
    pub handles: Vec<LogGroupHandle>,
    pub filter: Filter,
    /// Epoch millis; without it the window is "most recent"
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
    /// Keep forwarding live events after the history window
    pub follow: bool,
    /// Task whose termination ends the session
    pub task: Option<TaskHandle>,
}

impl TailRequest {
    /// The historical window to replay, if any, ending at `until` or `now`.
    fn history_window(&self, now: i64) -> Option<HistoryWindow> {
        if self.follow && self.since.is_none() && self.limit.is_none() {
            return None;
        }
        Some(HistoryWindow::new(self.since, self.until.unwrap_or(now), self.limit))
    }
}

/// Provider clients a session talks to.
#[derive(Clone)]
pub struct TailDeps {
    pub logs: Arc<dyn LogProvider>,
    pub tasks: Option<Arc<dyn TaskStatusProvider>>,
}

/// Builds source workers with the session's shared settings.
struct SourceFactory {
    deps: TailDeps,
    settings: TailConfig,
    window: Option<HistoryWindow>,
    abort_check: Option<Arc<dyn AbortCheck>>,
    state: StateTracker,
}

impl SourceFactory {
    /// Live tail of one group. Without a window the tail starts with new
    /// events only; with one it picks up right where the window ends.
    fn live(
        &self,
        handle: LogGroupHandle,
        history: Option<HistoryWindow>,
        gate: Option<PhaseReceiver>,
    ) -> Box<dyn AggregatedSource<RawBatch>> {
        let (phase_tx, phase_rx) = phase_channel();
        self.state.track(phase_rx);

        let mut source = LiveQueryAndTail::new(Arc::clone(&self.deps.logs), handle)
            .with_history(history)
            .with_live_from(self.window.map(|w| w.end))
            .with_retry(RetryPolicy::fixed(self.settings.not_found_retry_interval))
            .with_abort_check(self.abort_check.clone())
            .with_page_limit(self.settings.page_limit)
            .with_phase(phase_tx);
        if let Some(gate) = gate {
            source = source.after(gate);
        }
        Box::new(source)
    }

    /// Merged history of every group, then one gated live tail per group that
    /// supports it. Groups without live tail are fully covered by the history.
    fn follow(&self, handles: &[LogGroupHandle]) -> Vec<Box<dyn AggregatedSource<RawBatch>>> {
        if self.window.is_none() {
            return handles.iter().map(|h| self.live(h.clone(), None, None)).collect();
        }

        let (history, gate) = self.merged_history(handles);
        let mut sources = vec![history];
        sources.extend(
            handles
                .iter()
                .filter(|h| self.deps.logs.supports_live_tail(h))
                .map(|h| self.live(h.clone(), None, Some(gate.clone()))),
        );
        sources
    }

    /// One globally ordered source over every group's history, and a receiver
    /// that reports when it has finished.
    fn merged_history(
        &self,
        handles: &[LogGroupHandle],
    ) -> (Box<dyn AggregatedSource<RawBatch>>, PhaseReceiver) {
        let window = self
            .window
            .unwrap_or_else(|| HistoryWindow::new(None, now_millis(), None));
        let streams = handles
            .iter()
            .map(|handle| window.query_stream(&self.deps.logs, handle, self.settings.page_limit))
            .collect();
        let merged = window.apply(merge_all(streams));

        let (phase_tx, phase_rx) = phase_channel();
        self.state.track(phase_rx.clone());
        (Box::new(HistoricalSource::new("history", merged).with_phase(phase_tx)), phase_rx)
    }
}

pub struct TailSession {
    aggregator: SourceAggregator<RawBatch>,
    classifier: Classifier,
    filter: Filter,
    pending: VecDeque<CanonicalLogRecord>,
    state: StateTracker,
    token: CancellationToken,
    watchdog: Option<JoinHandle<()>>,
    task_failure: Option<Arc<Mutex<Option<String>>>>,
    factory: SourceFactory,
    follow: bool,
    closed: bool,
}

impl TailSession {
    /// Start every source and the task watchdog. Must be called inside a Tokio runtime.
    pub fn start(
        request: TailRequest,
        deps: TailDeps,
        settings: TailConfig,
        classifier: ClassifierConfig,
    ) -> Result<Self, SessionError> {
        if request.handles.is_empty() {
            return Err(SessionError::NoLogGroups);
        }

        let token = CancellationToken::new();
        let state = StateTracker::new();

        let abort_check: Option<Arc<dyn AbortCheck>> = match (&deps.tasks, &request.task) {
            (Some(tasks), Some(task)) => Some(Arc::new(TaskAbortCheck::new(Arc::clone(tasks), task.clone()))),
            _ => None,
        };

        let factory = SourceFactory {
            deps,
            settings,
            window: request.history_window(now_millis()),
            abort_check,
            state: state.clone(),
        };

        let sources = if request.follow {
            factory.follow(&request.handles)
        } else {
            vec![factory.merged_history(&request.handles).0]
        };
        let aggregator = SourceAggregator::new(sources, factory.settings.queue_capacity, token.clone());

        let mut watchdog = None;
        let mut task_failure = None;
        if let (Some(tasks), Some(task)) = (&factory.deps.tasks, &request.task) {
            let dog = Watchdog::new(Arc::clone(tasks), task.clone(), token.clone(), state.clone())
                .with_timing(factory.settings.task_poll_interval, factory.settings.task_stop_grace);
            task_failure = Some(dog.failure_slot());
            watchdog = Some(dog.spawn());
        }

        info!(
            groups = request.handles.len(),
            follow = request.follow,
            since = ?request.since,
            until = ?request.until,
            limit = ?request.limit,
            "Tail session started"
        );

        Ok(Self {
            aggregator,
            classifier: Classifier::new(classifier),
            filter: request.filter,
            pending: VecDeque::new(),
            state,
            token,
            watchdog,
            task_failure,
            factory,
            follow: request.follow,
            closed: false,
        })
    }

    /// Start tailing one more group. Its history is delivered separately, not
    /// merged with the groups already running.
    pub fn add_group(&mut self, handle: LogGroupHandle) -> Result<(), SessionError> {
        let source = if self.follow {
            self.factory.live(handle, self.factory.window, None)
        } else {
            self.factory.merged_history(std::slice::from_ref(&handle)).0
        };
        self.aggregator.add_source(source)?;
        Ok(())
    }

    /// Next record, or `None` once every source has finished or the session
    /// was cancelled. Check [`take_error`](Self::take_error) afterwards.
    pub async fn receive(&mut self) -> Option<CanonicalLogRecord> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(record);
            }
            let batch = self.aggregator.receive().await?;
            self.classify_batch(&batch);
        }
    }

    fn classify_batch(&mut self, batch: &[RawLogEvent]) {
        let mut rest = batch;
        while let Some(first) = rest.first() {
            let run_len = rest.iter().take_while(|e| e.same_stream(first)).count();
            let (run, tail) = rest.split_at(run_len);
            rest = tail;

            let header = self.classifier.batch_header(first);
            if !self.filter.accepts_batch(&header) {
                debug!(
                    group = %first.source_group_id,
                    stream = %first.stream_name,
                    count = run.len(),
                    "Batch rejected by filter"
                );
                continue;
            }

            for event in run {
                if let Some(record) = self.classifier.classify_event(&header, event) {
                    if self.filter.accepts_record(&record) {
                        self.pending.push_back(record);
                    }
                }
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    pub fn stats(&self) -> &ClassifyStats {
        self.classifier.stats()
    }

    /// The error that ended the session: the first fatal source error, else the
    /// watched task's failure. Returns each error once.
    pub fn take_error(&mut self) -> Option<SessionError> {
        if let Some(e) = self.aggregator.take_error() {
            return Some(SessionError::Source(e));
        }
        self.task_failure
            .as_ref()
            .and_then(|slot| slot.lock().ok().and_then(|mut detail| detail.take()))
            .map(SessionError::TaskFailed)
    }

    /// Stop all sources. `receive` returns `None` once buffered records are drained.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel everything and wait for all workers. Idempotent.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.token.cancel();
        let result = self.aggregator.close().await;

        if let Some(watchdog) = self.watchdog.take() {
            if let Err(e) = watchdog.await {
                debug!(error = %e, "Watchdog task ended abnormally");
            }
        }
        self.state.mark_closed();

        let stats = self.classifier.stats();
        debug!(
            classified = stats.classified(),
            dropped_unmatched = stats.dropped_unmatched,
            dropped_malformed = stats.dropped_malformed,
            access_log = stats.access_log,
            lifecycle = stats.lifecycle,
            control_plane = stats.control_plane,
            build = stats.build,
            sidecar = stats.sidecar,
            service = stats.service,
            "Classification summary"
        );
        info!("Tail session closed");

        result.map_err(SessionError::from)
    }
}
