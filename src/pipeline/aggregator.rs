//! Fan-in of many concurrently running sources into one bounded queue.
//!
//! Ownership of the consumer-facing queue: workers only ever hold sender
//! clones, and the aggregator's own sender is dropped by the coordinator task
//! once every worker has exited. The queue therefore closes exactly when the
//! last worker is gone, never earlier, and nothing can send into it afterwards.

use super::channel::{create_channel, send_or_cancel, Receiver, SendOutcome, Sender};
use crate::source::provider::SourceError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("aggregator is closed, cannot add source '{0}'")]
    Closed(String),

    #[error("errors while closing sources: {}", .0.join("; "))]
    Close(Vec<String>),

    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A long-running producer owned by one aggregator worker.
#[async_trait]
pub trait AggregatedSource<T>: Send + 'static {
    fn name(&self) -> String;

    /// Produce items into `sink` until exhausted, cancelled, or failed.
    ///
    /// Returning `Err` is fatal: the error lands in the aggregator's error slot
    /// and, since the sink is consumed, the source cannot send anything after it.
    async fn run(self: Box<Self>, sink: SourceSink<T>) -> Result<(), SourceError>;
}

/// A worker's handle on the shared queue.
pub struct SourceSink<T> {
    name: String,
    tx: Sender<T>,
    token: CancellationToken,
    close_errors: Arc<Mutex<Vec<String>>>,
}

impl<T> SourceSink<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns false once the worker should stop: the session was cancelled or
    /// the consumer has gone away.
    pub async fn send(&self, item: T) -> bool {
        match send_or_cancel(&self.tx, item, &self.token).await {
            SendOutcome::Sent => true,
            SendOutcome::Cancelled => false,
            SendOutcome::Closed => {
                debug!(source = %self.name, "Consumer queue closed");
                false
            }
        }
    }

    /// Record a non-fatal error from releasing the source's resources.
    pub fn record_close_error(&self, error: impl std::fmt::Display) {
        if let Ok(mut guard) = self.close_errors.lock() {
            guard.push(format!("{}: {}", self.name, error));
        }
    }
}

pub struct SourceAggregator<T> {
    rx: Receiver<T>,
    /// Master sender, cloned for each new worker; taken by the coordinator
    tx: Arc<Mutex<Option<Sender<T>>>>,
    tracker: TaskTracker,
    token: CancellationToken,
    error_slot: Arc<Mutex<Option<SourceError>>>,
    close_errors: Arc<Mutex<Vec<String>>>,
    coordinator: Option<JoinHandle<()>>,
    closed: bool,
}

impl<T: Send + 'static> SourceAggregator<T> {
    /// Start one worker per source. Further sources may be added with
    /// [`add_source`](Self::add_source) while any worker is still running.
    pub fn new(
        sources: Vec<Box<dyn AggregatedSource<T>>>,
        capacity: usize,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = create_channel(capacity);
        let mut aggregator = Self {
            rx,
            tx: Arc::new(Mutex::new(Some(tx))),
            tracker: TaskTracker::new(),
            token,
            error_slot: Arc::new(Mutex::new(None)),
            close_errors: Arc::new(Mutex::new(Vec::new())),
            coordinator: None,
            closed: false,
        };

        for source in sources {
            // Cannot fail: the coordinator has not started yet
            let _ = aggregator.add_source(source);
        }

        // From here on the tracker may become empty, which lets the coordinator finish
        aggregator.tracker.close();

        let tracker = aggregator.tracker.clone();
        let tx = Arc::clone(&aggregator.tx);
        aggregator.coordinator = Some(tokio::spawn(async move {
            tracker.wait().await;
            if let Ok(mut guard) = tx.lock() {
                guard.take();
            }
            debug!("All source workers exited, released consumer queue");
        }));

        aggregator
    }

    /// Start a worker for `source`.
    ///
    /// The worker is registered with the join tracker before it starts running,
    /// so a concurrent `close` always waits for it.
    pub fn add_source(&self, source: Box<dyn AggregatedSource<T>>) -> Result<(), AggregatorError> {
        let name = source.name();
        let guard = self
            .tx
            .lock()
            .map_err(|_| AggregatorError::Closed(name.clone()))?;
        let Some(tx) = guard.as_ref() else {
            return Err(AggregatorError::Closed(name));
        };
        if self.closed || self.token.is_cancelled() {
            return Err(AggregatorError::Closed(name));
        }

        let sink = SourceSink {
            name: name.clone(),
            tx: tx.clone(),
            token: self.token.clone(),
            close_errors: Arc::clone(&self.close_errors),
        };
        let error_slot = Arc::clone(&self.error_slot);
        let token = self.token.clone();

        self.tracker.spawn(async move {
            debug!(source = %name, "Source worker started");
            match source.run(sink).await {
                Ok(()) => debug!(source = %name, "Source worker finished"),
                Err(e) => {
                    let message = e.to_string();
                    let mut first = false;
                    if let Ok(mut slot) = error_slot.lock() {
                        if slot.is_none() {
                            *slot = Some(e);
                            first = true;
                        }
                    }
                    if first {
                        error!(source = %name, error = %message, "Source failed, cancelling remaining sources");
                        token.cancel();
                    } else {
                        debug!(source = %name, error = %message, "Discarding error from source after first failure");
                    }
                }
            }
        });
        drop(guard);

        Ok(())
    }

    /// Next item from any source, or `None` once every worker has exited and
    /// the queue is drained.
    pub async fn receive(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the first fatal source error, if any. Later calls return `None`.
    pub fn take_error(&self) -> Option<SourceError> {
        self.error_slot.lock().ok().and_then(|mut slot| slot.take())
    }

    pub fn has_error(&self) -> bool {
        self.error_slot
            .lock()
            .map(|slot| slot.is_some())
            .unwrap_or(false)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Number of workers still running.
    pub fn active_sources(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel all sources, wait for every worker to exit, then close the queue.
    ///
    /// Non-fatal close errors reported by sources are combined into one error.
    /// Calling `close` again is a no-op.
    pub async fn close(&mut self) -> Result<(), AggregatorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        if let Some(coordinator) = self.coordinator.take() {
            coordinator.await?;
        }
        self.rx.close();

        let close_errors = self
            .close_errors
            .lock()
            .map(|mut errors| std::mem::take(&mut *errors))
            .unwrap_or_default();

        info!(close_errors = close_errors.len(), "Aggregator closed");

        if close_errors.is_empty() {
            Ok(())
        } else {
            Err(AggregatorError::Close(close_errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::provider::ProviderError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Emits `count` numbered items, then optionally fails.
    struct Counter {
        name: &'static str,
        count: u32,
        fail: bool,
    }

    #[async_trait]
    impl AggregatedSource<String> for Counter {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn run(self: Box<Self>, sink: SourceSink<String>) -> Result<(), SourceError> {
            for i in 0..self.count {
                if !sink.send(format!("{}-{}", self.name, i)).await {
                    return Ok(());
                }
            }
            if self.fail {
                return Err(SourceError::provider(
                    self.name,
                    ProviderError::AccessDenied("denied".into()),
                ));
            }
            Ok(())
        }
    }

    /// Never produces anything; waits in a one-second polling loop until cancelled.
    struct Stuck {
        exited: Arc<AtomicUsize>,
        close_error: bool,
    }

    #[async_trait]
    impl AggregatedSource<String> for Stuck {
        fn name(&self) -> String {
            "stuck".to_string()
        }

        async fn run(self: Box<Self>, sink: SourceSink<String>) -> Result<(), SourceError> {
            loop {
                tokio::select! {
                    _ = sink.token().cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            if self.close_error {
                sink.record_close_error("session close failed");
            }
            self.exited.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counter(name: &'static str, count: u32) -> Box<dyn AggregatedSource<String>> {
        Box::new(Counter {
            name,
            count,
            fail: false,
        })
    }

    #[tokio::test]
    async fn test_queue_closes_after_all_workers_exit() {
        let mut agg = SourceAggregator::new(
            vec![counter("a", 3), counter("b", 2)],
            2,
            CancellationToken::new(),
        );

        let mut items = Vec::new();
        while let Some(item) = agg.receive().await {
            items.push(item);
        }

        assert_eq!(items.len(), 5);
        // Per-source order is preserved
        let from_a: Vec<_> = items.iter().filter(|i| i.starts_with("a-")).cloned().collect();
        assert_eq!(from_a, vec!["a-0", "a-1", "a-2"]);
        assert!(agg.take_error().is_none());
        agg.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_sources() {
        let mut agg: SourceAggregator<String> =
            SourceAggregator::new(Vec::new(), 4, CancellationToken::new());
        assert!(agg.receive().await.is_none());
        agg.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_joins_stuck_workers_promptly() {
        for k in 0..4 {
            let exited = Arc::new(AtomicUsize::new(0));
            let sources: Vec<Box<dyn AggregatedSource<String>>> = (0..k)
                .map(|_| {
                    Box::new(Stuck {
                        exited: Arc::clone(&exited),
                        close_error: false,
                    }) as Box<dyn AggregatedSource<String>>
                })
                .collect();
            let mut agg = SourceAggregator::new(sources, 4, CancellationToken::new());

            let started = Instant::now();
            agg.close().await.unwrap();
            assert!(started.elapsed() < Duration::from_secs(1));
            assert_eq!(exited.load(Ordering::SeqCst), k);
            assert_eq!(agg.active_sources(), 0);
        }
    }

    #[tokio::test]
    async fn test_first_error_wins_and_cancels_siblings() {
        let exited = Arc::new(AtomicUsize::new(0));
        let mut agg = SourceAggregator::new(
            vec![
                Box::new(Counter {
                    name: "bad",
                    count: 1,
                    fail: true,
                }),
                Box::new(Stuck {
                    exited: Arc::clone(&exited),
                    close_error: false,
                }),
            ],
            8,
            CancellationToken::new(),
        );

        let mut items = Vec::new();
        while let Some(item) = agg.receive().await {
            items.push(item);
        }

        // The item sent before the failure is still delivered
        assert_eq!(items, vec!["bad-0"]);
        assert_eq!(exited.load(Ordering::SeqCst), 1);

        let err = agg.take_error().expect("error should be recorded");
        assert!(err.to_string().contains("bad"));
        assert!(agg.take_error().is_none());
        agg.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_aggregates_close_errors() {
        let exited = Arc::new(AtomicUsize::new(0));
        let sources: Vec<Box<dyn AggregatedSource<String>>> = (0..2)
            .map(|_| {
                Box::new(Stuck {
                    exited: Arc::clone(&exited),
                    close_error: true,
                }) as Box<dyn AggregatedSource<String>>
            })
            .collect();
        let mut agg = SourceAggregator::new(sources, 4, CancellationToken::new());

        match agg.close().await {
            Err(AggregatorError::Close(errors)) => assert_eq!(errors.len(), 2),
            other => panic!("expected close error, got {:?}", other),
        }
        // Idempotent
        agg.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_add_source_while_running() {
        let exited = Arc::new(AtomicUsize::new(0));
        let mut agg = SourceAggregator::new(
            vec![Box::new(Stuck {
                exited: Arc::clone(&exited),
                close_error: false,
            })],
            8,
            CancellationToken::new(),
        );

        agg.add_source(counter("late", 2)).unwrap();
        assert_eq!(agg.receive().await.as_deref(), Some("late-0"));
        assert_eq!(agg.receive().await.as_deref(), Some("late-1"));

        agg.close().await.unwrap();
        assert!(agg.add_source(counter("after-close", 1)).is_err());
    }

    #[tokio::test]
    async fn test_add_source_after_queue_released_fails() {
        let mut agg = SourceAggregator::new(vec![counter("a", 1)], 4, CancellationToken::new());
        while agg.receive().await.is_some() {}
        assert!(matches!(
            agg.add_source(counter("b", 1)),
            Err(AggregatorError::Closed(_))
        ));
    }
}
