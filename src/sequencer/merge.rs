use futures::stream::{self, BoxStream, StreamExt};

/// Anything ordered by a millisecond timestamp.
pub trait Timestamped {
    fn timestamp_millis(&self) -> i64;
}

/// Ascending stream terminated by at most one error.
pub type OrderedStream<T, E> = BoxStream<'static, Result<T, E>>;

/// Merge two ascending streams into one ascending stream.
///
/// Each side is pulled only when its head slot is empty, so a consumer that
/// stops early never forces either input to be drained. On equal timestamps
/// the left event is emitted first. A missing side degenerates to a
/// pass-through of the other. An error from either side is emitted once and
/// ends the merge; whatever the other side had buffered is discarded.
pub fn merge<T, E>(
    left: Option<OrderedStream<T, E>>,
    right: Option<OrderedStream<T, E>>,
) -> OrderedStream<T, E>
where
    T: Timestamped + Send + 'static,
    E: Send + 'static,
{
    match (left, right) {
        (None, None) => stream::empty().boxed(),
        (Some(only), None) | (None, Some(only)) => only,
        (Some(left), Some(right)) => {
            let state = MergeState {
                left: Side::new(left),
                right: Side::new(right),
                failed: false,
            };
            stream::unfold(state, |mut state| async move {
                let item = state.next().await?;
                Some((item, state))
            })
            .boxed()
        }
    }
}

/// Merge any number of ascending streams by repeated pairwise merging.
///
/// Earlier streams win ties against later ones.
pub fn merge_all<T, E>(streams: Vec<OrderedStream<T, E>>) -> OrderedStream<T, E>
where
    T: Timestamped + Send + 'static,
    E: Send + 'static,
{
    streams
        .into_iter()
        .fold(None, |merged, next| Some(merge(merged, Some(next))))
        .unwrap_or_else(|| stream::empty().boxed())
}

struct Side<T, E> {
    stream: Option<OrderedStream<T, E>>,
    head: Option<T>,
}

impl<T, E> Side<T, E> {
    fn new(stream: OrderedStream<T, E>) -> Self {
        Self {
            stream: Some(stream),
            head: None,
        }
    }

    /// Pull one item into the head slot if it is empty and the input is live.
    async fn fill(&mut self) -> Result<(), E> {
        if self.head.is_some() {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        match stream.next().await {
            Some(Ok(item)) => self.head = Some(item),
            Some(Err(e)) => {
                self.stream = None;
                return Err(e);
            }
            None => self.stream = None,
        }
        Ok(())
    }
}

struct MergeState<T, E> {
    left: Side<T, E>,
    right: Side<T, E>,
    failed: bool,
}

impl<T: Timestamped, E> MergeState<T, E> {
    async fn next(&mut self) -> Option<Result<T, E>> {
        if self.failed {
            return None;
        }

        if let Err(e) = self.left.fill().await {
            self.failed = true;
            return Some(Err(e));
        }
        if let Err(e) = self.right.fill().await {
            self.failed = true;
            return Some(Err(e));
        }

        let take_right = match (&self.left.head, &self.right.head) {
            (Some(l), Some(r)) => r.timestamp_millis() < l.timestamp_millis(),
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => return None,
        };

        let item = if take_right {
            self.right.head.take()
        } else {
            self.left.head.take()
        };
        item.map(Ok)
    }
}
