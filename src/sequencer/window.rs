use super::merge::OrderedStream;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;

/// Keep the first `n` events, then stop pulling from the input.
///
/// `n <= 0` leaves the stream untouched. Errors are passed through and do
/// not count toward `n`.
pub fn take_first_n<T, E>(input: OrderedStream<T, E>, n: i64) -> OrderedStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    if n <= 0 {
        return input;
    }

    stream::unfold((input, n as usize), |(mut input, remaining)| async move {
        if remaining == 0 {
            return None;
        }
        let item = input.next().await?;
        let remaining = if item.is_ok() { remaining - 1 } else { remaining };
        Some((item, (input, remaining)))
    })
    .boxed()
}

/// Keep only the most recent `n` events, emitted once the input is exhausted.
///
/// Buffers at most `n` events (oldest dropped first). A terminal error is
/// emitted after the buffered events. `n <= 0` leaves the stream untouched.
pub fn take_last_n<T, E>(input: OrderedStream<T, E>, n: i64) -> OrderedStream<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    if n <= 0 {
        return input;
    }
    let n = n as usize;

    let drained = async move {
        let mut input = input;
        let mut window: VecDeque<T> = VecDeque::with_capacity(n.min(1024));
        let mut error = None;

        while let Some(item) = input.next().await {
            match item {
                Ok(value) => {
                    if window.len() == n {
                        window.pop_front();
                    }
                    window.push_back(value);
                }
                Err(e) => {
                    error = Some(e);
                    break;
                }
            }
        }

        let items: Vec<Result<T, E>> = window.into_iter().map(Ok).chain(error.map(Err)).collect();
        stream::iter(items)
    };

    stream::once(drained).flatten().boxed()
}
