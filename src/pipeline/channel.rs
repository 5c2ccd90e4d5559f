use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type Sender<T> = mpsc::Sender<T>;
pub type Receiver<T> = mpsc::Receiver<T>;

/// Create a bounded channel with the specified buffer size
pub fn create_channel<T>(buffer_size: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(buffer_size.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Cancelled,
    /// The receiving side is gone
    Closed,
}

/// Send that gives up as soon as `token` is cancelled, even when the queue is full.
pub async fn send_or_cancel<T>(tx: &Sender<T>, item: T, token: &CancellationToken) -> SendOutcome {
    tokio::select! {
        biased;
        _ = token.cancelled() => SendOutcome::Cancelled,
        result = tx.send(item) => match result {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::Closed,
        },
    }
}
