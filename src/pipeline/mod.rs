pub mod aggregator;
pub mod channel;

pub use aggregator::{AggregatedSource, AggregatorError, SourceAggregator, SourceSink};
pub use channel::{create_channel, send_or_cancel, Receiver, SendOutcome, Sender};
