pub mod access_log;
pub mod event;
pub mod live;
pub mod local;
pub mod provider;
pub mod query;
pub mod retry;
pub mod timestamp;

pub use access_log::{AccessLogProvider, DirectoryObjectStore};
pub use event::{EventStream, LiveTailEvent, LogGroupHandle, RawBatch, RawLogEvent};
pub use live::{HistoricalSource, LiveQueryAndTail, TailPhase};
pub use local::DirectoryProvider;
pub use provider::{
    ErrorSource, EventPage, LiveTail, LogProvider, ObjectStore, PageRequest, ProviderError,
    SourceError, TaskHandle, TaskStatus, TaskStatusProvider,
};
pub use query::{HistoricalQuery, HistoryWindow};
pub use retry::{AbortCheck, RetryOutcome, RetryPolicy};
pub use timestamp::{TimestampError, TimestampExtractor};
