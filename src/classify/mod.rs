pub mod envelope;
pub mod filter;
pub mod record;
pub mod rules;

pub use filter::{Filter, UnknownFieldPolicy};
pub use record::CanonicalLogRecord;
pub use rules::{BatchHeader, BatchKind, ClassifyError, ClassifyStats, Classifier};
