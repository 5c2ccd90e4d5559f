pub mod merge;
pub mod window;

pub use merge::{merge, merge_all, OrderedStream, Timestamped};
pub use window::{take_first_n, take_last_n};
