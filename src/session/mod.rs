pub mod state;
pub mod tail;
pub mod watchdog;

pub use state::SessionState;
pub use tail::{SessionError, TailDeps, TailRequest, TailSession};
pub use watchdog::{TaskAbortCheck, Watchdog};
