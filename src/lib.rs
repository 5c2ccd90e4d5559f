pub mod classify;
pub mod cli;
pub mod config;
pub mod pipeline;
pub mod sequencer;
pub mod session;
pub mod source;
