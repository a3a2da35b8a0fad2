//! Demo host for the monbus IPC layer
//!
//! Provides:
//! - The request/reply codes shared by `monbusd` and `monbus-ping`
//! - A dispatcher answering echo, stats and shutdown requests
//! - Settings resolution from a config file plus command-line overrides

mod dispatcher;
mod protocol;
mod settings;

pub use dispatcher::*;
pub use protocol::*;
pub use settings::*;
