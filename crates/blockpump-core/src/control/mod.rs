//! Control channel
//!
//! A line-oriented TCP protocol for live parameter changes:
//!
//! ```text
//! set <objectId> <value>   -> OK | Invalid value | Invalid object | Invalid format
//! exit                     -> connection closes, no reply
//! <anything else>          -> Unknown command
//! ```
//!
//! One connection is served at a time. Every reply ends with `\n`.

mod command;
mod server;
mod tunables;

pub use command::{parse_line, ControlCommand, Reply};
pub use server::{
    handle_session, spawn_control_server, ControlServer, ControlShutdown, SessionEnd,
    SessionSummary,
};
pub use tunables::{default_tunables, Tunable, TunableKind, TunableRegistry};

use thiserror::Error;

/// Errors from the control channel
#[derive(Debug, Error)]
pub enum ControlError {
    /// Could not bind the listening socket
    #[error("Failed to bind control port {addr}: {error}")]
    Bind {
        addr: String,
        #[source]
        error: std::io::Error,
    },

    /// Socket error inside a session or on accept
    #[error("Control socket error: {0}")]
    Io(#[from] std::io::Error),

    /// Two tunables share an object id
    #[error("Duplicate tunable object id {0}")]
    DuplicateObject(i64),

    /// Float tunable with min > max or NaN bounds
    #[error("Tunable {object_id} has invalid range [{min}, {max}]")]
    InvalidRange { object_id: i64, min: f32, max: f32 },
}

/// Result type for control channel operations
pub type ControlResult<T> = Result<T, ControlError>;
