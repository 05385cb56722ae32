use std::io;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GearmanError>;

/// All errors surfaced at the API boundary.
///
/// I/O errors encountered inside the background poll and reconnect tasks
/// never reach callers directly; they mark the affected connection as lost
/// and the reconnect task retries it. Errors on correlated operations
/// (submit, option, echo, admin) propagate as one of these kinds after the
/// faulty connection has been marked lost.
#[derive(Debug, Error)]
pub enum GearmanError {
    /// Unable to open a socket to the server, or the connection dropped
    /// while an operation was outstanding on it.
    #[error("connection error: {0}")]
    Connection(String),
    /// Invalid configuration, such as a duplicate server entry or a partial
    /// TLS file set.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The operation requires at least one active connection and none
    /// exists.
    #[error("no connected Gearman servers")]
    NoConnectedServers,
    /// A correlated response or waiter did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(String),
    /// A blocking `get_job` was released by `stop_waiting_for_jobs` or by
    /// shutdown.
    #[error("interrupted while waiting")]
    Interrupted,
    /// A response referenced a job handle not present in the connection's
    /// related-jobs map.
    #[error("unknown job handle: {0}")]
    UnknownJob(String),
    /// Malformed packet, bad magic byte, or a type/argument mismatch.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Generic protocol failure, e.g. a submit that exhausted every
    /// connected server.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
