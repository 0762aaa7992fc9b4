//! Error taxonomy for the reactor core.
//!
//! Errors never escape into user callbacks as exceptions. They are either
//! surfaced through the callback interface (a connection observed going to
//! `disconnected`) or, for conditions that indicate a bug in the embedder or
//! the environment, logged at `error` level and turned into a process abort.
//! See the crate-level documentation for the full policy table.

use std::io;

/// Errors the reactor core can report back to an embedder through a
/// `Result`-returning API. Conditions classified as fatal in the design
/// (second loop on a thread, fd-creation failure at startup) do not appear
/// here: they abort the process directly via [`abort`].
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("self-connect detected on {addr}")]
    SelfConnect { addr: String },

    #[error("operation requires the calling thread to be the loop's own thread")]
    WrongThread,

    #[error("event loop is shutting down")]
    LoopQuitting,
}

pub type Result<T> = std::result::Result<T, ReactorError>;

/// Classifies a `connect(2)` errno into the three buckets the Connector
/// state machine distinguishes. `None` means "do nothing surprising" never
/// occurs in this model; every errno path is exhaustively one of the three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Connection established, in progress, or otherwise already moving
    /// forward: proceed to the `connecting` state.
    Proceed,
    /// Transient condition: schedule a retry with backoff.
    Retry,
    /// Permanent condition: close the socket and give up.
    Fatal,
}

pub fn classify_connect_errno(errno: Option<i32>) -> ConnectOutcome {
    use ConnectOutcome::*;
    let Some(errno) = errno else {
        return Proceed;
    };
    match errno {
        0 => Proceed,
        libc::EINPROGRESS | libc::EINTR | libc::EISCONN => Proceed,
        libc::EAGAIN
        | libc::EADDRINUSE
        | libc::EADDRNOTAVAIL
        | libc::ECONNREFUSED
        | libc::ENETUNREACH => Retry,
        _ => Fatal,
    }
}

/// Logs a diagnostic at `error` level and aborts the process. Used for the
/// "Fatal startup" and "Invariant violation" policy rows: these indicate a
/// programmer or environment error that the reactor cannot recover from.
#[track_caller]
pub fn abort(message: &str) -> ! {
    log::error!("{message}");
    std::process::abort();
}
