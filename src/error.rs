use std::{io, result::Result as StdResult};

use crate::{config::BackendKind, net::errors::NetworkError, protocol::Role};

/// Errors raised by runloops, signals, timers and protocols.
///
/// Transport-level failures are wrapped in [`Error::Network`]. Everything else here
/// is a misuse of the API (wrong thread, wrong backend, operating on something that
/// is already shutting down) and is reported instead of asserted.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("runloop is stopping and rejects new work")]
    RunloopStopping,

    #[error("backend mismatch: expected `{expected}`, found `{found}`")]
    BackendMismatch {
        expected: BackendKind,
        found: BackendKind,
    },

    #[error("operation must run on the thread that owns the runloop")]
    WrongThread,

    #[error("reference count already dropped to zero")]
    RefCountExhausted,

    #[error("unknown runloop backend `{0}`")]
    UnknownBackend(String),

    #[error("timer is closed")]
    TimerClosed,

    #[error("timer is still active")]
    TimerActive,

    #[error("timer is bound to another runloop")]
    TimerBound,

    #[error("protocol is closing")]
    Closing,

    #[error("operation not supported by a protocol in role {0:?}")]
    InvalidRole(Role),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("runloop thread exited before it was ready")]
    ThreadGone,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = StdResult<T, Error>;
