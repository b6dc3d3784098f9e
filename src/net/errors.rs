use std::io;

use crate::config::BackendKind;

/// Transport-level failures.
///
/// These are reported to connect and read callbacks as values; a protocol reacts to
/// them by retrying or closing, never by panicking.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("connect to {uri} failed: {source}")]
    Connect {
        uri: String,
        #[source]
        source: io::Error,
    },

    #[error("nothing is listening at {0}")]
    Unreachable(String),

    #[error("address {0} is already in use")]
    AddrInUse(String),

    #[error("invalid uri `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("no transport registered for scheme `{0}`")]
    UnsupportedScheme(String),

    #[error("transport is closed")]
    Closed,

    #[error("aborted by close")]
    Aborted,

    #[error("transport cannot run on the `{0}` runloop backend")]
    BackendUnsupported(BackendKind),

    #[error("descriptor belongs to the `{0}` transport")]
    ForeignDescriptor(String),

    #[error("stream was detached")]
    Detached,

    #[error("a connect is already in progress")]
    InProgress,

    #[error("reads must be stopped first")]
    Reading,
}

impl NetworkError {
    /// Whether the peer address could not be reached at all, as opposed to a local
    /// or mid-stream failure.
    pub fn is_unreachable(&self) -> bool {
        match self {
            NetworkError::Unreachable(_) => true,
            NetworkError::Connect { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
