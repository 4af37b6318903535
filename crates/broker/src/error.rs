use serde::{Deserialize, Serialize};
use spool_protocol::{PayloadDefect, ProtocolError, SessionId};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Shared directory unreachable: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Other(String),
}

/// Why a single processing attempt failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("responder failed: {0}")]
    ResponderFailure(String),
}

impl JobError {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::MalformedRequest(_))
    }

    #[must_use]
    pub const fn kind(&self) -> JobErrorKind {
        match self {
            Self::TransientIo(_) => JobErrorKind::TransientIo,
            Self::MalformedRequest(_) => JobErrorKind::MalformedRequest,
            Self::ResponderFailure(_) => JobErrorKind::ResponderFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    TransientIo,
    MalformedRequest,
    ResponderFailure,
}

impl JobErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientIo => "transient_io",
            Self::MalformedRequest => "malformed_request",
            Self::ResponderFailure => "responder_failure",
        }
    }
}

/// A notification-backend failure observed by the directory watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherFault {
    pub message: String,
    pub at_unix_ms: u64,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("timed out after {waited:?} waiting for response to session {session_id}")]
    TimedOut {
        session_id: SessionId,
        waited: Duration,
    },

    #[error("malformed response for session {session_id}: {}", join_defects(.defects))]
    Malformed {
        session_id: SessionId,
        defects: Vec<PayloadDefect>,
    },

    #[error("session {session_id} failed: {message}")]
    Failed {
        session_id: SessionId,
        message: String,
    },
}

fn join_defects(defects: &[PayloadDefect]) -> String {
    defects
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
