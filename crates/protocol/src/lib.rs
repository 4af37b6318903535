//! # Spool protocol
//!
//! Shared vocabulary of the spool broker: session ids, artifact naming and
//! the response payload schema. Pure data, no I/O.

use thiserror::Error;

pub mod codec;
pub mod payload;
pub mod session;

pub use codec::{ArtifactCodec, ArtifactKind};
pub use payload::{
    iso_timestamp, response_schema_json, validate_value, PayloadDefect, ResponsePayload,
    ResponseStatus,
};
pub use session::{SessionId, MAX_SESSION_ID_LEN};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid session id {id:?}: {reason}")]
    InvalidSessionId { id: String, reason: String },

    #[error("invalid artifact naming: {0}")]
    InvalidCodec(String),
}
