//! Response artifact body.
//!
//! A response is a JSON object:
//!
//! ```json
//! {
//!   "success": true,
//!   "sessionId": "abc",
//!   "timestamp": "2026-10-15T12:00:00.000Z",
//!   "response": "...",
//!   "status": "completed",
//!   "error": null,
//!   "attempts": 1
//! }
//! ```
//!
//! `success`, `sessionId`, `timestamp`, `response` and `status` are required.
//! `success` must agree with `status`.

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    Failed,
}

impl ResponseStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub success: bool,
    pub session_id: SessionId,
    /// RFC 3339 / ISO-8601, UTC, millisecond precision.
    pub timestamp: String,
    pub response: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
}

impl ResponsePayload {
    #[must_use]
    pub fn completed(session_id: SessionId, response: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: true,
            session_id,
            timestamp: iso_timestamp(Utc::now()),
            response: response.into(),
            status: ResponseStatus::Completed,
            error: None,
            attempts: Some(attempts),
        }
    }

    #[must_use]
    pub fn failed(session_id: SessionId, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            success: false,
            session_id,
            timestamp: iso_timestamp(Utc::now()),
            response: String::new(),
            status: ResponseStatus::Failed,
            error: Some(error.into()),
            attempts: Some(attempts),
        }
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse and structurally validate a response body.
    pub fn parse(bytes: &[u8]) -> Result<Self, Vec<PayloadDefect>> {
        let value: Value = serde_json::from_slice(bytes).map_err(|err| {
            vec![PayloadDefect::NotJson {
                message: err.to_string(),
            }]
        })?;
        let defects = validate_value(&value);
        if !defects.is_empty() {
            return Err(defects);
        }
        serde_json::from_value(value).map_err(|err| {
            vec![PayloadDefect::NotJson {
                message: err.to_string(),
            }]
        })
    }

    /// Like [`ResponsePayload::parse`], additionally requiring the payload to
    /// belong to `expected`.
    pub fn parse_for(bytes: &[u8], expected: &SessionId) -> Result<Self, Vec<PayloadDefect>> {
        let payload = Self::parse(bytes)?;
        if &payload.session_id != expected {
            return Err(vec![PayloadDefect::SessionMismatch {
                expected: expected.to_string(),
                found: payload.session_id.to_string(),
            }]);
        }
        Ok(payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "defect", rename_all = "snake_case")]
pub enum PayloadDefect {
    NotJson { message: String },
    NotAnObject,
    MissingField { field: String },
    WrongType { field: String, expected: String },
    InvalidSessionId { reason: String },
    InvalidTimestamp { value: String },
    UnknownStatus { value: String },
    StatusMismatch { success: bool, status: String },
    SessionMismatch { expected: String, found: String },
}

impl fmt::Display for PayloadDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotJson { message } => write!(f, "not valid JSON: {message}"),
            Self::NotAnObject => f.write_str("payload is not a JSON object"),
            Self::MissingField { field } => write!(f, "missing field `{field}`"),
            Self::WrongType { field, expected } => {
                write!(f, "field `{field}` must be {expected}")
            }
            Self::InvalidSessionId { reason } => write!(f, "invalid sessionId: {reason}"),
            Self::InvalidTimestamp { value } => write!(f, "timestamp is not RFC 3339: {value}"),
            Self::UnknownStatus { value } => write!(f, "unknown status `{value}`"),
            Self::StatusMismatch { success, status } => {
                write!(f, "success={success} contradicts status `{status}`")
            }
            Self::SessionMismatch { expected, found } => {
                write!(f, "sessionId `{found}` does not match `{expected}`")
            }
        }
    }
}

const REQUIRED_FIELDS: &[(&str, &str)] = &[
    ("success", "a boolean"),
    ("sessionId", "a string"),
    ("timestamp", "a string"),
    ("response", "a string"),
    ("status", "a string"),
];

/// Every structural problem found in `value`; empty means well-formed.
#[must_use]
pub fn validate_value(value: &Value) -> Vec<PayloadDefect> {
    let Some(obj) = value.as_object() else {
        return vec![PayloadDefect::NotAnObject];
    };

    let mut defects = Vec::new();
    for (field, expected) in REQUIRED_FIELDS {
        let Some(v) = obj.get(*field) else {
            defects.push(PayloadDefect::MissingField {
                field: (*field).to_string(),
            });
            continue;
        };
        let type_ok = if *field == "success" {
            v.is_boolean()
        } else {
            v.is_string()
        };
        if !type_ok {
            defects.push(PayloadDefect::WrongType {
                field: (*field).to_string(),
                expected: (*expected).to_string(),
            });
        }
    }

    if let Some(v) = obj.get("error") {
        if !v.is_null() && !v.is_string() {
            defects.push(PayloadDefect::WrongType {
                field: "error".to_string(),
                expected: "a string or null".to_string(),
            });
        }
    }
    if let Some(v) = obj.get("attempts") {
        if !v.is_null() && v.as_u64().and_then(|n| u32::try_from(n).ok()).is_none() {
            defects.push(PayloadDefect::WrongType {
                field: "attempts".to_string(),
                expected: "a non-negative integer".to_string(),
            });
        }
    }

    if let Some(raw) = obj.get("sessionId").and_then(Value::as_str) {
        if let Err(err) = SessionId::parse(raw) {
            defects.push(PayloadDefect::InvalidSessionId {
                reason: err.to_string(),
            });
        }
    }
    if let Some(raw) = obj.get("timestamp").and_then(Value::as_str) {
        if DateTime::parse_from_rfc3339(raw).is_err() {
            defects.push(PayloadDefect::InvalidTimestamp {
                value: raw.to_string(),
            });
        }
    }

    let success = obj.get("success").and_then(Value::as_bool);
    if let Some(raw) = obj.get("status").and_then(Value::as_str) {
        let status = match raw {
            "completed" => Some(ResponseStatus::Completed),
            "failed" => Some(ResponseStatus::Failed),
            other => {
                defects.push(PayloadDefect::UnknownStatus {
                    value: other.to_string(),
                });
                None
            }
        };
        if let (Some(success), Some(status)) = (success, status) {
            if success != (status == ResponseStatus::Completed) {
                defects.push(PayloadDefect::StatusMismatch {
                    success,
                    status: raw.to_string(),
                });
            }
        }
    }

    defects
}

#[must_use]
pub fn iso_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// JSON Schema of [`ResponsePayload`], pretty-printed.
pub fn response_schema_json() -> serde_json::Result<String> {
    let schema = schemars::schema_for!(ResponsePayload);
    serde_json::to_string_pretty(&schema)
}
