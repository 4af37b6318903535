use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ProtocolError;

/// Upper bound keeps artifact names well below common filesystem limits.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// Opaque key correlating a request artifact with its response artifact.
///
/// A valid id is usable verbatim as a file name component: non-empty, at most
/// [`MAX_SESSION_ID_LEN`] bytes, free of path separators and control
/// characters, and neither `.` nor `..`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProtocolError> {
        let raw = raw.into();
        validate(&raw)?;
        Ok(Self(raw))
    }

    /// Fresh id for a new request (UUID v4, hyphen-free).
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

fn validate(raw: &str) -> Result<(), ProtocolError> {
    let invalid = |reason: &str| ProtocolError::InvalidSessionId {
        id: raw.to_string(),
        reason: reason.to_string(),
    };

    if raw.is_empty() {
        return Err(invalid("empty"));
    }
    if raw.len() > MAX_SESSION_ID_LEN {
        return Err(invalid("too long"));
    }
    if raw == "." || raw == ".." {
        return Err(invalid("reserved path component"));
    }
    if raw.contains(['/', '\\']) {
        return Err(invalid("contains a path separator"));
    }
    if raw.chars().any(char::is_control) {
        return Err(invalid("contains a control character"));
    }
    Ok(())
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for SessionId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        for raw in ["abc", "a.b.c", "user-42_x", "9f1c2d", "with space", "ünï"] {
            assert_eq!(SessionId::parse(raw).unwrap().as_str(), raw);
        }
    }

    #[test]
    fn rejects_path_like_ids() {
        for raw in ["", ".", "..", "a/b", "a\\b", "nul\0byte", "tab\tbed"] {
            assert!(SessionId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
        assert!(SessionId::parse("x".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(SessionId::parse(a.as_str()).is_ok());
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn deserialize_validates() {
        let ok: SessionId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.as_str(), "abc");
        assert!(serde_json::from_str::<SessionId>("\"a/b\"").is_err());
    }
}
