//! Artifact naming.
//!
//! Every artifact in the shared directory is named
//! `<prefix>-<kind>-<session id>.<extension>`. This module is the only place
//! that knows the pattern; everything else goes through [`ArtifactCodec`].

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, SessionId};

pub const DEFAULT_PREFIX: &str = "spool";
pub const DEFAULT_REQUEST_EXTENSION: &str = "txt";
pub const DEFAULT_RESPONSE_EXTENSION: &str = "json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Request,
    Response,
}

impl ArtifactKind {
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCodec {
    prefix: String,
    request_extension: String,
    response_extension: String,
}

impl Default for ArtifactCodec {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            request_extension: DEFAULT_REQUEST_EXTENSION.to_string(),
            response_extension: DEFAULT_RESPONSE_EXTENSION.to_string(),
        }
    }
}

impl ArtifactCodec {
    pub fn new(
        prefix: impl Into<String>,
        request_extension: impl Into<String>,
        response_extension: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let prefix = prefix.into();
        let request_extension = normalize_extension(request_extension.into());
        let response_extension = normalize_extension(response_extension.into());

        check_component("prefix", &prefix)?;
        check_component("request extension", &request_extension)?;
        check_component("response extension", &response_extension)?;
        if request_extension.contains('.') || response_extension.contains('.') {
            return Err(ProtocolError::InvalidCodec(
                "extensions must be a single component without dots".to_string(),
            ));
        }
        if request_extension.eq_ignore_ascii_case("tmp")
            || response_extension.eq_ignore_ascii_case("tmp")
        {
            return Err(ProtocolError::InvalidCodec(
                "`tmp` is reserved for in-flight writes".to_string(),
            ));
        }

        Ok(Self {
            prefix,
            request_extension,
            response_extension,
        })
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn extension(&self, kind: ArtifactKind) -> &str {
        match kind {
            ArtifactKind::Request => &self.request_extension,
            ArtifactKind::Response => &self.response_extension,
        }
    }

    #[must_use]
    pub fn file_name(&self, kind: ArtifactKind, session: &SessionId) -> String {
        format!(
            "{}-{}-{}.{}",
            self.prefix,
            kind.marker(),
            session.as_str(),
            self.extension(kind)
        )
    }

    #[must_use]
    pub fn request_file_name(&self, session: &SessionId) -> String {
        self.file_name(ArtifactKind::Request, session)
    }

    #[must_use]
    pub fn response_file_name(&self, session: &SessionId) -> String {
        self.file_name(ArtifactKind::Response, session)
    }

    /// Recover the kind and session id from an artifact name.
    ///
    /// Returns `None` for anything that is not an artifact of this codec,
    /// including in-flight `.tmp` files and names whose id part is invalid.
    #[must_use]
    pub fn decode(&self, file_name: &str) -> Option<(ArtifactKind, SessionId)> {
        [ArtifactKind::Request, ArtifactKind::Response]
            .into_iter()
            .find_map(|kind| {
                let raw = self.raw_id(kind, file_name)?;
                SessionId::parse(raw).ok().map(|id| (kind, id))
            })
    }

    #[must_use]
    pub fn decode_request(&self, file_name: &str) -> Option<SessionId> {
        self.raw_id(ArtifactKind::Request, file_name)
            .and_then(|raw| SessionId::parse(raw).ok())
    }

    #[must_use]
    pub fn decode_response(&self, file_name: &str) -> Option<SessionId> {
        self.raw_id(ArtifactKind::Response, file_name)
            .and_then(|raw| SessionId::parse(raw).ok())
    }

    /// True for names shaped like a request artifact even when the id part
    /// does not decode. The processor uses this to archive such files instead
    /// of leaving them in the shared directory forever.
    #[must_use]
    pub fn looks_like_request(&self, file_name: &str) -> bool {
        self.raw_id(ArtifactKind::Request, file_name).is_some()
    }

    fn raw_id<'a>(&self, kind: ArtifactKind, file_name: &'a str) -> Option<&'a str> {
        let rest = file_name.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_prefix('-')?;
        let rest = rest.strip_prefix(kind.marker())?;
        let rest = rest.strip_prefix('-')?;
        let rest = rest.strip_suffix(self.extension(kind))?;
        rest.strip_suffix('.')
    }
}

fn normalize_extension(raw: String) -> String {
    raw.trim().trim_start_matches('.').to_string()
}

fn check_component(label: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::InvalidCodec(format!("{label} must not be empty")));
    }
    if value.contains(['/', '\\']) || value.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidCodec(format!(
            "{label} must be a plain file name component: {value:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(raw: &str) -> SessionId {
        SessionId::parse(raw).unwrap()
    }

    #[test]
    fn encodes_default_names() {
        let codec = ArtifactCodec::default();
        assert_eq!(codec.request_file_name(&id("abc")), "spool-request-abc.txt");
        assert_eq!(codec.response_file_name(&id("abc")), "spool-response-abc.json");
    }

    #[test]
    fn decode_inverts_encode() {
        let codec = ArtifactCodec::new("ai", "txt", "json").unwrap();
        for raw in [
            "abc",
            "a.b",
            "x.txt",
            "x.json",
            "has-request-inside",
            "has-response-inside",
            "-leading-dash",
            "trailing.",
            "sp ace",
        ] {
            let session = id(raw);
            let request = codec.request_file_name(&session);
            let response = codec.response_file_name(&session);
            assert_eq!(codec.decode_request(&request), Some(session.clone()), "{request}");
            assert_eq!(codec.decode_response(&response), Some(session.clone()), "{response}");
            assert_eq!(
                codec.decode(&request),
                Some((ArtifactKind::Request, session.clone()))
            );
            assert_eq!(codec.decode(&response), Some((ArtifactKind::Response, session)));
        }
    }

    #[test]
    fn decode_rejects_foreign_names() {
        let codec = ArtifactCodec::default();
        for name in [
            "notes.txt",
            "spool-request-abc.json",
            "spool-response-abc.txt",
            "spool-request-abc.txt.tmp",
            "other-request-abc.txt",
            "spool-request-.txt",
            "spool-requestabc.txt",
            "spoolrequest-abc.txt",
        ] {
            assert_eq!(codec.decode(name), None, "{name}");
        }
    }

    #[test]
    fn looks_like_request_tolerates_bad_ids() {
        let codec = ArtifactCodec::default();
        assert!(codec.looks_like_request("spool-request-.txt"));
        assert!(codec.looks_like_request("spool-request-abc.txt"));
        assert!(!codec.looks_like_request("spool-response-abc.json"));
        assert!(!codec.looks_like_request("spool-request-abc.txt.tmp"));
        assert_eq!(codec.decode_request("spool-request-.txt"), None);
    }

    #[test]
    fn extension_dot_is_optional() {
        let codec = ArtifactCodec::new("p", ".md", ".json").unwrap();
        assert_eq!(codec.request_file_name(&id("a")), "p-request-a.md");
    }

    #[test]
    fn rejects_bad_codec_settings() {
        assert!(ArtifactCodec::new("", "txt", "json").is_err());
        assert!(ArtifactCodec::new("a/b", "txt", "json").is_err());
        assert!(ArtifactCodec::new("p", "tar.gz", "json").is_err());
        assert!(ArtifactCodec::new("p", "txt", "tmp").is_err());
        assert!(ArtifactCodec::new("p", " ", "json").is_err());
    }
}
