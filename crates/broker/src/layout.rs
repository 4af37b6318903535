//! Shared directory layout.
//!
//! ```text
//! <root>/
//!   spool-request-<id>.txt      pending requests
//!   spool-response-<id>.json    responses
//!   processed/                  archived successful requests
//!   errors/                     archived failed requests + `.error.json` records
//! ```

use chrono::{DateTime, Utc};
use spool_protocol::{ArtifactCodec, SessionId};
use std::path::{Path, PathBuf};

use crate::store::ArtifactStore;
use crate::Result;

pub const PROCESSED_DIR: &str = "processed";
pub const ERRORS_DIR: &str = "errors";
pub const ERROR_RECORD_SUFFIX: &str = ".error.json";

const ARCHIVE_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolLayout {
    root: PathBuf,
    codec: ArtifactCodec,
}

impl SpoolLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, codec: ArtifactCodec) -> Self {
        Self {
            root: root.into(),
            codec,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn codec(&self) -> &ArtifactCodec {
        &self.codec
    }

    #[must_use]
    pub fn processed_dir(&self) -> PathBuf {
        self.root.join(PROCESSED_DIR)
    }

    #[must_use]
    pub fn errors_dir(&self) -> PathBuf {
        self.root.join(ERRORS_DIR)
    }

    #[must_use]
    pub fn request_path(&self, session: &SessionId) -> PathBuf {
        self.root.join(self.codec.request_file_name(session))
    }

    #[must_use]
    pub fn response_path(&self, session: &SessionId) -> PathBuf {
        self.root.join(self.codec.response_file_name(session))
    }

    #[must_use]
    pub fn processed_path(&self, file_name: &str, at: DateTime<Utc>) -> PathBuf {
        self.processed_dir().join(archive_name(file_name, at))
    }

    #[must_use]
    pub fn errors_path(&self, file_name: &str, at: DateTime<Utc>) -> PathBuf {
        self.errors_dir().join(archive_name(file_name, at))
    }

    pub async fn ensure(&self, store: &dyn ArtifactStore) -> Result<()> {
        store.create_dir_all(&self.processed_dir()).await?;
        store.create_dir_all(&self.errors_dir()).await?;
        Ok(())
    }
}

#[must_use]
pub fn archive_name(file_name: &str, at: DateTime<Utc>) -> String {
    format!("{}-{file_name}", at.format(ARCHIVE_STAMP_FORMAT))
}

/// Strip the archive timestamp; `None` for names that were not produced by
/// [`archive_name`].
#[must_use]
pub fn original_name(archived: &str) -> Option<&str> {
    let (stamp, rest) = archived.split_once('-')?;
    let looks_stamped = stamp.len() == 20
        && stamp.ends_with('Z')
        && stamp.as_bytes().get(8) == Some(&b'T');
    (looks_stamped && !rest.is_empty()).then_some(rest)
}

#[must_use]
pub fn error_record_path(archived: &Path) -> PathBuf {
    let mut name = archived
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(ERROR_RECORD_SUFFIX);
    archived.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 12, 30, 5).unwrap()
    }

    #[test]
    fn archive_names_round_trip() {
        let name = archive_name("spool-request-abc.txt", at());
        assert_eq!(name, "20261015T123005.000Z-spool-request-abc.txt");
        assert_eq!(original_name(&name), Some("spool-request-abc.txt"));
        assert_eq!(original_name("spool-request-abc.txt"), None);
    }

    #[test]
    fn paths_follow_the_codec() {
        let layout = SpoolLayout::new("/srv/spool", ArtifactCodec::default());
        let session = SessionId::parse("abc").unwrap();
        assert_eq!(
            layout.request_path(&session),
            Path::new("/srv/spool/spool-request-abc.txt")
        );
        assert_eq!(
            layout.response_path(&session),
            Path::new("/srv/spool/spool-response-abc.json")
        );
        let archived = layout.errors_path("spool-request-abc.txt", at());
        assert_eq!(
            error_record_path(&archived),
            Path::new("/srv/spool/errors/20261015T123005.000Z-spool-request-abc.txt.error.json")
        );
    }
}
