//! Offline inspection of a shared directory.
//!
//! Never mutates artifacts. Safe to run against a directory a broker is
//! actively serving.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use spool_protocol::{iso_timestamp, PayloadDefect, ResponsePayload, SessionId};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::BrokerConfig;
use crate::error::JobErrorKind;
use crate::layout::{SpoolLayout, ERROR_RECORD_SUFFIX};
use crate::processor::ErrorRecord;
use crate::store::{ArtifactStore, FsStore, StoreEntry};
use crate::Result;

pub const DEFAULT_SIGNATURE_LEN: usize = 48;

const STALE_PENALTY: f64 = 10.0;
const STALE_PENALTY_CAP: f64 = 40.0;
const MALFORMED_PENALTY: f64 = 30.0;
const ERROR_PENALTY: f64 = 2.0;
const ERROR_PENALTY_CAP: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticOptions {
    pub stale_after: Duration,
    pub response_sample: usize,
    pub top_errors: usize,
    pub signature_len: usize,
    /// Failures older than this still show up in the error patterns but no
    /// longer cost health score.
    pub error_window: Duration,
}

impl Default for DiagnosticOptions {
    fn default() -> Self {
        Self::from(&BrokerConfig::default())
    }
}

impl From<&BrokerConfig> for DiagnosticOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            stale_after: config.stale_after,
            response_sample: config.response_sample,
            top_errors: config.top_errors,
            signature_len: DEFAULT_SIGNATURE_LEN,
            error_window: config.error_window,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticStatus {
    Healthy,
    Degraded,
    Critical,
}

impl DiagnosticStatus {
    #[must_use]
    pub const fn from_score(score: u8) -> Self {
        if score >= 80 {
            Self::Healthy
        } else if score >= 50 {
            Self::Degraded
        } else {
            Self::Critical
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleRequest {
    pub session_id: Option<SessionId>,
    pub file_name: String,
    pub age_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseIssue {
    pub file_name: String,
    pub defects: Vec<PayloadDefect>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseValidation {
    pub checked: usize,
    pub malformed: usize,
    pub malformed_ratio: f64,
    pub issues: Vec<ResponseIssue>,
}

impl ResponseValidation {
    fn empty() -> Self {
        Self {
            checked: 0,
            malformed: 0,
            malformed_ratio: 0.0,
            issues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub signature: String,
    pub count: usize,
    pub kind: JobErrorKind,
    pub example_session: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticReport {
    pub root: PathBuf,
    pub root_exists: bool,
    pub generated_at: String,
    pub pending_requests: usize,
    pub stale_requests: Vec<StaleRequest>,
    pub responses: ResponseValidation,
    pub error_patterns: Vec<ErrorPattern>,
    /// Failed jobs within [`DiagnosticOptions::error_window`].
    pub recent_errors: usize,
    pub health_score: u8,
    pub status: DiagnosticStatus,
}

pub struct Diagnostics {
    store: Arc<dyn ArtifactStore>,
    layout: SpoolLayout,
    options: DiagnosticOptions,
}

impl Diagnostics {
    #[must_use]
    pub fn new(store: Arc<dyn ArtifactStore>, layout: SpoolLayout, options: DiagnosticOptions) -> Self {
        Self {
            store,
            layout,
            options,
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self> {
        let layout = SpoolLayout::new(config.root.clone(), config.codec()?);
        Ok(Self::new(
            Arc::new(FsStore),
            layout,
            DiagnosticOptions::from(config),
        ))
    }

    pub async fn run(&self) -> Result<DiagnosticReport> {
        self.run_at(SystemTime::now()).await
    }

    /// Produce a report as if the current time were `now`.
    pub async fn run_at(&self, now: SystemTime) -> Result<DiagnosticReport> {
        let root = self.layout.root().to_path_buf();
        let generated_at = iso_timestamp(Utc::now());
        if !self.store.is_dir(&root).await {
            return Ok(DiagnosticReport {
                root,
                root_exists: false,
                generated_at,
                pending_requests: 0,
                stale_requests: Vec::new(),
                responses: ResponseValidation::empty(),
                error_patterns: Vec::new(),
                recent_errors: 0,
                health_score: 0,
                status: DiagnosticStatus::Critical,
            });
        }

        let root_entries = self.store.list(&root).await?;
        let error_entries = self.list_optional(&self.layout.errors_dir()).await?;
        let codec = self.layout.codec();

        let requests: Vec<&StoreEntry> = root_entries
            .iter()
            .filter(|e| codec.looks_like_request(&e.file_name))
            .collect();
        let responses: Vec<(&StoreEntry, SessionId)> = root_entries
            .iter()
            .filter_map(|e| codec.decode_response(&e.file_name).map(|id| (e, id)))
            .collect();
        let records: Vec<&StoreEntry> = error_entries
            .iter()
            .filter(|e| e.file_name.ends_with(ERROR_RECORD_SUFFIX))
            .collect();

        let stale_requests = self.stale_requests(&requests, now);
        let validation = self.validate_responses(&responses).await;
        let (error_patterns, recent_errors) = self.error_patterns(&records, now).await;

        let health_score = health_score(
            stale_requests.len(),
            validation.malformed_ratio,
            recent_errors,
        );
        Ok(DiagnosticReport {
            root,
            root_exists: true,
            generated_at,
            pending_requests: requests.len(),
            stale_requests,
            responses: validation,
            error_patterns,
            recent_errors,
            health_score,
            status: DiagnosticStatus::from_score(health_score),
        })
    }

    async fn list_optional(&self, dir: &std::path::Path) -> Result<Vec<StoreEntry>> {
        match self.store.list(dir).await {
            Ok(entries) => Ok(entries),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn stale_requests(&self, requests: &[&StoreEntry], now: SystemTime) -> Vec<StaleRequest> {
        let mut stale: Vec<StaleRequest> = requests
            .iter()
            .filter_map(|entry| {
                let age = now.duration_since(entry.modified?).ok()?;
                (age > self.options.stale_after).then(|| StaleRequest {
                    session_id: self.layout.codec().decode_request(&entry.file_name),
                    file_name: entry.file_name.clone(),
                    age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                })
            })
            .collect();
        stale.sort_by_key(|s| Reverse(s.age_ms));
        stale
    }

    async fn validate_responses(&self, responses: &[(&StoreEntry, SessionId)]) -> ResponseValidation {
        let mut recent: Vec<&(&StoreEntry, SessionId)> = responses.iter().collect();
        recent.sort_by_key(|(entry, _)| Reverse(entry.modified));
        recent.truncate(self.options.response_sample);

        let mut validation = ResponseValidation::empty();
        for (entry, session) in recent {
            let bytes = match self.store.read(&entry.path).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!("skip {}: {err}", entry.file_name);
                    continue;
                }
            };
            validation.checked += 1;
            if let Err(defects) = ResponsePayload::parse_for(&bytes, session) {
                validation.malformed += 1;
                validation.issues.push(ResponseIssue {
                    file_name: entry.file_name.clone(),
                    defects,
                });
            }
        }
        if validation.checked > 0 {
            #[allow(clippy::cast_precision_loss)]
            let ratio = validation.malformed as f64 / validation.checked as f64;
            validation.malformed_ratio = ratio;
        }
        validation
    }

    /// Top error buckets, plus how many records fall inside the error window.
    async fn error_patterns(
        &self,
        records: &[&StoreEntry],
        now: SystemTime,
    ) -> (Vec<ErrorPattern>, usize) {
        let mut buckets: HashMap<String, ErrorPattern> = HashMap::new();
        let mut recent = 0;
        for entry in records {
            let record: ErrorRecord = match self.store.read(&entry.path).await {
                Ok(bytes) => match serde_json::from_slice(&bytes) {
                    Ok(record) => record,
                    Err(err) => {
                        debug!("unreadable error record {}: {err}", entry.file_name);
                        continue;
                    }
                },
                Err(err) => {
                    debug!("skip {}: {err}", entry.file_name);
                    continue;
                }
            };
            let failed_at = DateTime::parse_from_rfc3339(&record.failed_at)
                .ok()
                .map(SystemTime::from)
                .or(entry.modified);
            let in_window = failed_at.is_some_and(|at| {
                now.duration_since(at)
                    .map_or(true, |age| age <= self.options.error_window)
            });
            if in_window {
                recent += 1;
            }

            let signature = error_signature(
                &record.last_error,
                record.session_id.as_ref(),
                self.options.signature_len,
            );
            buckets
                .entry(signature.clone())
                .and_modify(|pattern| pattern.count += 1)
                .or_insert_with(|| ErrorPattern {
                    signature,
                    count: 1,
                    kind: record.kind,
                    example_session: record.session_id.clone(),
                });
        }
        let mut patterns: Vec<ErrorPattern> = buckets.into_values().collect();
        patterns.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        patterns.truncate(self.options.top_errors);
        (patterns, recent)
    }
}

/// Bucket key for an error message: a leading `session <id>: ` becomes
/// `session <session>: `, digits become `#`, and the result is cut to `len`
/// characters.
#[must_use]
pub fn error_signature(message: &str, session: Option<&SessionId>, len: usize) -> String {
    let rest = session.and_then(|id| message.strip_prefix(&format!("session {id}: ")));
    let masked = match rest {
        Some(rest) => format!("session <session>: {rest}"),
        None => message.to_string(),
    };
    masked
        .chars()
        .map(|c| if c.is_ascii_digit() { '#' } else { c })
        .take(len)
        .collect()
}

/// 0..=100; see [`DiagnosticStatus::from_score`] for the bands.
#[must_use]
pub fn health_score(stale: usize, malformed_ratio: f64, errored: usize) -> u8 {
    #[allow(clippy::cast_precision_loss)]
    let stale_penalty = (stale as f64 * STALE_PENALTY).min(STALE_PENALTY_CAP);
    #[allow(clippy::cast_precision_loss)]
    let error_penalty = (errored as f64 * ERROR_PENALTY).min(ERROR_PENALTY_CAP);
    let malformed_penalty = malformed_ratio.clamp(0.0, 1.0) * MALFORMED_PENALTY;
    let score = 100.0 - stale_penalty - malformed_penalty - error_penalty;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let score = score.round().clamp(0.0, 100.0) as u8;
    score
}
