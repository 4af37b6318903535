//! Job processing.
//!
//! Each discovered request artifact goes through
//!
//! ```text
//! Discovered -> Claimed -> Read -> Responded -> Archived(processed/)
//!                            \-> Failed -> backoff -> Read ... -> Archived(errors/)
//! ```
//!
//! The [`ProcessingSet`] dedupes the watcher and the poller reporting the same
//! path. It is process-local: two broker processes on one directory can both
//! pick up a request. The loser of that race sees `NotFound` on read or on
//! archive and reports [`ProcessOutcome::Vanished`] or tolerates it.

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use spool_protocol::{iso_timestamp, ResponsePayload, SessionId};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{JobError, JobErrorKind};
use crate::layout::{error_record_path, SpoolLayout};
use crate::responder::Responder;
use crate::stats::BrokerStats;
use crate::store::ArtifactStore;

#[derive(Debug, Default)]
struct ProcessingSetInner {
    claims: Mutex<HashMap<PathBuf, u64>>,
    next_token: AtomicU64,
}

/// Request paths currently being handled by this process.
#[derive(Debug, Clone, Default)]
pub struct ProcessingSet {
    inner: Arc<ProcessingSetInner>,
}

impl ProcessingSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when the path is already claimed.
    #[must_use]
    pub fn claim(&self, path: &Path) -> Option<Claim> {
        let mut claims = self.lock();
        if claims.contains_key(path) {
            return None;
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        claims.insert(path.to_path_buf(), token);
        Some(Claim {
            path: path.to_path_buf(),
            token,
            set: self.clone(),
        })
    }

    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every claim. Claims handed out before the call stay valid
    /// for their holders but no longer block new claims of the same path.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn release(&self, path: &Path, token: u64) {
        let mut claims = self.lock();
        if claims.get(path) == Some(&token) {
            claims.remove(path);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, u64>> {
        self.inner
            .claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership in the [`ProcessingSet`]; released on drop.
#[derive(Debug)]
pub struct Claim {
    path: PathBuf,
    token: u64,
    set: ProcessingSet,
}

impl Claim {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set.release(&self.path, self.token);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based): `min(base * 2^attempt, max)`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed {
        session_id: SessionId,
        attempts: u32,
    },
    Failed {
        session_id: Option<SessionId>,
        error: JobError,
        attempts: u32,
    },
    /// Another task already holds the claim.
    Duplicate,
    /// The request disappeared before it could be read.
    Vanished,
}

impl ProcessOutcome {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Duplicate => "duplicate",
            Self::Vanished => "vanished",
        }
    }
}

/// Sidecar written next to every request archived into `errors/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    pub kind: JobErrorKind,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: String,
}

enum AttemptError {
    Vanished,
    Job(JobError),
}

impl From<JobError> for AttemptError {
    fn from(err: JobError) -> Self {
        Self::Job(err)
    }
}

pub struct JobProcessor {
    store: Arc<dyn ArtifactStore>,
    layout: SpoolLayout,
    responder: Arc<dyn Responder>,
    retry: RetryPolicy,
    processing_delay: Duration,
    processing: ProcessingSet,
    stats: Arc<BrokerStats>,
}

impl JobProcessor {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        layout: SpoolLayout,
        responder: Arc<dyn Responder>,
        stats: Arc<BrokerStats>,
    ) -> Self {
        Self {
            store,
            layout,
            responder,
            retry: RetryPolicy::default(),
            processing_delay: Duration::ZERO,
            processing: ProcessingSet::new(),
            stats,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_processing_delay(mut self, delay: Duration) -> Self {
        self.processing_delay = delay;
        self
    }

    #[must_use]
    pub fn processing_set(&self) -> &ProcessingSet {
        &self.processing
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<BrokerStats> {
        &self.stats
    }

    /// Claim `path`, counting a duplicate when it is already in flight.
    pub fn claim(&self, path: &Path) -> Option<Claim> {
        let claim = self.processing.claim(path);
        if claim.is_none() {
            self.stats.record_duplicate();
            debug!("{} already in flight, skipping", path.display());
        }
        claim
    }

    /// Claim and process `path` to completion.
    pub async fn process(&self, path: &Path) -> ProcessOutcome {
        match self.claim(path) {
            Some(claim) => self.run(claim).await,
            None => ProcessOutcome::Duplicate,
        }
    }

    /// Process an already claimed request; the claim is released when this
    /// returns.
    pub async fn run(&self, claim: Claim) -> ProcessOutcome {
        let started = Instant::now();
        let outcome = self.run_claimed(claim.path()).await;
        let elapsed_ms = started.elapsed().as_millis();
        let name = display_name(claim.path());
        match &outcome {
            ProcessOutcome::Completed {
                session_id,
                attempts,
            } => info!(
                "job {name}: completed session={session_id} attempts={attempts} in {elapsed_ms}ms"
            ),
            ProcessOutcome::Failed {
                session_id,
                error,
                attempts,
            } => {
                let session = session_id.as_ref().map_or("-", SessionId::as_str);
                warn!(
                    "job {name}: failed session={session} attempts={attempts} kind={} in {elapsed_ms}ms: {error}",
                    error.kind().as_str()
                );
            }
            ProcessOutcome::Duplicate => debug!("job {name}: duplicate"),
            ProcessOutcome::Vanished => info!("job {name}: vanished before read"),
        }
        drop(claim);
        outcome
    }

    async fn run_claimed(&self, path: &Path) -> ProcessOutcome {
        let session = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| self.layout.codec().decode_request(n));
        let Some(session) = session else {
            let err = JobError::MalformedRequest(
                "file name does not encode a valid session id".to_string(),
            );
            return self.fail(path, None, err, 1).await;
        };

        if !self.processing_delay.is_zero() {
            tokio::time::sleep(self.processing_delay).await;
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.attempt(path, &session, attempts).await {
                Ok(()) => {
                    self.archive_processed(path).await;
                    self.stats.record_processed();
                    return ProcessOutcome::Completed {
                        session_id: session,
                        attempts,
                    };
                }
                Err(AttemptError::Vanished) => {
                    self.stats.record_vanished();
                    return ProcessOutcome::Vanished;
                }
                Err(AttemptError::Job(err)) => {
                    if !err.is_retryable() || attempts >= self.retry.max_attempts {
                        return self.fail(path, Some(session), err, attempts).await;
                    }
                    let delay = self.retry.delay_after(attempts);
                    debug!(
                        "session {session}: attempt {attempts} failed ({err}), retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Read, respond and write the response artifact.
    async fn attempt(
        &self,
        path: &Path,
        session: &SessionId,
        attempt: u32,
    ) -> Result<(), AttemptError> {
        let bytes = match self.store.read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(AttemptError::Vanished)
            }
            Err(err) => {
                return Err(JobError::TransientIo(format!("read {}: {err}", path.display())).into())
            }
        };
        let instruction = String::from_utf8(bytes).map_err(|_| {
            JobError::MalformedRequest("request body is not valid UTF-8".to_string())
        })?;
        if instruction.trim().is_empty() {
            return Err(JobError::MalformedRequest("empty request body".to_string()).into());
        }

        let responder = Arc::clone(&self.responder);
        let owned_session = session.clone();
        let text = tokio::task::spawn_blocking(move || {
            responder.respond(&instruction, &owned_session)
        })
        .await
        .map_err(|err| JobError::ResponderFailure(format!("responder task aborted: {err}")))?
        .map_err(|err| JobError::ResponderFailure(err.to_string()))?;

        let payload = ResponsePayload::completed(session.clone(), text, attempt);
        self.write_response(&payload).await?;
        Ok(())
    }

    async fn write_response(&self, payload: &ResponsePayload) -> Result<(), JobError> {
        let bytes = payload
            .to_json_bytes()
            .map_err(|err| JobError::TransientIo(format!("encode response: {err}")))?;
        let target = self.layout.response_path(&payload.session_id);
        self.store
            .write_atomic(&target, &bytes)
            .await
            .map_err(|err| JobError::TransientIo(format!("write {}: {err}", target.display())))
    }

    async fn archive_processed(&self, path: &Path) {
        let dir = self.layout.processed_dir();
        let target = self.layout.processed_path(&display_name(path), Utc::now());
        if let Err(err) = self.move_into(path, &dir, &target).await {
            if err.kind() == io::ErrorKind::NotFound {
                debug!("{} archived elsewhere", path.display());
            } else {
                error!("failed to archive {}: {err}", path.display());
            }
        }
    }

    async fn fail(
        &self,
        path: &Path,
        session: Option<SessionId>,
        err: JobError,
        attempts: u32,
    ) -> ProcessOutcome {
        let message = match &session {
            Some(session) => format!("session {session}: {err}"),
            None => err.to_string(),
        };
        // A request with a known session leaves the root only after its
        // response exists. Left in place, the next startup scan retries it.
        if let Some(session) = &session {
            let payload = ResponsePayload::failed(session.clone(), message.clone(), attempts);
            if let Err(write_err) = self.write_response(&payload).await {
                error!(
                    "session {session}: could not write error response, leaving {} in place: {write_err}",
                    path.display()
                );
                return ProcessOutcome::Failed {
                    session_id: Some(session.clone()),
                    error: err,
                    attempts,
                };
            }
        }

        let dir = self.layout.errors_dir();
        let target = self.layout.errors_path(&display_name(path), Utc::now());
        match self.move_into(path, &dir, &target).await {
            Ok(()) => {
                let record = ErrorRecord {
                    session_id: session.clone(),
                    kind: err.kind(),
                    attempts,
                    last_error: message,
                    failed_at: iso_timestamp(Utc::now()),
                };
                self.write_error_record(&target, &record).await;
            }
            Err(move_err) if move_err.kind() == io::ErrorKind::NotFound => {
                debug!("{} archived elsewhere", path.display());
            }
            Err(move_err) => error!("failed to archive {}: {move_err}", path.display()),
        }

        self.stats.record_failed();
        ProcessOutcome::Failed {
            session_id: session,
            error: err,
            attempts,
        }
    }

    async fn write_error_record(&self, archived: &Path, record: &ErrorRecord) {
        let path = error_record_path(archived);
        let bytes = match serde_json::to_vec_pretty(record) {
            Ok(bytes) => bytes,
            Err(err) => {
                error!("encode error record for {}: {err}", archived.display());
                return;
            }
        };
        if let Err(err) = self.store.write_atomic(&path, &bytes).await {
            error!("write {}: {err}", path.display());
        }
    }

    async fn move_into(&self, from: &Path, dir: &Path, to: &Path) -> io::Result<()> {
        self.store.create_dir_all(dir).await?;
        self.store.rename(from, to).await
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
