//! Producer and consumer side of the exchange: write a request, then poll for
//! the matching response.

use log::debug;
use spool_protocol::{PayloadDefect, ResponsePayload, SessionId};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};

use crate::config::BrokerConfig;
use crate::error::ClientError;
use crate::layout::SpoolLayout;
use crate::store::{ArtifactStore, FsStore};

#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    Ready(ResponsePayload),
    TimedOut {
        session_id: SessionId,
        waited: Duration,
    },
    /// A response exists but is unusable. `raw` is the body as read.
    Malformed {
        session_id: SessionId,
        defects: Vec<PayloadDefect>,
        raw: String,
    },
}

impl ReadOutcome {
    /// Successful payloads only; everything else becomes an error.
    pub fn into_result(self) -> Result<ResponsePayload, ClientError> {
        match self {
            Self::Ready(payload) if payload.success => Ok(payload),
            Self::Ready(payload) => Err(ClientError::Failed {
                message: payload
                    .error
                    .clone()
                    .unwrap_or_else(|| "failed without an error message".to_string()),
                session_id: payload.session_id,
            }),
            Self::TimedOut { session_id, waited } => {
                Err(ClientError::TimedOut { session_id, waited })
            }
            Self::Malformed {
                session_id,
                defects,
                ..
            } => Err(ClientError::Malformed {
                session_id,
                defects,
            }),
        }
    }
}

#[derive(Clone)]
pub struct SpoolClient {
    layout: SpoolLayout,
    store: Arc<dyn ArtifactStore>,
    poll_interval: Duration,
}

impl SpoolClient {
    #[must_use]
    pub fn new(layout: SpoolLayout) -> Self {
        Self {
            layout,
            store: Arc::new(FsStore),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn from_config(config: &BrokerConfig) -> Result<Self, ClientError> {
        let codec = config
            .codec()
            .map_err(|err| ClientError::Config(err.to_string()))?;
        Ok(Self::new(SpoolLayout::new(config.root.clone(), codec))
            .with_poll_interval(config.response_poll_interval))
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = store;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    #[must_use]
    pub fn layout(&self) -> &SpoolLayout {
        &self.layout
    }

    /// Write a request under a fresh session id.
    pub async fn enqueue(&self, instruction: &str) -> Result<SessionId, ClientError> {
        let session = SessionId::generate();
        self.enqueue_with_session(&session, instruction).await?;
        Ok(session)
    }

    /// Write a request under a caller-chosen id. Re-using an id replaces
    /// its previous response once the new request is processed.
    pub async fn enqueue_with_session(
        &self,
        session: &SessionId,
        instruction: &str,
    ) -> Result<(), ClientError> {
        let path = self.layout.request_path(session);
        // The in-flight `.tmp` name does not look like a request, so the
        // watcher only ever sees the complete file.
        self.store.write_atomic(&path, instruction.as_bytes()).await?;
        debug!("enqueued {}", path.display());
        Ok(())
    }

    /// Look once. `None` when no response exists yet.
    pub async fn read_response(
        &self,
        session: &SessionId,
    ) -> Result<Option<ReadOutcome>, ClientError> {
        let path = self.layout.response_path(session);
        let bytes = match self.store.read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let outcome = match ResponsePayload::parse_for(&bytes, session) {
            Ok(payload) => ReadOutcome::Ready(payload),
            Err(defects) => ReadOutcome::Malformed {
                session_id: session.clone(),
                defects,
                raw: String::from_utf8_lossy(&bytes).into_owned(),
            },
        };
        Ok(Some(outcome))
    }

    /// Poll until a response appears or `timeout` elapses. A timeout is an
    /// outcome, not an error: the request may still be in progress.
    pub async fn wait_for_response(
        &self,
        session: &SessionId,
        timeout: Duration,
    ) -> Result<ReadOutcome, ClientError> {
        let started = Instant::now();
        let deadline = started + timeout;
        loop {
            if let Some(outcome) = self.read_response(session).await? {
                return Ok(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadOutcome::TimedOut {
                    session_id: session.clone(),
                    waited: now.duration_since(started),
                });
            }
            time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{tmp_path_for, MemoryStore};
    use pretty_assertions::assert_eq;
    use spool_protocol::ArtifactCodec;
    use std::path::Path;

    fn client() -> (SpoolClient, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let client = SpoolClient::new(SpoolLayout::new("/spool", ArtifactCodec::default()))
            .with_store(store.clone())
            .with_poll_interval(Duration::from_millis(5));
        (client, store)
    }

    #[tokio::test]
    async fn enqueue_writes_request_artifact() {
        let (client, store) = client();
        let session = client.enqueue("reconcile march").await.unwrap();
        let path = client.layout().request_path(&session);
        assert_eq!(store.get(&path).unwrap(), b"reconcile march");
        assert!(!store.contains(&tmp_path_for(&path)));
    }

    #[tokio::test]
    async fn missing_response_times_out() {
        let (client, _) = client();
        let session = SessionId::parse("never").unwrap();
        let outcome = client
            .wait_for_response(&session, Duration::from_millis(30))
            .await
            .unwrap();
        let ReadOutcome::TimedOut { session_id, waited } = outcome else {
            panic!("expected timeout, got {outcome:?}");
        };
        assert_eq!(session_id, session);
        assert!(waited >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn foreign_session_is_malformed() {
        let (client, store) = client();
        let asked = SessionId::parse("mine").unwrap();
        let other = SessionId::parse("theirs").unwrap();
        let payload = ResponsePayload::completed(other, "hi", 1);
        store.insert(
            Path::new("/spool/spool-response-mine.json"),
            payload.to_json_bytes().unwrap(),
        );

        let outcome = client
            .wait_for_response(&asked, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(outcome, ReadOutcome::Malformed { .. }));
        assert!(matches!(
            outcome.into_result(),
            Err(ClientError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn failed_payload_is_ready_but_errors_on_into_result() {
        let (client, store) = client();
        let session = SessionId::parse("bad").unwrap();
        let payload = ResponsePayload::failed(session.clone(), "session bad: empty request body", 1);
        store.insert(
            client.layout().response_path(&session),
            payload.to_json_bytes().unwrap(),
        );

        let outcome = client.read_response(&session).await.unwrap().unwrap();
        assert_eq!(outcome, ReadOutcome::Ready(payload));
        let err = outcome.into_result().unwrap_err();
        assert!(err.to_string().contains("empty request body"));
    }
}
