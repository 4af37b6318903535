//! # Spool Broker
//!
//! A request/response job broker built on a shared directory.
//!
//! ## Pipeline
//!
//! ```text
//! SpoolClient::enqueue
//!     │  spool-request-<id>.txt (tmp + rename)
//!     ▼
//! DirectoryWatcher (notify + periodic scan)
//!     │  DiscoveryEvent
//!     ▼
//! JobProcessor (ProcessingSet, retry/backoff)
//!     │  Responder
//!     ├──> spool-response-<id>.json
//!     └──> processed/ | errors/
//!
//! SpoolClient::wait_for_response polls for the response artifact.
//! The health monitor restarts discovery; Diagnostics inspects offline.
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use spool_broker::{Broker, BrokerConfig, SpoolClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BrokerConfig::for_root("/var/spool/jobs");
//!     let broker = Broker::builder(config.clone()).start().await?;
//!
//!     let client = SpoolClient::from_config(&config)?;
//!     let session = client.enqueue("reconcile march invoices").await?;
//!     let payload = client
//!         .wait_for_response(&session, Duration::from_secs(30))
//!         .await?
//!         .into_result()?;
//!     println!("{}", payload.response);
//!
//!     broker.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

mod broker;
mod client;
mod config;
mod diagnostics;
mod error;
mod health;
mod layout;
mod processor;
mod responder;
mod stats;
mod store;
mod watcher;

pub use broker::{Broker, BrokerBuilder};
pub use client::{ReadOutcome, SpoolClient};
pub use config::{BrokerConfig, CONFIG_FILE_NAME};
pub use diagnostics::{
    error_signature, health_score, DiagnosticOptions, DiagnosticReport, DiagnosticStatus,
    Diagnostics, ErrorPattern, ResponseIssue, ResponseValidation, StaleRequest,
    DEFAULT_SIGNATURE_LEN,
};
pub use error::{BrokerError, ClientError, JobError, JobErrorKind, Result, WatcherFault};
pub use health::{assess, read_health_report, write_health_report, HealthReport, HealthStatus};
pub use layout::{
    archive_name, error_record_path, original_name, SpoolLayout, ERRORS_DIR, ERROR_RECORD_SUFFIX,
    PROCESSED_DIR,
};
pub use processor::{Claim, ErrorRecord, JobProcessor, ProcessOutcome, ProcessingSet, RetryPolicy};
pub use responder::{Responder, ResponderError, TemplateResponder};
pub use stats::{BrokerStats, StatsSnapshot};
pub use store::{tmp_path_for, ArtifactStore, FsStore, MemoryStore, StoreEntry};
pub use watcher::{DirectoryWatcher, DiscoveryEvent, DiscoverySource, WatcherOptions};

pub use spool_protocol::{ArtifactCodec, ResponsePayload, ResponseStatus, SessionId};
