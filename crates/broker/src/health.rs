use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;

use crate::store::tmp_path_for;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// No check has run yet.
    Starting,
    Healthy,
    /// The watcher is dead or faulted; a restart follows.
    Degraded,
    Restarting,
    /// The shared root is missing or not a directory.
    Unreachable,
}

impl HealthStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Restarting => "restarting",
            Self::Unreachable => "unreachable",
        }
    }
}

/// Snapshot published after every health check, and persisted to the
/// configured health file so `spool status` can read it from another
/// process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub root_reachable: bool,
    pub watcher_alive: bool,
    pub in_flight: usize,
    pub pending_requests: usize,
    pub lifetime_processed: u64,
    pub lifetime_failed: u64,
    pub duplicates_skipped: u64,
    pub restarts: u64,
    pub watcher_faults: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fault: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart_error: Option<String>,
    pub last_check_unix_ms: u64,
}

impl HealthReport {
    #[must_use]
    pub fn initial() -> Self {
        Self {
            status: HealthStatus::Starting,
            root_reachable: true,
            watcher_alive: true,
            in_flight: 0,
            pending_requests: 0,
            lifetime_processed: 0,
            lifetime_failed: 0,
            duplicates_skipped: 0,
            restarts: 0,
            watcher_faults: 0,
            last_fault: None,
            last_restart_error: None,
            last_check_unix_ms: 0,
        }
    }

    #[must_use]
    pub fn needs_restart(&self) -> bool {
        matches!(
            self.status,
            HealthStatus::Degraded | HealthStatus::Unreachable
        )
    }
}

#[must_use]
pub const fn assess(root_reachable: bool, watcher_alive: bool) -> HealthStatus {
    match (root_reachable, watcher_alive) {
        (false, _) => HealthStatus::Unreachable,
        (true, false) => HealthStatus::Degraded,
        (true, true) => HealthStatus::Healthy,
    }
}

pub async fn write_health_report(path: &Path, report: &HealthReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(report)?;
    let tmp = tmp_path_for(path);
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

pub async fn read_health_report(path: &Path) -> Result<Option<HealthReport>> {
    match fs::read(path).await {
        Ok(bytes) => {
            let report = serde_json::from_slice(&bytes)?;
            Ok(Some(report))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn current_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|dur| u64::try_from(dur.as_millis()).ok())
        .unwrap_or(0)
}
