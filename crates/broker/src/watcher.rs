//! Request discovery.
//!
//! Two producers feed one channel: a `notify` watcher on the shared root and
//! a periodic directory scan. The scan is not optional. Network mounts and
//! some container filesystems never deliver change events, and a notify
//! backend that faulted stays silent. Consumers must tolerate the same path
//! being reported more than once.

use log::{debug, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use spool_protocol::ArtifactCodec;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::error::WatcherFault;
use crate::health::current_unix_ms;
use crate::store::ArtifactStore;
use crate::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    Startup,
    Notify,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryEvent {
    pub path: PathBuf,
    pub source: DiscoverySource,
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherOptions {
    pub poll_interval: Duration,
    pub notify_poll_interval: Duration,
    /// Poll-only mode when false.
    pub notify_enabled: bool,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            notify_poll_interval: Duration::from_secs(2),
            notify_enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct FaultLog {
    count: AtomicU64,
    last: Mutex<Option<WatcherFault>>,
}

impl FaultLog {
    fn record(&self, message: String) {
        warn!("watcher fault: {message}");
        self.count.fetch_add(1, Ordering::Relaxed);
        *lock(&self.last) = Some(WatcherFault {
            message,
            at_unix_ms: current_unix_ms(),
        });
    }
}

pub struct DirectoryWatcher {
    root: PathBuf,
    notify: Mutex<Option<RecommendedWatcher>>,
    notify_enabled: bool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    faults: Arc<FaultLog>,
    closed: AtomicBool,
}

impl DirectoryWatcher {
    /// Scan the root once, then subscribe to change events and start the
    /// periodic scan. Every request artifact already present is emitted with
    /// [`DiscoverySource::Startup`].
    ///
    /// Fails only when the root cannot be listed. A notify backend that
    /// cannot be initialised is recorded as a fault and discovery continues
    /// through the scan.
    pub async fn start(
        store: Arc<dyn ArtifactStore>,
        root: &Path,
        codec: ArtifactCodec,
        tx: mpsc::Sender<DiscoveryEvent>,
        options: WatcherOptions,
    ) -> Result<Self> {
        let initial = scan_requests(store.as_ref(), root, &codec)
            .await
            .map_err(|err| BrokerError::Unreachable(format!("{}: {err}", root.display())))?;
        for path in &initial {
            let event = DiscoveryEvent {
                path: path.clone(),
                source: DiscoverySource::Startup,
            };
            if tx.send(event).await.is_err() {
                return Err(BrokerError::Other("discovery channel closed".to_string()));
            }
        }
        info!(
            "watching {} ({} pending at startup)",
            root.display(),
            initial.len()
        );

        let faults = Arc::new(FaultLog::default());
        let notify = if options.notify_enabled {
            match create_notify_watcher(
                root,
                codec.clone(),
                tx.clone(),
                faults.clone(),
                options.notify_poll_interval,
            ) {
                Ok(watcher) => Some(watcher),
                Err(err) => {
                    faults.record(format!("notify init failed: {err}"));
                    None
                }
            }
        } else {
            None
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll_task = tokio::spawn(poll_loop(
            store,
            root.to_path_buf(),
            codec,
            tx,
            initial.into_iter().collect(),
            options.poll_interval,
            shutdown_rx,
        ));

        Ok(Self {
            root: root.to_path_buf(),
            notify: Mutex::new(notify),
            notify_enabled: options.notify_enabled,
            poll_task: Mutex::new(Some(poll_task)),
            shutdown_tx,
            faults,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Notify subscription present (when enabled), no fault recorded and the
    /// scan task still running.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) || self.fault_count() > 0 {
            return false;
        }
        if self.notify_enabled && lock(&self.notify).is_none() {
            return false;
        }
        lock(&self.poll_task)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    #[must_use]
    pub fn fault_count(&self) -> u64 {
        self.faults.count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_fault(&self) -> Option<WatcherFault> {
        lock(&self.faults.last).clone()
    }

    /// Stop both producers. Safe to call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock(&self.notify).take();
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = lock(&self.poll_task).take() {
            task.abort();
        }
        debug!("watcher on {} closed", self.root.display());
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn create_notify_watcher(
    root: &Path,
    codec: ArtifactCodec,
    tx: mpsc::Sender<DiscoveryEvent>,
    faults: Arc<FaultLog>,
    poll_interval: Duration,
) -> notify::Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for path in request_paths(&event, &codec) {
                    // Events trail the filesystem; the job may already be archived.
                    if !path.exists() {
                        continue;
                    }
                    let _ = tx.blocking_send(DiscoveryEvent {
                        path,
                        source: DiscoverySource::Notify,
                    });
                }
            }
            Err(err) => faults.record(err.to_string()),
        },
        NotifyConfig::default().with_poll_interval(poll_interval),
    )?;
    watcher.watch(root, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

/// Request artifacts that an event announces as arrived.
///
/// Renames away from the root (`From`), removals and content changes are
/// ignored. inotify reports a rename as `From`, `To` and `Both`; only `To`
/// counts so one rename yields one discovery.
fn request_paths(event: &Event, codec: &ArtifactCodec) -> Vec<PathBuf> {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Any))
            | EventKind::Any
            | EventKind::Other
    );
    if !relevant {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter(|path| is_request_name(path, codec))
        .cloned()
        .collect()
}

fn is_request_name(path: &Path, codec: &ArtifactCodec) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| codec.looks_like_request(name))
}

async fn scan_requests(
    store: &dyn ArtifactStore,
    root: &Path,
    codec: &ArtifactCodec,
) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = store.list(root).await?;
    // Oldest first so a backlog drains in arrival order.
    entries.sort_by(|a, b| a.modified.cmp(&b.modified).then(a.file_name.cmp(&b.file_name)));
    Ok(entries
        .into_iter()
        .filter(|entry| codec.looks_like_request(&entry.file_name))
        .map(|entry| entry.path)
        .collect())
}

async fn poll_loop(
    store: Arc<dyn ArtifactStore>,
    root: PathBuf,
    codec: ArtifactCodec,
    tx: mpsc::Sender<DiscoveryEvent>,
    mut seen: HashSet<PathBuf>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        let current = match scan_requests(store.as_ref(), &root, &codec).await {
            Ok(paths) => paths,
            Err(err) => {
                debug!("scan of {} failed: {err}", root.display());
                continue;
            }
        };
        for path in &current {
            if seen.contains(path) {
                continue;
            }
            let event = DiscoveryEvent {
                path: path.clone(),
                source: DiscoverySource::Poll,
            };
            if tx.send(event).await.is_err() {
                return;
            }
        }
        seen = current.into_iter().collect();
    }
}
