//! The running broker: discovery, dispatch and the health monitor.

use log::{debug, error, info, warn};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::time::{self, MissedTickBehavior};

use crate::config::BrokerConfig;
use crate::health::{assess, current_unix_ms, write_health_report, HealthReport, HealthStatus};
use crate::layout::SpoolLayout;
use crate::processor::{JobProcessor, RetryPolicy};
use crate::responder::{Responder, TemplateResponder};
use crate::stats::{BrokerStats, StatsSnapshot};
use crate::store::{ArtifactStore, FsStore};
use crate::watcher::{DirectoryWatcher, DiscoveryEvent, WatcherOptions};
use crate::{BrokerError, Result};

pub struct BrokerBuilder {
    config: BrokerConfig,
    responder: Option<Arc<dyn Responder>>,
    store: Option<Arc<dyn ArtifactStore>>,
    notify_enabled: bool,
}

impl BrokerBuilder {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            responder: None,
            store: None,
            notify_enabled: true,
        }
    }

    #[must_use]
    pub fn responder<R: Responder + 'static>(mut self, responder: R) -> Self {
        self.responder = Some(Arc::new(responder));
        self
    }

    #[must_use]
    pub fn shared_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Discover requests through the periodic scan only.
    #[must_use]
    pub fn without_notify(mut self) -> Self {
        self.notify_enabled = false;
        self
    }

    pub async fn start(self) -> Result<Broker> {
        let config = self.config;
        config.validate()?;
        let layout = SpoolLayout::new(config.root.clone(), config.codec()?);
        let store: Arc<dyn ArtifactStore> = self.store.unwrap_or_else(|| Arc::new(FsStore));
        let responder = self
            .responder
            .unwrap_or_else(|| Arc::new(TemplateResponder::default()));

        if !store.is_dir(layout.root()).await {
            return Err(BrokerError::Unreachable(format!(
                "{} is not a directory",
                layout.root().display()
            )));
        }
        layout.ensure(store.as_ref()).await?;

        let stats = Arc::new(BrokerStats::new());
        let processor = Arc::new(
            JobProcessor::new(store.clone(), layout.clone(), responder, stats.clone())
                .with_retry(RetryPolicy {
                    max_attempts: config.max_attempts,
                    base_delay: config.base_delay,
                    max_delay: config.max_delay,
                })
                .with_processing_delay(config.processing_delay),
        );

        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (health_tx, _) = watch::channel(HealthReport::initial());

        // The startup scan feeds the channel, so the consumer must run first.
        tokio::spawn(dispatch_loop(
            processor.clone(),
            event_rx,
            shutdown_rx.clone(),
        ));

        let watcher_options = WatcherOptions {
            poll_interval: config.poll_interval,
            notify_poll_interval: config.notify_poll_interval,
            notify_enabled: self.notify_enabled,
        };
        let watcher = DirectoryWatcher::start(
            store.clone(),
            layout.root(),
            layout.codec().clone(),
            event_tx.clone(),
            watcher_options,
        )
        .await?;

        let health_interval = config.health_interval;
        let inner = Arc::new(BrokerInner {
            config,
            layout,
            store,
            processor,
            stats,
            watcher: TokioMutex::new(Some(watcher)),
            watcher_options,
            event_tx,
            health_tx,
            shutdown_tx,
        });
        tokio::spawn(health_loop(
            Arc::downgrade(&inner),
            health_interval,
            shutdown_rx,
        ));

        info!("broker started on {}", inner.layout.root().display());
        Ok(Broker { inner })
    }
}

/// Handle to a running broker. Clones share the same instance; the broker
/// stops when the last clone is dropped or [`Broker::shutdown`] is called.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    config: BrokerConfig,
    layout: SpoolLayout,
    store: Arc<dyn ArtifactStore>,
    processor: Arc<JobProcessor>,
    stats: Arc<BrokerStats>,
    watcher: TokioMutex<Option<DirectoryWatcher>>,
    watcher_options: WatcherOptions,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    health_tx: watch::Sender<HealthReport>,
    shutdown_tx: watch::Sender<bool>,
}

impl Broker {
    #[must_use]
    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn layout(&self) -> &SpoolLayout {
        &self.inner.layout
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.processor.processing_set().len()
    }

    #[must_use]
    pub fn health_snapshot(&self) -> HealthReport {
        self.inner.health_tx.borrow().clone()
    }

    #[must_use]
    pub fn health_stream(&self) -> watch::Receiver<HealthReport> {
        self.inner.health_tx.subscribe()
    }

    /// Run one health check now, restarting discovery if needed.
    pub async fn check_health(&self) -> HealthReport {
        self.inner.check_health().await
    }

    pub async fn restart(&self) -> Result<()> {
        self.inner.restart().await
    }

    pub async fn watcher_alive(&self) -> bool {
        self.inner
            .watcher
            .lock()
            .await
            .as_ref()
            .is_some_and(DirectoryWatcher::is_alive)
    }

    /// Stop discovery without telling the health monitor, as if the watcher
    /// had died on its own.
    pub async fn kill_watcher(&self) {
        if let Some(watcher) = self.inner.watcher.lock().await.as_ref() {
            warn!("killing watcher on {}", watcher.root().display());
            watcher.close();
        }
    }

    /// Stop discovery and the health monitor, then wait up to `drain` for
    /// in-flight jobs.
    pub async fn shutdown(&self, drain: Duration) {
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(watcher) = self.inner.watcher.lock().await.take() {
            watcher.close();
        }
        let deadline = time::Instant::now() + drain;
        while self.in_flight() > 0 && time::Instant::now() < deadline {
            time::sleep(Duration::from_millis(20)).await;
        }
        let remaining = self.in_flight();
        if remaining > 0 {
            warn!("shutdown with {remaining} job(s) still in flight");
        }
        info!("broker on {} stopped", self.inner.layout.root().display());
    }
}

impl BrokerInner {
    async fn observe(&self) -> HealthReport {
        let root = self.layout.root();
        let root_reachable = self.store.is_dir(root).await;
        let (watcher_alive, current_faults, last_fault) = {
            let guard = self.watcher.lock().await;
            match guard.as_ref() {
                Some(watcher) => (
                    watcher.is_alive(),
                    watcher.fault_count(),
                    watcher.last_fault().map(|f| f.message),
                ),
                None => (false, 0, None),
            }
        };
        let pending_requests = if root_reachable {
            count_pending(self.store.as_ref(), &self.layout).await
        } else {
            0
        };
        let stats = self.stats.snapshot();
        HealthReport {
            status: assess(root_reachable, watcher_alive),
            root_reachable,
            watcher_alive,
            in_flight: self.processor.processing_set().len(),
            pending_requests,
            lifetime_processed: stats.processed,
            lifetime_failed: stats.failed,
            duplicates_skipped: stats.duplicates,
            restarts: stats.restarts,
            watcher_faults: stats.watcher_faults + current_faults,
            last_fault,
            last_restart_error: None,
            last_check_unix_ms: current_unix_ms(),
        }
    }

    async fn check_health(&self) -> HealthReport {
        let mut report = self.observe().await;
        if report.needs_restart() {
            warn!(
                "health check on {}: {} (root_reachable={}, watcher_alive={})",
                self.layout.root().display(),
                report.status.as_str(),
                report.root_reachable,
                report.watcher_alive
            );
            self.publish(report.clone()).await;
            self.publish(HealthReport {
                status: HealthStatus::Restarting,
                ..report.clone()
            })
            .await;
            match self.restart().await {
                Ok(()) => report = self.observe().await,
                Err(err) => {
                    error!("restart failed, retrying next check: {err}");
                    report.last_restart_error = Some(err.to_string());
                }
            }
        } else {
            debug!(
                "health check: {} pending, {} in flight",
                report.pending_requests, report.in_flight
            );
        }
        self.publish(report.clone()).await;
        report
    }

    async fn restart(&self) -> Result<()> {
        let mut guard = self.watcher.lock().await;
        if let Some(old) = guard.take() {
            old.close();
            self.stats.add_watcher_faults(old.fault_count());
        }
        self.processor.processing_set().clear();
        time::sleep(self.config.restart_cooldown).await;

        let root = self.layout.root();
        if !self.store.is_dir(root).await {
            return Err(BrokerError::Unreachable(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        self.layout.ensure(self.store.as_ref()).await?;
        let watcher = DirectoryWatcher::start(
            self.store.clone(),
            root,
            self.layout.codec().clone(),
            self.event_tx.clone(),
            self.watcher_options,
        )
        .await?;
        *guard = Some(watcher);
        self.stats.record_restart();
        info!("watcher on {} restarted", root.display());
        Ok(())
    }

    async fn publish(&self, report: HealthReport) {
        if let Some(path) = &self.config.health_file {
            if let Err(err) = write_health_report(path, &report).await {
                warn!("failed to persist health report to {}: {err}", path.display());
            }
        }
        self.health_tx.send_replace(report);
    }
}

impl Drop for BrokerInner {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn count_pending(store: &dyn ArtifactStore, layout: &SpoolLayout) -> usize {
    match store.list(layout.root()).await {
        Ok(entries) => entries
            .iter()
            .filter(|entry| layout.codec().looks_like_request(&entry.file_name))
            .count(),
        Err(err) => {
            debug!("list {}: {err}", layout.root().display());
            0
        }
    }
}

async fn dispatch_loop(
    processor: Arc<JobProcessor>,
    mut event_rx: mpsc::Receiver<DiscoveryEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_event = event_rx.recv() => {
                let Some(event) = maybe_event else {
                    break;
                };
                debug!("discovered {} via {:?}", display(&event.path), event.source);
                let Some(claim) = processor.claim(&event.path) else {
                    continue;
                };
                let processor = processor.clone();
                tokio::spawn(async move {
                    processor.run(claim).await;
                });
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!("dispatch loop stopped");
}

async fn health_loop(
    inner: Weak<BrokerInner>,
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
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.check_health().await;
    }
    debug!("health monitor stopped");
}

fn display(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
