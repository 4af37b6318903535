use spool_broker::{
    read_health_report, Broker, BrokerConfig, DiagnosticStatus, Diagnostics, HealthStatus,
    ReadOutcome, ResponderError, SessionId, SpoolClient, ERRORS_DIR, PROCESSED_DIR,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn fast_config(root: &Path) -> BrokerConfig {
    let mut config = BrokerConfig::for_root(root);
    config.poll_interval = Duration::from_millis(50);
    config.health_interval = Duration::from_secs(3600);
    config.restart_cooldown = Duration::from_millis(20);
    config.base_delay = Duration::from_millis(5);
    config.max_delay = Duration::from_millis(20);
    config.response_poll_interval = Duration::from_millis(20);
    config
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

async fn start(config: &BrokerConfig) -> Broker {
    Broker::builder(config.clone())
        .without_notify()
        .start()
        .await
        .expect("broker starts")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scenario_r1_round_trip() {
    let temp = TempDir::new().expect("tempdir");
    let config = fast_config(temp.path());
    let broker = start(&config).await;
    let client = SpoolClient::from_config(&config).expect("client");

    let session = SessionId::parse("abc").expect("session");
    client
        .enqueue_with_session(&session, "R1")
        .await
        .expect("enqueue");

    let payload = client
        .wait_for_response(&session, Duration::from_secs(10))
        .await
        .expect("read")
        .into_result()
        .expect("successful response");
    assert!(payload.success);
    assert!(!payload.response.is_empty());
    assert_eq!(payload.session_id, session);

    assert!(!client.layout().request_path(&session).exists());
    let processed = file_names(&temp.path().join(PROCESSED_DIR));
    assert_eq!(processed.len(), 1, "{processed:?}");
    assert!(processed[0].ends_with("-spool-request-abc.txt"));

    broker.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_within_one_poll_interval_is_fully_answered() {
    let temp = TempDir::new().expect("tempdir");
    let mut config = fast_config(temp.path());
    config.poll_interval = Duration::from_millis(300);
    let broker = start(&config).await;
    let client = SpoolClient::from_config(&config).expect("client");

    let mut sessions = Vec::new();
    for text in ["first", "second", "third"] {
        sessions.push(client.enqueue(text).await.expect("enqueue"));
    }

    for (session, text) in sessions.iter().zip(["first", "second", "third"]) {
        let payload = client
            .wait_for_response(session, Duration::from_secs(10))
            .await
            .expect("read")
            .into_result()
            .expect("success");
        assert!(payload.response.contains(text), "{}", payload.response);
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(file_names(&temp.path().join(PROCESSED_DIR)).len(), 3);
    let stats = broker.stats();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.failed, 0);
    broker.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_request_gets_error_response() {
    let temp = TempDir::new().expect("tempdir");
    let config = fast_config(temp.path());
    let broker = start(&config).await;
    let client = SpoolClient::from_config(&config).expect("client");

    let session = client.enqueue("").await.expect("enqueue");
    let outcome = client
        .wait_for_response(&session, Duration::from_secs(10))
        .await
        .expect("read");
    let ReadOutcome::Ready(payload) = outcome else {
        panic!("expected a response, got {outcome:?}");
    };
    assert!(!payload.success);
    assert!(payload.error.as_deref().unwrap_or("").contains("empty"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let errors = file_names(&temp.path().join(ERRORS_DIR));
    assert_eq!(errors.len(), 2, "{errors:?}");
    assert!(errors.iter().any(|n| n.ends_with(".error.json")));
    broker.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_archive_into_errors() {
    let temp = TempDir::new().expect("tempdir");
    let config = fast_config(temp.path());
    let broker = Broker::builder(config.clone())
        .responder(|_: &str, _: &SessionId| -> Result<String, ResponderError> {
            Err(ResponderError::new("ledger service unavailable"))
        })
        .without_notify()
        .start()
        .await
        .expect("broker");
    let client = SpoolClient::from_config(&config).expect("client");

    let session = client.enqueue("reconcile").await.expect("enqueue");
    let err = client
        .wait_for_response(&session, Duration::from_secs(10))
        .await
        .expect("read")
        .into_result()
        .expect_err("failure response");
    assert!(err.to_string().contains("ledger service unavailable"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!client.layout().request_path(&session).exists());
    assert_eq!(broker.stats().failed, 1);

    let report = Diagnostics::from_config(&config)
        .expect("diagnostics")
        .run()
        .await
        .expect("report");
    assert_eq!(report.recent_errors, 1);
    assert_eq!(report.error_patterns.len(), 1);
    assert_eq!(report.error_patterns[0].count, 1);
    assert_eq!(report.health_score, 98);
    assert_eq!(report.status, DiagnosticStatus::Healthy);
    broker.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_watcher_is_restarted_and_catches_up() {
    let temp = TempDir::new().expect("tempdir");
    let mut config = fast_config(temp.path());
    config.health_interval = Duration::from_millis(200);
    config.health_file = Some(temp.path().join("state").join("health.json"));
    let broker = start(&config).await;
    let client = SpoolClient::from_config(&config).expect("client");

    broker.kill_watcher().await;
    assert!(!broker.watcher_alive().await);

    let session = client
        .enqueue("written while nobody watches")
        .await
        .expect("enqueue");
    let payload = client
        .wait_for_response(&session, Duration::from_secs(10))
        .await
        .expect("read")
        .into_result()
        .expect("success after restart");
    assert!(payload.success);
    assert!(broker.watcher_alive().await);
    assert!(broker.stats().restarts >= 1);

    let health_file = config.health_file.clone().expect("configured");
    let mut persisted = None;
    for _ in 0..50 {
        persisted = read_health_report(&health_file).await.expect("readable");
        if persisted
            .as_ref()
            .is_some_and(|r| r.status == HealthStatus::Healthy)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let persisted = persisted.expect("health report persisted");
    assert_eq!(persisted.status, HealthStatus::Healthy);
    assert!(persisted.restarts >= 1);
    broker.shutdown(Duration::from_secs(2)).await;
}

async fn start_with_notify(config: &BrokerConfig, calls: Arc<AtomicUsize>) -> Option<Broker> {
    if std::env::var("SKIP_WATCH_FLOW").is_ok() {
        eprintln!("skipping notify flow due to SKIP_WATCH_FLOW");
        return None;
    }
    let broker = Broker::builder(config.clone())
        .responder(move |text: &str, _: &SessionId| -> Result<String, ResponderError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("done: {text}"))
        })
        .start()
        .await
        .expect("broker starts");
    if !broker.watcher_alive().await {
        eprintln!(
            "skipping notify flow: {:?}",
            broker.health_snapshot().last_fault
        );
        broker.shutdown(Duration::from_secs(1)).await;
        return None;
    }
    Some(broker)
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "notify event shapes are only pinned down on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notify_discovery_counts_each_job_once() {
    let temp = TempDir::new().expect("tempdir");
    let mut config = fast_config(temp.path());
    // Anything processed within the test was discovered through notify.
    config.poll_interval = Duration::from_secs(60);
    let calls = Arc::new(AtomicUsize::new(0));
    let Some(broker) = start_with_notify(&config, calls.clone()).await else {
        return;
    };
    let client = SpoolClient::from_config(&config).expect("client");

    let session = client.enqueue("R1").await.expect("enqueue");
    let payload = client
        .wait_for_response(&session, Duration::from_secs(10))
        .await
        .expect("read")
        .into_result()
        .expect("success");
    assert_eq!(payload.response, "done: R1");

    // Give trailing rename events time to arrive.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = broker.stats();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.vanished, 0, "{stats:?}");
    assert_eq!(stats.duplicates, 0, "{stats:?}");
    broker.shutdown(Duration::from_secs(2)).await;
}

#[cfg_attr(
    not(target_os = "linux"),
    ignore = "notify event shapes are only pinned down on Linux"
)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn notify_and_scan_together_answer_once() {
    let temp = TempDir::new().expect("tempdir");
    let mut config = fast_config(temp.path());
    // The scan runs several times while the job is in flight.
    config.processing_delay = Duration::from_millis(300);
    let calls = Arc::new(AtomicUsize::new(0));
    let Some(broker) = start_with_notify(&config, calls.clone()).await else {
        return;
    };
    let client = SpoolClient::from_config(&config).expect("client");

    let session = client.enqueue("only once").await.expect("enqueue");
    client
        .wait_for_response(&session, Duration::from_secs(10))
        .await
        .expect("read")
        .into_result()
        .expect("success");

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = broker.stats();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.vanished, 0, "{stats:?}");
    assert!(stats.duplicates <= 1, "{stats:?}");

    let root_files = file_names(temp.path());
    let responses: Vec<_> = root_files
        .iter()
        .filter(|n| n.starts_with("spool-response-"))
        .collect();
    assert_eq!(responses.len(), 1, "{root_files:?}");
    assert_eq!(file_names(&temp.path().join(PROCESSED_DIR)).len(), 1);
    broker.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn reader_timeout_is_an_outcome() {
    let temp = TempDir::new().expect("tempdir");
    let config = fast_config(temp.path());
    let client = SpoolClient::from_config(&config).expect("client");
    let session = SessionId::parse("nobody-home").expect("session");

    let outcome = client
        .wait_for_response(&session, Duration::from_millis(100))
        .await
        .expect("timeout is not an error");
    assert!(matches!(outcome, ReadOutcome::TimedOut { .. }));
}
