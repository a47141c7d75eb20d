#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archivist_core::{
    ArchivistError, ArchivistResult, BuildRecord, ClusterConfig, NamespaceCapacity, NamespaceRecord,
    ReplicaSetRecord,
};
use archivist_monitor::{
    ActivityCalculator, ActivitySource, Archiver, ClusterMonitor, MonitorSources, MonitorState, SkipReason,
};
use archivist_store::FakeSource;
use chrono::{DateTime, Duration as Days, TimeZone, Utc};
use tokio_util::sync::CancellationToken;

fn tm(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

fn ns(name: &str) -> NamespaceRecord {
    NamespaceRecord { name: name.to_string(), created: None }
}

fn build(ns: &str, started: DateTime<Utc>) -> BuildRecord {
    BuildRecord { namespace: ns.to_string(), name: format!("{ns}-build"), started: Some(started) }
}

fn cluster(high: usize, low: usize) -> ClusterConfig {
    ClusterConfig {
        name: "test".into(),
        namespace_capacity: NamespaceCapacity { high_watermark: high, low_watermark: low },
        protected_namespaces: vec!["default".into(), "openshift-infra".into()],
        warmup_millis: 10,
        check_interval_secs: 3600,
        ..Default::default()
    }
}

fn empty_sources() -> MonitorSources {
    MonitorSources {
        namespaces: Arc::new(FakeSource::<NamespaceRecord>::new(vec![])),
        builds: Arc::new(FakeSource::<BuildRecord>::new(vec![])),
        replica_sets: Arc::new(FakeSource::<ReplicaSetRecord>::new(vec![])),
    }
}

#[derive(Default)]
struct RecordingArchiver {
    seen: Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl Archiver for RecordingArchiver {
    async fn export(&self, namespace: &str, requester: &str) -> ArchivistResult<Vec<serde_json::Value>> {
        self.seen.lock().unwrap().push((namespace.to_string(), requester.to_string()));
        if namespace == "gone" {
            return Err(ArchivistError::NotFound { namespace: namespace.to_string() });
        }
        Ok(vec![serde_json::json!({ "kind": "Namespace", "name": namespace })])
    }
}

#[test]
fn last_activity_requires_known_namespace() {
    let m = ClusterMonitor::new(cluster(5, 3), empty_sources());
    m.namespaces().upsert(ns("present")).unwrap();
    m.builds().upsert(build("present", tm(2017, 5, 1))).unwrap();
    m.builds().upsert(build("absent", tm(2017, 5, 2))).unwrap();

    assert_eq!(m.get_last_activity("present").unwrap(), Some(tm(2017, 5, 1)));
    assert!(matches!(
        m.get_last_activity("absent"),
        Err(ArchivistError::NotFound { namespace }) if namespace == "absent"
    ));
}

#[test]
fn last_activity_of_protected_namespace_is_still_answered() {
    let m = ClusterMonitor::new(cluster(5, 3), empty_sources());
    m.namespaces().upsert(ns("default")).unwrap();
    m.builds().upsert(build("default", tm(2016, 1, 1))).unwrap();
    assert_eq!(m.get_last_activity("default").unwrap(), Some(tm(2016, 1, 1)));
}

#[test]
fn namespaces_to_archive_over_mirrors() {
    let m = ClusterMonitor::new(cluster(5, 3), empty_sources());
    let data = [
        ("vinactive1", tm(2015, 1, 7)),
        ("vinactive2", tm(2016, 1, 5)),
        ("vinactive3", tm(2017, 1, 9)),
        ("vinactive4", tm(2017, 2, 14)),
        ("vinactive5", tm(2017, 3, 20)),
        ("inactive6", tm(2017, 4, 25)),
        ("inactive7", tm(2017, 4, 27)),
        ("active1", tm(2017, 5, 25)),
        ("active2", tm(2017, 5, 20)),
    ];
    for (name, t) in data {
        m.namespaces().upsert(ns(name)).unwrap();
        m.builds().upsert(build(name, t)).unwrap();
    }

    let report = m.namespaces_to_archive(tm(2017, 5, 29)).unwrap();
    let mut names = report.candidate_names();
    names.sort();
    assert_eq!(names, vec!["inactive6", "vinactive1", "vinactive2", "vinactive3", "vinactive4", "vinactive5"]);
    assert!(!names.contains(&"inactive7"));
    assert_eq!(report.total_namespaces, 9);
}

#[test]
fn missing_watermark_yields_skipped_report() {
    let m = ClusterMonitor::new(cluster(0, 3), empty_sources());
    m.namespaces().upsert(ns("old")).unwrap();
    m.builds().upsert(build("old", tm(2010, 1, 1))).unwrap();

    let report = m.check_capacity().unwrap();
    assert_eq!(report.skipped, Some(SkipReason::NoHighWatermark));
    assert!(report.candidates.is_empty());
    assert!(m.last_report().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_checks_after_warmup_and_stops_cleanly() {
    let now = Utc::now();
    let sources = MonitorSources {
        namespaces: Arc::new(FakeSource::new(vec![ns("old"), ns("gone"), ns("stale"), ns("fresh")])),
        builds: Arc::new(FakeSource::new(vec![
            build("old", now - Days::days(200)),
            build("gone", now - Days::days(180)),
            build("stale", now - Days::days(45)),
            build("fresh", now - Days::days(1)),
        ])),
        replica_sets: Arc::new(FakeSource::<ReplicaSetRecord>::new(vec![])),
    };
    let mut cfg = cluster(3, 1);
    cfg.warmup_millis = 200;
    let archiver = Arc::new(RecordingArchiver::default());
    let m = Arc::new(ClusterMonitor::new(cfg, sources).with_archiver(archiver.clone()));
    let mut reports = m.subscribe_reports();
    let mut states = m.subscribe_state();

    let stop = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&m).run(stop.clone()));

    tokio::time::timeout(Duration::from_secs(5), reports.changed())
        .await
        .expect("report within timeout")
        .unwrap();
    assert_eq!(m.state(), MonitorState::Running);
    assert!(m.synced());

    let report = m.last_report().expect("published report");
    let mut names = report.candidate_names();
    names.sort();
    assert_eq!(names, vec!["gone", "old", "stale"]);

    // Dispatch happens after the report is published.
    tokio::time::timeout(Duration::from_secs(5), async {
        while archiver.seen.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("archiver called");
    for (_, requester) in archiver.seen.lock().unwrap().iter() {
        assert_eq!(requester, "system:archivist");
    }

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.expect("run returns").unwrap();
    assert_eq!(*states.borrow_and_update(), MonitorState::Stopped);
}

#[tokio::test]
async fn run_cancelled_during_warmup_never_checks() {
    let mut cfg = cluster(3, 2);
    cfg.warmup_millis = 60_000;
    let m = Arc::new(ClusterMonitor::new(cfg, empty_sources()));
    let stop = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&m).run(stop.clone()));

    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await.expect("run returns").unwrap();
    assert_eq!(m.state(), MonitorState::Stopped);
    assert!(m.last_report().is_none());
}

fn stale_sources() -> MonitorSources {
    MonitorSources {
        namespaces: Arc::new(FakeSource::new(vec![ns("old"), ns("fresh")])),
        builds: Arc::new(FakeSource::new(vec![
            build("old", Utc::now() - Days::days(200)),
            build("fresh", Utc::now() - Days::days(1)),
        ])),
        replica_sets: Arc::new(FakeSource::<ReplicaSetRecord>::new(vec![])),
    }
}

fn every_minute() -> ClusterConfig {
    ClusterConfig { check_interval_secs: 60, ..cluster(3, 2) }
}

#[tokio::test(start_paused = true)]
async fn checks_repeat_every_interval() {
    let m = Arc::new(ClusterMonitor::new(every_minute(), stale_sources()));
    let reports = m.subscribe_reports();
    let stop = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&m).run(stop.clone()));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(*reports.borrow(), 1, "only the warm-up check so far");
    tokio::time::sleep(Duration::from_secs(95)).await;
    assert!(*reports.borrow() >= 3, "reports after two intervals: {}", *reports.borrow());
    assert_eq!(m.last_report().expect("report").candidate_names(), vec!["old"]);

    stop.cancel();
    handle.await.unwrap();
    assert_eq!(m.state(), MonitorState::Stopped);
}

/// Fails the first lookup, then answers from the mirrors.
struct FailsOnce {
    inner: ActivityCalculator,
    failed: AtomicBool,
}

impl ActivitySource for FailsOnce {
    fn last_activity(&self, namespace: &str) -> ArchivistResult<Option<DateTime<Utc>>> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(ArchivistError::Lookup("index unavailable".into()));
        }
        self.inner.last_activity(namespace)
    }
}

#[tokio::test(start_paused = true)]
async fn failed_check_is_followed_by_next_tick() {
    let m = ClusterMonitor::new(every_minute(), stale_sources());
    let inner = ActivityCalculator::new(Arc::clone(m.builds()), Arc::clone(m.replica_sets()));
    let m = Arc::new(m.with_activity(Arc::new(FailsOnce { inner, failed: AtomicBool::new(false) })));
    let reports = m.subscribe_reports();
    let stop = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&m).run(stop.clone()));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(m.state(), MonitorState::Running);
    assert_eq!(*reports.borrow(), 0);
    assert!(m.last_report().is_none());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(*reports.borrow(), 1);
    assert_eq!(m.last_report().expect("report").candidate_names(), vec!["old"]);

    stop.cancel();
    handle.await.unwrap();
}

#[derive(Default)]
struct HangingArchiver {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Archiver for HangingArchiver {
    async fn export(&self, _namespace: &str, _requester: &str) -> ArchivistResult<Vec<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn hung_archiver_times_out_and_schedule_continues() {
    let cfg = ClusterConfig { archive_timeout_secs: 5, ..every_minute() };
    let archiver = Arc::new(HangingArchiver::default());
    let m = Arc::new(ClusterMonitor::new(cfg, stale_sources()).with_archiver(archiver.clone()));
    let reports = m.subscribe_reports();
    let stop = CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&m).run(stop.clone()));

    tokio::time::sleep(Duration::from_secs(125)).await;
    assert!(*reports.borrow() >= 3);
    assert!(archiver.calls.load(Ordering::SeqCst) >= 3);

    stop.cancel();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_run_calls_start_once() {
    let m = Arc::new(ClusterMonitor::new(every_minute(), stale_sources()));
    let stop = CancellationToken::new();
    let a = tokio::spawn(Arc::clone(&m).run(stop.clone()));
    let b = tokio::spawn(Arc::clone(&m).run(stop.clone()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(m.state(), MonitorState::Running);
    assert!(a.is_finished() != b.is_finished(), "exactly one run call should still be active");

    stop.cancel();
    a.await.unwrap();
    b.await.unwrap();
    assert_eq!(m.state(), MonitorState::Stopped);
}
