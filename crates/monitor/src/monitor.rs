//! Control loop: owns the three mirrors and runs capacity checks on a schedule.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use archivist_core::{
    ArchivistError, ArchivistResult, BuildRecord, ClusterConfig, NamespaceRecord, ReplicaSetRecord,
};
use archivist_store::{Mirror, ResourceSource, Subscription, SubscriptionConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Span};

use crate::{ActivityCalculator, ActivitySource, Archiver, CapacityEvaluator, CapacityReport, DryRunArchiver};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Remote collections feeding the monitor's mirrors.
#[derive(Clone)]
pub struct MonitorSources {
    pub namespaces: Arc<dyn ResourceSource<NamespaceRecord>>,
    pub builds: Arc<dyn ResourceSource<BuildRecord>>,
    pub replica_sets: Arc<dyn ResourceSource<ReplicaSetRecord>>,
}

fn cluster_scoped<K>(_: &K) -> Option<&str> {
    None
}

pub struct ClusterMonitor {
    cluster: ClusterConfig,
    sources: MonitorSources,
    namespaces: Arc<Mirror<NamespaceRecord>>,
    builds: Arc<Mirror<BuildRecord>>,
    replica_sets: Arc<Mirror<ReplicaSetRecord>>,
    activity: Arc<dyn ActivitySource>,
    evaluator: CapacityEvaluator,
    archiver: Arc<dyn Archiver>,
    last_report: ArcSwapOption<CapacityReport>,
    report_tx: watch::Sender<u64>,
    state_tx: watch::Sender<MonitorState>,
    span: Span,
}

impl ClusterMonitor {
    pub fn new(cluster: ClusterConfig, sources: MonitorSources) -> Self {
        let span = info_span!("clustermonitor", cluster = %cluster.name);
        let namespaces = Arc::new(Mirror::new("namespaces", NamespaceRecord::key, cluster_scoped));
        let builds = Arc::new(Mirror::new("builds", BuildRecord::key, BuildRecord::namespace));
        let replica_sets = Arc::new(Mirror::new(
            "replicationcontrollers",
            ReplicaSetRecord::key,
            ReplicaSetRecord::namespace,
        ));
        let activity: Arc<dyn ActivitySource> = Arc::new(
            ActivityCalculator::new(Arc::clone(&builds), Arc::clone(&replica_sets))
                .with_span(info_span!(parent: &span, "activity")),
        );
        let evaluator =
            CapacityEvaluator::new(cluster.policy()).with_span(info_span!(parent: &span, "capacitycheck"));
        let (report_tx, _) = watch::channel(0u64);
        let (state_tx, _) = watch::channel(MonitorState::Stopped);
        Self {
            cluster,
            sources,
            namespaces,
            builds,
            replica_sets,
            activity,
            evaluator,
            archiver: Arc::new(DryRunArchiver),
            last_report: ArcSwapOption::empty(),
            report_tx,
            state_tx,
            span,
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    /// Replace the activity lookup built over this monitor's mirrors.
    pub fn with_activity(mut self, activity: Arc<dyn ActivitySource>) -> Self {
        self.activity = activity;
        self
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn namespaces(&self) -> &Arc<Mirror<NamespaceRecord>> {
        &self.namespaces
    }

    pub fn builds(&self) -> &Arc<Mirror<BuildRecord>> {
        &self.builds
    }

    pub fn replica_sets(&self) -> &Arc<Mirror<ReplicaSetRecord>> {
        &self.replica_sets
    }

    /// True once every mirror has applied its first full listing.
    pub fn synced(&self) -> bool {
        self.namespaces.has_synced() && self.builds.has_synced() && self.replica_sets.has_synced()
    }

    pub fn state(&self) -> MonitorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<MonitorState> {
        self.state_tx.subscribe()
    }

    /// Most recent completed capacity check, if any.
    pub fn last_report(&self) -> Option<Arc<CapacityReport>> {
        self.last_report.load_full()
    }

    /// Counter bumped after each completed capacity check.
    pub fn subscribe_reports(&self) -> watch::Receiver<u64> {
        self.report_tx.subscribe()
    }

    fn set_state(&self, state: MonitorState) {
        self.state_tx.send_replace(state);
        info!(parent: &self.span, ?state, "monitor state");
    }

    /// Last activity of a namespace known to the namespace mirror.
    pub fn get_last_activity(&self, namespace: &str) -> ArchivistResult<Option<DateTime<Utc>>> {
        if !self.namespaces.contains(namespace)? {
            return Err(ArchivistError::NotFound { namespace: namespace.to_string() });
        }
        if self.evaluator.policy().is_protected(namespace) {
            warn!(parent: &self.span, namespace, "called get_last_activity for protected namespace");
        }
        self.activity.last_activity(namespace)
    }

    /// Evaluate every mirrored namespace as of `check_time`.
    pub fn namespaces_to_archive(&self, check_time: DateTime<Utc>) -> ArchivistResult<CapacityReport> {
        let namespaces = self.namespaces.list_all()?;
        self.evaluator.evaluate(check_time, &namespaces, |ns| self.activity.last_activity(ns))
    }

    /// Run one capacity check now and publish its report.
    pub fn check_capacity(&self) -> ArchivistResult<CapacityReport> {
        let started = Instant::now();
        let res = self.namespaces_to_archive(Utc::now());
        metrics::histogram!("capacity_check_ms", started.elapsed().as_secs_f64() * 1000.0);
        let report = match res {
            Ok(r) => r,
            Err(e) => {
                metrics::counter!("capacity_checks_total", 1u64, "outcome" => "error");
                return Err(e);
            }
        };
        let outcome = if report.skipped.is_some() { "skipped" } else { "ok" };
        metrics::counter!("capacity_checks_total", 1u64, "outcome" => outcome);
        metrics::gauge!("capacity_candidates", report.candidates.len() as f64);
        self.last_report.store(Some(Arc::new(report.clone())));
        self.report_tx.send_modify(|n| *n += 1);
        Ok(report)
    }

    /// Spawn the three subscriptions; they run until `stop` is cancelled.
    pub fn start_subscriptions(&self, stop: &CancellationToken) -> Vec<JoinHandle<()>> {
        let cfg = SubscriptionConfig { relist_interval: self.cluster.relist_interval(), ..Default::default() };
        vec![
            tokio::spawn(
                Subscription::new(self.sources.namespaces.clone(), Arc::clone(&self.namespaces), cfg.clone())
                    .with_parent_span(&self.span)
                    .run(stop.clone()),
            ),
            tokio::spawn(
                Subscription::new(self.sources.builds.clone(), Arc::clone(&self.builds), cfg.clone())
                    .with_parent_span(&self.span)
                    .run(stop.clone()),
            ),
            tokio::spawn(
                Subscription::new(self.sources.replica_sets.clone(), Arc::clone(&self.replica_sets), cfg)
                    .with_parent_span(&self.span)
                    .run(stop.clone()),
            ),
        ]
    }

    /// Drive the monitor until `stop` is cancelled.
    ///
    /// Subscriptions start first; after the warm-up one check runs immediately, then
    /// one per check interval. A check in progress when `stop` fires runs to completion.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let claimed = self.state_tx.send_if_modified(|s| {
            if *s != MonitorState::Stopped {
                return false;
            }
            *s = MonitorState::Starting;
            true
        });
        if !claimed {
            warn!(parent: &self.span, state = ?self.state(), "monitor already running");
            return;
        }
        info!(parent: &self.span, state = ?MonitorState::Starting, "monitor state");
        let tasks = self.start_subscriptions(&stop);

        let warmed = tokio::select! {
            _ = stop.cancelled() => false,
            _ = tokio::time::sleep(self.cluster.warmup()) => true,
        };
        if warmed {
            if !self.synced() {
                warn!(parent: &self.span, "mirrors not fully synced after warm-up; checking anyway");
            }
            self.set_state(MonitorState::Running);
            info!(parent: &self.span, interval_secs = self.cluster.check_interval_secs, "cluster monitor is running");
            self.cycle().await;

            let period = self.cluster.check_interval().max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => self.cycle().await,
                }
            }
        }

        self.set_state(MonitorState::Stopping);
        for t in tasks {
            if let Err(e) = t.await {
                error!(parent: &self.span, error = %e, "subscription task failed");
            }
        }
        self.set_state(MonitorState::Stopped);
    }

    async fn cycle(&self) {
        match self.check_capacity() {
            Ok(report) => self.dispatch(&report).await,
            Err(e) => error!(parent: &self.span, error = %e, "capacity check failed"),
        }
    }

    async fn dispatch(&self, report: &CapacityReport) {
        let requester = self.cluster.archive_requester.as_str();
        for c in &report.candidates {
            let (outcome, res) = match self.export(&c.namespace, requester).await {
                Ok(objects) => {
                    info!(parent: &self.span, namespace = %c.namespace, objects = objects.len(), "archive requested");
                    ("ok", Ok(()))
                }
                Err(ArchivistError::NotFound { namespace }) => {
                    warn!(parent: &self.span, namespace = %namespace, "namespace gone before archival");
                    ("not_found", Ok(()))
                }
                Err(e) => ("error", Err(e)),
            };
            metrics::counter!("archive_requests_total", 1u64, "outcome" => outcome);
            if let Err(e) = res {
                error!(parent: &self.span, namespace = %c.namespace, error = %e, "archive request failed");
            }
        }
    }

    /// One archiver call, bounded by the configured timeout.
    async fn export(&self, namespace: &str, requester: &str) -> ArchivistResult<Vec<serde_json::Value>> {
        let limit = self.cluster.archive_timeout();
        match tokio::time::timeout(limit, self.archiver.export(namespace, requester)).await {
            Ok(res) => res,
            Err(_) => Err(ArchivistError::Archive(format!(
                "export of {} timed out after {}s",
                namespace,
                limit.as_secs()
            ))),
        }
    }
}
