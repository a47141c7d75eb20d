//! Last-activity calculation from mirrored builds and replication controllers.

use std::sync::Arc;

use archivist_core::{ArchivistResult, BuildRecord, ReplicaSetRecord};
use archivist_store::Mirror;
use chrono::{DateTime, Utc};
use tracing::{debug, info_span, Span};

/// Answers when a namespace was last active. `None` means no activity is known.
pub trait ActivitySource: Send + Sync {
    fn last_activity(&self, namespace: &str) -> ArchivistResult<Option<DateTime<Utc>>>;
}

pub struct ActivityCalculator {
    builds: Arc<Mirror<BuildRecord>>,
    replica_sets: Arc<Mirror<ReplicaSetRecord>>,
    span: Span,
}

impl ActivityCalculator {
    pub fn new(builds: Arc<Mirror<BuildRecord>>, replica_sets: Arc<Mirror<ReplicaSetRecord>>) -> Self {
        Self { builds, replica_sets, span: info_span!("activity") }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Most recent build start or replication controller creation in `namespace`.
    ///
    /// Builds that have not started and controllers without a creation time are ignored.
    /// `None` means nothing qualified; it is not an error. The namespace itself is not
    /// looked up, so this also answers for namespaces the mirror has never seen.
    pub fn last_activity(&self, namespace: &str) -> ArchivistResult<Option<DateTime<Utc>>> {
        let _enter = self.span.enter();
        let builds = self.builds.list_by_namespace(namespace)?;
        let rcs = self.replica_sets.list_by_namespace(namespace)?;
        debug!(namespace, builds = builds.len(), rcs = rcs.len(), "calculating last activity time");

        let build_times = builds.iter().filter_map(|b| {
            if b.started.is_none() {
                debug!(namespace, name = %b.name, kind = "Build", "skipping build with no start time");
            }
            b.started
        });
        let rc_times = rcs.iter().filter_map(|rc| {
            if rc.created.is_none() {
                debug!(namespace, name = %rc.name, kind = "ReplicationController", "skipping RC with no creation time");
            }
            rc.created
        });
        let last = build_times.chain(rc_times).max();

        debug!(namespace, last_activity = ?last, "calculated last activity");
        Ok(last)
    }
}

impl ActivitySource for ActivityCalculator {
    fn last_activity(&self, namespace: &str) -> ArchivistResult<Option<DateTime<Utc>>> {
        ActivityCalculator::last_activity(self, namespace)
    }
}
