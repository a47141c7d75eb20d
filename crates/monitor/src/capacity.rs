//! Capacity evaluation: turns last-activity times and watermarks into archival candidates.

use std::sync::Arc;

use archivist_core::{ArchivistResult, CapacityPolicy, LastActivity, NamespaceRecord};
use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Span};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SkipReason {
    NoHighWatermark,
    NoLowWatermark,
}

/// Outcome of one capacity check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityReport {
    pub check_time: DateTime<Utc>,
    pub total_namespaces: usize,
    pub protected: usize,
    pub no_activity: usize,
    pub very_inactive: usize,
    pub somewhat_inactive: usize,
    /// Namespaces to archive. Unordered.
    pub candidates: Vec<LastActivity>,
    /// Namespace count once every candidate is archived.
    pub remaining: usize,
    pub low_watermark_reached: bool,
    pub skipped: Option<SkipReason>,
}

impl CapacityReport {
    fn skipped(check_time: DateTime<Utc>, total: usize, reason: SkipReason) -> Self {
        Self {
            check_time,
            total_namespaces: total,
            protected: 0,
            no_activity: 0,
            very_inactive: 0,
            somewhat_inactive: 0,
            candidates: Vec::new(),
            remaining: total,
            low_watermark_reached: false,
            skipped: Some(reason),
        }
    }

    pub fn candidate_names(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.namespace.as_str()).collect()
    }
}

/// Applies a [`CapacityPolicy`] to a set of namespaces.
///
/// Namespaces inactive for longer than `max_inactive_days` are always candidates.
/// Those between the two cutoffs are taken only when the namespace count is at or
/// above the high watermark, oldest first, until the low watermark would be reached.
/// Protected namespaces and namespaces without any computable activity are never
/// candidates.
pub struct CapacityEvaluator {
    policy: CapacityPolicy,
    span: Span,
}

impl CapacityEvaluator {
    pub fn new(policy: CapacityPolicy) -> Self {
        Self { policy, span: info_span!("capacitycheck") }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn policy(&self) -> &CapacityPolicy {
        &self.policy
    }

    /// `(min_inactive_cutoff, max_inactive_cutoff)`; the second is the older one.
    pub fn cutoffs(&self, check_time: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let back = |days: u32| check_time.checked_sub_days(Days::new(days.into())).unwrap_or(DateTime::<Utc>::MIN_UTC);
        (back(self.policy.min_inactive_days), back(self.policy.max_inactive_days))
    }

    /// Select archival candidates among `namespaces`.
    ///
    /// `last_activity` is asked once per unprotected namespace; its first error aborts
    /// the evaluation.
    pub fn evaluate<F>(
        &self,
        check_time: DateTime<Utc>,
        namespaces: &[Arc<NamespaceRecord>],
        mut last_activity: F,
    ) -> ArchivistResult<CapacityReport>
    where
        F: FnMut(&str) -> ArchivistResult<Option<DateTime<Utc>>>,
    {
        let _enter = self.span.enter();
        let policy = &self.policy;
        let total = namespaces.len();
        if policy.high_watermark == 0 {
            warn!("no namespace capacity high watermark defined, skipping");
            return Ok(CapacityReport::skipped(check_time, total, SkipReason::NoHighWatermark));
        }
        if policy.low_watermark == 0 {
            warn!("no namespace capacity low watermark defined, skipping");
            return Ok(CapacityReport::skipped(check_time, total, SkipReason::NoLowWatermark));
        }

        let (min_cutoff, max_cutoff) = self.cutoffs(check_time);
        info!(
            %check_time,
            min_inactive = %min_cutoff,
            max_inactive = %max_cutoff,
            high_watermark = policy.high_watermark,
            low_watermark = policy.low_watermark,
            "calculating namespaces to be archived"
        );

        let mut very_inactive = Vec::new();
        let mut somewhat_inactive = Vec::new();
        let (mut protected, mut no_activity) = (0usize, 0usize);
        for ns in namespaces {
            let name = ns.name.as_str();
            if policy.is_protected(name) {
                debug!(namespace = name, "skipping protected namespace");
                protected += 1;
                continue;
            }
            let Some(last) = last_activity(name)? else {
                warn!(namespace = name, "no last activity time calculated for namespace");
                no_activity += 1;
                continue;
            };
            if last < max_cutoff {
                info!(namespace = name, last_activity = %last, "found namespace over max inactive time");
                very_inactive.push(LastActivity { namespace: name.to_string(), time: last });
            } else if last < min_cutoff {
                info!(namespace = name, last_activity = %last, "found namespace between max/min inactive times");
                somewhat_inactive.push(LastActivity { namespace: name.to_string(), time: last });
            }
        }
        let (very_count, somewhat_count) = (very_inactive.len(), somewhat_inactive.len());
        info!(
            total_namespaces = total,
            very_inactive = very_count,
            somewhat_inactive = somewhat_count,
            "last activity totals"
        );

        let mut candidates = very_inactive;
        let new_count = total - candidates.len();
        if total >= policy.high_watermark && new_count >= policy.low_watermark {
            let target = new_count - policy.low_watermark;
            debug!(target, "looking for semi-inactive namespaces to archive");
            if target >= somewhat_inactive.len() {
                candidates.append(&mut somewhat_inactive);
            } else {
                // Only a subset goes, so only now is the pool sorted: oldest activity
                // first, the most recently active stay.
                somewhat_inactive.sort_by_key(|la| la.time);
                candidates.extend(somewhat_inactive.into_iter().take(target));
            }
        }

        let remaining = total - candidates.len();
        let low_watermark_reached = remaining <= policy.low_watermark;
        info!(count = candidates.len(), "found namespaces to archive");
        for c in &candidates {
            info!(namespace = %c.namespace, last_activity = %c.time, "archiving");
        }
        if !low_watermark_reached {
            warn!(
                low_watermark = policy.low_watermark,
                new_ns_count = remaining,
                "unable to reach namespace capacity low watermark"
            );
        }

        Ok(CapacityReport {
            check_time,
            total_namespaces: total,
            protected,
            no_activity,
            very_inactive: very_count,
            somewhat_inactive: somewhat_count,
            candidates,
            remaining,
            low_watermark_reached,
            skipped: None,
        })
    }
}
