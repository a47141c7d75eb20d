//! Archivist configuration: one capacity policy per monitored cluster.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{ArchivistError, ArchivistResult, CapacityPolicy};

const DEFAULT_PROTECTED: &[&str] = &[
    "default",
    "kube-system",
    "logging",
    "management-infra",
    "openshift",
    "openshift-infra",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ArchivistConfig {
    pub log_level: String,
    pub clusters: Vec<ClusterConfig>,
}

impl Default for ArchivistConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), clusters: vec![ClusterConfig::default()] }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct NamespaceCapacity {
    /// Namespace count at which eviction of somewhat inactive namespaces kicks in.
    pub high_watermark: usize,
    /// Namespace count eviction tries to get down to.
    pub low_watermark: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    pub namespace_capacity: NamespaceCapacity,
    pub min_inactive_days: u32,
    pub max_inactive_days: u32,
    pub protected_namespaces: Vec<String>,
    pub check_interval_secs: u64,
    pub warmup_millis: u64,
    /// Periodic full relist of every mirror; 0 disables it.
    pub relist_secs: u64,
    pub archive_requester: String,
    /// Upper bound on one archiver call; a slower export counts as failed.
    pub archive_timeout_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "local".to_string(),
            namespace_capacity: NamespaceCapacity::default(),
            min_inactive_days: 30,
            max_inactive_days: 60,
            protected_namespaces: DEFAULT_PROTECTED.iter().map(|s| s.to_string()).collect(),
            check_interval_secs: 300,
            warmup_millis: 500,
            relist_secs: 0,
            archive_requester: "system:archivist".to_string(),
            archive_timeout_secs: 60,
        }
    }
}

impl ClusterConfig {
    pub fn policy(&self) -> CapacityPolicy {
        CapacityPolicy {
            high_watermark: self.namespace_capacity.high_watermark,
            low_watermark: self.namespace_capacity.low_watermark,
            min_inactive_days: self.min_inactive_days,
            max_inactive_days: self.max_inactive_days,
            protected_namespaces: self.protected_namespaces.iter().cloned().collect(),
        }
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_millis)
    }

    pub fn archive_timeout(&self) -> Duration {
        Duration::from_secs(self.archive_timeout_secs)
    }

    pub fn relist_interval(&self) -> Option<Duration> {
        (self.relist_secs > 0).then(|| Duration::from_secs(self.relist_secs))
    }

    pub fn validate(&self) -> ArchivistResult<()> {
        if self.max_inactive_days < self.min_inactive_days {
            return Err(ArchivistError::InvalidConfig(format!(
                "cluster {}: maxInactiveDays ({}) must be >= minInactiveDays ({})",
                self.name, self.max_inactive_days, self.min_inactive_days
            )));
        }
        if self.check_interval_secs == 0 {
            return Err(ArchivistError::InvalidConfig(format!(
                "cluster {}: checkIntervalSecs must be > 0",
                self.name
            )));
        }
        if self.archive_timeout_secs == 0 {
            return Err(ArchivistError::InvalidConfig(format!(
                "cluster {}: archiveTimeoutSecs must be > 0",
                self.name
            )));
        }
        let cap = self.namespace_capacity;
        // Accepted as-is: eviction then simply never finds room below the low mark.
        if cap.high_watermark != 0 && cap.high_watermark < cap.low_watermark {
            warn!(
                cluster = %self.name,
                high_watermark = cap.high_watermark,
                low_watermark = cap.low_watermark,
                "high watermark is below low watermark"
            );
        }
        Ok(())
    }
}

impl ArchivistConfig {
    /// Parse without validating. Callers that log validation warnings parse first,
    /// install their subscriber, then call [`ArchivistConfig::validate`].
    pub fn parse_yaml(s: &str) -> ArchivistResult<Self> {
        serde_yaml::from_str(s).map_err(|e| ArchivistError::InvalidConfig(format!("parsing yaml: {}", e)))
    }

    pub fn from_yaml(s: &str) -> ArchivistResult<Self> {
        let cfg = Self::parse_yaml(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse `path` without validating.
    pub fn read_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {}", path.display(), e))?;
        Ok(Self::parse_yaml(&raw)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let cfg = Self::read_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> ArchivistResult<()> {
        if self.clusters.is_empty() {
            return Err(ArchivistError::InvalidConfig("no clusters configured".to_string()));
        }
        for c in &self.clusters {
            c.validate()?;
        }
        Ok(())
    }

    /// Pick the cluster to monitor: by name if given, otherwise the first one.
    pub fn cluster(&self, name: Option<&str>) -> ArchivistResult<&ClusterConfig> {
        match name {
            Some(n) => self
                .clusters
                .iter()
                .find(|c| c.name == n)
                .ok_or_else(|| ArchivistError::InvalidConfig(format!("cluster not configured: {}", n))),
            None => {
                if self.clusters.len() > 1 {
                    warn!(
                        clusters = self.clusters.len(),
                        "multiple clusters configured; only the first is monitored"
                    );
                }
                self.clusters
                    .first()
                    .ok_or_else(|| ArchivistError::InvalidConfig("no clusters configured".to_string()))
            }
        }
    }
}
