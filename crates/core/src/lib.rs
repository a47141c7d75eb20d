//! Archivist core types: mirrored records, watch events, capacity policy and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;

pub use config::{ArchivistConfig, ClusterConfig, NamespaceCapacity};

pub mod prelude {
    pub use super::{
        ArchivistError, ArchivistResult, BuildRecord, CapacityPolicy, LastActivity, NamespaceRecord,
        ReplicaSetRecord, WatchAction, WatchEvent,
    };
}

/// Errors surfaced by the archivist library crates.
#[derive(Debug, thiserror::Error)]
pub enum ArchivistError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("namespace does not exist in cache: {namespace}")]
    NotFound { namespace: String },
    #[error("lookup failed: {0}")]
    Lookup(String),
    #[error("archive request failed: {0}")]
    Archive(String),
}

pub type ArchivistResult<T> = Result<T, ArchivistError>;

/// Mirrored tenant namespace (cluster scoped).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

impl NamespaceRecord {
    pub fn key(&self) -> String {
        self.name.clone()
    }
}

/// Mirrored build. `started` stays `None` until the build has actually started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildRecord {
    pub namespace: String,
    pub name: String,
    pub started: Option<DateTime<Utc>>,
}

impl BuildRecord {
    pub fn key(&self) -> String {
        namespaced_key(&self.namespace, &self.name)
    }

    pub fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }
}

/// Mirrored replication controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplicaSetRecord {
    pub namespace: String,
    pub name: String,
    pub created: Option<DateTime<Utc>>,
}

impl ReplicaSetRecord {
    pub fn key(&self) -> String {
        namespaced_key(&self.namespace, &self.name)
    }

    pub fn namespace(&self) -> Option<&str> {
        Some(&self.namespace)
    }
}

/// `namespace/name`, the key used for namespaced objects in a mirror.
pub fn namespaced_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
}

impl WatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchAction::Added => "added",
            WatchAction::Modified => "modified",
            WatchAction::Deleted => "deleted",
        }
    }
}

/// One incremental change from a remote watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent<K> {
    pub action: WatchAction,
    pub object: K,
    /// Resource version of the object after the change, when the remote side reports one.
    pub resource_version: Option<String>,
}

impl<K> WatchEvent<K> {
    pub fn added(object: K) -> Self {
        Self { action: WatchAction::Added, object, resource_version: None }
    }

    pub fn modified(object: K) -> Self {
        Self { action: WatchAction::Modified, object, resource_version: None }
    }

    pub fn deleted(object: K) -> Self {
        Self { action: WatchAction::Deleted, object, resource_version: None }
    }

    pub fn with_version(mut self, rv: impl Into<String>) -> Self {
        self.resource_version = Some(rv.into());
        self
    }
}

/// Namespace paired with its computed last activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastActivity {
    pub namespace: String,
    pub time: DateTime<Utc>,
}

/// Watermarks and inactivity windows that drive archival.
///
/// `max_inactive_days` is the older cutoff and must not be below `min_inactive_days`.
/// A zero watermark means "unset" and disables evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CapacityPolicy {
    pub high_watermark: usize,
    pub low_watermark: usize,
    pub min_inactive_days: u32,
    pub max_inactive_days: u32,
    pub protected_namespaces: BTreeSet<String>,
}

impl CapacityPolicy {
    pub fn is_protected(&self, namespace: &str) -> bool {
        self.protected_namespaces.contains(namespace)
    }
}
