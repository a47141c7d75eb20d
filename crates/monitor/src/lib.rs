//! Archivist monitor: decides which dormant namespaces to archive.
//!
//! Three mirrors (namespaces, builds, replication controllers) are kept current by
//! watch subscriptions. On a fixed schedule the [`ClusterMonitor`] derives each
//! namespace's last activity from the mirrors and hands the result to the
//! [`CapacityEvaluator`], whose candidates go to an [`Archiver`].

#![forbid(unsafe_code)]

pub mod activity;
pub mod archiver;
pub mod capacity;
pub mod monitor;

pub use activity::{ActivityCalculator, ActivitySource};
pub use archiver::{Archiver, DryRunArchiver};
pub use capacity::{CapacityEvaluator, CapacityReport, SkipReason};
pub use monitor::{ClusterMonitor, MonitorSources, MonitorState};
