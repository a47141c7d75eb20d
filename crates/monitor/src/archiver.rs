//! Hand-off point for namespaces selected for archival.

use archivist_core::ArchivistResult;
use tracing::info;

/// Exports a namespace's contents on behalf of `requester`.
///
/// Implementations return `ArchivistError::NotFound` when the namespace no longer exists.
#[async_trait::async_trait]
pub trait Archiver: Send + Sync {
    async fn export(&self, namespace: &str, requester: &str) -> ArchivistResult<Vec<serde_json::Value>>;
}

/// Logs what would be archived and exports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunArchiver;

#[async_trait::async_trait]
impl Archiver for DryRunArchiver {
    async fn export(&self, namespace: &str, requester: &str) -> ArchivistResult<Vec<serde_json::Value>> {
        info!(namespace, requester, "dry run: namespace would be archived");
        Ok(Vec::new())
    }
}
