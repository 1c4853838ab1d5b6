use std::path::Path;

use async_trait::async_trait;
use boxsync_core::{ListPage, RemoteClient, RemoteEntry, RemoteError, SpaceUsage};

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::metadata::{Entry, EntryKind};

/// Seam between the sync machinery and the HTTP client, so the workers and
/// the dispatcher can be driven by an in-memory fake in tests.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListPage, RemoteError>;
    async fn get_changes(&self, cursor: &str) -> Result<ListPage, RemoteError>;
    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError>;
    async fn download(&self, remote_path: &str, target: &Path) -> Result<(), RemoteError>;
    async fn upload(
        &self,
        source: &Path,
        remote_path: &str,
        overwrite: bool,
    ) -> Result<RemoteEntry, RemoteError>;
    async fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError>;
    async fn delete(&self, path: &str) -> Result<(), RemoteError>;
    async fn move_entry(&self, from: &str, to: &str) -> Result<RemoteEntry, RemoteError>;
    async fn space_usage(&self) -> Result<SpaceUsage, RemoteError>;
}

#[async_trait]
impl RemoteStore for RemoteClient {
    async fn list_folder(&self, path: &str, recursive: bool) -> Result<ListPage, RemoteError> {
        RemoteClient::list_folder(self, path, recursive).await
    }

    async fn get_changes(&self, cursor: &str) -> Result<ListPage, RemoteError> {
        RemoteClient::get_changes(self, cursor).await
    }

    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        RemoteClient::get_metadata(self, path).await
    }

    async fn download(&self, remote_path: &str, target: &Path) -> Result<(), RemoteError> {
        RemoteClient::download(self, remote_path, target).await
    }

    async fn upload(
        &self,
        source: &Path,
        remote_path: &str,
        overwrite: bool,
    ) -> Result<RemoteEntry, RemoteError> {
        RemoteClient::upload(self, source, remote_path, overwrite).await
    }

    async fn create_folder(&self, path: &str) -> Result<RemoteEntry, RemoteError> {
        RemoteClient::create_folder(self, path).await
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        RemoteClient::delete(self, path).await
    }

    async fn move_entry(&self, from: &str, to: &str) -> Result<RemoteEntry, RemoteError> {
        RemoteClient::move_entry(self, from, to).await
    }

    async fn space_usage(&self) -> Result<SpaceUsage, RemoteError> {
        RemoteClient::space_usage(self).await
    }
}

/// RFC3339 timestamp to unix seconds; a malformed stamp decays to 0 rather
/// than failing the whole reconcile pass.
pub fn parse_modified(raw: &str) -> i64 {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map(|dt| dt.unix_timestamp())
        .unwrap_or(0)
}

/// Wire entry to store entry. Deleted markers carry no metadata and map to
/// `None`; they are handled as removals by the caller.
pub fn entry_from_remote(remote: &RemoteEntry, uploaded: bool) -> Option<Entry> {
    match remote {
        RemoteEntry::File {
            id,
            path,
            name,
            size,
            modified,
        } => Some(Entry {
            path: path.clone(),
            id: id.clone(),
            name: name.clone(),
            kind: EntryKind::File,
            size: *size,
            modified: parse_modified(modified),
            uploaded,
        }),
        RemoteEntry::Folder { id, path, name } => Some(Entry {
            path: path.clone(),
            id: id.clone(),
            name: name.clone(),
            kind: EntryKind::Folder,
            size: 0,
            modified: 0,
            uploaded,
        }),
        RemoteEntry::Deleted { .. } => None,
    }
}
