//! Contracts for the backing store plus the adapters that implement them.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use copycat_core::{FileEntry, MessageRow};

use crate::error::ClientError;

mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub loaded: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            return 100;
        }
        let ratio = self.loaded.min(self.total) as f64 / self.total as f64;
        (ratio * 100.0).round() as u64
    }
}

pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub payload: Bytes,
    pub content_type: Option<String>,
    /// Replace an existing object with the same name instead of failing.
    pub upsert: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Objects ordered newest first.
    async fn list(&self) -> Result<Vec<FileEntry>, ClientError>;

    async fn upload(&self, request: UploadRequest, progress: ProgressFn)
    -> Result<(), ClientError>;

    async fn remove(&self, names: &[String]) -> Result<(), ClientError>;

    fn public_url(&self, name: &str) -> String;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Newest first, at most `limit` rows.
    async fn recent_messages(&self, limit: usize) -> Result<Vec<MessageRow>, ClientError>;

    async fn insert_message(&self, content: &str, title: Option<&str>) -> Result<(), ClientError>;

    async fn delete_message(&self, id: i64) -> Result<(), ClientError>;

    async fn clear_messages(&self) -> Result<(), ClientError>;
}

/// Shares a snippet; blank content is ignored and an empty title is dropped.
pub async fn share_message<M: MessageStore + ?Sized>(
    store: &M,
    content: &str,
    title: &str,
) -> Result<bool, ClientError> {
    if content.is_empty() {
        return Ok(false);
    }
    let title = title.trim();
    store
        .insert_message(content, (!title.is_empty()).then_some(title))
        .await?;
    Ok(true)
}

/// Removes every object in the store, returning how many were deleted.
pub async fn remove_all_files<O: ObjectStore + ?Sized>(store: &O) -> Result<usize, ClientError> {
    let names: Vec<String> = store.list().await?.into_iter().map(|f| f.name).collect();
    if names.is_empty() {
        return Ok(0);
    }
    store.remove(&names).await?;
    Ok(names.len())
}
