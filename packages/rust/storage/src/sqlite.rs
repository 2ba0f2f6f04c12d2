//! [`ContentStore`] backed by a lazily-opened libSQL [`Storage`].

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use newsloom_shared::{ContentItem, ContentStore, NewsloomError, Result, SummaryItem};
use tokio::sync::RwLock;

use crate::Storage;

/// Content store plugin over a libSQL file.
///
/// The database is opened by [`ContentStore::init`] and dropped by
/// [`ContentStore::close`]; every other call fails until `init` has run.
pub struct SqliteStore {
    path: PathBuf,
    inner: RwLock<Option<Arc<Storage>>>,
}

impl SqliteStore {
    /// A store that opens `path` on `init`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(None),
        }
    }

    /// A store sharing an already-open database. `init` is a no-op.
    pub fn with_storage(path: impl Into<PathBuf>, storage: Arc<Storage>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(Some(storage)),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn storage(&self) -> Result<Arc<Storage>> {
        self.inner.read().await.clone().ok_or_else(|| {
            NewsloomError::Storage(format!(
                "sqlite store at {} is not initialized",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.is_none() {
            tracing::debug!(path = %self.path.display(), "opening sqlite content store");
            *inner = Some(Arc::new(Storage::open(&self.path).await?));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.write().await.take();
        Ok(())
    }

    async fn get_content_item(&self, content_id: &str) -> Result<Option<ContentItem>> {
        self.storage().await?.get_content_item(content_id).await
    }

    async fn save_content_items(&self, items: &[ContentItem]) -> Result<usize> {
        self.storage().await?.save_content_items(items).await
    }

    async fn save_summary_item(&self, item: &SummaryItem) -> Result<()> {
        self.storage().await?.save_summary_item(item).await
    }
}
