//! Content collaborator: loads the objects a work item refers to and stores
//! generated content.
//!
//! Items carry their references in an `objects` field, a list of
//! `{"bucket": .., "key": ..}` entries. Loading attaches the decoded texts
//! as `contents`, in reference order. Retries happen here; callers only see
//! a terminal status on each item.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flowpool_core::config::ContentConfig;
use flowpool_core::{Status, StatusCode, WorkItem};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::BoxFuture;
use crate::pipeline::ItemStream;

/// Field holding an item's object references.
pub const OBJECTS_FIELD: &str = "objects";
/// Field the loaded texts are written to.
pub const CONTENTS_FIELD: &str = "contents";

/// Location of one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentRef {
    pub bucket: String,
    pub key: String,
}

impl std::fmt::Display for ContentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.bucket, self.key)
    }
}

/// Errors from content storage.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("Content not found: {0}")]
    NotFound(ContentRef),

    #[error("Invalid content reference: {reason}")]
    InvalidRef { reason: String },

    #[error("Storage unavailable: {0}")]
    Connection(String),
}

impl ContentError {
    /// Whether another attempt could succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Object storage backend.
pub trait ContentStore: Send + Sync + 'static {
    fn fetch<'a>(&'a self, object: &'a ContentRef) -> BoxFuture<'a, Result<Vec<u8>, ContentError>>;

    /// Store `data` under `bucket`/`id` and return the object key.
    fn store<'a>(
        &'a self,
        bucket: &'a str,
        id: &'a str,
        data: Vec<u8>,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<String, ContentError>>;
}

/// Filesystem-backed store: each bucket is a sub-directory of `root`.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ContentError> {
        for part in [bucket, key] {
            let plain = !part.is_empty()
                && Path::new(part)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !plain {
                return Err(ContentError::InvalidRef {
                    reason: format!("'{part}' is not a plain relative path"),
                });
            }
        }
        Ok(self.root.join(bucket).join(key))
    }
}

impl ContentStore for FsContentStore {
    fn fetch<'a>(&'a self, object: &'a ContentRef) -> BoxFuture<'a, Result<Vec<u8>, ContentError>> {
        Box::pin(async move {
            let path = self.object_path(&object.bucket, &object.key)?;
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(data),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    Err(ContentError::NotFound(object.clone()))
                }
                Err(e) => Err(ContentError::Connection(format!("{}: {e}", path.display()))),
            }
        })
    }

    fn store<'a>(
        &'a self,
        bucket: &'a str,
        id: &'a str,
        data: Vec<u8>,
        content_type: &'a str,
    ) -> BoxFuture<'a, Result<String, ContentError>> {
        Box::pin(async move {
            let path = self.object_path(bucket, id)?;
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ContentError::Connection(e.to_string()))?;
            }
            tokio::fs::write(&path, data)
                .await
                .map_err(|e| ContentError::Connection(e.to_string()))?;
            debug!(bucket, id, content_type, "Stored content");
            Ok(id.to_string())
        })
    }
}

/// Concurrent, retrying loader over a [`ContentStore`].
pub struct ContentLoader<S> {
    store: Arc<S>,
    permits: Arc<Semaphore>,
    batch_size: usize,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl<S> Clone for ContentLoader<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            permits: Arc::clone(&self.permits),
            batch_size: self.batch_size,
            retry_attempts: self.retry_attempts,
            retry_delay: self.retry_delay,
        }
    }
}

impl<S> std::fmt::Debug for ContentLoader<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentLoader")
            .field("available_permits", &self.permits.available_permits())
            .field("batch_size", &self.batch_size)
            .field("retry_attempts", &self.retry_attempts)
            .finish_non_exhaustive()
    }
}

impl<S: ContentStore> ContentLoader<S> {
    pub fn new(store: S, config: &ContentConfig) -> Self {
        Self {
            store: Arc::new(store),
            permits: Arc::new(Semaphore::new(config.fetch_concurrency.max(1))),
            batch_size: config.batch_size.max(1),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: config.retry_delay(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load every item's contents and return once all batches are done.
    pub async fn get_contents(&self, items: Vec<WorkItem>) -> Vec<WorkItem> {
        let mut tasks = self.spawn_batches(items);
        let mut loaded = Vec::new();
        while let Some(done) = tasks.join_next().await {
            match done {
                Ok(batch) => loaded.extend(batch),
                Err(e) => error!(error = %e, "Content batch task failed"),
            }
        }
        loaded
    }

    /// Load every item's contents, yielding each batch as it completes.
    pub fn get_contents_stream(&self, items: Vec<WorkItem>) -> ItemStream {
        let mut tasks = self.spawn_batches(items);
        Box::pin(async_stream::stream! {
            while let Some(done) = tasks.join_next().await {
                match done {
                    Ok(batch) => {
                        for item in batch {
                            yield Ok(item);
                        }
                    }
                    Err(e) => error!(error = %e, "Content batch task failed"),
                }
            }
        })
    }

    /// Store generated content and describe where it went. Failures come
    /// back as the descriptor's status.
    pub async fn put_content(
        &self,
        id: &str,
        data: Vec<u8>,
        bucket: &str,
        length: usize,
        content_type: &str,
    ) -> WorkItem {
        if data.len() != length {
            return WorkItem::new(id).with_status(Status::new(
                StatusCode::InvalidInput,
                format!("declared length {length} does not match {} bytes", data.len()),
            ));
        }

        let mut last_error = None;
        for attempt in 1..=self.retry_attempts {
            match self.store.store(bucket, id, data.clone(), content_type).await {
                Ok(object_key) => {
                    return WorkItem::new(id)
                        .with_field("bucket", bucket)
                        .with_field("object_key", object_key)
                        .with_field("length", length)
                        .with_field("content_type", content_type);
                }
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    warn!(id, bucket, attempt, error = %e, "Failed to store content, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => {
                    last_error = Some(e);
                    break;
                }
            }
        }

        let reason = last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string());
        error!(id, bucket, %reason, "Giving up on storing content");
        WorkItem::new(id).with_status(Status::new(
            StatusCode::ConnectionError,
            format!("Can't push content to storage: {reason}"),
        ))
    }

    fn spawn_batches(&self, items: Vec<WorkItem>) -> JoinSet<Vec<WorkItem>> {
        let mut tasks = JoinSet::new();
        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let batch: Vec<WorkItem> = items.by_ref().take(self.batch_size).collect();
            let loader = self.clone();
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = loader.permits.acquire().await.ok();
                loader.load_batch(batch).await
            });
        }
        tasks
    }

    async fn load_batch(&self, batch: Vec<WorkItem>) -> Vec<WorkItem> {
        let mut loaded = Vec::with_capacity(batch.len());
        for item in batch {
            loaded.push(self.load_item(item).await);
        }
        loaded
    }

    async fn load_item(&self, item: WorkItem) -> WorkItem {
        if !item.is_ok() {
            return item;
        }
        let refs: Vec<ContentRef> = match item
            .get(OBJECTS_FIELD)
            .cloned()
            .map(serde_json::from_value::<Vec<ContentRef>>)
        {
            Some(Ok(refs)) => refs,
            Some(Err(e)) => {
                return item.with_status(Status::new(
                    StatusCode::InvalidInput,
                    format!("malformed '{OBJECTS_FIELD}': {e}"),
                ));
            }
            None => {
                return item.with_status(Status::new(
                    StatusCode::InvalidInput,
                    format!("missing '{OBJECTS_FIELD}'"),
                ));
            }
        };

        let mut contents = Vec::with_capacity(refs.len());
        for object in &refs {
            match self.fetch_with_retry(object).await {
                Ok(data) => match String::from_utf8(data) {
                    Ok(text) => contents.push(text),
                    Err(_) => {
                        return item.with_status(Status::new(
                            StatusCode::InvalidInput,
                            format!("content of '{object}' is not valid UTF-8"),
                        ));
                    }
                },
                Err(e) => {
                    let code = match &e {
                        ContentError::NotFound(_) | ContentError::InvalidRef { .. } => {
                            StatusCode::ContentNotFound
                        }
                        ContentError::Connection(_) => StatusCode::ConnectionError,
                    };
                    debug!(key = %item.key(), object = %object, error = %e, "Content unavailable");
                    let message = format!("Contents for '{}' weren't found: {e}", item.key());
                    return item.with_status(Status::new(code, message));
                }
            }
        }
        item.with_field(CONTENTS_FIELD, contents)
    }

    async fn fetch_with_retry(&self, object: &ContentRef) -> Result<Vec<u8>, ContentError> {
        let mut attempt = 1;
        loop {
            match self.store.fetch(object).await {
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    warn!(object = %object, attempt, error = %e, "Failed to fetch content, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_stream::StreamExt;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config() -> ContentConfig {
        ContentConfig {
            fetch_concurrency: 2,
            batch_size: 2,
            retry_attempts: 3,
            retry_delay_ms: 1,
        }
    }

    fn container(key: &str, objects: &[(&str, &str)]) -> WorkItem {
        let refs: Vec<_> = objects
            .iter()
            .map(|(bucket, key)| json!({"bucket": bucket, "key": key}))
            .collect();
        WorkItem::new(key).with_field(OBJECTS_FIELD, refs)
    }

    fn fs_loader() -> (tempfile::TempDir, ContentLoader<FsContentStore>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), "Alpha text").unwrap();
        std::fs::write(dir.path().join("docs/b.txt"), "Beta text").unwrap();
        let loader = ContentLoader::new(FsContentStore::new(dir.path()), &config());
        (dir, loader)
    }

    /// Fails with a connection error a fixed number of times, then serves.
    struct FlakyStore {
        failures: u32,
        calls: AtomicU32,
    }

    impl ContentStore for FlakyStore {
        fn fetch<'a>(&'a self, object: &'a ContentRef) -> BoxFuture<'a, Result<Vec<u8>, ContentError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if object.key == "missing" {
                    return Err(ContentError::NotFound(object.clone()));
                }
                if call < self.failures {
                    return Err(ContentError::Connection("reset by peer".into()));
                }
                Ok(b"served".to_vec())
            })
        }

        fn store<'a>(
            &'a self,
            _bucket: &'a str,
            id: &'a str,
            _data: Vec<u8>,
            _content_type: &'a str,
        ) -> BoxFuture<'a, Result<String, ContentError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    return Err(ContentError::Connection("reset by peer".into()));
                }
                Ok(id.to_string())
            })
        }
    }

    fn flaky(failures: u32) -> ContentLoader<FlakyStore> {
        ContentLoader::new(
            FlakyStore {
                failures,
                calls: AtomicU32::new(0),
            },
            &config(),
        )
    }

    // ===== Loading =====

    #[tokio::test]
    async fn loads_contents_in_reference_order() {
        let (_dir, loader) = fs_loader();
        let items = vec![
            container("c1", &[("docs", "b.txt"), ("docs", "a.txt")]),
            container("c2", &[("docs", "a.txt")]),
            container("c3", &[("docs", "b.txt")]),
        ];
        let mut out = loader.get_contents(items).await;
        out.sort_by(|a, b| a.key().cmp(b.key()));

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].get(CONTENTS_FIELD), Some(&json!(["Beta text", "Alpha text"])));
        assert!(out[0].contains(OBJECTS_FIELD));
        assert_eq!(out[1].get(CONTENTS_FIELD), Some(&json!(["Alpha text"])));
    }

    #[tokio::test]
    async fn missing_object_is_content_not_found() {
        let (_dir, loader) = fs_loader();
        let out = loader
            .get_contents(vec![container("c1", &[("docs", "a.txt"), ("docs", "nope.txt")])])
            .await;
        assert_eq!(out[0].status().code, StatusCode::ContentNotFound);
        assert!(
            out[0]
                .status()
                .message
                .as_deref()
                .is_some_and(|message| message.contains("'c1'"))
        );
        assert!(out[0].get(CONTENTS_FIELD).is_none());
    }

    #[tokio::test]
    async fn malformed_references_are_invalid_input() {
        let (_dir, loader) = fs_loader();
        let out = loader
            .get_contents(vec![
                WorkItem::new("none"),
                WorkItem::new("bad").with_field(OBJECTS_FIELD, "docs/a.txt"),
            ])
            .await;
        assert!(out.iter().all(|i| i.status().code == StatusCode::InvalidInput));
    }

    #[tokio::test]
    async fn escaping_paths_are_rejected() {
        let (_dir, loader) = fs_loader();
        let out = loader
            .get_contents(vec![container("c", &[("docs", "../../etc/passwd")])])
            .await;
        assert_eq!(out[0].status().code, StatusCode::ContentNotFound);
    }

    #[tokio::test]
    async fn stream_yields_every_item() {
        let (_dir, loader) = fs_loader();
        let items: Vec<_> = (0..5)
            .map(|n| container(&format!("c{n}"), &[("docs", "a.txt")]))
            .collect();
        let out: Vec<_> = loader.get_contents_stream(items).collect().await;
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|r| r.as_ref().is_ok_and(WorkItem::is_ok)));
    }

    #[tokio::test]
    async fn broken_items_are_passed_through() {
        let (_dir, loader) = fs_loader();
        let broken = container("c", &[("docs", "a.txt")])
            .with_status(Status::internal_error("earlier"));
        let out = loader.get_contents(vec![broken.clone()]).await;
        assert_eq!(out, vec![broken]);
    }

    // ===== Retries =====

    #[tokio::test]
    async fn transient_fetch_errors_are_retried() {
        let loader = flaky(2);
        let out = loader.get_contents(vec![container("c", &[("b", "k")])]).await;
        assert!(out[0].is_ok());
        assert_eq!(out[0].get(CONTENTS_FIELD), Some(&json!(["served"])));
        assert_eq!(loader.store().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_are_connection_error() {
        let loader = flaky(10);
        let out = loader.get_contents(vec![container("c", &[("b", "k")])]).await;
        assert_eq!(out[0].status().code, StatusCode::ConnectionError);
        assert_eq!(loader.store().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let loader = flaky(0);
        let out = loader
            .get_contents(vec![container("c", &[("b", "missing")])])
            .await;
        assert_eq!(out[0].status().code, StatusCode::ContentNotFound);
        assert_eq!(loader.store().calls.load(Ordering::SeqCst), 1);
    }

    // ===== Storing =====

    #[tokio::test]
    async fn put_content_writes_file_and_describes_it() {
        let (dir, loader) = fs_loader();
        let data = b"{\"abbr\":[]}".to_vec();
        let len = data.len();
        let descriptor = loader
            .put_content("reply-1", data, "replies", len, "application/json")
            .await;

        assert!(descriptor.is_ok());
        assert_eq!(descriptor.key(), "reply-1");
        assert_eq!(descriptor.get("bucket"), Some(&json!("replies")));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("replies/reply-1")).unwrap(),
            "{\"abbr\":[]}"
        );
    }

    #[tokio::test]
    async fn put_content_gives_up_with_connection_error() {
        let loader = flaky(10);
        let descriptor = loader
            .put_content("r", b"x".to_vec(), "replies", 1, "text/plain")
            .await;
        assert_eq!(descriptor.status().code, StatusCode::ConnectionError);
        assert_eq!(loader.store().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn put_content_checks_declared_length() {
        let loader = flaky(0);
        let descriptor = loader
            .put_content("r", b"abc".to_vec(), "replies", 7, "text/plain")
            .await;
        assert_eq!(descriptor.status().code, StatusCode::InvalidInput);
        assert_eq!(loader.store().calls.load(Ordering::SeqCst), 0);
    }
}
