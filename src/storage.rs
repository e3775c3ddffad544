//! Content-addressed blob storage.
//!
//! The sync engine talks to storage through the [`BlobStore`] trait. Blobs
//! are reference counted by the shares that point at them: replaying a log
//! acquires every content id a file currently holds and releases the ones
//! it no longer holds. [`DiskBlobStore`] keeps blobs as `<checksum>.blob`
//! files plus a `trackers.json` table and evicts least recently accessed
//! blobs when the configured quota is exceeded.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ids::ContentId;

/// Reader over a byte range of a blob.
pub type BlobStream = Pin<Box<dyn AsyncRead + Send>>;

const TRACKERS_FILE: &str = "trackers.json";
const COPY_BUFFER: usize = 64 * 1024;

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn has_data(&self, content: &ContentId) -> bool;

    /// Register one more reference to `content`.
    fn acquire(&self, content: &ContentId);

    fn release(&self, content: &ContentId);

    /// Start a replay: reference counts are reset and quota checks are
    /// suspended until [`batch_update_complete`](Self::batch_update_complete).
    fn init_batch_update(&self);

    fn batch_update_complete(&self);

    /// Directory for partially received blobs.
    fn scratch_dir(&self) -> PathBuf;

    async fn store(&self, data: &[u8]) -> Result<ContentId>;

    /// Hash and store a local file.
    async fn store_file(&self, path: &Path) -> Result<ContentId>;

    /// Move a fully downloaded file into the store. The file must hash to
    /// `content`.
    async fn import_file(&self, path: &Path, content: &ContentId) -> Result<()>;

    async fn get_stream(&self, content: &ContentId, start: u64, finish: u64) -> Result<BlobStream>;

    async fn read_range(&self, content: &ContentId, start: u64, finish: u64) -> Result<Bytes> {
        let mut stream = self.get_stream(content, start, finish).await?;
        let mut buf = Vec::with_capacity(finish.saturating_sub(start) as usize);
        stream.read_to_end(&mut buf).await?;
        if buf.len() as u64 != finish.saturating_sub(start) {
            return Err(Error::storage(format!(
                "short read of {}: {} bytes for {}..{}",
                content,
                buf.len(),
                start,
                finish
            )));
        }
        Ok(Bytes::from(buf))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracker {
    pub content: ContentId,
    pub accessed: DateTime<Utc>,
    pub added: DateTime<Utc>,
    pub acquired: Option<DateTime<Utc>>,
    pub stored: bool,
    pub use_count: u32,
}

impl Tracker {
    fn new(content: ContentId) -> Self {
        let now = Utc::now();
        Self {
            content,
            accessed: now,
            added: now,
            acquired: None,
            stored: false,
            use_count: 0,
        }
    }
}

/// Byte limits for the blob directory. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    /// Unused blobs are evicted above this size
    pub optimal: Option<u64>,
    /// Used blobs are evicted above this size
    pub max: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StorageStats {
    pub blobs: usize,
    pub total_size: u64,
    pub used: usize,
}

struct StoreState {
    trackers: BTreeMap<String, Tracker>,
    batch: bool,
}

pub struct DiskBlobStore {
    dir: PathBuf,
    quota: Quota,
    state: Mutex<StoreState>,
}

impl DiskBlobStore {
    pub async fn open(dir: PathBuf, quota: Quota) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        fs::create_dir_all(dir.join("scratch")).await?;

        let trackers_path = dir.join(TRACKERS_FILE);
        let trackers: BTreeMap<String, Tracker> = if trackers_path.exists() {
            let data = fs::read_to_string(&trackers_path).await?;
            serde_json::from_str(&data).unwrap_or_else(|e| {
                warn!("Ignoring unreadable {}: {}", TRACKERS_FILE, e);
                BTreeMap::new()
            })
        } else {
            BTreeMap::new()
        };

        let store = Self {
            dir,
            quota,
            state: Mutex::new(StoreState { trackers, batch: false }),
        };
        store.verify_stored_blobs();
        Ok(store)
    }

    fn blob_path(&self, content: &ContentId) -> PathBuf {
        self.dir.join(content.file_name())
    }

    pub fn tracker(&self, content: &ContentId) -> Option<Tracker> {
        self.state.lock().trackers.get(&content.to_string()).cloned()
    }

    pub fn stats(&self) -> StorageStats {
        let state = self.state.lock();
        let stored = state.trackers.values().filter(|t| t.stored);
        let (blobs, total_size, used) = stored.fold((0, 0, 0), |(n, size, used), t| {
            (n + 1, size + t.content.length(), used + usize::from(t.use_count > 0))
        });
        StorageStats { blobs, total_size, used }
    }

    /// Drop trackers whose blob file disappeared.
    fn verify_stored_blobs(&self) {
        let mut state = self.state.lock();
        let mut missing = 0;
        for tracker in state.trackers.values_mut() {
            if tracker.stored && !self.blob_path(&tracker.content).exists() {
                warn!("Missing blob file for {}", tracker.content);
                tracker.stored = false;
                missing += 1;
            }
        }
        if missing > 0 {
            self.save_trackers(&state);
        }
    }

    fn save_trackers(&self, state: &StoreState) {
        let result = serde_json::to_string_pretty(&state.trackers)
            .map_err(Error::from)
            .and_then(|data| std::fs::write(self.dir.join(TRACKERS_FILE), data).map_err(Error::from));
        if let Err(e) = result {
            warn!("Failed to save blob trackers: {}", e);
        }
    }

    fn mark_stored(&self, content: &ContentId) {
        let mut state = self.state.lock();
        let tracker = state
            .trackers
            .entry(content.to_string())
            .or_insert_with(|| Tracker::new(content.clone()));
        tracker.stored = true;
        tracker.accessed = Utc::now();
        if !state.batch {
            self.check_quota(&mut state);
        }
        self.save_trackers(&state);
    }

    /// Evict unused blobs above the optimal size, then used ones above the
    /// hard cap, least recently accessed first.
    fn check_quota(&self, state: &mut StoreState) {
        let mut total: u64 = state
            .trackers
            .values()
            .filter(|t| t.stored)
            .map(|t| t.content.length())
            .sum();

        let mut candidates: Vec<(bool, DateTime<Utc>, String)> = state
            .trackers
            .iter()
            .filter(|(_, t)| t.stored)
            .map(|(key, t)| (t.use_count > 0, t.accessed, key.clone()))
            .collect();
        candidates.sort();

        for (used, _, key) in candidates {
            let limit = if used { self.quota.max } else { self.quota.optimal.or(self.quota.max) };
            let Some(limit) = limit else { continue };
            if total <= limit {
                continue;
            }
            let Some(tracker) = state.trackers.get_mut(&key) else { continue };
            if let Err(e) = std::fs::remove_file(self.blob_path(&tracker.content)) {
                warn!("Failed to evict {}: {}", tracker.content, e);
                continue;
            }
            info!("Evicted blob {} ({} bytes)", tracker.content, tracker.content.length());
            tracker.stored = false;
            total = total.saturating_sub(tracker.content.length());
            if tracker.use_count == 0 {
                state.trackers.remove(&key);
            }
        }
    }

    async fn finish_write(&self, temp: &Path, content: &ContentId) -> Result<()> {
        let target = self.blob_path(content);
        if target.exists() {
            fs::remove_file(temp).await?;
        } else {
            fs::rename(temp, &target).await?;
        }
        self.mark_stored(content);
        debug!("Stored blob {}", content);
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        self.scratch_dir().join(format!("{}.tmp", uuid::Uuid::new_v4()))
    }
}

async fn hash_file(path: &Path) -> Result<ContentId> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut length = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        length += n as u64;
    }
    Ok(ContentId::new(hasher.finalize().to_hex().to_string(), length))
}

#[async_trait]
impl BlobStore for DiskBlobStore {
    fn has_data(&self, content: &ContentId) -> bool {
        self.state
            .lock()
            .trackers
            .get(&content.to_string())
            .map(|t| t.stored)
            .unwrap_or(false)
    }

    fn acquire(&self, content: &ContentId) {
        let mut state = self.state.lock();
        let tracker = state
            .trackers
            .entry(content.to_string())
            .or_insert_with(|| Tracker::new(content.clone()));
        tracker.use_count += 1;
        tracker.acquired = Some(Utc::now());
        if !state.batch {
            self.check_quota(&mut state);
            self.save_trackers(&state);
        }
    }

    fn release(&self, content: &ContentId) {
        let mut state = self.state.lock();
        let Some(tracker) = state.trackers.get_mut(&content.to_string()) else {
            return;
        };
        tracker.use_count = tracker.use_count.saturating_sub(1);
        if !state.batch {
            self.check_quota(&mut state);
            self.save_trackers(&state);
        }
    }

    fn init_batch_update(&self) {
        let mut state = self.state.lock();
        state.batch = true;
        for tracker in state.trackers.values_mut() {
            tracker.use_count = 0;
        }
    }

    fn batch_update_complete(&self) {
        let mut state = self.state.lock();
        state.batch = false;
        self.check_quota(&mut state);
        self.save_trackers(&state);
    }

    fn scratch_dir(&self) -> PathBuf {
        self.dir.join("scratch")
    }

    async fn store(&self, data: &[u8]) -> Result<ContentId> {
        let content = ContentId::for_bytes(data);
        if self.has_data(&content) {
            return Ok(content);
        }
        let temp = self.temp_path();
        fs::write(&temp, data).await?;
        self.finish_write(&temp, &content).await?;
        Ok(content)
    }

    async fn store_file(&self, path: &Path) -> Result<ContentId> {
        let temp = self.temp_path();
        let mut src = fs::File::open(path).await?;
        let mut dst = fs::File::create(&temp).await?;
        let mut hasher = blake3::Hasher::new();
        let mut buf = vec![0u8; COPY_BUFFER];
        let mut length = 0u64;
        loop {
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            dst.write_all(&buf[..n]).await?;
            length += n as u64;
        }
        dst.flush().await?;
        drop(dst);

        let content = ContentId::new(hasher.finalize().to_hex().to_string(), length);
        self.finish_write(&temp, &content).await?;
        Ok(content)
    }

    async fn import_file(&self, path: &Path, content: &ContentId) -> Result<()> {
        let actual = hash_file(path).await?;
        if &actual != content {
            fs::remove_file(path).await?;
            return Err(Error::storage(format!(
                "downloaded data hashes to {} instead of {}",
                actual, content
            )));
        }
        self.finish_write(path, content).await
    }

    async fn get_stream(&self, content: &ContentId, start: u64, finish: u64) -> Result<BlobStream> {
        if finish < start || finish > content.length() {
            return Err(Error::storage(format!(
                "range {}..{} outside of {}",
                start, finish, content
            )));
        }
        {
            let mut state = self.state.lock();
            match state.trackers.get_mut(&content.to_string()) {
                Some(tracker) if tracker.stored => tracker.accessed = Utc::now(),
                _ => return Err(Error::storage(format!("blob {} is not stored", content))),
            }
        }
        let mut file = fs::File::open(self.blob_path(content)).await?;
        file.seek(SeekFrom::Start(start)).await?;
        Ok(Box::pin(file.take(finish - start)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    async fn open(quota: Quota) -> (TempDir, DiskBlobStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(temp_dir.path().join("blobs"), quota).await.unwrap();
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_store_and_read_range() {
        let (_dir, store) = open(Quota::default()).await;
        let content = store.store(b"hello blob world").await.unwrap();

        assert!(store.has_data(&content));
        assert_eq!(content.length(), 16);
        let part = store.read_range(&content, 6, 10).await.unwrap();
        assert_eq!(&part[..], b"blob");
    }

    #[tokio::test]
    async fn test_range_outside_blob_is_rejected() {
        let (_dir, store) = open(Quota::default()).await;
        let content = store.store(b"tiny").await.unwrap();
        assert_matches!(store.get_stream(&content, 2, 10).await.map(|_| ()), Err(Error::Storage(_)));
        assert_matches!(
            store.get_stream(&ContentId::for_bytes(b"absent"), 0, 1).await.map(|_| ()),
            Err(Error::Storage(_))
        );
    }

    #[tokio::test]
    async fn test_import_checks_hash() {
        let (dir, store) = open(Quota::default()).await;
        let path = dir.path().join("download.part");
        fs::write(&path, b"payload").await.unwrap();

        let wrong = ContentId::for_bytes(b"other");
        assert_matches!(store.import_file(&path, &wrong).await, Err(Error::Storage(_)));
        assert!(!path.exists());

        fs::write(&path, b"payload").await.unwrap();
        let right = ContentId::for_bytes(b"payload");
        store.import_file(&path, &right).await.unwrap();
        assert!(store.has_data(&right));
    }

    #[tokio::test]
    async fn test_store_file_hashes_contents() {
        let (dir, store) = open(Quota::default()).await;
        let path = dir.path().join("local.txt");
        fs::write(&path, vec![42u8; 200_000]).await.unwrap();
        let content = store.store_file(&path).await.unwrap();
        assert_eq!(content, ContentId::for_bytes(&vec![42u8; 200_000]));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unused_blobs_evicted_above_optimal() {
        let quota = Quota { optimal: Some(10), max: None };
        let (_dir, store) = open(quota).await;

        let kept = store.store(b"0123456789").await.unwrap();
        store.acquire(&kept);
        let dropped = store.store(b"abcdef").await.unwrap();

        assert!(store.has_data(&kept));
        assert!(!store.has_data(&dropped));
    }

    #[tokio::test]
    async fn test_used_blobs_only_evicted_above_max() {
        let quota = Quota { optimal: Some(1), max: Some(12) };
        let (_dir, store) = open(quota).await;

        store.init_batch_update();
        let old = store.store(b"first-blob").await.unwrap();
        store.acquire(&old);
        let new = store.store(b"second-blob").await.unwrap();
        store.acquire(&new);
        store.batch_update_complete();

        // Both are in use; the least recently accessed goes
        assert!(!store.has_data(&old));
        assert!(store.has_data(&new));
        assert_eq!(store.tracker(&old).unwrap().use_count, 1);
    }

    #[tokio::test]
    async fn test_batch_update_resets_counts() {
        let (_dir, store) = open(Quota::default()).await;
        let content = store.store(b"data").await.unwrap();
        store.acquire(&content);
        store.acquire(&content);

        store.init_batch_update();
        assert_eq!(store.tracker(&content).unwrap().use_count, 0);
        store.acquire(&content);
        store.batch_update_complete();
        assert_eq!(store.tracker(&content).unwrap().use_count, 1);
    }

    #[tokio::test]
    async fn test_trackers_persist() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("blobs");
        let content = {
            let store = DiskBlobStore::open(dir.clone(), Quota::default()).await.unwrap();
            let content = store.store(b"persist me").await.unwrap();
            store.acquire(&content);
            content
        };

        let store = DiskBlobStore::open(dir, Quota::default()).await.unwrap();
        assert!(store.has_data(&content));
        assert_eq!(store.stats().used, 1);
    }
}
