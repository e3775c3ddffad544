//! Resumable, multi-source download of one blob.
//!
//! Received bytes land in part files named after their start offset. A part
//! grows while bytes arrive in order and swallows the parts it reaches, so
//! out-of-order delivery from several peers ends in a single file. Once a
//! part spans the whole blob it is imported into the [`BlobStore`]. A blob
//! that fails to import is thrown away and requested again from the start.
//!
//! Part files are written through `tokio::fs` under their own async lock;
//! the request bookkeeping lock is never held across disk I/O.
//!
//! Readers are served from the part files while the transfer runs. A read
//! that finds nothing waits for new bytes and fails with
//! [`Error::TransferStall`] when none arrive within [`STALL_TIMEOUT`].

use bytes::Bytes;
use parking_lot::Mutex;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthMonitor;
use crate::error::{Error, Result};
use crate::ids::ContentId;
use crate::ranges::RequestSet;
use crate::storage::BlobStore;

/// How long a reader waits for new bytes.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(20);

/// Largest chunk handed out by a single read.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
struct Part {
    start: u64,
    limit: u64,
    path: PathBuf,
    file: File,
}

impl Part {
    async fn create(dir: &Path, content: &ContentId, start: u64) -> Result<Self> {
        let path = dir.join(format!(
            "{}_{}_{}.part",
            content.checksum(),
            start,
            uuid::Uuid::new_v4().simple()
        ));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self { start, limit: start, path, file })
    }

    async fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::End(0)).await?;
        self.file.write_all(data).await?;
        self.file.flush().await?;
        self.limit += data.len() as u64;
        Ok(())
    }

    async fn read_at(&mut self, pos: u64, max: usize) -> Result<Vec<u8>> {
        let len = (self.limit - pos).min(max as u64) as usize;
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(pos - self.start)).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    fn covers(&self, pos: u64) -> bool {
        self.start <= pos && pos < self.limit
    }

    async fn discard(self) {
        let Part { path, file, .. } = self;
        drop(file);
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove part file {}: {}", path.display(), e),
        }
    }
}

#[derive(Debug)]
struct DownloadState {
    requests: RequestSet,
    monitor: BandwidthMonitor,
    completed: bool,
    imported: bool,
    failure: Option<Error>,
}

pub struct DataDownloader {
    content: ContentId,
    scratch: PathBuf,
    store: Arc<dyn BlobStore>,
    stall_timeout: Duration,
    state: Mutex<DownloadState>,
    /// Sorted by start offset. Lock before `state` when both are needed.
    parts: tokio::sync::Mutex<Vec<Part>>,
    progress: Notify,
}

impl DataDownloader {
    pub fn new(content: ContentId, store: Arc<dyn BlobStore>) -> Self {
        Self::with_timeouts(content, store, STALL_TIMEOUT, RequestSet::default())
    }

    pub fn with_timeouts(
        content: ContentId,
        store: Arc<dyn BlobStore>,
        stall_timeout: Duration,
        requests: RequestSet,
    ) -> Self {
        Self {
            scratch: store.scratch_dir(),
            content,
            store,
            stall_timeout,
            state: Mutex::new(DownloadState {
                requests,
                monitor: BandwidthMonitor::new(),
                completed: false,
                imported: false,
                failure: None,
            }),
            parts: tokio::sync::Mutex::new(Vec::new()),
            progress: Notify::new(),
        }
    }

    pub fn content(&self) -> &ContentId {
        &self.content
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().imported
    }

    /// Register interest in `[start, finish)`; `query` broadcasts a data
    /// query for a range and reports whether anyone could be asked.
    pub fn request_data<F>(&self, start: u64, finish: u64, query: F)
    where
        F: FnMut(u64, u64) -> bool,
    {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.monitor.start();
        state.requests.expire_serviced(Instant::now());
        state.requests.request(start, finish, Instant::now(), query);
    }

    /// Re-send queries for everything outstanding, e.g. to a peer that just
    /// came online.
    pub fn resend_queries<F>(&self, mut query: F) -> bool
    where
        F: FnMut(u64, u64) -> bool,
    {
        let state = self.state.lock();
        let mut sent = false;
        for (start, finish) in state.requests.ranges() {
            sent |= query(start, finish);
        }
        sent
    }

    /// Query again whatever nobody is serving and was not asked for lately.
    pub fn requery<F>(&self, query: F)
    where
        F: FnMut(u64, u64) -> bool,
    {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.requests.requery(Instant::now(), query);
    }

    /// A peer has `[start, finish)`; `fetch` asks it for a block.
    pub fn process_response<F>(&self, start: u64, finish: u64, fetch: F)
    where
        F: FnMut(u64, u64) -> bool,
    {
        let mut state = self.state.lock();
        if state.completed {
            return;
        }
        state.requests.respond(start, finish, Instant::now(), fetch);
    }

    /// Store received bytes starting at `pos`. Fails when the bytes cannot
    /// be written or when they complete a blob that does not import; in the
    /// latter case the whole blob is wanted again.
    pub async fn data_got(&self, pos: u64, data: &[u8]) -> Result<()> {
        let mut parts = self.parts.lock().await;
        if self.state.lock().completed {
            return Ok(());
        }
        let written = self.write_part(&mut parts, pos, data).await?;
        let whole = parts
            .first()
            .filter(|p| p.start == 0 && p.limit == self.content.length())
            .map(|p| p.path.clone());
        {
            let mut state = self.state.lock();
            state.monitor.update(written);
            state.requests.received(pos, pos + data.len() as u64);
            state.requests.touch(pos, pos + data.len() as u64, Instant::now());
            if whole.is_some() {
                state.completed = true;
                state.monitor.stop();
            }
        }
        drop(parts);
        self.progress.notify_waiters();

        let Some(path) = whole else {
            return Ok(());
        };
        let result = self.store.import_file(&path, &self.content).await;
        let mut parts = self.parts.lock().await;
        match &result {
            Ok(()) => {
                parts.clear();
                let mut state = self.state.lock();
                info!(
                    "Download of {} complete, average {} bytes/s",
                    self.content,
                    state.monitor.average_speed()
                );
                state.imported = true;
            }
            Err(e) => {
                warn!("Failed to import download of {}: {}", self.content, e);
                for part in parts.drain(..) {
                    part.discard().await;
                }
                let mut state = self.state.lock();
                state.completed = false;
                state.failure = Some(e.clone());
                state
                    .requests
                    .request(0, self.content.length(), Instant::now(), |_, _| false);
            }
        }
        drop(parts);
        self.progress.notify_waiters();
        result
    }

    /// Zero-length blobs have nothing to transfer.
    pub async fn complete_empty(&self) -> Result<()> {
        if self.content.length() != 0 {
            return Ok(());
        }
        let path = self.scratch.join(format!("{}.empty", uuid::Uuid::new_v4().simple()));
        fs::write(&path, b"").await?;
        self.store.import_file(&path, &self.content).await?;
        self.state.lock().imported = true;
        self.progress.notify_waiters();
        Ok(())
    }

    /// Returns how many new bytes went to disk.
    async fn write_part(&self, parts: &mut Vec<Part>, pos: u64, data: &[u8]) -> Result<u64> {
        let limit = pos + data.len() as u64;
        if data.is_empty() || limit > self.content.length() {
            if !data.is_empty() {
                warn!("Ignoring bytes {}..{} beyond the end of {}", pos, limit, self.content);
            }
            return Ok(0);
        }

        let mut target = None;
        for (i, part) in parts.iter().enumerate() {
            if part.start <= pos && part.limit >= limit {
                // Already have all of it
                return Ok(0);
            }
            if part.start <= pos && pos <= part.limit && limit > part.limit {
                target = Some(i);
                break;
            }
        }

        let index = match target {
            Some(i) => {
                let skip = (parts[i].limit - pos) as usize;
                parts[i].append(&data[skip..]).await?;
                i
            }
            None => {
                let mut part = Part::create(&self.scratch, &self.content, pos).await?;
                part.append(data).await?;
                parts.push(part);
                parts.len() - 1
            }
        };

        // Swallow parts that the grown part reaches
        let mut current = parts.swap_remove(index);
        let mut kept = Vec::with_capacity(parts.len() + 1);
        for mut other in std::mem::take(parts) {
            if current.start <= other.start && current.limit >= other.limit {
                other.discard().await;
            } else if current.start <= other.start && current.limit >= other.start && current.limit < other.limit {
                let tail = other.read_at(current.limit, (other.limit - current.limit) as usize).await?;
                current.append(&tail).await?;
                other.discard().await;
            } else {
                kept.push(other);
            }
        }
        debug!("Part of {} now spans {}..{}", self.content, current.start, current.limit);
        kept.push(current);
        kept.sort_by_key(|p| p.start);
        *parts = kept;
        Ok(data.len() as u64)
    }

    async fn try_read(&self, pos: u64, max: usize) -> Result<Option<Vec<u8>>> {
        let failure = self.state.lock().failure.take();
        if let Some(e) = failure {
            return Err(e);
        }
        let mut parts = self.parts.lock().await;
        match parts.iter_mut().find(|p| p.covers(pos)) {
            Some(part) => Ok(Some(part.read_at(pos, max).await?)),
            None => Ok(None),
        }
    }

    /// Read up to `max` bytes at `pos`, waiting for them to arrive.
    pub async fn read(&self, pos: u64, max: usize) -> Result<Bytes> {
        let end = self.content.length().min(pos + max as u64);
        if pos >= end {
            return Ok(Bytes::new());
        }
        let deadline = tokio::time::Instant::now() + self.stall_timeout;
        loop {
            let notified = self.progress.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().imported {
                return self.store.read_range(&self.content, pos, end).await;
            }
            if let Some(data) = self.try_read(pos, (end - pos) as usize).await? {
                return Ok(Bytes::from(data));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::stall(format!(
                    "no data for {} at offset {} within {:?}",
                    self.content, pos, self.stall_timeout
                )));
            }
        }
    }

    /// Read `[start, finish)` completely. Each chunk gets a fresh stall
    /// window.
    pub async fn read_range(&self, start: u64, finish: u64) -> Result<Bytes> {
        let mut out = Vec::with_capacity(finish.saturating_sub(start) as usize);
        let mut pos = start;
        while pos < finish {
            let chunk = self.read(pos, ((finish - pos) as usize).min(READ_CHUNK)).await?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

impl Drop for DataDownloader {
    fn drop(&mut self) {
        for part in self.parts.get_mut().drain(..) {
            let Part { path, file, .. } = part;
            drop(file);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to remove part file {}: {}", path.display(), e);
                }
            }
        }
    }
}
