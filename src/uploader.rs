//! Serving a requested byte range to a peer.
//!
//! Small ranges go out as a single `DATA_BLOCK` message. Larger ones are
//! streamed in sessions of at most [`SESSION_LIMIT`] bytes; each session is
//! a `STREAM_START` header followed by the raw bytes and is queued behind
//! whatever else the connection is sending.

use bytes::Bytes;
use tracing::{debug, info};

use crate::bandwidth::{BandwidthManager, BandwidthMonitor};
use crate::error::{Error, Result};
use crate::ids::{ContentId, ShareId, UserId};
use crate::storage::BlobStore;
use crate::transport::ShareTransport;
use crate::wire::{DataRange, Message, StreamHeader, MAX_STREAM_SESSION};

/// Ranges below this size are sent as one block.
pub const BLOCK_LIMIT: u64 = 32 * 1024;

/// Largest stream session.
pub const SESSION_LIMIT: u64 = MAX_STREAM_SESSION;

#[derive(Debug)]
pub struct DataUploader {
    peer: UserId,
    local: UserId,
    share: ShareId,
    content: ContentId,
    start: u64,
    finish: u64,
    monitor: BandwidthMonitor,
}

impl DataUploader {
    pub fn new(
        peer: UserId,
        local: UserId,
        share: ShareId,
        content: ContentId,
        start: u64,
        finish: u64,
    ) -> Self {
        Self {
            peer,
            local,
            share,
            content,
            start,
            finish,
            monitor: BandwidthMonitor::new(),
        }
    }

    /// Send the whole range. Returns the number of bytes sent.
    pub async fn run(
        mut self,
        store: &dyn BlobStore,
        transport: &dyn ShareTransport,
        bandwidth: &BandwidthManager,
    ) -> Result<u64> {
        if self.finish > self.content.length() || self.finish < self.start {
            return Err(Error::protocol(format!(
                "request for {}..{} of {}",
                self.start, self.finish, self.content
            )));
        }
        self.monitor.start();
        let total = self.finish - self.start;

        if total < BLOCK_LIMIT {
            let data = store.read_range(&self.content, self.start, self.finish).await?;
            bandwidth.request_upload_quota(total).await;
            let message = Message::DataBlock {
                range: DataRange {
                    share: self.share.clone(),
                    content: self.content.clone(),
                    start: self.start,
                    finish: self.finish,
                },
                data,
            };
            if !transport.send_to_user(&self.peer, message, false, false) {
                return Err(Error::protocol(format!("no path to {} for a data block", self.peer)));
            }
            self.monitor.update(total);
        } else {
            let mut pos = self.start;
            while pos < self.finish {
                let session_end = self.finish.min(pos + SESSION_LIMIT);
                let body = store.read_range(&self.content, pos, session_end).await?;
                bandwidth.request_upload_quota(session_end - pos).await;
                self.send_session(transport, pos, session_end, body).await?;
                self.monitor.update(session_end - pos);
                debug!("Streamed {}..{} of {} to {}", pos, session_end, self.content, self.peer);
                pos = session_end;
            }
        }

        self.monitor.stop();
        info!(
            "Upload of {} bytes of {} to {} done ({} bytes/s)",
            total,
            self.content,
            self.peer,
            self.monitor.average_speed()
        );
        Ok(total)
    }

    async fn send_session(
        &self,
        transport: &dyn ShareTransport,
        start: u64,
        finish: u64,
        body: Bytes,
    ) -> Result<()> {
        let header = StreamHeader {
            to: self.peer.clone(),
            from: self.local.clone(),
            share: self.share.clone(),
            content: self.content.clone(),
            start,
            finish,
        };
        if transport.send_stream(&self.peer, header, body).await {
            Ok(())
        } else {
            Err(Error::protocol(format!("no connection to {} for streaming", self.peer)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::storage::{DiskBlobStore, Quota};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<Message>>,
        streams: Mutex<Vec<(StreamHeader, Bytes)>>,
    }

    #[async_trait]
    impl ShareTransport for Recorder {
        fn send_to_user(&self, _: &UserId, message: Message, _: bool, _: bool) -> bool {
            self.messages.lock().push(message);
            true
        }

        async fn send_stream(&self, _: &UserId, header: StreamHeader, body: Bytes) -> bool {
            self.streams.lock().push((header, body));
            true
        }

        fn add_contact(&self, _: &Identity, _: &ShareId) {}

        fn remove_contact(&self, _: &UserId, _: &ShareId) {}

        fn is_online(&self, _: &UserId) -> bool {
            true
        }
    }

    async fn store_with(data: &[u8]) -> (TempDir, DiskBlobStore, ContentId) {
        let dir = TempDir::new().unwrap();
        let store = DiskBlobStore::open(dir.path().join("blobs"), Quota::default()).await.unwrap();
        let content = store.store(data).await.unwrap();
        (dir, store, content)
    }

    fn uploader(content: &ContentId, start: u64, finish: u64) -> DataUploader {
        DataUploader::new(
            UserId::new("peer"),
            UserId::new("me"),
            ShareId::parse("me:share").unwrap(),
            content.clone(),
            start,
            finish,
        )
    }

    #[tokio::test]
    async fn test_small_range_is_one_block() {
        let data = vec![1u8; 1000];
        let (_dir, store, content) = store_with(&data).await;
        let transport = Recorder::default();

        let sent = uploader(&content, 100, 900)
            .run(&store, &transport, &BandwidthManager::unlimited())
            .await
            .unwrap();
        assert_eq!(sent, 800);
        let messages = transport.messages.lock();
        assert!(matches!(&messages[0], Message::DataBlock { range, data } if range.start == 100 && data.len() == 800));
        assert!(transport.streams.lock().is_empty());
    }

    #[tokio::test]
    async fn test_large_range_is_streamed_in_sessions() {
        let data: Vec<u8> = (0..1_200_000u32).map(|i| (i % 7) as u8).collect();
        let (_dir, store, content) = store_with(&data).await;
        let transport = Recorder::default();

        uploader(&content, 0, data.len() as u64)
            .run(&store, &transport, &BandwidthManager::unlimited())
            .await
            .unwrap();

        let streams = transport.streams.lock();
        assert_eq!(streams.len(), 3);
        assert!(streams.iter().all(|(h, b)| h.len() <= SESSION_LIMIT && b.len() as u64 == h.len()));
        let joined: Vec<u8> = streams.iter().flat_map(|(_, b)| b.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn test_range_past_end_is_rejected() {
        let (_dir, store, content) = store_with(b"short").await;
        let transport = Recorder::default();
        let result = uploader(&content, 0, 50)
            .run(&store, &transport, &BandwidthManager::unlimited())
            .await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
