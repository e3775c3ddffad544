//! One authenticated connection and its two tasks.
//!
//! After the handshake a [`Framed`] connection is split: a reader task turns
//! frames into [`ConnectionEvent`]s on a channel shared by all connections
//! of a manager, and a writer task drains the connection's unbounded
//! outbound queue. Stream sessions are queued like any other frame, so one
//! stream is written at a time and later ones wait their turn.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::Error;
use crate::identity::Identity;
use crate::wire::{FrameCodec, Inbound, Message, Outbound, StreamHeader};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the reader task reports.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message { conn: ConnId, message: Message },
    /// A slice of a stream session; `offset` is relative to `header.start`.
    Stream {
        conn: ConnId,
        header: StreamHeader,
        offset: u64,
        data: Bytes,
    },
    Closed { conn: ConnId, error: Option<Error> },
}

struct OutboundItem {
    frame: Outbound,
    ack: Option<oneshot::Sender<bool>>,
}

struct Shared {
    id: ConnId,
    peer: Option<Identity>,
    remote: Option<String>,
    outgoing: bool,
    queue: mpsc::UnboundedSender<OutboundItem>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Handle to a running connection. Clones share the tasks; the last clone
/// dropped stops them.
#[derive(Clone)]
pub struct PeerConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &self.shared.id)
            .field("peer", &self.shared.peer.as_ref().map(|p| p.user_id().clone()))
            .field("remote", &self.shared.remote)
            .finish()
    }
}

impl PeerConnection {
    /// Start the reader and writer tasks for an authenticated connection.
    pub fn spawn<T>(
        framed: Framed<T, FrameCodec>,
        peer: Option<Identity>,
        remote: Option<String>,
        outgoing: bool,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnId::next();
        let (mut sink, mut stream) = framed.split();
        let (queue, mut outbound) = mpsc::unbounded_channel::<OutboundItem>();

        let writer = tokio::spawn(async move {
            while let Some(item) = outbound.recv().await {
                let result = sink.send(item.frame).await;
                let ok = result.is_ok();
                if let Some(ack) = item.ack {
                    let _ = ack.send(ok);
                }
                if let Err(e) = result {
                    debug!("Connection {} write failed: {}", id, e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            let mut current: Option<(StreamHeader, u64)> = None;
            let error = loop {
                match stream.next().await {
                    None => break None,
                    Some(Err(e)) => break Some(e),
                    Some(Ok(Inbound::Message(Message::StreamStart(header)))) => {
                        if header.is_empty() {
                            let _ = events.send(ConnectionEvent::Stream {
                                conn: id,
                                header,
                                offset: 0,
                                data: Bytes::new(),
                            });
                        } else {
                            current = Some((header, 0));
                        }
                    }
                    Some(Ok(Inbound::Message(message))) => {
                        if events.send(ConnectionEvent::Message { conn: id, message }).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Inbound::StreamData(data))) => {
                        let Some((header, offset)) = current.as_mut() else {
                            break Some(Error::protocol("stream bytes without a header"));
                        };
                        let len = data.len() as u64;
                        let _ = events.send(ConnectionEvent::Stream {
                            conn: id,
                            header: header.clone(),
                            offset: *offset,
                            data,
                        });
                        *offset += len;
                        if *offset >= header.len() {
                            current = None;
                        }
                    }
                }
            };
            if let Some(e) = &error {
                warn!("Connection {} failed: {}", id, e);
            }
            let _ = events.send(ConnectionEvent::Closed { conn: id, error });
        });

        Self {
            shared: Arc::new(Shared {
                id,
                peer,
                remote,
                outgoing,
                queue,
                reader,
                writer,
            }),
        }
    }

    pub fn id(&self) -> ConnId {
        self.shared.id
    }

    /// Authenticated peer, `None` for anonymous connections.
    pub fn peer(&self) -> Option<&Identity> {
        self.shared.peer.as_ref()
    }

    pub fn remote(&self) -> Option<&str> {
        self.shared.remote.as_deref()
    }

    /// Whether we opened this connection.
    pub fn is_outgoing(&self) -> bool {
        self.shared.outgoing
    }

    /// Queue a message. Never blocks; returns false once the writer is gone.
    pub fn send(&self, message: Message) -> bool {
        self.shared
            .queue
            .send(OutboundItem {
                frame: Outbound::Message(message),
                ack: None,
            })
            .is_ok()
    }

    /// Queue a stream session and wait until it has been written.
    pub async fn send_stream(&self, header: StreamHeader, body: Bytes) -> bool {
        let (ack, done) = oneshot::channel();
        let queued = self
            .shared
            .queue
            .send(OutboundItem {
                frame: Outbound::Stream { header, body },
                ack: Some(ack),
            })
            .is_ok();
        queued && done.await.unwrap_or(false)
    }

    /// Queue a stream session without waiting for it to be written.
    pub fn queue_stream(&self, header: StreamHeader, body: Bytes) -> bool {
        self.shared
            .queue
            .send(OutboundItem {
                frame: Outbound::Stream { header, body },
                ack: None,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.is_closed() || self.shared.reader.is_finished()
    }

    /// Stop both tasks without reporting a close event.
    pub fn close(&self) {
        self.shared.reader.abort();
        self.shared.writer.abort();
    }
}
