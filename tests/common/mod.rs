//! In-process network for share-level integration tests.
//!
//! Every peer gets an inbox; a pump task per peer hands deliveries to the
//! peer's shares the way the node dispatcher does.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use slymesh::bandwidth::BandwidthManager;
use slymesh::identity::{Identity, LocalIdentity};
use slymesh::ids::{ShareId, UserId};
use slymesh::share::{ShareContext, ShareModel};
use slymesh::storage::{DiskBlobStore, Quota};
use slymesh::transport::ShareTransport;
use slymesh::trust::TrustContext;
use slymesh::wire::{DataRange, Message, StreamHeader};

enum Delivery {
    Message(UserId, Message),
    Stream(StreamHeader, Bytes),
}

#[derive(Default)]
pub struct Network {
    inboxes: Mutex<HashMap<UserId, mpsc::UnboundedSender<Delivery>>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn deliver(&self, to: &UserId, delivery: Delivery) -> bool {
        match self.inboxes.lock().get(to) {
            Some(inbox) => inbox.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Take a peer off the network; it can come back with [`Peer::reconnect`].
    pub fn disconnect(&self, user: &UserId) {
        self.inboxes.lock().remove(user);
    }
}

/// The network as seen from one peer.
struct Link {
    network: Arc<Network>,
    me: UserId,
    /// Only this part of any range is confirmed in `DATA_RESPONSE`
    confirm_only: Mutex<Option<(u64, u64)>>,
}

#[async_trait]
impl ShareTransport for Link {
    fn send_to_user(&self, user: &UserId, message: Message, _: bool, _: bool) -> bool {
        let message = match message {
            Message::DataResponse(range) => match *self.confirm_only.lock() {
                Some((start, finish)) => {
                    let start = range.start.max(start);
                    let finish = range.finish.min(finish);
                    if start >= finish {
                        return true;
                    }
                    Message::DataResponse(DataRange { start, finish, ..range })
                }
                None => Message::DataResponse(range),
            },
            other => other,
        };
        self.network.deliver(user, Delivery::Message(self.me.clone(), message))
    }

    async fn send_stream(&self, user: &UserId, header: StreamHeader, body: Bytes) -> bool {
        self.network.deliver(user, Delivery::Stream(header, body))
    }

    fn add_contact(&self, _: &Identity, _: &ShareId) {}

    fn remove_contact(&self, _: &UserId, _: &ShareId) {}

    fn is_online(&self, user: &UserId) -> bool {
        self.network.inboxes.lock().contains_key(user)
    }
}

pub struct Peer {
    _dir: TempDir,
    pub local: Arc<LocalIdentity>,
    pub trust: Arc<TrustContext>,
    network: Arc<Network>,
    link: Arc<Link>,
    ctx: ShareContext,
    shares: Mutex<HashMap<ShareId, Arc<ShareModel>>>,
}

impl Peer {
    pub async fn join(network: &Arc<Network>, name: &str) -> Arc<Self> {
        let dir = TempDir::new().unwrap();
        let local = Arc::new(LocalIdentity::generate(name, name).unwrap());
        let trust = Arc::new(TrustContext::new(local.identity()));
        let store = DiskBlobStore::open(dir.path().join("blobs"), Quota::default())
            .await
            .unwrap();
        let link = Arc::new(Link {
            network: network.clone(),
            me: local.user_id().clone(),
            confirm_only: Mutex::new(None),
        });
        let ctx = ShareContext {
            local: local.clone(),
            trust: trust.clone(),
            store: Arc::new(store),
            transport: link.clone(),
            bandwidth: Arc::new(BandwidthManager::unlimited()),
            dir: Some(dir.path().join("shares")),
        };
        let peer = Arc::new(Self {
            _dir: dir,
            local,
            trust,
            network: network.clone(),
            link,
            ctx,
            shares: Mutex::new(HashMap::new()),
        });
        peer.reconnect();
        peer
    }

    /// Put the peer (back) on the network and start delivering its inbox.
    pub fn reconnect(self: &Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.network.inboxes.lock().insert(self.user_id().clone(), tx);
        let peer = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let Some(peer) = peer.upgrade() else { break };
                match delivery {
                    Delivery::Message(from, message) => {
                        let share = message.share().and_then(|id| peer.share(id));
                        if let Some(share) = share {
                            share.handle_message(&from, message).await;
                        }
                    }
                    Delivery::Stream(header, body) => {
                        if let Some(share) = peer.share(&header.share) {
                            share.stream_data(&header, 0, body).await;
                        }
                    }
                }
            }
        });
    }

    pub fn user_id(&self) -> &UserId {
        self.local.user_id()
    }

    pub fn identity(&self) -> &Identity {
        self.local.identity()
    }

    /// Confirm only `[start, finish)` of any data query from now on.
    pub fn confirm_only(&self, start: u64, finish: u64) {
        *self.link.confirm_only.lock() = Some((start, finish));
    }

    pub fn share(&self, id: &ShareId) -> Option<Arc<ShareModel>> {
        self.shares.lock().get(id).cloned()
    }

    pub fn create_share(&self, name: &str) -> Arc<ShareModel> {
        let share = ShareModel::create(self.ctx.clone(), name).unwrap();
        self.shares.lock().insert(share.id().clone(), share.clone());
        share
    }

    /// An empty replica of `id`, not connected to anyone yet.
    pub fn attach(&self, id: &ShareId, name: &str) -> Arc<ShareModel> {
        let share = ShareModel::attach(self.ctx.clone(), id.clone(), name);
        self.shares.lock().insert(id.clone(), share.clone());
        share
    }

    /// Invite `other` into `share` the way an accepted invitation plays
    /// out: both sides trust each other and `other` syncs with us.
    pub async fn admit(&self, share: &Arc<ShareModel>, other: &Peer) -> Arc<ShareModel> {
        self.trust.add_contact(other.identity());
        other.trust.add_contact(self.identity());
        let replica = other.attach(share.id(), &share.name());
        replica.sync_with(self.identity());
        share.invite_user(other.identity(), "welcome").unwrap();
        share
            .handle_message(
                other.user_id(),
                Message::InviteResponse {
                    share: share.id().clone(),
                    accept: true,
                },
            )
            .await;
        replica
    }
}

/// Poll `check` until it holds or a few seconds passed.
pub async fn wait_for<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Wait until every replica has the same events and tree.
pub async fn wait_converged(shares: &[Arc<ShareModel>]) {
    wait_for(|| {
        let first = &shares[0];
        shares[1..]
            .iter()
            .all(|s| s.frontier() == first.frontier() && s.listing() == first.listing())
    })
    .await;
}
