//! # Local Node
//!
//! A [`LocalNode`] is one running participant: its identity and trust
//! context, the blob store, the connection manager and every share it
//! replicates. It is the [`Dispatcher`] of its connection manager and
//! routes share messages by share id.
//!
//! Layout of the data directory:
//!
//! ```text
//! <data_dir>/contacts.json     address book and trusted roots
//! <data_dir>/invites.json      invitations received
//! <data_dir>/blobs/            content-addressed blob store
//! <data_dir>/shares/*.json     one file per share
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bandwidth::{BandwidthManager, BandwidthStats};
use crate::error::{Error, Result};
use crate::identity::{Identity, LocalIdentity};
use crate::ids::{ShareId, UserId};
use crate::invite::{InviteBook, InviteOutcome, ReceivedInvite};
use crate::manager::{ConnectionManager, Dispatcher, ManagerOptions};
use crate::share::{ShareContext, ShareModel};
use crate::storage::{BlobStore, DiskBlobStore, Quota, StorageStats};
use crate::transport::ShareTransport;
use crate::trust::TrustContext;
use crate::wire::{Message, StreamHeader};

const CONTACTS_FILE: &str = "contacts.json";
const INVITES_FILE: &str = "invites.json";

/// Settings of a [`LocalNode`].
#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    pub data_dir: PathBuf,
    pub quota: Quota,
    pub upload_limit: Option<u64>,
    pub download_limit: Option<u64>,
    pub manager: ManagerOptions,
}

impl NodeOptions {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}

/// Summary for `status`.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub user_id: UserId,
    pub shares: usize,
    pub connected_peers: Vec<UserId>,
    pub lookup_online: bool,
    pub pending_invites: usize,
    pub storage: StorageStats,
    pub bandwidth: BandwidthStats,
}

pub struct LocalNode {
    local: Arc<LocalIdentity>,
    trust: Arc<TrustContext>,
    store: Arc<DiskBlobStore>,
    bandwidth: Arc<BandwidthManager>,
    manager: ConnectionManager,
    invites: InviteBook,
    shares: RwLock<HashMap<ShareId, Arc<ShareModel>>>,
    data_dir: PathBuf,
    invite_events: broadcast::Sender<ReceivedInvite>,
}

impl LocalNode {
    /// Open the node stored in `options.data_dir`, loading its contacts,
    /// invitations and shares. Must be called inside a tokio runtime.
    pub async fn open(local: LocalIdentity, options: NodeOptions) -> Result<Arc<Self>> {
        let data_dir = options.data_dir;
        tokio::fs::create_dir_all(data_dir.join("shares")).await?;

        let local = Arc::new(local);
        let trust = Arc::new(TrustContext::new(local.identity()));
        trust.load(&data_dir.join(CONTACTS_FILE))?;
        let store = Arc::new(DiskBlobStore::open(data_dir.join("blobs"), options.quota).await?);
        let bandwidth = Arc::new(BandwidthManager::new(options.upload_limit, options.download_limit));
        let manager = ConnectionManager::new(local.clone(), trust.clone(), options.manager);
        let invites = InviteBook::open(&data_dir.join(INVITES_FILE))?;
        let (invite_events, _) = broadcast::channel(64);

        let node = Arc::new(Self {
            local,
            trust,
            store,
            bandwidth,
            manager,
            invites,
            shares: RwLock::new(HashMap::new()),
            data_dir,
            invite_events,
        });
        let dispatcher: Arc<dyn Dispatcher> = node.clone();
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&dispatcher);
        node.manager.set_dispatcher(weak);
        node.load_shares().await?;
        Ok(node)
    }

    fn share_context(&self) -> ShareContext {
        ShareContext {
            local: self.local.clone(),
            trust: self.trust.clone(),
            store: self.store.clone(),
            transport: Arc::new(self.manager.clone()),
            bandwidth: self.bandwidth.clone(),
            dir: Some(self.shares_dir()),
        }
    }

    fn shares_dir(&self) -> PathBuf {
        self.data_dir.join("shares")
    }

    async fn load_shares(&self) -> Result<()> {
        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(self.shares_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }

        // Replays re-acquire every blob they reference
        self.store.init_batch_update();
        let ctx = self.share_context();
        let mut loaded = Vec::new();
        for path in paths {
            match ShareModel::load(ctx.clone(), &path) {
                Ok(share) => loaded.push(share),
                Err(e) => warn!("Skipping share file {}: {}", path.display(), e),
            }
        }
        self.store.batch_update_complete();

        let mut shares = self.shares.write();
        for share in loaded {
            share.register_contacts();
            shares.insert(share.id().clone(), share);
        }
        info!("Loaded {} shares", shares.len());
        Ok(())
    }

    /// Listen for direct connections and connect to lookup servers.
    pub async fn start(&self, listen: Option<&str>, lookup_servers: &[String]) -> Result<Option<SocketAddr>> {
        let bound = match listen {
            Some(addr) => Some(self.manager.listen(addr).await?),
            None => None,
        };
        for server in lookup_servers {
            self.manager.add_lookup_server(server.clone());
        }
        info!("Node {} started", self.local.user_id());
        Ok(bound)
    }

    pub fn local(&self) -> &LocalIdentity {
        &self.local
    }

    pub fn user_id(&self) -> &UserId {
        self.local.user_id()
    }

    pub fn trust(&self) -> &TrustContext {
        &self.trust
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn bandwidth(&self) -> &BandwidthManager {
        &self.bandwidth
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Persist the address book.
    pub fn save_contacts(&self) -> Result<()> {
        self.trust.save(&self.data_dir.join(CONTACTS_FILE))
    }

    /// Our identity in armored form, for handing to others.
    pub fn export_identity(&self) -> String {
        self.local.identity().to_armored()
    }

    /// Add the armored identity in `text` to the address book.
    pub fn import_identity(&self, text: &str) -> Result<Identity> {
        let identity = Identity::from_armored(text)?;
        if identity.user_id() == self.local.user_id() {
            return Err(Error::config("that is our own identity"));
        }
        let contact = self.trust.add_contact(&identity);
        self.save_contacts()?;
        info!("Imported contact {}", contact);
        Ok(contact)
    }

    pub fn create_share(&self, name: &str) -> Result<Arc<ShareModel>> {
        let share = ShareModel::create(self.share_context(), name)?;
        share.flush()?;
        self.shares.write().insert(share.id().clone(), share.clone());
        Ok(share)
    }

    pub fn share(&self, id: &ShareId) -> Option<Arc<ShareModel>> {
        self.shares.read().get(id).cloned()
    }

    /// Look a share up by id, or by name when the name is unique.
    pub fn find_share(&self, key: &str) -> Result<Arc<ShareModel>> {
        if let Ok(id) = ShareId::parse(key) {
            if let Some(share) = self.share(&id) {
                return Ok(share);
            }
        }
        let matches: Vec<Arc<ShareModel>> = self
            .shares
            .read()
            .values()
            .filter(|share| share.name() == key)
            .cloned()
            .collect();
        match matches.len() {
            1 => Ok(matches[0].clone()),
            0 => Err(Error::config(format!("no share '{}'", key))),
            _ => Err(Error::config(format!("several shares are called '{}', use the id", key))),
        }
    }

    /// Every share, sorted by name.
    pub fn shares(&self) -> Vec<Arc<ShareModel>> {
        let mut shares: Vec<_> = self.shares.read().values().cloned().collect();
        shares.sort_by_key(|share| (share.name(), share.id().clone()));
        shares
    }

    /// Invite a contact into one of our shares.
    pub fn invite(&self, share: &ShareId, invitee: &Identity, greeting: &str) -> Result<()> {
        let share = self
            .share(share)
            .ok_or_else(|| Error::config(format!("no share {}", share)))?;
        share.invite_user(invitee, greeting)?;
        self.save_contacts()
    }

    /// Invitations waiting for a decision.
    pub fn pending_invites(&self) -> Vec<ReceivedInvite> {
        self.invites.pending()
    }

    pub fn subscribe_invites(&self) -> broadcast::Receiver<ReceivedInvite> {
        self.invite_events.subscribe()
    }

    /// Accept an invitation: trust the inviters, attach the share and start
    /// syncing with them.
    pub fn accept(&self, share: &ShareId) -> Result<Arc<ShareModel>> {
        let invite = self.invites.decide(share, true)?;
        let mut inviters = self.invites.inviter_identities(share);
        for user in &invite.inviters {
            if inviters.iter().any(|known| known.user_id() == user) {
                continue;
            }
            match self.manager.known_identity(user) {
                Some(identity) => inviters.push(identity),
                None => warn!("No identity known for inviter {}", user),
            }
        }
        for inviter in &inviters {
            self.trust.add_contact(inviter);
        }
        if let Err(e) = self.save_contacts() {
            warn!("Failed to save contacts: {}", e);
        }

        let model = {
            let mut shares = self.shares.write();
            shares
                .entry(share.clone())
                .or_insert_with(|| ShareModel::attach(self.share_context(), share.clone(), &invite.name))
                .clone()
        };
        for inviter in &inviters {
            model.sync_with(inviter);
        }
        self.send_replies(&invite);
        info!("Accepted invitation to '{}' ({})", invite.name, share);
        Ok(model)
    }

    pub fn reject(&self, share: &ShareId) -> Result<()> {
        let invite = self.invites.decide(share, false)?;
        self.send_replies(&invite);
        info!("Declined invitation to '{}' ({})", invite.name, share);
        Ok(())
    }

    /// Tell every inviter that has not heard it yet about our decision.
    fn send_replies(&self, invite: &ReceivedInvite) {
        let Some(accept) = invite.verdict else { return };
        for user in invite.unanswered() {
            let message = Message::InviteResponse {
                share: invite.share.clone(),
                accept,
            };
            if self.manager.send_to_user(&user, message, false, true) {
                self.invites.mark_answered(&invite.share, &user);
            } else {
                debug!("Answer to {} for {} stays pending", user, invite.share);
            }
        }
    }

    fn receive_invite(&self, from: &UserId, share: ShareId, name: String, greeting: String) {
        if let Some(existing) = self.share(&share) {
            debug!("{} invited us to {} which we already have", from, share);
            self.manager.send_to_user(
                from,
                Message::InviteResponse {
                    share: share.clone(),
                    accept: true,
                },
                false,
                true,
            );
            match self.manager.known_identity(from) {
                Some(inviter) => existing.sync_with(&inviter),
                None => warn!("No identity known for inviter {}", from),
            }
            return;
        }

        let outcome = self.invites.receive(&share, &name, &greeting, from);
        if let Some(identity) = self.manager.known_identity(from) {
            self.invites.remember_identity(&share, &identity);
        }
        match outcome {
            InviteOutcome::New => {
                if let Some(invite) = self.invites.get(&share) {
                    let _ = self.invite_events.send(invite);
                }
            }
            InviteOutcome::Coalesced => debug!("{} also invited us to {}", from, share),
            InviteOutcome::Decided(_) => {
                if let Some(invite) = self.invites.get(&share) {
                    self.send_replies(&invite);
                }
            }
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            user_id: self.local.user_id().clone(),
            shares: self.shares.read().len(),
            connected_peers: self.manager.connected_peers(),
            lookup_online: self.manager.lookup_online(),
            pending_invites: self.invites.pending().len(),
            storage: self.store.stats(),
            bandwidth: self.bandwidth.stats(),
        }
    }

    /// Save everything and close all connections.
    pub fn shutdown(&self) {
        for share in self.shares() {
            if let Err(e) = share.flush() {
                warn!("Failed to save share {}: {}", share.id(), e);
            }
        }
        if let Err(e) = self.save_contacts() {
            warn!("Failed to save contacts: {}", e);
        }
        self.manager.shutdown();
        info!("Node {} stopped", self.local.user_id());
    }
}

#[async_trait]
impl Dispatcher for LocalNode {
    async fn message_from(&self, from: &UserId, message: Message) {
        if let Message::Invite { share, name, greeting } = message {
            self.receive_invite(from, share, name, greeting);
            return;
        }
        let Some(share) = message.share().and_then(|id| self.share(id)) else {
            debug!("Dropping {} from {} for an unknown share", message.kind(), from);
            return;
        };
        share.handle_message(from, message).await;
    }

    async fn stream_data(&self, header: &StreamHeader, offset: u64, data: Bytes) {
        match self.share(&header.share) {
            Some(share) => share.stream_data(header, offset, data).await,
            None => debug!("Dropping stream data for unknown share {}", header.share),
        }
    }

    fn contact_status_changed(&self, user: &UserId, online: bool) {
        debug!("{} is {}", user, if online { "online" } else { "offline" });
        for share in self.shares() {
            share.contact_status_changed(user, online);
        }
        if online {
            for invite in self.invites.unanswered() {
                if invite.unanswered().contains(user) {
                    self.send_replies(&invite);
                }
            }
        }
    }

    fn lookup_state_changed(&self, online: bool) {
        info!("Lookup service {}", if online { "reachable" } else { "lost" });
        for share in self.shares() {
            share.lookup_state_changed(online);
        }
    }
}
