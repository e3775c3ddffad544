//! # Share Coordinator
//!
//! A [`ShareModel`] is one replica of a shared folder. It owns the share's
//! event log, the materialized item tree, membership, pending invitations
//! and the downloads in flight, all behind a single lock that is never held
//! across an `.await`.
//!
//! Local mutations become signed events on top of the current head. Remote
//! events are validated against the node's [`TrustContext`] and stored even
//! when they cannot be applied yet; an event that does not extend the head
//! triggers a full replay in deterministic order, which is what makes all
//! replicas converge.
//!
//! Synchronization with a peer is driven by the per-issuer heads exchanged
//! in `SYNC` (a request) and `SYNC_NOTIFY` (an announcement):
//!
//! | peer's head for a line | on `SYNC`                     | on `SYNC_NOTIFY`              |
//! |------------------------|-------------------------------|-------------------------------|
//! | our own last event     | nothing                       | nothing                       |
//! | an earlier event       | send what follows             | send what follows             |
//! | unknown to us          | wait                          | send our own `SYNC`           |
//! | empty                  | send the whole line           | send the whole line           |
//! | line we do not have    | ask for it with an empty head | ask for it with an empty head |
//!
//! Lines the peer did not mention are sent whole. A peer is asked for a
//! given line at most once a minute unless it reconnects.

use base64::prelude::*;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthManager;
use crate::downloader::DataDownloader;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::event_log::EventLog;
use crate::identity::{Identity, LocalIdentity};
use crate::ids::{ContentId, EventId, ItemId, ShareId, UserId};
use crate::invite::Invite;
use crate::storage::BlobStore;
use crate::transport::ShareTransport;
use crate::tree::{ContentChange, Item, ItemTree, Revision};
use crate::trust::TrustContext;
use crate::uploader::DataUploader;
use crate::wire::{event_batches, DataRange, Message, StreamHeader};

const CHANGE_CHANNEL: usize = 256;

/// A peer is asked for the same unknown chain at most this often.
const ASK_AGAIN: Duration = Duration::from_secs(60);

/// Everything a share needs from its node.
#[derive(Clone)]
pub struct ShareContext {
    pub local: Arc<LocalIdentity>,
    pub trust: Arc<TrustContext>,
    pub store: Arc<dyn BlobStore>,
    pub transport: Arc<dyn ShareTransport>,
    pub bandwidth: Arc<BandwidthManager>,
    /// Directory for `<share>.json`; `None` keeps the share in memory.
    pub dir: Option<PathBuf>,
}

/// Notifications published by a share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareEvent {
    /// New events were applied; `head` is the new head.
    Changed { head: EventId },
    /// The tree was rebuilt from the whole log.
    Reset,
    MemberAdded(UserId),
    MemberRemoved(UserId),
    InviteAnswered { user: UserId, accepted: bool },
    DownloadComplete(ContentId),
}

struct ShareState {
    name: String,
    created: DateTime<Utc>,
    log: EventLog,
    tree: ItemTree,
    members: BTreeMap<UserId, Identity>,
    invites: HashMap<UserId, Invite>,
    /// Peers we sync with before they show up as members
    sync_peers: HashMap<UserId, Identity>,
    downloads: HashMap<ContentId, Arc<DataDownloader>>,
    /// Key the local user last signed with in this share
    last_key: Option<String>,
    /// When a peer was last asked for a whole chain, keyed by (peer, issuer)
    asked: HashMap<(UserId, UserId), Instant>,
}

struct MemberChanges {
    added: Vec<Identity>,
    removed: Vec<UserId>,
}

impl MemberChanges {
    fn between(before: &BTreeMap<UserId, Identity>, after: &BTreeMap<UserId, Identity>) -> Self {
        Self {
            added: after
                .iter()
                .filter(|(user, _)| !before.contains_key(*user))
                .map(|(_, identity)| identity.clone())
                .collect(),
            removed: before.keys().filter(|user| !after.contains_key(*user)).cloned().collect(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ShareFile {
    id: ShareId,
    name: String,
    created: DateTime<Utc>,
    #[serde(default)]
    last_key: Option<String>,
    events: Vec<String>,
    #[serde(default)]
    invites: Vec<InviteEntry>,
    #[serde(default)]
    sync_peers: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct InviteEntry {
    identity: String,
    greeting: String,
    created: DateTime<Utc>,
}

pub struct ShareModel {
    id: ShareId,
    ctx: ShareContext,
    state: Mutex<ShareState>,
    changes: broadcast::Sender<ShareEvent>,
}

impl std::fmt::Debug for ShareModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareModel").field("id", &self.id).finish()
    }
}

impl ShareModel {
    fn new(id: ShareId, name: &str, created: DateTime<Utc>, ctx: ShareContext) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL);
        let last_key = Some(ctx.local.key_id().to_string());
        Self {
            id,
            ctx,
            state: Mutex::new(ShareState {
                name: name.to_string(),
                created,
                log: EventLog::new(),
                tree: ItemTree::new(),
                members: BTreeMap::new(),
                invites: HashMap::new(),
                sync_peers: HashMap::new(),
                downloads: HashMap::new(),
                last_key,
                asked: HashMap::new(),
            }),
            changes,
        }
    }

    /// Start a new share owned by the local user. Its first events admit
    /// the local user and create the root folder.
    pub fn create(ctx: ShareContext, name: &str) -> Result<Arc<Self>> {
        let id = ShareId::generate(ctx.local.user_id());
        let share = Arc::new(Self::new(id, name, Utc::now(), ctx));
        let me = share.ctx.local.identity().clone();
        share.issue(None, EventKind::AddUser { info: me })?;
        share.issue(
            Some(ItemId::generate()),
            EventKind::CreateFolder {
                parent: None,
                name: name.to_string(),
                modified: Utc::now(),
            },
        )?;
        info!("Created share '{}' ({})", name, share.id);
        Ok(share)
    }

    /// An empty replica of a share someone else created, filled by syncing.
    pub fn attach(ctx: ShareContext, id: ShareId, name: &str) -> Arc<Self> {
        info!("Attached share '{}' ({})", name, id);
        let share = Arc::new(Self::new(id, name, Utc::now(), ctx));
        share.save();
        share
    }

    /// Where a share is persisted inside `dir`.
    pub fn file_path(dir: &Path, id: &ShareId) -> PathBuf {
        dir.join(format!("{}.json", id.as_str().replace(':', "_")))
    }

    /// Load a share saved by [`flush`](Self::flush) and replay its log.
    pub fn load(ctx: ShareContext, path: &Path) -> Result<Arc<Self>> {
        let file: ShareFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        let share = Self::new(file.id, &file.name, file.created, ctx);
        {
            let mut state = share.state.lock();
            state.last_key = file.last_key;
            for raw in &file.events {
                let event = BASE64_STANDARD
                    .decode(raw)
                    .map_err(|e| Error::malformed(format!("invalid event encoding: {}", e)))
                    .and_then(|bytes| Event::parse(&bytes));
                match event {
                    Ok(event) => {
                        state.log.insert(event);
                    }
                    Err(e) => warn!("Dropping stored event of {}: {}", share.id, e),
                }
            }
            for entry in file.invites {
                match Identity::from_armored(&entry.identity) {
                    Ok(invitee) => {
                        let mut invite = Invite::new(share.id.clone(), invitee, entry.greeting);
                        invite.created = entry.created;
                        state.invites.insert(invite.invitee.user_id().clone(), invite);
                    }
                    Err(e) => warn!("Dropping stored invite of {}: {}", share.id, e),
                }
            }
            for text in file.sync_peers {
                match Identity::from_armored(&text) {
                    Ok(peer) => {
                        state.sync_peers.insert(peer.user_id().clone(), peer);
                    }
                    Err(e) => warn!("Dropping stored sync peer of {}: {}", share.id, e),
                }
            }
            share.replay(&mut state);
            debug!(
                "Loaded share {} with {} events and {} members",
                share.id,
                state.log.len(),
                state.members.len()
            );
        }
        Ok(Arc::new(share))
    }

    /// Write the share to its file, if it has one.
    pub fn flush(&self) -> Result<()> {
        let Some(dir) = &self.ctx.dir else {
            return Ok(());
        };
        let file = {
            let state = self.state.lock();
            ShareFile {
                id: self.id.clone(),
                name: state.name.clone(),
                created: state.created,
                last_key: state.last_key.clone(),
                events: state
                    .log
                    .events()
                    .into_iter()
                    .map(|event| event.to_bytes().map(|bytes| BASE64_STANDARD.encode(bytes)))
                    .collect::<Result<Vec<_>>>()?,
                invites: state
                    .invites
                    .values()
                    .map(|invite| InviteEntry {
                        identity: invite.invitee.to_armored(),
                        greeting: invite.greeting.clone(),
                        created: invite.created,
                    })
                    .collect(),
                sync_peers: state.sync_peers.values().map(Identity::to_armored).collect(),
            }
        };
        std::fs::create_dir_all(dir)?;
        let path = Self::file_path(dir, &self.id);
        let temp = path.with_extension("json.tmp");
        std::fs::write(&temp, serde_json::to_string_pretty(&file)?)?;
        std::fs::rename(&temp, &path)?;
        Ok(())
    }

    fn save(&self) {
        if let Err(e) = self.flush() {
            warn!("Failed to save share {}: {}", self.id, e);
        }
    }

    pub fn id(&self) -> &ShareId {
        &self.id
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.state.lock().created
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.changes.subscribe()
    }

    fn publish(&self, event: ShareEvent) {
        // Nobody listening is fine
        let _ = self.changes.send(event);
    }

    pub fn members(&self) -> Vec<Identity> {
        self.state.lock().members.values().cloned().collect()
    }

    pub fn is_member(&self, user: &UserId) -> bool {
        self.state.lock().members.contains_key(user)
    }

    pub fn pending_invites(&self) -> Vec<Invite> {
        self.state.lock().invites.values().cloned().collect()
    }

    pub fn sync_peers(&self) -> Vec<UserId> {
        self.state.lock().sync_peers.keys().cloned().collect()
    }

    pub fn head(&self) -> EventId {
        self.state.lock().log.head().clone()
    }

    pub fn frontier(&self) -> BTreeMap<UserId, EventId> {
        self.state.lock().log.frontier()
    }

    pub fn event_count(&self) -> usize {
        self.state.lock().log.len()
    }

    /// Every event in the log, sorted by id, as signed bytes.
    pub fn export_events(&self) -> Result<Vec<Bytes>> {
        self.state
            .lock()
            .log
            .events()
            .into_iter()
            .map(|event| event.to_bytes().map(Bytes::from))
            .collect()
    }

    pub fn root(&self) -> Option<Item> {
        self.state.lock().tree.root().cloned()
    }

    pub fn item(&self, id: &ItemId) -> Option<Item> {
        self.state.lock().tree.get(id).cloned()
    }

    pub fn find(&self, path: &str) -> Option<Item> {
        self.state.lock().tree.find_by_path(path).cloned()
    }

    pub fn children(&self, folder: &ItemId) -> Vec<Item> {
        self.state.lock().tree.children(folder).into_iter().cloned().collect()
    }

    pub fn revisions(&self, item: &ItemId) -> Vec<Revision> {
        self.state.lock().tree.revisions(item).to_vec()
    }

    /// The whole tree keyed by path.
    pub fn listing(&self) -> BTreeMap<String, Item> {
        self.state.lock().tree.listing()
    }

    /// The event DAG in replay order, one line per event, indented by
    /// depth. Events whose parent is missing are listed at the end.
    pub fn print_log(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut depth: HashMap<&EventId, usize> = HashMap::new();
        let mut lines = Vec::new();
        for event in state.log.replay_order() {
            let level = if event.parent().is_root() {
                0
            } else {
                depth.get(event.parent()).map(|d| d + 1).unwrap_or(0)
            };
            depth.insert(event.id(), level);
            let marker = if event.id() == state.log.head() { "*" } else { " " };
            lines.push(format!("{}{}{}", marker, "  ".repeat(level), event));
        }
        let unreachable = state.log.unreachable();
        if unreachable > 0 {
            lines.push(format!("({} events waiting for their parent)", unreachable));
        }
        lines
    }

    pub fn downloads_in_flight(&self) -> usize {
        self.state.lock().downloads.len()
    }

    // ---- Local mutations ----

    /// Sign `kind` on top of the head, apply and store it, then tell the
    /// other members.
    fn issue(&self, item: Option<ItemId>, kind: EventKind) -> Result<Event> {
        let local = &self.ctx.local;
        let (event, changes) = {
            let mut state = self.state.lock();
            let before = state.members.clone();
            if state.last_key.as_deref() != Some(local.key_id()) {
                if state.members.contains_key(local.user_id()) {
                    let announce = Event::issue(
                        local,
                        state.log.head().clone(),
                        None,
                        EventKind::AddUserKey {
                            info: local.identity().clone(),
                        },
                    )?;
                    self.append_local(&mut state, announce)?;
                    info!("Announced key {} in share {}", local.key_id(), self.id);
                }
                state.last_key = Some(local.key_id().to_string());
            }
            let event = Event::issue(local, state.log.head().clone(), item, kind)?;
            self.append_local(&mut state, event.clone())?;
            let changes = MemberChanges::between(&before, &state.members);
            (event, changes)
        };
        debug!("Issued {} in share {}", event, self.id);
        self.after_change(changes, None, false);
        Ok(event)
    }

    fn append_local(&self, state: &mut ShareState, event: Event) -> Result<()> {
        self.apply(state, &event, true)?;
        state.log.set_head(event.id().clone());
        state.log.insert(event);
        Ok(())
    }

    fn existing_folder(&self, parent: Option<&ItemId>) -> Result<Option<ItemId>> {
        let Some(parent) = parent else {
            return Ok(None);
        };
        match self.state.lock().tree.get(parent) {
            Some(item) if item.is_folder() => Ok(Some(parent.clone())),
            Some(_) => Err(Error::inconsistency(format!("{} is not a folder", parent))),
            None => Err(Error::inconsistency(format!("no folder {}", parent))),
        }
    }

    /// Create a folder below `parent`, or below the root when `None`.
    pub fn create_folder(&self, parent: Option<&ItemId>, name: &str) -> Result<ItemId> {
        if name.is_empty() {
            return Err(Error::config("folder name must not be empty"));
        }
        let parent = self.existing_folder(parent)?;
        let id = ItemId::generate();
        self.issue(
            Some(id.clone()),
            EventKind::CreateFolder {
                parent,
                name: name.to_string(),
                modified: Utc::now(),
            },
        )?;
        Ok(id)
    }

    /// Create an empty file below `parent`, or below the root when `None`.
    pub fn create_file(&self, parent: Option<&ItemId>, name: &str) -> Result<ItemId> {
        if name.is_empty() {
            return Err(Error::config("file name must not be empty"));
        }
        let parent = self.existing_folder(parent)?;
        let id = ItemId::generate();
        self.issue(
            Some(id.clone()),
            EventKind::CreateFile {
                parent,
                name: name.to_string(),
                modified: Utc::now(),
            },
        )?;
        Ok(id)
    }

    fn set_content(&self, item: &ItemId, content: ContentId, content_type: &str) -> Result<()> {
        self.issue(
            Some(item.clone()),
            EventKind::UpdateFile {
                content,
                content_type: content_type.to_string(),
                modified: Utc::now(),
            },
        )?;
        Ok(())
    }

    /// Store `data` and make it the new content of `item`.
    pub async fn update_file(&self, item: &ItemId, data: &[u8], content_type: &str) -> Result<ContentId> {
        let content = self.ctx.store.store(data).await?;
        self.set_content(item, content.clone(), content_type)?;
        Ok(content)
    }

    /// Copy a local file into the share below `parent`.
    pub async fn put_file(&self, parent: Option<&ItemId>, path: &Path) -> Result<ItemId> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::config(format!("no file name in {}", path.display())))?
            .to_string();
        let content = self.ctx.store.store_file(path).await?;
        let item = self.create_file(parent, &name)?;
        self.set_content(&item, content, content_type_for(&name))?;
        info!("Added {} to share {}", name, self.id);
        Ok(item)
    }

    /// Move and/or rename an item.
    pub fn move_item(&self, item: &ItemId, parent: Option<&ItemId>, name: &str) -> Result<()> {
        let parent = self.existing_folder(parent)?;
        self.issue(
            Some(item.clone()),
            EventKind::Move {
                parent,
                name: name.to_string(),
                modified: Utc::now(),
            },
        )?;
        Ok(())
    }

    pub fn delete_item(&self, item: &ItemId) -> Result<()> {
        self.issue(Some(item.clone()), EventKind::Delete)?;
        Ok(())
    }

    /// Issue a `REMOVE_USER` for a member.
    pub fn remove_user(&self, user: &UserId) -> Result<()> {
        let info = self
            .state
            .lock()
            .members
            .get(user)
            .cloned()
            .ok_or_else(|| Error::config(format!("{} is not a member of {}", user, self.id)))?;
        self.issue(None, EventKind::RemoveUser { info })?;
        Ok(())
    }

    // ---- Applying events ----

    /// Apply one event to the materialized state. Blob references only
    /// change when `track_content` is set; replays settle them at the end.
    fn apply(&self, state: &mut ShareState, event: &Event, track_content: bool) -> Result<()> {
        match event.kind() {
            EventKind::AddUser { info } => {
                self.ctx.trust.add_key(info);
                let user = info.user_id().clone();
                state.invites.remove(&user);
                state.sync_peers.remove(&user);
                state.members.insert(user, info.clone());
            }
            EventKind::AddUserKey { info } => {
                self.ctx.trust.add_key(info);
                state.members.insert(info.user_id().clone(), info.clone());
            }
            EventKind::RemoveUser { info } => {
                state.members.remove(info.user_id());
            }
            _ => {
                let issuer = event
                    .issuer()
                    .ok_or_else(|| Error::malformed(format!("event {} has no issuer", event.id())))?;
                let changes = state.tree.apply(event, &issuer)?;
                if track_content {
                    for change in changes {
                        match change {
                            ContentChange::Acquire(content) => self.ctx.store.acquire(&content),
                            ContentChange::Release(content) => self.ctx.store.release(&content),
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Rebuild tree and membership from the whole log.
    fn replay(&self, state: &mut ShareState) {
        let held = state.tree.contents();
        state.tree.clear();
        state.members.clear();

        let order: Vec<Event> = state.log.replay_order().into_iter().cloned().collect();
        let mut head = EventId::root();
        for event in &order {
            if let Err(e) = self.apply(state, event, false) {
                debug!("Skipping {} in {}: {}", event, self.id, e);
            }
            head = event.id().clone();
        }
        state.log.set_head(head);

        // Take the new references before dropping the old ones so nothing
        // still in use looks unused in between.
        for content in state.tree.contents() {
            self.ctx.store.acquire(&content);
        }
        for content in held {
            self.ctx.store.release(&content);
        }
        debug!(
            "Replayed {} events of {} ({} unreachable)",
            order.len(),
            self.id,
            state.log.len() - order.len()
        );
    }

    /// Check an incoming event's signature and signer.
    fn validate(&self, state: &ShareState, event: &Event) -> Result<()> {
        let issuer = event
            .issuer()
            .ok_or_else(|| Error::malformed(format!("event {} has no issuer", event.id())))?;

        if let EventKind::AddUserKey { info } = event.kind() {
            if info.user_id() != &issuer {
                return Err(Error::authentication(format!(
                    "{} announces a key for {}",
                    issuer,
                    info.user_id()
                )));
            }
            if !state.members.contains_key(&issuer) {
                return Err(Error::trust(format!("{} is not a member of {}", issuer, self.id)));
            }
            if !self.ctx.trust.is_trusted(info) {
                return Err(Error::trust(format!("new key of {} is not trusted", issuer)));
            }
            if info.key_id() != event.signer_id() || !info.verify(event.record()) {
                return Err(Error::authentication(format!(
                    "key announcement of {} not signed by the new key",
                    issuer
                )));
            }
            return Ok(());
        }

        match self.ctx.trust.signer_of(event.record()) {
            Ok(signer) if signer.user_id() == &issuer => Ok(()),
            Ok(signer) => Err(Error::authentication(format!(
                "event {} signed by {}",
                event.id(),
                signer.user_id()
            ))),
            Err(Error::Trust(reason)) => {
                if self.is_creator_introduction(event, &issuer) {
                    Ok(())
                } else {
                    Err(Error::Trust(reason))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// The share id names its creator. A key-only identity whose user id
    /// is that name may admit itself.
    fn is_creator_introduction(&self, event: &Event, issuer: &UserId) -> bool {
        let EventKind::AddUser { info } = event.kind() else {
            return false;
        };
        self.id.creator().as_ref() == Some(issuer)
            && info.user_id() == issuer
            && info.user_id().as_str() == info.key_id()
            && info.key_id() == event.signer_id()
            && info.verify(event.record())
    }

    /// Import received events. Returns how many were new. Events failing
    /// the trust check are retried within the batch while others make
    /// progress, since an earlier event may introduce the signer.
    pub fn import_events(&self, raw: &[Bytes], source: Option<&UserId>) -> usize {
        let mut pending: Vec<Event> = Vec::with_capacity(raw.len());
        for bytes in raw {
            match Event::parse(bytes) {
                Ok(event) => pending.push(event),
                Err(e) => warn!("Dropping malformed event for {}: {}", self.id, e),
            }
        }

        let (added, reset, changes) = {
            let mut state = self.state.lock();
            let before = state.members.clone();
            let mut added = 0;
            let mut reset = false;
            let mut replayed = false;
            loop {
                let mut deferred = Vec::new();
                let mut progress = false;
                for event in pending {
                    if state.log.contains(event.id()) {
                        continue;
                    }
                    match self.validate(&state, &event) {
                        Ok(()) => {
                            if let EventKind::AddUser { info } | EventKind::AddUserKey { info } = event.kind() {
                                self.ctx.trust.add_key(info);
                            }
                            progress = true;
                            added += 1;
                            if !reset
                                && event.parent_is(state.log.head())
                                && state.log.children(event.id()).next().is_none()
                            {
                                if let Err(e) = self.apply(&mut state, &event, true) {
                                    debug!("Skipping {} in {}: {}", event, self.id, e);
                                }
                                state.log.set_head(event.id().clone());
                            } else {
                                reset = true;
                            }
                            state.log.insert(event);
                        }
                        Err(Error::Trust(reason)) => {
                            debug!("Deferring {}: {}", event, reason);
                            deferred.push(event);
                        }
                        Err(e) => warn!("Rejected {} for {}: {}", event, self.id, e),
                    }
                }
                if deferred.is_empty() {
                    break;
                }
                if !progress {
                    for event in &deferred {
                        warn!("Rejected {} for {}: signer not trusted", event, self.id);
                    }
                    break;
                }
                // Membership decides the retries, so bring it up to date
                if reset {
                    self.replay(&mut state);
                    reset = false;
                    replayed = true;
                }
                pending = deferred;
            }
            if reset {
                self.replay(&mut state);
                replayed = true;
            }
            let changes = MemberChanges::between(&before, &state.members);
            (added, replayed, changes)
        };

        if added > 0 {
            debug!("Imported {} events into {}", added, self.id);
            self.after_change(changes, source, reset);
        }
        added
    }

    fn after_change(&self, changes: MemberChanges, source: Option<&UserId>, reset: bool) {
        let local = self.ctx.local.user_id();
        for identity in &changes.added {
            if identity.user_id() != local {
                self.ctx.transport.add_contact(identity, &self.id);
            }
            self.publish(ShareEvent::MemberAdded(identity.user_id().clone()));
        }
        for user in &changes.removed {
            if user != local {
                self.ctx.transport.remove_contact(user, &self.id);
            }
            self.publish(ShareEvent::MemberRemoved(user.clone()));
        }
        if reset {
            self.publish(ShareEvent::Reset);
        }
        self.publish(ShareEvent::Changed { head: self.head() });
        self.notify_peers(source);
        self.save();
    }

    // ---- Sync ----

    fn heads(state: &ShareState) -> Vec<(UserId, EventId)> {
        state.log.frontier().into_iter().collect()
    }

    fn sync_targets(&self, state: &ShareState) -> Vec<UserId> {
        let local = self.ctx.local.user_id();
        let mut targets: Vec<UserId> = state
            .members
            .keys()
            .chain(state.sync_peers.keys())
            .filter(|user| *user != local)
            .cloned()
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Announce our heads to every member and sync peer but `except`.
    fn notify_peers(&self, except: Option<&UserId>) {
        let (heads, targets) = {
            let state = self.state.lock();
            (Self::heads(&state), self.sync_targets(&state))
        };
        for peer in targets.iter().filter(|peer| Some(*peer) != except) {
            let message = Message::SyncNotify {
                share: self.id.clone(),
                heads: heads.clone(),
            };
            if !self.ctx.transport.send_to_user(peer, message, false, false) {
                debug!("No path to {} for a sync notification", peer);
            }
        }
    }

    /// Ask `peer` for everything after our heads.
    pub fn request_sync(&self, peer: &UserId) -> bool {
        let heads = Self::heads(&self.state.lock());
        self.ctx.transport.send_to_user(
            peer,
            Message::Sync {
                share: self.id.clone(),
                heads,
            },
            false,
            false,
        )
    }

    /// Sync with a peer that is not (yet) a member, e.g. an inviter after
    /// we accepted an invitation to a share we already have.
    pub fn sync_with(&self, peer: &Identity) {
        let user = peer.user_id();
        if user == self.ctx.local.user_id() {
            return;
        }
        {
            let mut state = self.state.lock();
            if !state.members.contains_key(user) {
                state.sync_peers.insert(user.clone(), peer.clone());
            }
        }
        self.ctx.transport.add_contact(peer, &self.id);
        if !self.request_sync(user) {
            debug!("{} unreachable for now, will sync when online", user);
        }
        self.save();
    }

    fn handle_sync(&self, from: &UserId, heads: Vec<(UserId, EventId)>, notify: bool) {
        let (outgoing, reply) = {
            let mut state = self.state.lock();
            let frontier = state.log.frontier();
            let mut send: HashSet<EventId> = HashSet::new();
            let mut wanted = Vec::new();
            let mut behind = false;
            let mut mentioned = HashSet::new();

            for (issuer, head) in &heads {
                mentioned.insert(issuer);
                match frontier.get(issuer) {
                    None => {
                        if !head.is_root() {
                            wanted.push((issuer.clone(), EventId::root()));
                        }
                    }
                    Some(last) if last == head => {}
                    Some(_) => match state.log.line_after(issuer, head) {
                        Some(events) => send.extend(events.into_iter().map(|e| e.id().clone())),
                        None => behind = true,
                    },
                }
            }
            for issuer in frontier.keys().filter(|issuer| !mentioned.contains(issuer)) {
                if let Some(events) = state.log.line_after(issuer, &EventId::root()) {
                    send.extend(events.into_iter().map(|e| e.id().clone()));
                }
            }

            let outgoing: Vec<Event> = state
                .log
                .replay_order()
                .into_iter()
                .filter(|event| send.contains(event.id()))
                .cloned()
                .collect();

            let now = Instant::now();
            state.asked.retain(|_, at| now.duration_since(*at) < ASK_AGAIN);
            wanted.retain(|(issuer, _)| {
                let key = (from.clone(), issuer.clone());
                if state.asked.contains_key(&key) {
                    return false;
                }
                state.asked.insert(key, now);
                true
            });
            if behind && !notify {
                debug!("{} is ahead of us in {}, waiting for it", from, self.id);
            }
            // Chains we have never seen are asked for from the start
            let reply = if (notify && behind) || !wanted.is_empty() {
                let mut ask = Self::heads(&state);
                ask.extend(wanted);
                Some(ask)
            } else {
                None
            };
            (outgoing, reply)
        };

        if !outgoing.is_empty() {
            debug!("Sending {} events of {} to {}", outgoing.len(), self.id, from);
            self.send_events(from, &outgoing);
        }
        if let Some(heads) = reply {
            let message = Message::Sync {
                share: self.id.clone(),
                heads,
            };
            self.ctx.transport.send_to_user(from, message, false, false);
        }
    }

    fn send_events(&self, to: &UserId, events: &[Event]) {
        let mut raw = Vec::with_capacity(events.len());
        for event in events {
            match event.to_bytes() {
                Ok(bytes) => raw.push(Bytes::from(bytes)),
                Err(e) => warn!("Cannot encode {}: {}", event, e),
            }
        }
        for message in event_batches(&self.id, raw) {
            if !self.ctx.transport.send_to_user(to, message, false, false) {
                debug!("Lost the path to {} while sending events", to);
                break;
            }
        }
    }

    // ---- Invitations ----

    /// Invite `invitee`. The invitation is sent as soon as the invitee is
    /// reachable and again whenever it comes back online until answered.
    pub fn invite_user(&self, invitee: &Identity, greeting: &str) -> Result<()> {
        let user = invitee.user_id();
        if user == self.ctx.local.user_id() {
            return Err(Error::config("cannot invite yourself"));
        }
        {
            let mut state = self.state.lock();
            if state.members.contains_key(user) {
                return Err(Error::config(format!("{} is already a member of {}", invitee, self.id)));
            }
            state
                .invites
                .insert(user.clone(), Invite::new(self.id.clone(), invitee.clone(), greeting));
        }
        self.ctx.trust.add_contact(invitee);
        self.ctx.transport.add_contact(invitee, &self.id);
        info!("Invited {} to {}", invitee, self.id);
        self.send_invite(user);
        self.save();
        Ok(())
    }

    fn send_invite(&self, user: &UserId) -> bool {
        let message = {
            let state = self.state.lock();
            let Some(invite) = state.invites.get(user) else {
                return false;
            };
            Message::Invite {
                share: self.id.clone(),
                name: state.name.clone(),
                greeting: invite.greeting.clone(),
            }
        };
        if !self.ctx.transport.is_online(user) {
            debug!("{} is offline, invitation to {} stays pending", user, self.id);
            return false;
        }
        let sent = self.ctx.transport.send_to_user(user, message, false, false);
        if sent {
            if let Some(invite) = self.state.lock().invites.get_mut(user) {
                invite.sent = true;
            }
        }
        sent
    }

    fn handle_invite_response(&self, from: &UserId, accept: bool) {
        let Some(invite) = self.state.lock().invites.remove(from) else {
            debug!("Answer from {} to {} without a pending invitation", from, self.id);
            return;
        };
        self.publish(ShareEvent::InviteAnswered {
            user: from.clone(),
            accepted: accept,
        });
        if accept {
            info!("{} accepted the invitation to {}", invite.invitee, self.id);
            if let Err(e) = self.issue(None, EventKind::AddUser { info: invite.invitee }) {
                warn!("Failed to add {} to {}: {}", from, self.id, e);
            }
        } else {
            info!("{} declined the invitation to {}", invite.invitee, self.id);
            self.save();
        }
    }

    // ---- Data ----

    fn reachable_peers(&self) -> Vec<UserId> {
        let targets = self.sync_targets(&self.state.lock());
        targets
            .into_iter()
            .filter(|peer| self.ctx.transport.is_online(peer))
            .collect()
    }

    fn query(&self, peers: &[UserId], content: &ContentId, start: u64, finish: u64) -> bool {
        let mut sent = false;
        for peer in peers {
            let message = Message::DataQuery(DataRange {
                share: self.id.clone(),
                content: content.clone(),
                start,
                finish,
            });
            sent |= self.ctx.transport.send_to_user(peer, message, false, false);
        }
        sent
    }

    fn downloader(&self, content: &ContentId) -> Arc<DataDownloader> {
        self.state
            .lock()
            .downloads
            .entry(content.clone())
            .or_insert_with(|| Arc::new(DataDownloader::new(content.clone(), self.ctx.store.clone())))
            .clone()
    }

    fn finish_download(&self, content: &ContentId) {
        if self.state.lock().downloads.remove(content).is_some() {
            self.publish(ShareEvent::DownloadComplete(content.clone()));
        }
    }

    /// Bytes `[start, finish)` of a blob, downloading from the other
    /// members when it is not stored locally.
    pub async fn get_data_stream(&self, content: &ContentId, start: u64, finish: u64) -> Result<Bytes> {
        if start > finish || finish > content.length() {
            return Err(Error::storage(format!(
                "range {}..{} outside of {}",
                start, finish, content
            )));
        }
        if self.ctx.store.has_data(content) {
            return self.ctx.store.read_range(content, start, finish).await;
        }
        let download = self.downloader(content);
        if content.length() == 0 {
            download.complete_empty().await?;
            self.finish_download(content);
            return Ok(Bytes::new());
        }

        let peers = self.reachable_peers();
        download.request_data(start, finish, |s, f| self.query(&peers, content, s, f));
        let data = download.read_range(start, finish).await?;
        if download.is_complete() {
            self.finish_download(content);
        }
        Ok(data)
    }

    /// Current content of a file.
    pub async fn read_file(&self, item: &ItemId) -> Result<Bytes> {
        let item = self
            .item(item)
            .ok_or_else(|| Error::inconsistency(format!("no item {}", item)))?;
        match item.content() {
            Some(content) => self.get_data_stream(content, 0, content.length()).await,
            None if item.is_folder() => Err(Error::inconsistency(format!("{} is a folder", item.name))),
            None => Ok(Bytes::new()),
        }
    }

    fn valid_range(range: &DataRange) -> bool {
        range.start < range.finish && range.finish <= range.content.length()
    }

    fn handle_query(&self, from: &UserId, range: DataRange) {
        if !Self::valid_range(&range) || !self.ctx.store.has_data(&range.content) {
            return;
        }
        debug!("Confirming {}..{} of {} to {}", range.start, range.finish, range.content, from);
        self.ctx
            .transport
            .send_to_user(from, Message::DataResponse(range), false, false);
    }

    fn handle_response(&self, from: &UserId, range: DataRange) {
        let download = self.state.lock().downloads.get(&range.content).cloned();
        let Some(download) = download else {
            return;
        };
        download.process_response(range.start, range.finish, |start, finish| {
            let request = Message::DataRequest(DataRange {
                share: self.id.clone(),
                content: range.content.clone(),
                start,
                finish,
            });
            self.ctx.transport.send_to_user(from, request, false, false)
        });
    }

    fn handle_request(&self, from: &UserId, range: DataRange) {
        if !Self::valid_range(&range) || !self.ctx.store.has_data(&range.content) {
            debug!("Cannot serve {} to {}", range.content, from);
            return;
        }
        let uploader = DataUploader::new(
            from.clone(),
            self.ctx.local.user_id().clone(),
            self.id.clone(),
            range.content,
            range.start,
            range.finish,
        );
        let store = self.ctx.store.clone();
        let transport = self.ctx.transport.clone();
        let bandwidth = self.ctx.bandwidth.clone();
        let peer = from.clone();
        tokio::spawn(async move {
            if let Err(e) = uploader.run(store.as_ref(), transport.as_ref(), &bandwidth).await {
                warn!("Upload to {} failed: {}", peer, e);
            }
        });
    }

    async fn data_got(&self, content: &ContentId, pos: u64, data: &[u8]) {
        let download = self.state.lock().downloads.get(content).cloned();
        let Some(download) = download else {
            debug!("Dropping unexpected data for {}", content);
            return;
        };
        self.ctx.bandwidth.request_download_quota(data.len() as u64).await;
        if let Err(e) = download.data_got(pos, data).await {
            warn!("Failed to store data of {}: {}", content, e);
            let peers = self.reachable_peers();
            download.requery(|s, f| self.query(&peers, content, s, f));
        }
        if download.is_complete() {
            self.finish_download(content);
        }
    }

    // ---- Network events ----

    /// A share message from `from`, already routed by share id.
    pub async fn handle_message(&self, from: &UserId, message: Message) {
        let (participant, invitee) = {
            let state = self.state.lock();
            (
                state.members.contains_key(from) || state.sync_peers.contains_key(from),
                state.invites.contains_key(from),
            )
        };
        let allowed = participant || (invitee && matches!(message, Message::InviteResponse { .. }));
        if !allowed {
            warn!("Ignoring {} from {} who is not part of {}", message.kind(), from, self.id);
            return;
        }

        match message {
            Message::Sync { heads, .. } => self.handle_sync(from, heads, false),
            Message::SyncNotify { heads, .. } => self.handle_sync(from, heads, true),
            Message::Event { events, .. } => {
                self.import_events(&events, Some(from));
            }
            Message::DataQuery(range) => self.handle_query(from, range),
            Message::DataResponse(range) => self.handle_response(from, range),
            Message::DataRequest(range) => self.handle_request(from, range),
            Message::DataBlock { range, data } => {
                self.data_got(&range.content, range.start, &data).await;
            }
            Message::InviteResponse { accept, .. } => self.handle_invite_response(from, accept),
            other => debug!("Share {} ignores {}", self.id, other.kind()),
        }
    }

    /// A slice of a stream session carrying blob data.
    pub async fn stream_data(&self, header: &StreamHeader, offset: u64, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let known = {
            let state = self.state.lock();
            state.members.contains_key(&header.from) || state.sync_peers.contains_key(&header.from)
        };
        if !known {
            warn!("Ignoring stream from {} who is not part of {}", header.from, self.id);
            return;
        }
        self.data_got(&header.content, header.start + offset, &data).await;
    }

    /// Retry what was waiting for `user` to come online.
    pub fn contact_status_changed(&self, user: &UserId, online: bool) {
        if !online {
            return;
        }
        let (invited, participant, downloads) = {
            let mut state = self.state.lock();
            state.asked.retain(|(peer, _), _| peer != user);
            (
                state.invites.contains_key(user),
                state.members.contains_key(user) || state.sync_peers.contains_key(user),
                state.downloads.values().cloned().collect::<Vec<_>>(),
            )
        };
        if invited {
            self.send_invite(user);
        }
        if participant {
            let heads = Self::heads(&self.state.lock());
            self.ctx.transport.send_to_user(
                user,
                Message::SyncNotify {
                    share: self.id.clone(),
                    heads,
                },
                false,
                false,
            );
            let peers = [user.clone()];
            for download in downloads {
                download.resend_queries(|s, f| self.query(&peers, download.content(), s, f));
            }
        }
    }

    /// Register everyone we talk to with the connection manager again.
    pub fn register_contacts(&self) {
        let identities: Vec<Identity> = {
            let state = self.state.lock();
            state
                .members
                .values()
                .chain(state.sync_peers.values())
                .chain(state.invites.values().map(|invite| &invite.invitee))
                .filter(|identity| identity.user_id() != self.ctx.local.user_id())
                .cloned()
                .collect()
        };
        for identity in &identities {
            self.ctx.transport.add_contact(identity, &self.id);
        }
    }

    pub fn lookup_state_changed(&self, online: bool) {
        if online {
            self.register_contacts();
        }
    }
}

/// Content type from a file name's extension.
pub fn content_type_for(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("txt") | Some("md") => "text/plain",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
