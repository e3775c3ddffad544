//! # Connection Manager
//!
//! Owns every connection of a node: direct links to contacts, accepted
//! incoming peers and the links to lookup servers. It decides which path a
//! message takes, relays what arrives to the [`Dispatcher`] and keeps lost
//! links coming back through a delay-queue reconnect scheduler.
//!
//! Paths to a contact, in order of preference:
//!
//! 1. a direct connection
//! 2. a `FORWARD` through a lookup server that reported the contact online
//! 3. with blind delivery, a `FORWARD` through every connected lookup server
//!
//! A blind send puts one copy of a message on every lookup link; only the
//! first copy to arrive is handed on.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::connection::{ConnId, ConnectionEvent, PeerConnection};
use crate::error::{Error, Result};
use crate::handshake::{authenticate, HandshakeOptions, STEP_TIMEOUT};
use crate::identity::{Identity, LocalIdentity};
use crate::ids::{ShareId, UserId};
use crate::transport::ShareTransport;
use crate::trust::TrustContext;
use crate::wire::{FrameCodec, Message, StreamHeader};

/// Retry delays for direct peer links, in seconds.
pub const PEER_RECONNECT: [u64; 3] = [20, 20, 60];

/// Retry delays for lookup server links, in seconds.
pub const LOOKUP_RECONNECT: [u64; 9] = [1, 1, 1, 2, 4, 10, 20, 20, 60];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long copies of a relayed message are counted.
const DEDUP_WINDOW: Duration = Duration::from_secs(30);

/// Receiver of everything the manager does not handle itself.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// A share-level message from `from`, direct or relayed.
    async fn message_from(&self, from: &UserId, message: Message);

    /// A slice of a stream session; `offset` is relative to `header.start`.
    async fn stream_data(&self, header: &StreamHeader, offset: u64, data: Bytes);

    fn contact_status_changed(&self, user: &UserId, online: bool);

    /// Called when the first lookup link comes up or the last one drops.
    fn lookup_state_changed(&self, online: bool);
}

/// Tunables of a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub peer_reconnect: Vec<Duration>,
    pub lookup_reconnect: Vec<Duration>,
    pub step_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            peer_reconnect: PEER_RECONNECT.iter().map(|s| Duration::from_secs(*s)).collect(),
            lookup_reconnect: LOOKUP_RECONNECT.iter().map(|s| Duration::from_secs(*s)).collect(),
            step_timeout: STEP_TIMEOUT,
        }
    }
}

/// Delay before retry number `attempt`, saturating at the last tier.
pub fn reconnect_delay(tiers: &[Duration], attempt: usize) -> Duration {
    match tiers.len() {
        0 => Duration::ZERO,
        n => tiers[attempt.min(n - 1)],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Peer(UserId),
    Lookup(usize),
}

#[derive(Debug, Clone)]
enum Role {
    Peer(UserId),
    Lookup(usize),
}

#[derive(Debug)]
struct Contact {
    identity: Identity,
    direct: Option<PeerConnection>,
    /// Lookup links reporting the contact online.
    via: HashSet<usize>,
    shares: HashSet<ShareId>,
    had_direct: bool,
    attempt: usize,
    connecting: bool,
}

impl Contact {
    fn new(identity: Identity) -> Self {
        Self {
            identity,
            direct: None,
            via: HashSet::new(),
            shares: HashSet::new(),
            had_direct: false,
            attempt: 0,
            connecting: false,
        }
    }

    fn is_online(&self) -> bool {
        self.direct.is_some() || !self.via.is_empty()
    }

    fn wants_direct(&self) -> bool {
        self.direct.is_none()
            && !self.connecting
            && !self.shares.is_empty()
            && self.identity.address().is_some()
    }
}

#[derive(Debug)]
struct LookupLink {
    address: String,
    conn: Option<PeerConnection>,
    attempt: usize,
}

#[derive(Default)]
struct State {
    contacts: HashMap<UserId, Contact>,
    /// Identities introduced by lookup servers, trusted or not.
    introduced: HashMap<UserId, Identity>,
    lookups: Vec<LookupLink>,
    roles: HashMap<ConnId, Role>,
    advertised: Option<String>,
    relayed: RelayCopies,
}

/// Relayed payloads seen recently, counted per lookup link.
///
/// Links are FIFO and a blind send puts exactly one copy on each, so a copy
/// is a new transmission only when its link has now carried the payload
/// more often than any other link did.
#[derive(Default)]
struct RelayCopies {
    arrivals: VecDeque<(Instant, blake3::Hash)>,
    counts: HashMap<blake3::Hash, (Instant, HashMap<usize, u32>)>,
}

impl RelayCopies {
    /// Count a copy from `from` that came in over lookup link `link`;
    /// returns whether it should be delivered.
    fn arrived(&mut self, link: usize, from: &UserId, payload: &[u8], now: Instant) -> bool {
        while let Some(&(at, hash)) = self.arrivals.front() {
            if now.duration_since(at) < DEDUP_WINDOW {
                break;
            }
            self.arrivals.pop_front();
            if self.counts.get(&hash).is_some_and(|(last, _)| *last <= at) {
                self.counts.remove(&hash);
            }
        }

        let mut hasher = blake3::Hasher::new();
        hasher.update(from.as_str().as_bytes());
        hasher.update(payload);
        let hash = hasher.finalize();
        self.arrivals.push_back((now, hash));

        let (last, links) = self.counts.entry(hash).or_insert_with(|| (now, HashMap::new()));
        *last = now;
        let count = links.entry(link).or_insert(0);
        *count += 1;
        let mine = *count;
        links.iter().all(|(other, seen)| *other == link || *seen < mine)
    }

    /// Forget what a lost link carried; its copies cannot arrive anymore.
    fn link_lost(&mut self, link: usize) {
        self.counts.retain(|_, (_, links)| {
            links.remove(&link);
            !links.is_empty()
        });
    }
}

impl State {
    fn connected_lookups(&self) -> impl Iterator<Item = &PeerConnection> {
        self.lookups.iter().filter_map(|l| l.conn.as_ref())
    }

    fn lookup_online(&self) -> bool {
        self.connected_lookups().next().is_some()
    }
}

struct Inner {
    local: Arc<LocalIdentity>,
    trust: Arc<TrustContext>,
    options: ManagerOptions,
    state: Mutex<State>,
    dispatcher: RwLock<Option<Weak<dyn Dispatcher>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    reconnect: mpsc::UnboundedSender<(Target, Duration)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Cheap to clone; all clones share the same connections.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager and start its event and reconnect tasks. Must be
    /// called inside a tokio runtime.
    pub fn new(local: Arc<LocalIdentity>, trust: Arc<TrustContext>, options: ManagerOptions) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (reconnect, reconnect_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local,
            trust,
            options,
            state: Mutex::new(State::default()),
            dispatcher: RwLock::new(None),
            events,
            reconnect,
            tasks: Mutex::new(Vec::new()),
        });

        let event_task = tokio::spawn(event_loop(Arc::downgrade(&inner), event_rx));
        let reconnect_task = tokio::spawn(reconnect_loop(Arc::downgrade(&inner), reconnect_rx));
        inner.tasks.lock().extend([event_task, reconnect_task]);
        Self { inner }
    }

    pub fn set_dispatcher(&self, dispatcher: Weak<dyn Dispatcher>) {
        *self.inner.dispatcher.write() = Some(dispatcher);
    }

    fn dispatcher(&self) -> Option<Arc<dyn Dispatcher>> {
        self.inner.dispatcher.read().as_ref().and_then(Weak::upgrade)
    }

    pub fn local_user(&self) -> &UserId {
        self.inner.local.user_id()
    }

    /// Address published in registrations.
    pub fn set_advertised_address(&self, address: Option<String>) {
        self.inner.state.lock().advertised = address;
    }

    /// Accept direct connections on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!("Listening for peers on {}", bound);
        {
            let mut state = self.inner.state.lock();
            if state.advertised.is_none() && !bound.ip().is_unspecified() {
                state.advertised = Some(bound.to_string());
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let (socket, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let Some(inner) = weak.upgrade() else { break };
                let manager = ConnectionManager { inner };
                tokio::spawn(async move {
                    if let Err(e) = manager.accept(socket, Some(remote.to_string())).await {
                        warn!("Rejected connection from {}: {}", remote, e);
                    }
                });
            }
        });
        self.inner.tasks.lock().push(handle);
        Ok(bound)
    }

    /// Authenticate an incoming connection. Only trusted peers are kept.
    pub async fn accept<T>(&self, io: T, remote: Option<String>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        let mut options = HandshakeOptions::new(Some(&self.inner.local));
        options.step_timeout = self.inner.options.step_timeout;
        let peer = authenticate(&mut framed, options)
            .await?
            .ok_or_else(|| Error::authentication("anonymous peer"))?;
        if !self.inner.trust.is_trusted(&peer) {
            return Err(Error::trust(format!("{} is not trusted", peer)));
        }
        info!("Accepted connection from {}", peer);
        self.register_direct(framed, peer, remote, false);
        Ok(())
    }

    /// Authenticate an outgoing connection to `target`.
    pub async fn connect_stream<T>(&self, io: T, remote: Option<String>, target: &UserId) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        let mut options = HandshakeOptions::new(Some(&self.inner.local)).target(target);
        options.step_timeout = self.inner.options.step_timeout;
        let peer = authenticate(&mut framed, options)
            .await?
            .ok_or_else(|| Error::authentication("anonymous peer"))?;
        if !self.inner.trust.is_trusted(&peer) {
            return Err(Error::trust(format!("{} is not trusted", peer)));
        }
        info!("Connected to {}", peer);
        self.register_direct(framed, peer, remote, true);
        Ok(())
    }

    fn register_direct<T>(
        &self,
        framed: Framed<T, FrameCodec>,
        peer: Identity,
        remote: Option<String>,
        outgoing: bool,
    ) where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let user = peer.user_id().clone();
        let local = self.local_user().clone();

        let came_online = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            // Spawned under the lock so the role is known before any event
            let conn = PeerConnection::spawn(
                framed,
                Some(peer.clone()),
                remote,
                outgoing,
                self.inner.events.clone(),
            );
            let contact = state
                .contacts
                .entry(user.clone())
                .or_insert_with(|| Contact::new(peer.clone()));
            if let Some(existing) = contact.direct.as_ref().filter(|c| !c.is_closed()) {
                // Both sides dialed at once: the link opened by the smaller id wins
                let keep_new = if outgoing { local < user } else { user < local };
                if !keep_new {
                    debug!("Dropping duplicate connection to {}", user);
                    conn.close();
                    return;
                }
                state.roles.remove(&existing.id());
                existing.close();
            }
            let was_online = contact.is_online();
            contact.direct = Some(conn.clone());
            contact.had_direct = true;
            contact.attempt = 0;
            contact.connecting = false;
            state.roles.insert(conn.id(), Role::Peer(user.clone()));
            !was_online
        };
        if came_online {
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher.contact_status_changed(&user, true);
            }
        }
    }

    /// Dial a contact at its last known address.
    async fn connect_peer(&self, user: UserId) {
        let address = {
            let mut state = self.inner.state.lock();
            let Some(contact) = state.contacts.get_mut(&user) else { return };
            if contact.direct.is_some() {
                contact.connecting = false;
                return;
            }
            let Some(address) = contact.identity.address().map(str::to_string) else {
                contact.connecting = false;
                return;
            };
            contact.connecting = true;
            address
        };

        debug!("Connecting to {} at {}", user, address);
        let result = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Err(_) => Err(Error::authentication(format!("connect to {} timed out", address))),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(stream)) => self.connect_stream(stream, Some(address.clone()), &user).await,
        };

        if let Err(e) = result {
            warn!("Failed to connect to {} at {}: {}", user, address, e);
            let retry = {
                let mut state = self.inner.state.lock();
                match state.contacts.get_mut(&user) {
                    Some(contact) => {
                        contact.connecting = false;
                        let retry = contact.had_direct && !contact.shares.is_empty() && e.is_retryable();
                        let attempt = contact.attempt;
                        contact.attempt += 1;
                        retry.then_some(attempt)
                    }
                    None => None,
                }
            };
            if let Some(attempt) = retry {
                self.schedule(Target::Peer(user), attempt);
            }
        }
    }

    /// Add a lookup server and start connecting to it.
    pub fn add_lookup_server(&self, address: impl Into<String>) -> usize {
        let index = {
            let mut state = self.inner.state.lock();
            state.lookups.push(LookupLink {
                address: address.into(),
                conn: None,
                attempt: 0,
            });
            state.lookups.len() - 1
        };
        let manager = self.clone();
        tokio::spawn(async move { manager.connect_lookup(index).await });
        index
    }

    async fn connect_lookup(&self, index: usize) {
        let address = {
            let state = self.inner.state.lock();
            match state.lookups.get(index) {
                Some(link) if link.conn.is_none() => link.address.clone(),
                _ => return,
            }
        };
        let result = match timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
            Err(_) => Err(Error::authentication(format!("connect to {} timed out", address))),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(stream)) => self.attach_lookup(stream, index).await,
        };
        if let Err(e) = result {
            warn!("Lookup server {} unavailable: {}", address, e);
            let attempt = {
                let mut state = self.inner.state.lock();
                let Some(link) = state.lookups.get_mut(index) else { return };
                link.attempt += 1;
                link.attempt - 1
            };
            self.schedule(Target::Lookup(index), attempt);
        }
    }

    /// Authenticate to a lookup server over `io`, register and announce our
    /// contacts.
    pub async fn attach_lookup<T>(&self, io: T, index: usize) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        let mut options = HandshakeOptions::new(Some(&self.inner.local)).accept_anonymous(true);
        options.step_timeout = self.inner.options.step_timeout;
        let server = authenticate(&mut framed, options).await?;

        let advertised = self.inner.state.lock().advertised.clone();
        let registration = self.inner.local.identity().with_registration(
            self.inner.local.keys(),
            advertised.as_deref(),
            Utc::now(),
        )?;

        let (conn, came_online) = {
            let mut state = self.inner.state.lock();
            let Some(address) = state.lookups.get(index).map(|l| l.address.clone()) else {
                return Err(Error::config(format!("no lookup server #{}", index)));
            };
            let conn = PeerConnection::spawn(
                framed,
                server,
                Some(address.clone()),
                true,
                self.inner.events.clone(),
            );
            let came_online = !state.lookup_online();
            if let Some(link) = state.lookups.get_mut(index) {
                link.conn = Some(conn.clone());
                link.attempt = 0;
            }
            state.roles.insert(conn.id(), Role::Lookup(index));
            info!("Connected to lookup server {}", address);
            (conn, came_online)
        };

        conn.send(Message::Register {
            identity: registration.to_armored(),
        });
        let users = self.interesting_users();
        if !users.is_empty() {
            conn.send(Message::AddContacts { users });
        }
        if came_online {
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher.lookup_state_changed(true);
            }
        }
        Ok(())
    }

    fn interesting_users(&self) -> Vec<UserId> {
        let state = self.inner.state.lock();
        let mut users: Vec<UserId> = state
            .contacts
            .iter()
            .filter(|(_, c)| !c.shares.is_empty())
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    fn schedule(&self, target: Target, attempt: usize) {
        let tiers = match target {
            Target::Peer(_) => &self.inner.options.peer_reconnect,
            Target::Lookup(_) => &self.inner.options.lookup_reconnect,
        };
        let delay = reconnect_delay(tiers, attempt);
        debug!("Reconnecting {:?} in {:?}", target, delay);
        let _ = self.inner.reconnect.send((target, delay));
    }

    async fn retry(&self, target: Target) {
        match target {
            Target::Peer(user) => self.connect_peer(user).await,
            Target::Lookup(index) => self.connect_lookup(index).await,
        }
    }

    /// Identity of `user` as far as anyone told us.
    pub fn known_identity(&self, user: &UserId) -> Option<Identity> {
        {
            let state = self.inner.state.lock();
            if let Some(contact) = state.contacts.get(user) {
                return Some(contact.identity.clone());
            }
            if let Some(identity) = state.introduced.get(user) {
                return Some(identity.clone());
            }
        }
        self.inner.trust.find_user(user)
    }

    pub fn lookup_online(&self) -> bool {
        self.inner.state.lock().lookup_online()
    }

    /// Users with a live direct connection.
    pub fn connected_peers(&self) -> Vec<UserId> {
        let state = self.inner.state.lock();
        let mut users: Vec<UserId> = state
            .contacts
            .iter()
            .filter(|(_, c)| c.direct.is_some())
            .map(|(user, _)| user.clone())
            .collect();
        users.sort();
        users
    }

    /// Close every connection and stop the background tasks.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        for contact in state.contacts.values_mut() {
            if let Some(conn) = contact.direct.take() {
                conn.close();
            }
        }
        for link in &mut state.lookups {
            if let Some(conn) = link.conn.take() {
                conn.close();
            }
        }
        state.roles.clear();
        drop(state);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Connection manager stopped");
    }

    async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { conn, message } => self.on_message(conn, message).await,
            ConnectionEvent::Stream {
                conn,
                header,
                offset,
                data,
            } => self.on_stream(conn, header, offset, data).await,
            ConnectionEvent::Closed { conn, error } => self.on_closed(conn, error),
        }
    }

    async fn on_message(&self, conn: ConnId, message: Message) {
        let role = self.inner.state.lock().roles.get(&conn).cloned();
        match role {
            Some(Role::Peer(user)) => {
                if message.share().is_none() {
                    warn!("Ignoring {} from peer {}", message.kind(), user);
                    return;
                }
                if let Some(dispatcher) = self.dispatcher() {
                    dispatcher.message_from(&user, message).await;
                }
            }
            Some(Role::Lookup(index)) => self.on_lookup_message(index, message).await,
            None => debug!("Dropping {} from closed connection {}", message.kind(), conn),
        }
    }

    async fn on_lookup_message(&self, index: usize, message: Message) {
        match message {
            Message::NetworkMirror { addresses } => {
                info!("Lookup server #{} sees us at {}", index, addresses.join(", "));
            }
            Message::ContactUpdate { identities } => {
                for armored in identities {
                    match Identity::from_armored(&armored) {
                        Ok(identity) => self.contact_seen(index, identity),
                        Err(e) => warn!("Bad identity in contact update: {}", e),
                    }
                }
            }
            Message::ContactDisconnect { user } => self.contact_lost(index, &user),
            Message::Forward { to, from, payload } => {
                if &to != self.local_user() {
                    warn!("Relayed message for {} reached us", to);
                    return;
                }
                let fresh = self.inner.state.lock().relayed.arrived(index, &from, &payload, Instant::now());
                if !fresh {
                    debug!("Duplicate relayed message from {}", from);
                    return;
                }
                match Message::decode(&payload) {
                    Ok(inner) if inner.share().is_some() => {
                        if let Some(dispatcher) = self.dispatcher() {
                            dispatcher.message_from(&from, inner).await;
                        }
                    }
                    Ok(inner) => warn!("Ignoring relayed {} from {}", inner.kind(), from),
                    Err(e) => warn!("Malformed relayed message from {}: {}", from, e),
                }
            }
            other => warn!("Unexpected {} from lookup server #{}", other.kind(), index),
        }
    }

    fn contact_seen(&self, index: usize, identity: Identity) {
        let user = identity.user_id().clone();
        if &user == self.local_user() {
            return;
        }
        let trusted = self.inner.trust.is_trusted(&identity);
        if trusted {
            self.inner.trust.update_contact(&identity);
        }

        let (came_online, connect) = {
            let mut state = self.inner.state.lock();
            match state.introduced.get_mut(&user) {
                Some(known) if identity.modified() < known.modified() => {}
                Some(known) => *known = identity.clone(),
                None => {
                    state.introduced.insert(user.clone(), identity.clone());
                }
            }
            match state.contacts.get_mut(&user) {
                Some(contact) => {
                    if trusted && identity.modified() >= contact.identity.modified() {
                        contact.identity = identity.clone();
                    }
                    let was_online = contact.is_online();
                    contact.via.insert(index);
                    let connect = trusted && contact.wants_direct();
                    if connect {
                        contact.connecting = true;
                    }
                    (!was_online, connect)
                }
                None => (false, false),
            }
        };
        debug!("Lookup server #{} reports {} online", index, user);

        if came_online {
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher.contact_status_changed(&user, true);
            }
        }
        if connect {
            let manager = self.clone();
            tokio::spawn(async move { manager.connect_peer(user).await });
        }
    }

    fn contact_lost(&self, index: usize, user: &UserId) {
        let went_offline = {
            let mut state = self.inner.state.lock();
            match state.contacts.get_mut(user) {
                Some(contact) => contact.via.remove(&index) && !contact.is_online(),
                None => false,
            }
        };
        debug!("Lookup server #{} reports {} gone", index, user);
        if went_offline {
            if let Some(dispatcher) = self.dispatcher() {
                dispatcher.contact_status_changed(user, false);
            }
        }
    }

    async fn on_stream(&self, conn: ConnId, header: StreamHeader, offset: u64, data: Bytes) {
        let role = self.inner.state.lock().roles.get(&conn).cloned();
        match role {
            Some(Role::Peer(user)) if user != header.from => {
                warn!("Stream from {} claims to come from {}", user, header.from);
                return;
            }
            Some(Role::Lookup(_)) if &header.to != self.local_user() => {
                warn!("Relayed stream for {} reached us", header.to);
                return;
            }
            None => return,
            _ => {}
        }
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher.stream_data(&header, offset, data).await;
        }
    }

    fn on_closed(&self, conn: ConnId, error: Option<Error>) {
        let retryable = error.as_ref().map_or(true, Error::is_retryable);
        let mut offline = Vec::new();
        let mut lookups_down = false;
        let mut retry = None;
        {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.roles.remove(&conn) {
                Some(Role::Peer(user)) => {
                    if let Some(contact) = state.contacts.get_mut(&user) {
                        if contact.direct.as_ref().map(PeerConnection::id) == Some(conn) {
                            contact.direct = None;
                            info!("Connection to {} closed", user);
                            if !contact.is_online() {
                                offline.push(user.clone());
                            }
                            if retryable && contact.had_direct && !contact.shares.is_empty() {
                                contact.connecting = true;
                                retry = Some((Target::Peer(user), contact.attempt));
                                contact.attempt += 1;
                            }
                        }
                    }
                }
                Some(Role::Lookup(index)) => {
                    if let Some(link) = state.lookups.get_mut(index) {
                        link.conn = None;
                        info!("Lost lookup server {}", link.address);
                        retry = Some((Target::Lookup(index), link.attempt));
                        link.attempt += 1;
                    }
                    state.relayed.link_lost(index);
                    for (user, contact) in state.contacts.iter_mut() {
                        if contact.via.remove(&index) && !contact.is_online() {
                            offline.push(user.clone());
                        }
                    }
                    lookups_down = !state.lookup_online();
                }
                None => {}
            }
        }

        if let Some((target, attempt)) = retry {
            self.schedule(target, attempt);
        }
        if let Some(dispatcher) = self.dispatcher() {
            for user in &offline {
                dispatcher.contact_status_changed(user, false);
            }
            if lookups_down {
                dispatcher.lookup_state_changed(false);
            }
        }
    }
}

#[async_trait]
impl ShareTransport for ConnectionManager {
    fn send_to_user(&self, user: &UserId, message: Message, require_direct: bool, blind: bool) -> bool {
        let (direct, relays) = {
            let state = self.inner.state.lock();
            let contact = state.contacts.get(user);
            let direct = contact
                .and_then(|c| c.direct.clone())
                .filter(|c| !c.is_closed());
            let relays: Vec<PeerConnection> = if direct.is_some() || require_direct {
                Vec::new()
            } else if blind {
                state.connected_lookups().cloned().collect()
            } else {
                let mut via: Vec<usize> = contact
                    .map(|c| c.via.iter().copied().collect())
                    .unwrap_or_default();
                via.sort_unstable();
                via.into_iter()
                    .filter_map(|i| state.lookups.get(i).and_then(|l| l.conn.clone()))
                    .filter(|c| !c.is_closed())
                    .collect()
            };
            (direct, relays)
        };

        if let Some(conn) = direct {
            debug!("Sending {} to {} directly", message.kind(), user);
            return conn.send(message);
        }
        if relays.is_empty() {
            debug!("No path to {} for {}", user, message.kind());
            return false;
        }
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cannot relay {} to {}: {}", message.kind(), user, e);
                return false;
            }
        };
        let mut sent = false;
        for relay in relays {
            let forwarded = relay.send(Message::Forward {
                to: user.clone(),
                from: self.local_user().clone(),
                payload: payload.clone(),
            });
            if !forwarded {
                debug!("Lookup link {} refused {} for {}", relay.id(), message.kind(), user);
            }
            sent |= forwarded;
            // One relay is enough unless every path was asked for
            if sent && !blind {
                break;
            }
        }
        sent
    }

    async fn send_stream(&self, user: &UserId, header: StreamHeader, body: Bytes) -> bool {
        let conn = {
            let state = self.inner.state.lock();
            let contact = state.contacts.get(user);
            let direct = contact
                .and_then(|c| c.direct.clone())
                .filter(|c| !c.is_closed());
            direct.or_else(|| {
                let mut via: Vec<usize> = contact
                    .map(|c| c.via.iter().copied().collect())
                    .unwrap_or_default();
                via.sort_unstable();
                via.into_iter()
                    .find_map(|i| state.lookups.get(i).and_then(|l| l.conn.clone()))
            })
        };
        match conn {
            Some(conn) => conn.send_stream(header, body).await,
            None => false,
        }
    }

    fn add_contact(&self, identity: &Identity, share: &ShareId) {
        let user = identity.user_id().clone();
        if &user == self.local_user() {
            return;
        }
        let (announce, connect, links) = {
            let mut state = self.inner.state.lock();
            let introduced = state.introduced.get(&user).cloned();
            let contact = state
                .contacts
                .entry(user.clone())
                .or_insert_with(|| Contact::new(identity.clone()));
            if identity.modified() > contact.identity.modified() {
                contact.identity = identity.clone();
            }
            if let Some(seen) = introduced {
                if seen.modified() > contact.identity.modified() && self.inner.trust.is_trusted(&seen) {
                    contact.identity = seen;
                }
            }
            let announce = contact.shares.is_empty();
            contact.shares.insert(share.clone());
            let connect = contact.wants_direct() && self.inner.trust.is_trusted(identity);
            if connect {
                contact.connecting = true;
            }
            let links: Vec<PeerConnection> = if announce {
                state.connected_lookups().cloned().collect()
            } else {
                Vec::new()
            };
            (announce, connect, links)
        };

        if announce {
            debug!("Watching {} for share {}", user, share);
            for link in links {
                link.send(Message::AddContacts {
                    users: vec![user.clone()],
                });
            }
        }
        if connect {
            let manager = self.clone();
            tokio::spawn(async move { manager.connect_peer(user).await });
        }
    }

    fn remove_contact(&self, user: &UserId, share: &ShareId) {
        let links = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(contact) = state.contacts.get_mut(user) else { return };
            contact.shares.remove(share);
            if !contact.shares.is_empty() {
                return;
            }
            if let Some(contact) = state.contacts.remove(user) {
                if let Some(conn) = contact.direct {
                    state.roles.remove(&conn.id());
                    conn.close();
                }
            }
            state.connected_lookups().cloned().collect::<Vec<_>>()
        };
        debug!("No longer watching {}", user);
        for link in links {
            link.send(Message::RemoveContacts {
                users: vec![user.clone()],
            });
        }
    }

    fn is_online(&self, user: &UserId) -> bool {
        self.inner
            .state
            .lock()
            .contacts
            .get(user)
            .map(Contact::is_online)
            .unwrap_or(false)
    }
}

async fn event_loop(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        ConnectionManager { inner }.handle_event(event).await;
    }
}

async fn reconnect_loop(weak: Weak<Inner>, mut requests: mpsc::UnboundedReceiver<(Target, Duration)>) {
    let mut queue: DelayQueue<Target> = DelayQueue::new();
    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some((target, delay)) => {
                    queue.insert(target, delay);
                }
                None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let Some(inner) = weak.upgrade() else { break };
                let manager = ConnectionManager { inner };
                let target = expired.into_inner();
                tokio::spawn(async move { manager.retry(target).await });
            }
        }
    }
}
