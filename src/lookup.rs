//! # Lookup Server
//!
//! A rendezvous point for nodes that cannot reach each other directly.
//! Nodes register their identity, say whose presence they care about, and
//! hand the server messages and stream sessions for users connected to it.
//! Everything lives in memory; a restarted server starts empty.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::connection::{ConnId, ConnectionEvent, PeerConnection};
use crate::error::{Error, Result};
use crate::handshake::{authenticate, HandshakeOptions};
use crate::identity::{Identity, LocalIdentity};
use crate::ids::UserId;
use crate::wire::{FrameCodec, Message, StreamHeader};

#[derive(Debug)]
struct Client {
    conn: PeerConnection,
    /// Identity proven in the handshake.
    authenticated: Option<Identity>,
    /// Identity from `REGISTER`, with address and timestamp.
    registered: Option<Identity>,
    interests: HashSet<UserId>,
    /// Users this client has been told about.
    introduced: HashSet<UserId>,
    /// Stream session being collected for relaying.
    relay: Option<StreamRelay>,
}

/// A stream session on its way through the server.
#[derive(Debug)]
struct StreamRelay {
    header: StreamHeader,
    recipient: PeerConnection,
    body: BytesMut,
}

impl Client {
    fn user(&self) -> Option<&UserId> {
        self.registered.as_ref().map(Identity::user_id)
    }
}

#[derive(Default)]
struct State {
    clients: HashMap<ConnId, Client>,
    by_user: HashMap<UserId, ConnId>,
}

impl State {
    fn registered(&self, user: &UserId) -> Option<&Client> {
        self.by_user.get(user).and_then(|id| self.clients.get(id))
    }

    /// Connections interested in `user`, other than `user` itself.
    fn watchers(&self, user: &UserId) -> Vec<PeerConnection> {
        self.clients
            .values()
            .filter(|c| c.interests.contains(user) && c.user() != Some(user))
            .map(|c| c.conn.clone())
            .collect()
    }
}

struct Inner {
    local: Option<Arc<LocalIdentity>>,
    accept_anonymous: bool,
    state: Mutex<State>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Snapshot of a server's tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupStats {
    pub connections: usize,
    pub registered: usize,
}

#[derive(Clone)]
pub struct LookupServer {
    inner: Arc<Inner>,
}

impl LookupServer {
    /// Create a server. Without an identity the server authenticates
    /// anonymously; `accept_anonymous` admits clients without one.
    pub fn new(local: Option<Arc<LocalIdentity>>, accept_anonymous: bool) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local,
            accept_anonymous,
            state: Mutex::new(State::default()),
            events,
            tasks: Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(event_loop(Arc::downgrade(&inner), event_rx));
        inner.tasks.lock().push(task);
        Self { inner }
    }

    /// Accept clients on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        info!("Lookup server listening on {}", bound);

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let (socket, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept client: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };
                let Some(inner) = weak.upgrade() else { break };
                let server = LookupServer { inner };
                tokio::spawn(async move {
                    if let Err(e) = server.accept(socket, Some(remote.to_string())).await {
                        warn!("Rejected client {}: {}", remote, e);
                    }
                });
            }
        });
        self.inner.tasks.lock().push(handle);
        Ok(bound)
    }

    /// Authenticate a client connection and start serving it.
    pub async fn accept<T>(&self, io: T, remote: Option<String>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(io, FrameCodec::new());
        let options = HandshakeOptions::new(self.inner.local.as_deref())
            .accept_anonymous(self.inner.accept_anonymous);
        let peer = authenticate(&mut framed, options).await?;
        debug!(
            "Client {} connected from {}",
            peer.as_ref().map(|p| p.user_id().to_string()).unwrap_or_else(|| "anonymous".into()),
            remote.as_deref().unwrap_or("?")
        );
        // Register before the reader can report anything
        let mut state = self.inner.state.lock();
        let conn = PeerConnection::spawn(framed, peer.clone(), remote, false, self.inner.events.clone());
        state.clients.insert(
            conn.id(),
            Client {
                conn,
                authenticated: peer,
                registered: None,
                interests: HashSet::new(),
                introduced: HashSet::new(),
                relay: None,
            },
        );
        Ok(())
    }

    pub fn stats(&self) -> LookupStats {
        let state = self.inner.state.lock();
        LookupStats {
            connections: state.clients.len(),
            registered: state.by_user.len(),
        }
    }

    /// Whether `user` is registered right now.
    pub fn is_registered(&self, user: &UserId) -> bool {
        self.inner.state.lock().by_user.contains_key(user)
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        for client in state.clients.values() {
            client.conn.close();
        }
        state.clients.clear();
        state.by_user.clear();
        drop(state);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Lookup server stopped");
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message { conn, message } => {
                if let Err(e) = self.on_message(conn, message) {
                    warn!("Dropping client {}: {}", conn, e);
                    self.disconnect(conn);
                }
            }
            ConnectionEvent::Stream {
                conn,
                header,
                offset,
                data,
            } => self.on_stream(conn, header, offset, data),
            ConnectionEvent::Closed { conn, .. } => self.disconnect(conn),
        }
    }

    fn on_message(&self, conn: ConnId, message: Message) -> Result<()> {
        match message {
            Message::Register { identity } => self.register(conn, &identity),
            Message::AddContacts { users } => {
                let (client, online) = {
                    let mut guard = self.inner.state.lock();
                    let state = &mut *guard;
                    let online: Vec<Identity> = users
                        .iter()
                        .filter_map(|u| state.registered(u))
                        .filter_map(|c| c.registered.clone())
                        .collect();
                    let Some(client) = state.clients.get_mut(&conn) else { return Ok(()) };
                    client.interests.extend(users);
                    client
                        .introduced
                        .extend(online.iter().map(|i| i.user_id().clone()));
                    (client.conn.clone(), online)
                };
                if !online.is_empty() {
                    client.send(Message::ContactUpdate {
                        identities: online.iter().map(Identity::to_armored).collect(),
                    });
                }
                Ok(())
            }
            Message::RemoveContacts { users } => {
                if let Some(client) = self.inner.state.lock().clients.get_mut(&conn) {
                    for user in &users {
                        client.interests.remove(user);
                    }
                }
                Ok(())
            }
            Message::Forward { to, from, payload } => {
                self.forward(conn, to, from, payload);
                Ok(())
            }
            other => Err(Error::protocol(format!("{} is not a lookup request", other.kind()))),
        }
    }

    fn register(&self, conn: ConnId, armored: &str) -> Result<()> {
        let identity = Identity::from_armored(armored)?;
        let (client, mirror, watchers) = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(client) = state.clients.get_mut(&conn) else { return Ok(()) };
            match &client.authenticated {
                Some(peer) if peer.key_id() == identity.key_id() => {}
                _ => {
                    return Err(Error::authentication(format!(
                        "registration for {} does not match the connection",
                        identity.user_id()
                    )));
                }
            }
            let user = identity.user_id().clone();
            client.registered = Some(identity.clone());
            let mirror = client.conn.remote().map(str::to_string);
            let handle = client.conn.clone();
            if let Some(previous) = state.by_user.insert(user.clone(), conn) {
                if previous != conn {
                    debug!("{} re-registered from a new connection", user);
                }
            }
            let watchers = state.watchers(&user);
            for client in state.clients.values_mut() {
                if client.interests.contains(&user) {
                    client.introduced.insert(user.clone());
                }
            }
            (handle, mirror, watchers)
        };

        info!("Registered {}", identity);
        client.send(Message::NetworkMirror {
            addresses: mirror.into_iter().collect(),
        });
        let update = Message::ContactUpdate {
            identities: vec![identity.to_armored()],
        };
        for watcher in watchers {
            watcher.send(update.clone());
        }
        Ok(())
    }

    /// Look up the recipient of a relayed item, introducing the sender to
    /// it first if needed.
    fn relay_target(&self, conn: ConnId, to: &UserId, from: &UserId) -> Option<PeerConnection> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let sender = state.clients.get(&conn)?;
        if sender.user() != Some(from) {
            warn!("Client {} tried to relay as {}", conn, from);
            return None;
        }
        let sender_identity = sender.registered.as_ref()?.to_armored();
        let Some(recipient_id) = state.by_user.get(to).copied() else {
            debug!("No route to {}, dropping relay from {}", to, from);
            return None;
        };
        let recipient = state.clients.get_mut(&recipient_id)?;
        if recipient.introduced.insert(from.clone()) {
            recipient.conn.send(Message::ContactUpdate {
                identities: vec![sender_identity],
            });
        }
        Some(recipient.conn.clone())
    }

    fn forward(&self, conn: ConnId, to: UserId, from: UserId, payload: Bytes) {
        if let Some(recipient) = self.relay_target(conn, &to, &from) {
            debug!("Relaying {} bytes from {} to {}", payload.len(), from, to);
            recipient.send(Message::Forward { to, from, payload });
        }
    }

    fn on_stream(&self, conn: ConnId, header: StreamHeader, offset: u64, data: Bytes) {
        // The route is settled before any bytes are kept
        let recipient = match offset {
            0 => match self.relay_target(conn, &header.to, &header.from) {
                Some(recipient) => Some(recipient),
                None => {
                    if let Some(client) = self.inner.state.lock().clients.get_mut(&conn) {
                        client.relay = None;
                    }
                    return;
                }
            },
            _ => None,
        };

        let complete = {
            let mut state = self.inner.state.lock();
            let Some(client) = state.clients.get_mut(&conn) else { return };
            if let Some(recipient) = recipient {
                client.relay = Some(StreamRelay {
                    header: header.clone(),
                    recipient,
                    body: BytesMut::new(),
                });
            }
            match client.relay.as_mut() {
                Some(relay) if relay.header == header => {
                    relay.body.extend_from_slice(&data);
                    if relay.body.len() as u64 >= header.len() {
                        client.relay.take()
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(relay) = complete {
            debug!(
                "Relaying {} stream bytes from {} to {}",
                relay.body.len(),
                relay.header.from,
                relay.header.to
            );
            if !relay.recipient.queue_stream(relay.header, relay.body.freeze()) {
                debug!("Recipient went away before a relayed stream");
            }
        }
    }

    fn disconnect(&self, conn: ConnId) {
        let (user, watchers) = {
            let mut state = self.inner.state.lock();
            let Some(client) = state.clients.remove(&conn) else { return };
            client.conn.close();
            let Some(user) = client.user().cloned() else { return };
            if state.by_user.get(&user) != Some(&conn) {
                return;
            }
            state.by_user.remove(&user);
            for other in state.clients.values_mut() {
                other.introduced.remove(&user);
            }
            let watchers = state.watchers(&user);
            (user, watchers)
        };
        info!("{} disconnected", user);
        for watcher in watchers {
            watcher.send(Message::ContactDisconnect { user: user.clone() });
        }
    }
}

async fn event_loop(weak: Weak<Inner>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        LookupServer { inner }.handle_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::io::duplex;
    use tokio::time::timeout;

    use crate::wire::{Inbound, Outbound};

    struct Client {
        local: LocalIdentity,
        framed: Framed<tokio::io::DuplexStream, FrameCodec>,
    }

    impl Client {
        async fn connect(server: &LookupServer, name: &str) -> Self {
            let local = LocalIdentity::generate(name, name).unwrap();
            let (a, b) = duplex(256 * 1024);
            let mut framed = Framed::new(a, FrameCodec::new());
            let (auth, accepted) = tokio::join!(
                authenticate(&mut framed, HandshakeOptions::new(Some(&local)).accept_anonymous(true)),
                server.accept(b, Some(format!("10.0.0.1:{}", name.len()))),
            );
            auth.unwrap();
            accepted.unwrap();
            Self { local, framed }
        }

        async fn send(&mut self, message: Message) {
            self.framed.send(Outbound::Message(message)).await.unwrap();
        }

        async fn recv(&mut self) -> Inbound {
            timeout(Duration::from_secs(5), self.framed.next())
                .await
                .expect("nothing received")
                .unwrap()
                .unwrap()
        }

        async fn register(&mut self) {
            let identity = self.local.identity().to_armored();
            self.send(Message::Register { identity }).await;
            match self.recv().await {
                Inbound::Message(Message::NetworkMirror { addresses }) => assert_eq!(addresses.len(), 1),
                other => panic!("expected mirror, got {:?}", other),
            }
        }

        fn id(&self) -> UserId {
            self.local.user_id().clone()
        }
    }

    fn contact_update_users(inbound: Inbound) -> Vec<UserId> {
        match inbound {
            Inbound::Message(Message::ContactUpdate { identities }) => identities
                .iter()
                .map(|i| Identity::from_armored(i).unwrap().user_id().clone())
                .collect(),
            other => panic!("expected contact update, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_presence_is_pushed_to_watchers() {
        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        let mut bob = Client::connect(&server, "bob").await;
        alice.register().await;
        alice.send(Message::AddContacts { users: vec![bob.id()] }).await;

        bob.register().await;
        assert_eq!(contact_update_users(alice.recv().await), vec![bob.id()]);

        let bob_id = bob.id();
        drop(bob);
        match alice.recv().await {
            Inbound::Message(Message::ContactDisconnect { user }) => assert_eq!(user, bob_id),
            other => panic!("expected disconnect, got {:?}", other),
        }
        assert_eq!(server.stats().registered, 1);
    }

    #[tokio::test]
    async fn test_add_contacts_reports_online_users() {
        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        let mut bob = Client::connect(&server, "bob").await;
        bob.register().await;
        alice.register().await;
        alice.send(Message::AddContacts { users: vec![bob.id(), UserId::new("nobody")] }).await;
        assert_eq!(contact_update_users(alice.recv().await), vec![bob.id()]);
    }

    #[tokio::test]
    async fn test_forward_introduces_sender_once() {
        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        let mut bob = Client::connect(&server, "bob").await;
        alice.register().await;
        bob.register().await;

        for _ in 0..2 {
            alice
                .send(Message::Forward {
                    to: bob.id(),
                    from: alice.id(),
                    payload: Bytes::from_static(b"opaque"),
                })
                .await;
        }
        assert_eq!(contact_update_users(bob.recv().await), vec![alice.id()]);
        for _ in 0..2 {
            match bob.recv().await {
                Inbound::Message(Message::Forward { from, payload, .. }) => {
                    assert_eq!(from, alice.id());
                    assert_eq!(&payload[..], b"opaque");
                }
                other => panic!("expected forward, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_forward_to_unknown_user_is_dropped() {
        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        alice.register().await;
        alice
            .send(Message::Forward {
                to: UserId::new("ghost"),
                from: alice.id(),
                payload: Bytes::from_static(b"x"),
            })
            .await;
        // Still connected and served
        alice.send(Message::AddContacts { users: vec![alice.id()] }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.stats().connections, 1);
    }

    #[tokio::test]
    async fn test_stream_is_relayed_whole() {
        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        let mut bob = Client::connect(&server, "bob").await;
        alice.register().await;
        bob.register().await;

        let body = Bytes::from(vec![9u8; 100_000]);
        let header = StreamHeader {
            to: bob.id(),
            from: alice.id(),
            share: crate::ids::ShareId::generate(&alice.id()),
            content: crate::ids::ContentId::for_bytes(&body),
            start: 0,
            finish: body.len() as u64,
        };
        alice
            .framed
            .send(Outbound::Stream { header: header.clone(), body: body.clone() })
            .await
            .unwrap();

        assert_eq!(contact_update_users(bob.recv().await), vec![alice.id()]);
        match bob.recv().await {
            Inbound::Message(Message::StreamStart(got)) => assert_eq!(got, header),
            other => panic!("expected stream header, got {:?}", other),
        }
        let mut received = 0;
        while received < body.len() {
            match bob.recv().await {
                Inbound::StreamData(chunk) => received += chunk.len(),
                other => panic!("expected stream bytes, got {:?}", other),
            }
        }
        assert_eq!(received, body.len());
    }

    #[tokio::test]
    async fn test_oversized_stream_closes_only_that_client() {
        use tokio::io::AsyncWriteExt;

        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        let mut bob = Client::connect(&server, "bob").await;
        alice.register().await;
        bob.register().await;

        let header = StreamHeader {
            to: bob.id(),
            from: alice.id(),
            share: crate::ids::ShareId::generate(&alice.id()),
            content: crate::ids::ContentId::new("ab", 1 << 50),
            start: 0,
            finish: 1 << 50,
        };
        let payload = Message::StreamStart(header).encode().unwrap();
        let mut raw = (payload.len() as u16).to_le_bytes().to_vec();
        raw.extend_from_slice(&payload);
        raw.extend_from_slice(&[0u8; 16]);
        alice.framed.get_mut().write_all(&raw).await.unwrap();

        let closed = timeout(Duration::from_secs(5), alice.framed.next()).await.unwrap();
        assert!(closed.is_none() || matches!(closed, Some(Err(_))));
        let stats = server.clone();
        timeout(Duration::from_secs(5), async move {
            while stats.stats().connections != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(server.is_registered(&bob.id()));
    }

    #[tokio::test]
    async fn test_stream_without_route_is_dropped() {
        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        let mut bob = Client::connect(&server, "bob").await;
        alice.register().await;
        bob.register().await;

        let body = Bytes::from(vec![1u8; 64 * 1024]);
        let header = StreamHeader {
            to: UserId::new("ghost"),
            from: alice.id(),
            share: crate::ids::ShareId::generate(&alice.id()),
            content: crate::ids::ContentId::for_bytes(&body),
            start: 0,
            finish: body.len() as u64,
        };
        alice
            .framed
            .send(Outbound::Stream { header, body })
            .await
            .unwrap();

        // The connection keeps working and nothing is held for the ghost
        alice
            .send(Message::Forward {
                to: bob.id(),
                from: alice.id(),
                payload: Bytes::from_static(b"still here"),
            })
            .await;
        assert_eq!(contact_update_users(bob.recv().await), vec![alice.id()]);
        match bob.recv().await {
            Inbound::Message(Message::Forward { payload, .. }) => assert_eq!(&payload[..], b"still here"),
            other => panic!("expected forward, got {:?}", other),
        }
        let state = server.inner.state.lock();
        assert!(state.clients.values().all(|c| c.relay.is_none()));
    }

    #[tokio::test]
    async fn test_registration_must_match_connection() {
        let server = LookupServer::new(None, false);
        let mut alice = Client::connect(&server, "alice").await;
        let impostor = LocalIdentity::generate("bob", "bob").unwrap();
        alice
            .send(Message::Register {
                identity: impostor.identity().to_armored(),
            })
            .await;
        let closed = timeout(Duration::from_secs(5), alice.framed.next()).await.unwrap();
        assert!(closed.is_none() || matches!(closed, Some(Err(_))));
        assert!(!server.is_registered(impostor.user_id()));
    }

    #[tokio::test]
    async fn test_anonymous_clients_need_permission() {
        let server = LookupServer::new(None, false);
        let (a, b) = duplex(1024);
        let mut framed = Framed::new(a, FrameCodec::new());
        let (_, accepted) = tokio::join!(
            authenticate(&mut framed, HandshakeOptions::new(None).accept_anonymous(true)),
            server.accept(b, None),
        );
        assert!(accepted.is_err());
    }
}
