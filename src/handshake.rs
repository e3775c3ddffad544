//! Mutual challenge-response authentication.
//!
//! Both sides run the same exchange over a fresh [`Framed`] connection:
//!
//! 1. send `HELLO{greeting, target, nonce}` with a fresh random nonce
//! 2. receive the peer's `HELLO`
//! 3. send `AUTH{identity, proof}` where `proof` is a record signing the
//!    peer's nonce with our key (both empty when we have no identity)
//! 4. receive the peer's `AUTH` and check it against our own nonce
//!
//! Each receive is bounded by the step timeout. Trust decisions are left
//! to the caller: a successful handshake only proves that the peer holds
//! the key of the identity it presented.

use futures::{SinkExt, StreamExt};
use rand::RngCore;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identity::{Identity, LocalIdentity};
use crate::ids::UserId;
use crate::record::SignedRecord;
use crate::wire::{FrameCodec, Inbound, Message, Outbound, GREETING};

/// Time allowed for each receive step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// What one side of a handshake knows and expects.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeOptions<'a> {
    /// Our identity; `None` authenticates anonymously.
    pub local: Option<&'a LocalIdentity>,
    /// The user we meant to reach, for outgoing connections.
    pub target: Option<&'a UserId>,
    /// Whether a peer without an identity is acceptable.
    pub accept_anonymous: bool,
    pub step_timeout: Duration,
}

impl<'a> HandshakeOptions<'a> {
    pub fn new(local: Option<&'a LocalIdentity>) -> Self {
        Self {
            local,
            target: None,
            accept_anonymous: false,
            step_timeout: STEP_TIMEOUT,
        }
    }

    pub fn target(mut self, target: &'a UserId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn accept_anonymous(mut self, accept: bool) -> Self {
        self.accept_anonymous = accept;
        self
    }
}

fn new_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn receive<T>(framed: &mut Framed<T, FrameCodec>, step: Duration) -> Result<Message>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(step, framed.next()).await {
        Err(_) => Err(Error::authentication(format!("peer silent for {:?}", step))),
        Ok(None) => Err(Error::authentication("connection closed during handshake")),
        Ok(Some(Err(e))) => Err(e),
        Ok(Some(Ok(Inbound::Message(message)))) => Ok(message),
        Ok(Some(Ok(Inbound::StreamData(_)))) => {
            Err(Error::protocol("stream data during handshake"))
        }
    }
}

/// Run the handshake. Returns the peer's identity, or `None` for an
/// accepted anonymous peer.
pub async fn authenticate<T>(
    framed: &mut Framed<T, FrameCodec>,
    options: HandshakeOptions<'_>,
) -> Result<Option<Identity>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let nonce = new_nonce();
    framed
        .send(Outbound::Message(Message::Hello {
            greeting: GREETING.to_string(),
            target: options.target.map(|t| t.to_string()).unwrap_or_default(),
            nonce: nonce.clone(),
        }))
        .await?;

    let (peer_nonce, wanted) = match receive(framed, options.step_timeout).await? {
        Message::Hello { greeting, target, nonce } => {
            if greeting != GREETING {
                return Err(Error::protocol(format!("unexpected greeting '{}'", greeting)));
            }
            (nonce, target)
        }
        other => {
            return Err(Error::protocol(format!("expected HELLO, got {}", other.kind())));
        }
    };
    if !wanted.is_empty() {
        match options.local {
            Some(local) if local.user_id().as_str() == wanted => {}
            _ => return Err(Error::authentication(format!("peer was looking for {}", wanted))),
        }
    }

    let auth = match options.local {
        Some(local) => Message::Auth {
            identity: local.identity().to_armored(),
            proof: local.nonce_proof(&peer_nonce).to_armored(),
        },
        None => Message::Auth {
            identity: String::new(),
            proof: String::new(),
        },
    };
    framed.send(Outbound::Message(auth)).await?;

    let (identity, proof) = match receive(framed, options.step_timeout).await? {
        Message::Auth { identity, proof } => (identity, proof),
        other => {
            return Err(Error::protocol(format!("expected AUTH, got {}", other.kind())));
        }
    };

    if identity.is_empty() {
        if !options.accept_anonymous {
            return Err(Error::authentication("anonymous peer"));
        }
        if let Some(target) = options.target {
            return Err(Error::authentication(format!("expected {}, peer is anonymous", target)));
        }
        debug!("Anonymous peer authenticated");
        return Ok(None);
    }

    let identity = Identity::from_armored(&identity)?;
    let proof = SignedRecord::from_armored(&proof)?;
    if !identity.verify(&proof) {
        return Err(Error::authentication(format!(
            "nonce proof not signed by {}",
            identity.user_id()
        )));
    }
    if proof.get("nonce") != Some(nonce.as_str()) {
        return Err(Error::authentication("nonce mismatch"));
    }
    if let Some(target) = options.target {
        if identity.user_id() != target {
            return Err(Error::authentication(format!(
                "expected {}, reached {}",
                target,
                identity.user_id()
            )));
        }
    }
    debug!("Authenticated {}", identity);
    Ok(Some(identity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tokio::io::duplex;

    fn pair() -> (
        Framed<tokio::io::DuplexStream, FrameCodec>,
        Framed<tokio::io::DuplexStream, FrameCodec>,
    ) {
        let (a, b) = duplex(64 * 1024);
        (Framed::new(a, FrameCodec::new()), Framed::new(b, FrameCodec::new()))
    }

    #[tokio::test]
    async fn test_mutual_authentication() {
        let alice = LocalIdentity::generate("alice", "Alice").unwrap();
        let bob = LocalIdentity::generate("bob", "Bob").unwrap();
        let (mut a, mut b) = pair();

        let bob_id = bob.user_id().clone();
        let (left, right) = tokio::join!(
            authenticate(&mut a, HandshakeOptions::new(Some(&alice)).target(&bob_id)),
            authenticate(&mut b, HandshakeOptions::new(Some(&bob))),
        );
        assert_eq!(left.unwrap().unwrap().user_id(), bob.user_id());
        assert_eq!(right.unwrap().unwrap().user_id(), alice.user_id());
    }

    #[tokio::test]
    async fn test_wrong_target_fails() {
        let alice = LocalIdentity::generate("alice", "Alice").unwrap();
        let bob = LocalIdentity::generate("bob", "Bob").unwrap();
        let carol = UserId::new("carol");
        let (mut a, mut b) = pair();

        let mut options = HandshakeOptions::new(Some(&alice)).target(&carol);
        options.step_timeout = Duration::from_millis(200);
        let (left, right) = tokio::join!(
            authenticate(&mut a, options),
            authenticate(&mut b, HandshakeOptions::new(Some(&bob))),
        );
        assert!(left.is_err());
        assert_matches!(right, Err(Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_anonymous_only_when_allowed() {
        let server = LocalIdentity::generate("lookup", "Lookup").unwrap();
        let (mut a, mut b) = pair();
        let (client, accepted) = tokio::join!(
            authenticate(&mut a, HandshakeOptions::new(None).accept_anonymous(true)),
            authenticate(&mut b, HandshakeOptions::new(Some(&server)).accept_anonymous(true)),
        );
        assert!(client.unwrap().is_some());
        assert!(accepted.unwrap().is_none());

        let (mut a, mut b) = pair();
        let (_, refused) = tokio::join!(
            authenticate(&mut a, HandshakeOptions::new(None).accept_anonymous(true)),
            authenticate(&mut b, HandshakeOptions::new(Some(&server))),
        );
        assert_matches!(refused, Err(Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_replayed_proof_is_rejected() {
        let alice = LocalIdentity::generate("alice", "Alice").unwrap();
        let bob = LocalIdentity::generate("bob", "Bob").unwrap();
        let (mut a, b) = pair();

        // Bob's side answers with a proof for a nonce it made up
        let mut raw = Framed::new(b.into_inner(), FrameCodec::new());
        let cheat = tokio::spawn(async move {
            let _ = raw.next().await;
            raw.send(Outbound::Message(Message::Hello {
                greeting: GREETING.to_string(),
                target: String::new(),
                nonce: "n".into(),
            }))
            .await
            .unwrap();
            let _ = raw.next().await;
            raw.send(Outbound::Message(Message::Auth {
                identity: bob.identity().to_armored(),
                proof: bob.nonce_proof("stale").to_armored(),
            }))
            .await
            .unwrap();
        });
        let result = authenticate(&mut a, HandshakeOptions::new(Some(&alice))).await;
        cheat.await.unwrap();
        assert_matches!(result, Err(Error::Authentication(_)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let alice = LocalIdentity::generate("alice", "Alice").unwrap();
        let (mut a, _b) = pair();
        let mut options = HandshakeOptions::new(Some(&alice));
        options.step_timeout = Duration::from_millis(50);
        assert_matches!(authenticate(&mut a, options).await, Err(Error::Authentication(_)));
    }
}
