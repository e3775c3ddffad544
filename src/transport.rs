//! The seam between share coordination and the network.
//!
//! [`ShareModel`](crate::share::ShareModel) only ever talks to peers through
//! a [`ShareTransport`]. The connection manager implements it for real
//! networks; tests plug in in-process transports.

use async_trait::async_trait;
use bytes::Bytes;

use crate::identity::Identity;
use crate::ids::{ShareId, UserId};
use crate::wire::{Message, StreamHeader};

#[async_trait]
pub trait ShareTransport: Send + Sync {
    /// Queue `message` for `user`. With `require_direct` only a direct
    /// connection is used; with `blind` the message is copied to every
    /// lookup path when there is no direct one. Returns whether any path
    /// took the message.
    fn send_to_user(&self, user: &UserId, message: Message, require_direct: bool, blind: bool) -> bool;

    /// Send one stream slice and wait until it has been written.
    async fn send_stream(&self, user: &UserId, header: StreamHeader, body: Bytes) -> bool;

    /// Start tracking `identity` on behalf of `share`.
    fn add_contact(&self, identity: &Identity, share: &ShareId);

    fn remove_contact(&self, user: &UserId, share: &ShareId);

    fn is_online(&self, user: &UserId) -> bool;
}
