//! # SlyMesh
//!
//! Peer-to-peer shared folders on top of a signed, append-only event log.
//!
//! Every change to a share is an event signed by its author and chained to
//! the event it was made on top of. Replicas exchange events and replay
//! them in a deterministic order, so every member ends up with the same
//! folder tree. File contents travel separately as content-addressed blobs,
//! fetched in ranges from whichever members have them. Nodes find each
//! other through lookup servers, which also relay traffic when no direct
//! connection is possible.
//!
//! ## Core Modules
//!
//! - [`identity`] and [`trust`] - keys, certificates and who we believe
//! - [`event`], [`event_log`] and [`tree`] - the replicated share state
//! - [`share`] - one share: sync protocol, invitations, downloads
//! - [`storage`], [`downloader`] and [`uploader`] - blob transfer
//! - [`wire`], [`handshake`], [`connection`] and [`manager`] - networking
//! - [`lookup`] - the rendezvous and relay server
//! - [`node`] - everything a running participant owns
//! - [`cli`] and [`config`] - the command line tool
//!
//! ## Quick Start
//!
//! ```bash
//! slymesh init --name alice
//! slymesh share create Photos
//! slymesh invite Photos bob.id --greeting "holiday pictures"
//! slymesh daemon
//! ```

pub mod bandwidth;
pub mod cli;
pub mod config;
pub mod connection;
pub mod downloader;
pub mod error;
pub mod event;
pub mod event_log;
pub mod handshake;
pub mod identity;
pub mod ids;
pub mod invite;
pub mod lookup;
pub mod manager;
pub mod node;
pub mod ranges;
pub mod record;
pub mod share;
pub mod storage;
pub mod transport;
pub mod tree;
pub mod trust;
pub mod uploader;
pub mod wire;

pub use config::Config;
pub use error::{Error, Result};
pub use identity::{Identity, LocalIdentity};
pub use node::{LocalNode, NodeOptions};
pub use share::ShareModel;
