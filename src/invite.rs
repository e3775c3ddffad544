//! Share invitations, sent and received.
//!
//! Sent invitations live with their share until the invitee answers.
//! Received ones are collected in an [`InviteBook`], one entry per share id
//! no matter how many members sent it, until the user decides. An accepted
//! invitation stays in the book so that late duplicates and inviters that
//! were offline at the time still get an answer. A declined one is dropped
//! right away; the share can be offered again later.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::ids::{ShareId, UserId};

/// An invitation we sent and that has not been answered yet.
#[derive(Debug, Clone)]
pub struct Invite {
    pub share: ShareId,
    pub invitee: Identity,
    pub greeting: String,
    /// Whether the `INVITE` message has left on some path.
    pub sent: bool,
    pub created: DateTime<Utc>,
}

impl Invite {
    pub fn new(share: ShareId, invitee: Identity, greeting: impl Into<String>) -> Self {
        Self {
            share,
            invitee,
            greeting: greeting.into(),
            sent: false,
            created: Utc::now(),
        }
    }
}

/// An invitation to a share we do not have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedInvite {
    pub share: ShareId,
    pub name: String,
    pub greeting: String,
    pub inviters: BTreeSet<UserId>,
    /// Inviters that already got our answer.
    #[serde(default)]
    pub answered: BTreeSet<UserId>,
    pub verdict: Option<bool>,
    pub received: DateTime<Utc>,
    /// Armored identities of inviters, as introduced when the invite came in
    #[serde(default)]
    pub identities: BTreeMap<UserId, String>,
}

impl ReceivedInvite {
    /// Inviters still waiting for the decision.
    pub fn unanswered(&self) -> Vec<UserId> {
        self.inviters.difference(&self.answered).cloned().collect()
    }
}

/// What receiving an `INVITE` led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InviteOutcome {
    /// First invitation for this share
    New,
    /// Another member invited us to a share that is still undecided
    Coalesced,
    /// Already decided; the sender should get this verdict right away
    Decided(bool),
}

#[derive(Serialize, Deserialize, Default)]
struct InviteFile {
    invites: Vec<ReceivedInvite>,
}

/// Received invitations of a node, optionally persisted as JSON.
#[derive(Debug, Default)]
pub struct InviteBook {
    path: Option<PathBuf>,
    invites: Mutex<BTreeMap<ShareId, ReceivedInvite>>,
}

impl InviteBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the book stored at `path`, or start an empty one there.
    pub fn open(path: &Path) -> Result<Self> {
        let mut invites = BTreeMap::new();
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let file: InviteFile = serde_json::from_str(&text)?;
            for invite in file.invites {
                invites.insert(invite.share.clone(), invite);
            }
            debug!("Loaded {} received invites", invites.len());
        }
        Ok(Self {
            path: Some(path.to_path_buf()),
            invites: Mutex::new(invites),
        })
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        let file = InviteFile {
            invites: self.invites.lock().values().cloned().collect(),
        };
        let result = serde_json::to_string_pretty(&file)
            .map_err(Error::from)
            .and_then(|text| std::fs::write(path, text).map_err(Error::from));
        if let Err(e) = result {
            warn!("Failed to save invites to {}: {}", path.display(), e);
        }
    }

    /// Record an `INVITE` from `from`.
    pub fn receive(&self, share: &ShareId, name: &str, greeting: &str, from: &UserId) -> InviteOutcome {
        let outcome = {
            let mut invites = self.invites.lock();
            match invites.get_mut(share) {
                Some(invite) => {
                    invite.inviters.insert(from.clone());
                    match invite.verdict {
                        Some(verdict) => InviteOutcome::Decided(verdict),
                        None => InviteOutcome::Coalesced,
                    }
                }
                None => {
                    info!("{} invited us to '{}' ({})", from, name, share);
                    invites.insert(
                        share.clone(),
                        ReceivedInvite {
                            share: share.clone(),
                            name: name.to_string(),
                            greeting: greeting.to_string(),
                            inviters: BTreeSet::from([from.clone()]),
                            answered: BTreeSet::new(),
                            verdict: None,
                            received: Utc::now(),
                            identities: BTreeMap::new(),
                        },
                    );
                    InviteOutcome::New
                }
            }
        };
        self.save();
        outcome
    }

    /// Record the decision for `share` and return the invite.
    ///
    /// Declining removes the entry, so the returned invite is the only
    /// record of who needs the answer.
    pub fn decide(&self, share: &ShareId, accept: bool) -> Result<ReceivedInvite> {
        let invite = {
            let mut invites = self.invites.lock();
            let invite = invites
                .get_mut(share)
                .ok_or_else(|| Error::config(format!("no invitation for share {}", share)))?;
            if invite.verdict == Some(true) && !accept {
                return Err(Error::config(format!("invitation to {} was already accepted", share)));
            }
            invite.verdict = Some(accept);
            let invite = invite.clone();
            if !accept {
                invites.remove(share);
            }
            invite
        };
        self.save();
        Ok(invite)
    }

    /// Keep the identity of an inviter so the decision can be acted on
    /// after a restart.
    pub fn remember_identity(&self, share: &ShareId, identity: &Identity) {
        let changed = match self.invites.lock().get_mut(share) {
            Some(invite) if invite.inviters.contains(identity.user_id()) => {
                invite
                    .identities
                    .insert(identity.user_id().clone(), identity.to_armored());
                true
            }
            _ => false,
        };
        if changed {
            self.save();
        }
    }

    /// Identities remembered for the inviters of `share`.
    pub fn inviter_identities(&self, share: &ShareId) -> Vec<Identity> {
        let Some(invite) = self.get(share) else {
            return Vec::new();
        };
        invite
            .identities
            .values()
            .filter_map(|text| match Identity::from_armored(text) {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!("Dropping stored inviter identity: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Note that `user` received our answer for `share`.
    pub fn mark_answered(&self, share: &ShareId, user: &UserId) {
        let changed = match self.invites.lock().get_mut(share) {
            Some(invite) => invite.answered.insert(user.clone()),
            None => false,
        };
        if changed {
            self.save();
        }
    }

    /// Drop the entry for `share`, e.g. once the share is synced.
    pub fn forget(&self, share: &ShareId) -> Option<ReceivedInvite> {
        let removed = self.invites.lock().remove(share);
        if removed.is_some() {
            self.save();
        }
        removed
    }

    pub fn get(&self, share: &ShareId) -> Option<ReceivedInvite> {
        self.invites.lock().get(share).cloned()
    }

    /// Invitations waiting for a decision.
    pub fn pending(&self) -> Vec<ReceivedInvite> {
        self.invites
            .lock()
            .values()
            .filter(|i| i.verdict.is_none())
            .cloned()
            .collect()
    }

    /// Decided invitations with inviters that still need the answer.
    pub fn unanswered(&self) -> Vec<ReceivedInvite> {
        self.invites
            .lock()
            .values()
            .filter(|i| i.verdict.is_some() && !i.unanswered().is_empty())
            .cloned()
            .collect()
    }
}
