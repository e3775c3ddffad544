//! Key cache, contacts and trust decisions of one node.
//!
//! A [`TrustContext`] is created per running node and passed to everything
//! that verifies signatures. Keys enter the cache when an identity is
//! imported as a contact, admitted to a share, or announced by a trusted
//! party; once cached a key stays trusted for the lifetime of the context.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::identity::{Certificate, Identity};
use crate::ids::UserId;
use crate::record::SignedRecord;

pub struct TrustContext {
    local: Identity,
    keys: RwLock<HashMap<String, Identity>>,
    roots: RwLock<HashMap<String, Certificate>>,
    contacts: RwLock<BTreeMap<UserId, Identity>>,
}

#[derive(Serialize, Deserialize, Default)]
struct ContactsFile {
    contacts: Vec<ContactEntry>,
    roots: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct ContactEntry {
    nickname: Option<String>,
    identity: String,
}

impl TrustContext {
    pub fn new(local: &Identity) -> Self {
        let mut keys = HashMap::new();
        keys.insert(local.key_id().to_string(), local.clone());
        Self {
            local: local.clone(),
            keys: RwLock::new(keys),
            roots: RwLock::new(HashMap::new()),
            contacts: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    /// Register a trusted root certificate. Only self-signed roots are
    /// accepted.
    pub fn add_root(&self, root: Certificate) -> Result<()> {
        if !root.is_self_signed() {
            return Err(Error::trust(format!(
                "root certificate for '{}' is not self-signed",
                root.subject()
            )));
        }
        info!("Added trusted root {}", root.subject());
        self.roots.write().insert(root.subject().to_string(), root);
        Ok(())
    }

    /// Cache the key of `identity`. Existing entries are kept.
    pub fn add_key(&self, identity: &Identity) -> bool {
        let mut keys = self.keys.write();
        if keys.contains_key(identity.key_id()) {
            return false;
        }
        debug!("Caching key {} for {}", identity.key_id(), identity.user_id());
        keys.insert(identity.key_id().to_string(), identity.clone());
        true
    }

    pub fn find_by_key(&self, key_id: &str) -> Option<Identity> {
        self.keys.read().get(key_id).cloned()
    }

    /// Look a user up among the local identity, contacts and cached keys.
    pub fn find_user(&self, user_id: &UserId) -> Option<Identity> {
        if self.local.user_id() == user_id {
            return Some(self.local.clone());
        }
        if let Some(contact) = self.contacts.read().get(user_id) {
            return Some(contact.clone());
        }
        self.keys
            .read()
            .values()
            .filter(|identity| identity.user_id() == user_id)
            .max_by_key(|identity| identity.modified())
            .cloned()
    }

    /// Known key, or a certificate issued by one of our roots.
    pub fn is_trusted(&self, identity: &Identity) -> bool {
        if self.keys.read().contains_key(identity.key_id()) {
            return true;
        }
        match identity.certificate() {
            Some(cert) => self
                .roots
                .read()
                .get(cert.issuer())
                .map(|root| cert.verified_by(root))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Whether `record` was signed by a cached key.
    pub fn check_signature(&self, record: &SignedRecord) -> bool {
        self.find_by_key(record.signer_id())
            .map(|signer| signer.verify(record))
            .unwrap_or(false)
    }

    /// Identity that signed `record`, or why it is not acceptable.
    pub fn signer_of(&self, record: &SignedRecord) -> Result<Identity> {
        let signer = self
            .find_by_key(record.signer_id())
            .ok_or_else(|| Error::trust(format!("unknown signing key {}", record.signer_id())))?;
        if !signer.verify(record) {
            return Err(Error::authentication(format!(
                "bad signature from {}",
                signer.user_id()
            )));
        }
        Ok(signer)
    }

    /// Add an identity to the address book. If the user is already a
    /// contact the stored entry is returned.
    pub fn add_contact(&self, identity: &Identity) -> Identity {
        self.add_key(identity);
        let mut contacts = self.contacts.write();
        if let Some(existing) = contacts.get(identity.user_id()) {
            return existing.clone();
        }
        info!("New contact {}", identity);
        contacts.insert(identity.user_id().clone(), identity.clone());
        identity.clone()
    }

    pub fn remove_contact(&self, user_id: &UserId) -> Option<Identity> {
        self.contacts.write().remove(user_id)
    }

    pub fn contacts(&self) -> Vec<Identity> {
        self.contacts.read().values().cloned().collect()
    }

    /// Replace a contact with a newer copy of its document.
    pub fn update_contact(&self, identity: &Identity) {
        self.add_key(identity);
        let mut contacts = self.contacts.write();
        if let Some(existing) = contacts.get_mut(identity.user_id()) {
            if identity.modified() >= existing.modified() {
                let nickname = existing.nickname().map(str::to_string);
                *existing = identity.clone();
                existing.set_nickname(nickname);
            }
        }
    }

    /// Set a contact's nickname, suffixing `_1`, `_2`, ... while another
    /// contact already uses the name.
    pub fn set_contact_name(&self, user_id: &UserId, name: &str) -> Result<String> {
        let mut contacts = self.contacts.write();
        let mut candidate = name.to_string();
        let mut counter = 0;
        while contacts
            .values()
            .any(|c| c.user_id() != user_id && c.display_name() == candidate)
        {
            counter += 1;
            candidate = format!("{}_{}", name, counter);
        }
        let contact = contacts
            .get_mut(user_id)
            .ok_or_else(|| Error::config(format!("unknown contact {}", user_id)))?;
        contact.set_nickname(Some(candidate.clone()));
        debug!("Contact {} is now known as {}", user_id, candidate);
        Ok(candidate)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = ContactsFile {
            contacts: self
                .contacts
                .read()
                .values()
                .map(|c| ContactEntry {
                    nickname: c.nickname().map(str::to_string),
                    identity: c.to_armored(),
                })
                .collect(),
            roots: self
                .roots
                .read()
                .values()
                .map(|r| r.record().to_armored())
                .collect(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// Load contacts and roots saved by [`save`](Self::save). Entries that
    /// fail to parse are skipped with a warning.
    pub fn load(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let file: ContactsFile = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        for entry in file.contacts {
            match Identity::from_armored(&entry.identity) {
                Ok(mut identity) => {
                    identity.set_nickname(entry.nickname);
                    self.add_contact(&identity);
                }
                Err(e) => warn!("Skipping unreadable contact: {}", e),
            }
        }
        for root in file.roots {
            match SignedRecord::from_armored(&root).and_then(Certificate::from_record) {
                Ok(cert) => {
                    if let Err(e) = self.add_root(cert) {
                        warn!("Skipping root: {}", e);
                    }
                }
                Err(e) => warn!("Skipping unreadable root: {}", e),
            }
        }
        Ok(())
    }
}
