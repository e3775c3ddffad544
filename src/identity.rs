//! # Identities
//!
//! This module provides the cryptographic identity layer:
//! - [`KeyPair`]: Ed25519 signing keys, persisted with restrictive permissions
//! - [`Certificate`]: a subject/key binding signed by an issuing root
//! - [`Identity`]: a self-signed, self-describing identity document
//! - [`LocalIdentity`]: the identity this node acts as, plus its keys
//!
//! Key fingerprints are the hex SHA-256 of the public key bytes. A user id
//! is the hex SHA-256 of the certificate subject for certificate-based
//! identities, and the key fingerprint otherwise. Only the former survives
//! a key change.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::Path;

use crate::error::{Error, Result};
use crate::ids::UserId;
use crate::record::SignedRecord;

const ALGO: &str = "ed25519";

/// Fingerprint of a public key.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn parse_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::malformed("public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| Error::malformed(format!("invalid public key: {}", e)))
}

/// Ed25519 key pair of a node.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: [u8; 32],
    #[serde(default)]
    identity: Option<String>,
}

impl KeyPair {
    pub fn generate() -> Self {
        let mut csprng = OsRng {};
        Self {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn key_id(&self) -> String {
        key_fingerprint(&self.signing_key.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("key_id", &self.key_id()).finish()
    }
}

/// Binding of a subject name to a public key, signed by an issuer.
///
/// A root certificate is self-signed (`issuer == subject`).
#[derive(Clone, Debug)]
pub struct Certificate {
    record: SignedRecord,
    subject: String,
    issuer: String,
    key: VerifyingKey,
}

impl Certificate {
    pub fn issue(issuer_keys: &KeyPair, issuer: &str, subject: &str, key: &VerifyingKey) -> Self {
        let mut record = SignedRecord::from_props([
            ("subject", subject.to_string()),
            ("issuer", issuer.to_string()),
            ("key", hex::encode(key.as_bytes())),
            ("algo", ALGO.to_string()),
        ]);
        record.sign(issuer_keys);
        Self {
            record,
            subject: subject.to_string(),
            issuer: issuer.to_string(),
            key: *key,
        }
    }

    /// Root certificate for `keys`.
    pub fn self_signed(keys: &KeyPair, subject: &str) -> Self {
        Self::issue(keys, subject, subject, &keys.verifying_key())
    }

    pub fn from_record(record: SignedRecord) -> Result<Self> {
        let subject = record.require("subject")?.to_string();
        let issuer = record.require("issuer")?.to_string();
        let key = parse_key(record.require("key")?)?;
        Ok(Self { record, subject, issuer, key })
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        Self::from_record(SignedRecord::parse(raw)?)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn key(&self) -> &VerifyingKey {
        &self.key
    }

    pub fn record(&self) -> &SignedRecord {
        &self.record
    }

    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer && self.verified_by(self)
    }

    /// Whether `issuer` issued and signed this certificate.
    pub fn verified_by(&self, issuer: &Certificate) -> bool {
        issuer.subject == self.issuer
            && self.record.signer_id() == key_fingerprint(&issuer.key)
            && self.record.verify_with(&issuer.key)
    }
}

/// A user's public, self-signed identity document.
///
/// Equality is by user id: two documents for the same user with different
/// keys or addresses compare equal.
#[derive(Clone, Debug)]
pub struct Identity {
    record: SignedRecord,
    key: VerifyingKey,
    key_id: String,
    user_id: UserId,
    certificate: Option<Certificate>,
    nickname: Option<String>,
}

impl Identity {
    pub fn create(
        keys: &KeyPair,
        name: &str,
        full_name: &str,
        certificate: Option<Certificate>,
    ) -> Result<Self> {
        let mut record = SignedRecord::new();
        record.set("name", name);
        record.set("fullname", full_name);
        match &certificate {
            Some(cert) => {
                if cert.key() != &keys.verifying_key() {
                    return Err(Error::config("certificate was issued for a different key"));
                }
                record.set("cert", hex::encode(cert.record().to_bytes()?));
            }
            None => {
                record.set("key", keys.public_key_hex());
                record.set("algo", ALGO);
            }
        }
        record.sign(keys);
        Self::from_record(record)
    }

    /// Validate a received identity document: the key it carries must have
    /// made the signature.
    pub fn from_record(record: SignedRecord) -> Result<Self> {
        let certificate = match record.get("cert") {
            Some(cert_hex) => Some(Certificate::parse(&hex::decode(cert_hex)?)?),
            None => None,
        };
        let key = match &certificate {
            Some(cert) => *cert.key(),
            None => parse_key(record.require("key")?)?,
        };
        let key_id = key_fingerprint(&key);
        if record.signer_id() != key_id {
            return Err(Error::authentication(format!(
                "identity signed by {} instead of its own key {}",
                record.signer_id(),
                key_id
            )));
        }
        if !record.verify_with(&key) {
            return Err(Error::authentication("identity self-signature does not verify"));
        }
        let user_id = match &certificate {
            Some(cert) => UserId::new(hex::encode(Sha256::digest(cert.subject().as_bytes()))),
            None => UserId::new(key_id.clone()),
        };
        Ok(Self {
            record,
            key,
            key_id,
            user_id,
            certificate,
            nickname: None,
        })
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        Self::from_record(SignedRecord::parse(raw)?)
    }

    pub fn from_armored(text: &str) -> Result<Self> {
        Self::from_record(SignedRecord::from_armored(text)?)
    }

    pub fn to_armored(&self) -> String {
        self.record.to_armored()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.record.to_bytes()
    }

    pub fn record(&self) -> &SignedRecord {
        &self.record
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn key(&self) -> &VerifyingKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        self.record.get("name").unwrap_or_default()
    }

    pub fn full_name(&self) -> &str {
        self.record.get("fullname").unwrap_or_default()
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn has_certificate(&self) -> bool {
        self.certificate.is_some()
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Local display name; never part of the signed document.
    pub fn set_nickname(&mut self, nickname: Option<String>) {
        self.nickname = nickname;
    }

    pub fn display_name(&self) -> &str {
        self.nickname.as_deref().unwrap_or_else(|| self.name())
    }

    /// Last known listening address, if this copy came from a registration.
    pub fn address(&self) -> Option<&str> {
        self.record.get("address").filter(|a| !a.is_empty())
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.record
            .get("modified")
            .and_then(|m| DateTime::parse_from_rfc3339(m).ok())
            .map(|m| m.with_timezone(&Utc))
    }

    /// Whether `record` was signed by this identity's key.
    pub fn verify(&self, record: &SignedRecord) -> bool {
        record.signer_id() == self.key_id && record.verify_with(&self.key)
    }

    /// Re-signed copy carrying the address and timestamp published to
    /// lookup servers.
    pub fn with_registration(
        &self,
        keys: &KeyPair,
        address: Option<&str>,
        modified: DateTime<Utc>,
    ) -> Result<Self> {
        if keys.key_id() != self.key_id {
            return Err(Error::config("registration must be signed with the identity's own key"));
        }
        let mut record = self.record.clone();
        record.set("address", address.unwrap_or_default());
        record.set("modified", modified.to_rfc3339());
        record.sign(keys);
        let mut identity = Self::from_record(record)?;
        identity.nickname = self.nickname.clone();
        Ok(identity)
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.user_id.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name(), self.user_id)
    }
}

/// The identity this node acts as, together with the keys to sign as it.
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    keys: KeyPair,
    identity: Identity,
}

impl LocalIdentity {
    pub fn new(keys: KeyPair, identity: Identity) -> Result<Self> {
        if keys.key_id() != identity.key_id() {
            return Err(Error::config("identity document does not match the key pair"));
        }
        Ok(Self { keys, identity })
    }

    /// Fresh key-based identity.
    pub fn generate(name: &str, full_name: &str) -> Result<Self> {
        let keys = KeyPair::generate();
        let identity = Identity::create(&keys, name, full_name, None)?;
        Ok(Self { keys, identity })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: IdentityFile =
            toml::from_str(&content).map_err(|e| Error::config(format!("invalid identity file: {}", e)))?;
        let keys = KeyPair::from_secret(&file.secret_key);
        let identity = match file.identity {
            Some(text) => Identity::from_armored(&text)?,
            None => Identity::create(&keys, "anonymous", "", None)?,
        };
        Self::new(keys, identity)
    }

    pub fn load_or_generate(path: &Path, name: &str) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let local = Self::generate(name, name)?;
            local.save(path)?;
            Ok(local)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = IdentityFile {
            secret_key: self.keys.secret_bytes(),
            identity: Some(self.identity.to_armored()),
        };
        let content =
            toml::to_string_pretty(&file).map_err(|e| Error::config(e.to_string()))?;
        std::fs::write(path, content)?;

        // Set restrictive permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    pub fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn user_id(&self) -> &UserId {
        self.identity.user_id()
    }

    pub fn key_id(&self) -> &str {
        self.identity.key_id()
    }

    pub fn sign(&self, record: &mut SignedRecord) {
        record.sign(&self.keys);
    }

    /// Handshake proof that we hold the key for our identity.
    pub fn nonce_proof(&self, nonce: &str) -> SignedRecord {
        let mut record = SignedRecord::from_props([("nonce", nonce)]);
        record.sign(&self.keys);
        record
    }

    /// Switch to a new key (and optionally a new certificate), keeping the
    /// names. The user id only survives when a certificate with the same
    /// subject is supplied.
    pub fn rotate(&self, certificate: Option<Certificate>, keys: KeyPair) -> Result<Self> {
        let identity = Identity::create(
            &keys,
            self.identity.name(),
            self.identity.full_name(),
            certificate,
        )?;
        Ok(Self { keys, identity })
    }
}
