//! Identifiers used across the event log, the transfer engine and the wire.
//!
//! Event and share ids are scoped to the user that created them
//! (`"<userId>:<uuid>"`), item ids are plain UUIDs, and content ids are the
//! digest and length of a blob (`"<hex digest>:<length>"`).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Stable identifier of a user: the digest of its certificate subject, or
/// its key fingerprint for key-only identities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn scoped_id(user: &UserId) -> String {
    format!("{}:{}", user, Uuid::new_v4())
}

fn scope_of(id: &str) -> Option<UserId> {
    id.split_once(':').map(|(user, _)| UserId::new(user))
}

/// Id of a single event. The empty id denotes the null root every chain
/// starts from. Ordering is plain string order, which is what sibling
/// replay sorts by.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate(issuer: &UserId) -> Self {
        Self(scoped_id(issuer))
    }

    /// The null root.
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse(s: &str) -> Result<Self> {
        if !s.is_empty() && scope_of(s).is_none() {
            return Err(Error::malformed(format!("invalid event id '{}'", s)));
        }
        Ok(Self(s.to_string()))
    }

    /// The user that issued this event.
    pub fn issuer(&self) -> Option<UserId> {
        scope_of(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of a shared folder, scoped to the user that created it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareId(String);

impl ShareId {
    pub fn generate(creator: &UserId) -> Self {
        Self(scoped_id(creator))
    }

    pub fn parse(s: &str) -> Result<Self> {
        match scope_of(s) {
            Some(user) if !user.is_empty() => Ok(Self(s.to_string())),
            _ => Err(Error::malformed(format!("invalid share id '{}'", s))),
        }
    }

    pub fn creator(&self) -> Option<UserId> {
        scope_of(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of a folder or file in the materialized tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content address of a blob: hex digest plus byte length. Equality is by
/// value.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentId {
    checksum: String,
    length: u64,
}

impl ContentId {
    pub fn new(checksum: impl Into<String>, length: u64) -> Self {
        Self {
            checksum: checksum.into(),
            length,
        }
    }

    /// Content id of an in-memory buffer.
    pub fn for_bytes(data: &[u8]) -> Self {
        Self::new(blake3::hash(data).to_hex().to_string(), data.len() as u64)
    }

    pub fn parse(s: &str) -> Result<Self> {
        let (checksum, length) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::malformed(format!("invalid content id '{}'", s)))?;
        if checksum.is_empty() || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::malformed(format!("invalid content checksum '{}'", checksum)));
        }
        let length = length
            .parse::<u64>()
            .map_err(|_| Error::malformed(format!("invalid content length '{}'", length)))?;
        Ok(Self::new(checksum, length))
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// Name of the file this blob is stored under.
    pub fn file_name(&self) -> String {
        format!("{}.blob", self.checksum)
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.checksum, self.length)
    }
}

impl TryFrom<String> for ContentId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.to_string()
    }
}
