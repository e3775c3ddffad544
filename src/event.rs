//! Signed share events.
//!
//! An [`Event`] is one mutation of a share: membership changes and folder
//! tree changes. Each event names its issuer's previous head as parent, so
//! every issuer forms a chain; across issuers the events form a DAG.
//!
//! On the wire an event is a [`SignedRecord`] with these properties:
//!
//! | property   | meaning                                      |
//! |------------|----------------------------------------------|
//! | `e_type`   | event type, e.g. `CREATE_FILE`               |
//! | `e_id`     | event id                                     |
//! | `e_parent` | parent event id (empty for the root)         |
//! | `item`     | target item for tree events                  |
//! | `info`     | armored identity for membership events       |
//! | `parent`   | parent folder for create/move (empty = none) |
//! | `name`, `modified`, `size`, `data`, `ct` | per type       |

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{Error, Result};
use crate::identity::{Identity, LocalIdentity};
use crate::ids::{ContentId, EventId, ItemId, UserId};
use crate::record::SignedRecord;

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    AddUser { info: Identity },
    RemoveUser { info: Identity },
    /// Introduces a new key for an existing member
    AddUserKey { info: Identity },
    CreateFolder {
        parent: Option<ItemId>,
        name: String,
        modified: DateTime<Utc>,
    },
    CreateFile {
        parent: Option<ItemId>,
        name: String,
        modified: DateTime<Utc>,
    },
    UpdateFile {
        content: ContentId,
        content_type: String,
        modified: DateTime<Utc>,
    },
    Move {
        parent: Option<ItemId>,
        name: String,
        modified: DateTime<Utc>,
    },
    Delete,
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::AddUser { .. } => "ADD_USER",
            EventKind::RemoveUser { .. } => "REMOVE_USER",
            EventKind::AddUserKey { .. } => "ADD_USER_KEY",
            EventKind::CreateFolder { .. } => "CREATE_FOLDER",
            EventKind::CreateFile { .. } => "CREATE_FILE",
            EventKind::UpdateFile { .. } => "UPDATE_FILE",
            EventKind::Move { .. } => "MOVE",
            EventKind::Delete => "DELETE",
        }
    }

    /// Whether the event targets an item of the folder tree.
    pub fn is_item_event(&self) -> bool {
        !matches!(
            self,
            EventKind::AddUser { .. } | EventKind::RemoveUser { .. } | EventKind::AddUserKey { .. }
        )
    }

    fn write_props(&self, record: &mut SignedRecord) {
        match self {
            EventKind::AddUser { info }
            | EventKind::RemoveUser { info }
            | EventKind::AddUserKey { info } => {
                record.set("info", info.to_armored());
            }
            EventKind::CreateFolder { parent, name, modified }
            | EventKind::CreateFile { parent, name, modified }
            | EventKind::Move { parent, name, modified } => {
                record.set("parent", parent.as_ref().map(ItemId::as_str).unwrap_or_default());
                record.set("name", name.as_str());
                record.set("modified", modified.to_rfc3339());
            }
            EventKind::UpdateFile { content, content_type, modified } => {
                record.set("size", content.length().to_string());
                record.set("data", content.to_string());
                record.set("ct", content_type.as_str());
                record.set("modified", modified.to_rfc3339());
            }
            EventKind::Delete => {}
        }
    }

    fn read_props(type_name: &str, record: &SignedRecord) -> Result<Self> {
        let info = || Identity::from_armored(record.require("info")?);
        let parent = || -> Option<ItemId> {
            record.get("parent").filter(|p| !p.is_empty()).map(ItemId::new)
        };
        let name = || record.require("name").map(str::to_string);
        let modified = || parse_time(record.require("modified")?);

        Ok(match type_name {
            "ADD_USER" => EventKind::AddUser { info: info()? },
            "REMOVE_USER" => EventKind::RemoveUser { info: info()? },
            "ADD_USER_KEY" => EventKind::AddUserKey { info: info()? },
            "CREATE_FOLDER" => EventKind::CreateFolder {
                parent: parent(),
                name: name()?,
                modified: modified()?,
            },
            "CREATE_FILE" => EventKind::CreateFile {
                parent: parent(),
                name: name()?,
                modified: modified()?,
            },
            "UPDATE_FILE" => EventKind::UpdateFile {
                content: ContentId::parse(record.require("data")?)?,
                content_type: record.get("ct").unwrap_or("application/octet-stream").to_string(),
                modified: modified()?,
            },
            "MOVE" => EventKind::Move {
                parent: parent(),
                name: name()?,
                modified: modified()?,
            },
            "DELETE" => EventKind::Delete,
            other => return Err(Error::malformed(format!("unknown event type '{}'", other))),
        })
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::malformed(format!("invalid timestamp '{}': {}", s, e)))
}

/// A signed, immutable share event.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    parent: EventId,
    item: Option<ItemId>,
    kind: EventKind,
    record: SignedRecord,
}

impl Event {
    /// Create and sign a new event on top of `parent`.
    pub fn issue(
        local: &LocalIdentity,
        parent: EventId,
        item: Option<ItemId>,
        kind: EventKind,
    ) -> Result<Self> {
        if kind.is_item_event() && item.is_none() {
            return Err(Error::malformed(format!("{} event needs an item", kind.type_name())));
        }
        let id = EventId::generate(local.user_id());
        let mut record = SignedRecord::new();
        record.set("e_type", kind.type_name());
        record.set("e_id", id.as_str());
        record.set("e_parent", parent.as_str());
        if let Some(item) = &item {
            record.set("item", item.as_str());
        }
        kind.write_props(&mut record);
        local.sign(&mut record);
        Ok(Self { id, parent, item, kind, record })
    }

    /// Parse an event record. Signatures are checked by the event log, not
    /// here.
    pub fn from_record(record: SignedRecord) -> Result<Self> {
        let id = EventId::parse(record.require("e_id")?)?;
        if id.is_root() {
            return Err(Error::malformed("event without an id"));
        }
        let parent = EventId::parse(record.get("e_parent").unwrap_or_default())?;
        let item = record.get("item").filter(|i| !i.is_empty()).map(ItemId::new);
        let kind = EventKind::read_props(record.require("e_type")?, &record)?;
        if kind.is_item_event() && item.is_none() {
            return Err(Error::malformed(format!("{} event {} has no item", kind.type_name(), id)));
        }
        Ok(Self { id, parent, item, kind, record })
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        Self::from_record(SignedRecord::parse(raw)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.record.to_bytes()
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn parent(&self) -> &EventId {
        &self.parent
    }

    pub fn parent_is(&self, head: &EventId) -> bool {
        &self.parent == head
    }

    pub fn item(&self) -> Option<&ItemId> {
        self.item.as_ref()
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn record(&self) -> &SignedRecord {
        &self.record
    }

    /// Fingerprint of the key that signed the event.
    pub fn signer_id(&self) -> &str {
        self.record.signer_id()
    }

    pub fn issuer(&self) -> Option<UserId> {
        self.id.issuer()
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.type_name(), self.id)?;
        if let Some(item) = &self.item {
            write!(f, " item={}", item)?;
        }
        write!(f, " parent={}", if self.parent.is_root() { "-" } else { self.parent.as_str() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn local() -> LocalIdentity {
        LocalIdentity::generate("alice", "Alice").unwrap()
    }

    #[test]
    fn test_issue_sets_identity_and_parent() {
        let me = local();
        let event = Event::issue(
            &me,
            EventId::root(),
            Some(ItemId::generate()),
            EventKind::CreateFolder { parent: None, name: "docs".into(), modified: Utc::now() },
        )
        .unwrap();

        assert_eq!(event.issuer().as_ref(), Some(me.user_id()));
        assert!(event.parent_is(&EventId::root()));
        assert_eq!(event.signer_id(), me.key_id());
        assert!(me.identity().verify(event.record()));
        assert_eq!(event.record().get("parent"), Some(""));
    }

    #[test]
    fn test_parse_signed_bytes() {
        let me = local();
        let content = ContentId::for_bytes(b"file body");
        let event = Event::issue(
            &me,
            EventId::generate(me.user_id()),
            Some(ItemId::generate()),
            EventKind::UpdateFile {
                content: content.clone(),
                content_type: "text/plain".into(),
                modified: Utc::now(),
            },
        )
        .unwrap();

        let parsed = Event::parse(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, event);
        assert_matches!(parsed.kind(), EventKind::UpdateFile { content: c, .. } if *c == content);
        assert_eq!(parsed.record().get("size"), Some("9"));
    }

    #[test]
    fn test_membership_event_embeds_identity() {
        let me = local();
        let friend = LocalIdentity::generate("bob", "Bob").unwrap();
        let event = Event::issue(
            &me,
            EventId::root(),
            None,
            EventKind::AddUser { info: friend.identity().clone() },
        )
        .unwrap();

        let parsed = Event::from_record(event.record().clone()).unwrap();
        assert_matches!(parsed.kind(), EventKind::AddUser { info } if info.user_id() == friend.user_id());
    }

    #[test]
    fn test_item_event_requires_item() {
        let me = local();
        let result = Event::issue(&me, EventId::root(), None, EventKind::Delete);
        assert_matches!(result, Err(Error::Malformed(_)));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let me = local();
        let mut record = SignedRecord::from_props([
            ("e_type", "EXPLODE"),
            ("e_id", "someone:1"),
            ("e_parent", ""),
        ]);
        me.sign(&mut record);
        assert_matches!(Event::from_record(record), Err(Error::Malformed(_)));
    }

    #[test]
    fn test_events_order_by_id() {
        let me = local();
        let mut events: Vec<Event> = (0..5)
            .map(|_| {
                Event::issue(&me, EventId::root(), Some(ItemId::generate()), EventKind::Delete).unwrap()
            })
            .collect();
        events.sort();
        for pair in events.windows(2) {
            assert!(pair[0].id() < pair[1].id());
        }
    }
}
