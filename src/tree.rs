//! Materialized folder tree of a share.
//!
//! The tree is a pure projection of the event log: replaying the same
//! events in the same order always yields the same tree. Item events that
//! refer to an item or folder that does not exist (yet) are reported as
//! [`Error::LogInconsistency`] and leave the tree untouched.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::ids::{ContentId, EventId, ItemId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKind {
    Folder,
    File {
        content: Option<ContentId>,
        content_type: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    pub name: String,
    pub parent: Option<ItemId>,
    pub kind: ItemKind,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub creator: UserId,
    pub modifier: UserId,
}

impl Item {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, ItemKind::Folder)
    }

    pub fn content(&self) -> Option<&ContentId> {
        match &self.kind {
            ItemKind::File { content, .. } => content.as_ref(),
            ItemKind::Folder => None,
        }
    }

    pub fn len(&self) -> u64 {
        self.content().map(ContentId::length).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One recorded version of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub event: EventId,
    pub content: ContentId,
    pub content_type: String,
    pub modified: DateTime<Utc>,
    pub modifier: UserId,
}

/// Change in blob references caused by applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentChange {
    Acquire(ContentId),
    Release(ContentId),
}

#[derive(Debug, Default, Clone)]
pub struct ItemTree {
    items: HashMap<ItemId, Item>,
    root: Option<ItemId>,
    revisions: HashMap<ItemId, Vec<Revision>>,
}

impl ItemTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.root = None;
        self.revisions.clear();
    }

    pub fn root(&self) -> Option<&Item> {
        self.root.as_ref().and_then(|id| self.items.get(id))
    }

    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Children of a folder, sorted by name.
    pub fn children(&self, folder: &ItemId) -> Vec<&Item> {
        let mut children: Vec<&Item> = self
            .items
            .values()
            .filter(|item| item.parent.as_ref() == Some(folder))
            .collect();
        children.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        children
    }

    /// Content currently held by files, one entry per file.
    pub fn contents(&self) -> Vec<ContentId> {
        self.items.values().filter_map(|item| item.content().cloned()).collect()
    }

    pub fn revisions(&self, item: &ItemId) -> &[Revision] {
        self.revisions.get(item).map(Vec::as_slice).unwrap_or_default()
    }

    /// Slash-separated path of an item below the root.
    pub fn path_of(&self, id: &ItemId) -> Option<String> {
        let mut parts = Vec::new();
        let mut current = self.items.get(id)?;
        while let Some(parent) = &current.parent {
            parts.push(current.name.clone());
            current = self.items.get(parent)?;
        }
        parts.reverse();
        Some(format!("/{}", parts.join("/")))
    }

    pub fn find_by_path(&self, path: &str) -> Option<&Item> {
        let mut current = self.root()?;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self
                .children(&current.id)
                .into_iter()
                .find(|child| child.name == part)?;
        }
        Some(current)
    }

    /// Every item keyed by path, for listings and comparisons.
    pub fn listing(&self) -> BTreeMap<String, Item> {
        self.items
            .keys()
            .filter_map(|id| Some((self.path_of(id)?, self.items.get(id)?.clone())))
            .collect()
    }

    fn folder(&self, id: Option<&ItemId>) -> Option<&Item> {
        id.and_then(|id| self.items.get(id)).filter(|item| item.is_folder())
    }

    fn is_ancestor(&self, ancestor: &ItemId, item: &ItemId) -> bool {
        let mut current = Some(item.clone());
        while let Some(id) = current {
            if &id == ancestor {
                return true;
            }
            current = self.items.get(&id).and_then(|i| i.parent.clone());
        }
        false
    }

    /// Apply a tree event issued by `issuer`. Membership events are
    /// ignored.
    pub fn apply(&mut self, event: &Event, issuer: &UserId) -> Result<Vec<ContentChange>> {
        let Some(item_id) = event.item().cloned() else {
            return Ok(Vec::new());
        };

        match event.kind() {
            EventKind::CreateFolder { parent, name, modified } => {
                let parent_folder = self.folder(parent.as_ref()).map(|f| f.id.clone());
                let parent_id = match (parent_folder, &self.root) {
                    (Some(p), _) => Some(p),
                    (None, None) => None,
                    (None, Some(root)) if !name.is_empty() => Some(root.clone()),
                    (None, Some(_)) => {
                        return Err(Error::inconsistency(format!(
                            "{} tries to re-create the root folder",
                            event.id()
                        )));
                    }
                };
                let is_root = parent_id.is_none();
                self.insert(item_id.clone(), name, parent_id, ItemKind::Folder, *modified, issuer);
                if is_root {
                    self.root = Some(item_id);
                }
                Ok(Vec::new())
            }
            EventKind::CreateFile { parent, name, modified } => {
                let parent_id = self
                    .folder(parent.as_ref())
                    .map(|f| f.id.clone())
                    .or_else(|| self.root.clone())
                    .ok_or_else(|| Error::inconsistency("file created before the root folder"))?;
                let kind = ItemKind::File {
                    content: None,
                    content_type: "none".to_string(),
                };
                self.insert(item_id, name, Some(parent_id), kind, *modified, issuer);
                Ok(Vec::new())
            }
            EventKind::UpdateFile { content, content_type, modified } => {
                let item = self.items.get_mut(&item_id).ok_or_else(|| {
                    Error::inconsistency(format!("update of unknown item {}", item_id))
                })?;
                let ItemKind::File { content: current, content_type: ct } = &mut item.kind else {
                    return Err(Error::inconsistency(format!("update of folder {}", item_id)));
                };
                let mut changes = Vec::new();
                if current.as_ref() != Some(content) {
                    changes.push(ContentChange::Acquire(content.clone()));
                    if let Some(old) = current.take() {
                        changes.push(ContentChange::Release(old));
                    }
                    *current = Some(content.clone());
                }
                *ct = content_type.clone();
                item.modified = *modified;
                item.modifier = issuer.clone();

                self.revisions.entry(item_id).or_default().push(Revision {
                    event: event.id().clone(),
                    content: content.clone(),
                    content_type: content_type.clone(),
                    modified: *modified,
                    modifier: issuer.clone(),
                });
                Ok(changes)
            }
            EventKind::Move { parent, name, modified } => {
                if !self.items.contains_key(&item_id) {
                    return Err(Error::inconsistency(format!("move of unknown item {}", item_id)));
                }
                let parent_id = self
                    .folder(parent.as_ref())
                    .map(|f| f.id.clone())
                    .or_else(|| self.root.clone());
                if let Some(target) = &parent_id {
                    if self.is_ancestor(&item_id, target) {
                        return Err(Error::inconsistency(format!(
                            "move of {} into its own subtree",
                            item_id
                        )));
                    }
                }
                if let Some(item) = self.items.get_mut(&item_id) {
                    item.parent = parent_id;
                    item.name = name.clone();
                    item.modified = *modified;
                    item.modifier = issuer.clone();
                }
                Ok(Vec::new())
            }
            EventKind::Delete => {
                if !self.items.contains_key(&item_id) {
                    return Err(Error::inconsistency(format!("delete of unknown item {}", item_id)));
                }
                Ok(self.remove_subtree(&item_id))
            }
            EventKind::AddUser { .. } | EventKind::RemoveUser { .. } | EventKind::AddUserKey { .. } => {
                Ok(Vec::new())
            }
        }
    }

    fn insert(
        &mut self,
        id: ItemId,
        name: &str,
        parent: Option<ItemId>,
        kind: ItemKind,
        when: DateTime<Utc>,
        issuer: &UserId,
    ) {
        debug!("Creating item {} ({})", name, id);
        self.items.insert(
            id.clone(),
            Item {
                id,
                name: name.to_string(),
                parent,
                kind,
                created: when,
                modified: when,
                creator: issuer.clone(),
                modifier: issuer.clone(),
            },
        );
    }

    fn remove_subtree(&mut self, id: &ItemId) -> Vec<ContentChange> {
        let mut changes = Vec::new();
        let mut pending = vec![id.clone()];
        while let Some(next) = pending.pop() {
            pending.extend(self.children(&next).into_iter().map(|c| c.id.clone()));
            if let Some(item) = self.items.remove(&next) {
                if let Some(content) = item.content() {
                    changes.push(ContentChange::Release(content.clone()));
                }
            }
            self.revisions.remove(&next);
        }
        if self.root.as_ref() == Some(id) {
            self.root = None;
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use assert_matches::assert_matches;

    struct Fixture {
        me: LocalIdentity,
        tree: ItemTree,
        head: EventId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                me: LocalIdentity::generate("alice", "Alice").unwrap(),
                tree: ItemTree::new(),
                head: EventId::root(),
            }
        }

        fn apply(&mut self, item: &ItemId, kind: EventKind) -> Result<Vec<ContentChange>> {
            let event = Event::issue(&self.me, self.head.clone(), Some(item.clone()), kind).unwrap();
            self.head = event.id().clone();
            let issuer = self.me.user_id().clone();
            self.tree.apply(&event, &issuer)
        }

        fn folder(&mut self, parent: Option<&ItemId>, name: &str) -> ItemId {
            let id = ItemId::generate();
            self.apply(
                &id,
                EventKind::CreateFolder {
                    parent: parent.cloned(),
                    name: name.into(),
                    modified: Utc::now(),
                },
            )
            .unwrap();
            id
        }

        fn file(&mut self, parent: Option<&ItemId>, name: &str) -> ItemId {
            let id = ItemId::generate();
            self.apply(
                &id,
                EventKind::CreateFile {
                    parent: parent.cloned(),
                    name: name.into(),
                    modified: Utc::now(),
                },
            )
            .unwrap();
            id
        }
    }

    #[test]
    fn test_first_parentless_folder_becomes_root() {
        let mut f = Fixture::new();
        let root = f.folder(None, "");
        assert_eq!(f.tree.root().map(|r| &r.id), Some(&root));

        // Later parentless folders with a name go below the root
        let docs = f.folder(None, "docs");
        assert_eq!(f.tree.get(&docs).unwrap().parent.as_ref(), Some(&root));
        assert_eq!(f.tree.path_of(&docs).unwrap(), "/docs");
    }

    #[test]
    fn test_recreating_root_is_inconsistent() {
        let mut f = Fixture::new();
        f.folder(None, "");
        let result = f.apply(
            &ItemId::generate(),
            EventKind::CreateFolder { parent: None, name: String::new(), modified: Utc::now() },
        );
        assert_matches!(result, Err(Error::LogInconsistency(_)));
    }

    #[test]
    fn test_file_without_parent_lands_in_root() {
        let mut f = Fixture::new();
        let root = f.folder(None, "");
        let file = f.file(Some(&ItemId::generate()), "orphan.txt");
        assert_eq!(f.tree.get(&file).unwrap().parent.as_ref(), Some(&root));
    }

    #[test]
    fn test_update_tracks_content_and_revisions() {
        let mut f = Fixture::new();
        f.folder(None, "");
        let file = f.file(None, "a.txt");

        let v1 = ContentId::for_bytes(b"one");
        let v2 = ContentId::for_bytes(b"two");
        let changes = f
            .apply(&file, EventKind::UpdateFile { content: v1.clone(), content_type: "text/plain".into(), modified: Utc::now() })
            .unwrap();
        assert_eq!(changes, vec![ContentChange::Acquire(v1.clone())]);

        let changes = f
            .apply(&file, EventKind::UpdateFile { content: v2.clone(), content_type: "text/plain".into(), modified: Utc::now() })
            .unwrap();
        assert_eq!(changes, vec![ContentChange::Acquire(v2.clone()), ContentChange::Release(v1)]);
        assert_eq!(f.tree.get(&file).unwrap().content(), Some(&v2));
        assert_eq!(f.tree.revisions(&file).len(), 2);
    }

    #[test]
    fn test_update_unknown_item_is_inconsistent() {
        let mut f = Fixture::new();
        f.folder(None, "");
        let result = f.apply(
            &ItemId::generate(),
            EventKind::UpdateFile { content: ContentId::for_bytes(b"x"), content_type: "x".into(), modified: Utc::now() },
        );
        assert_matches!(result, Err(Error::LogInconsistency(_)));
    }

    #[test]
    fn test_move_and_reject_cycles() {
        let mut f = Fixture::new();
        f.folder(None, "");
        let a = f.folder(None, "a");
        let b = f.folder(Some(&a), "b");
        let file = f.file(Some(&b), "x.bin");

        f.apply(&file, EventKind::Move { parent: Some(a.clone()), name: "y.bin".into(), modified: Utc::now() })
            .unwrap();
        assert_eq!(f.tree.path_of(&file).unwrap(), "/a/y.bin");

        let result = f.apply(&a, EventKind::Move { parent: Some(b), name: "a".into(), modified: Utc::now() });
        assert_matches!(result, Err(Error::LogInconsistency(_)));
    }

    #[test]
    fn test_delete_folder_releases_contents() {
        let mut f = Fixture::new();
        f.folder(None, "");
        let dir = f.folder(None, "photos");
        let file = f.file(Some(&dir), "cat.jpg");
        let content = ContentId::for_bytes(b"meow");
        f.apply(&file, EventKind::UpdateFile { content: content.clone(), content_type: "image/jpeg".into(), modified: Utc::now() })
            .unwrap();

        let changes = f.apply(&dir, EventKind::Delete).unwrap();
        assert_eq!(changes, vec![ContentChange::Release(content)]);
        assert!(f.tree.get(&file).is_none());
        assert!(f.tree.find_by_path("/photos").is_none());
        assert_eq!(f.tree.len(), 1);
    }

    #[test]
    fn test_find_by_path() {
        let mut f = Fixture::new();
        f.folder(None, "");
        let a = f.folder(None, "a");
        let file = f.file(Some(&a), "notes.md");
        assert_eq!(f.tree.find_by_path("/a/notes.md").map(|i| &i.id), Some(&file));
        assert!(f.tree.find_by_path("/").unwrap().is_folder());
    }
}
