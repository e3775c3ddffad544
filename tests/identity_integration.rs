//! Identity documents, certificates and trust decisions through the public
//! API.

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use slymesh::identity::{Certificate, Identity, KeyPair, LocalIdentity};
use slymesh::record::SignedRecord;
use slymesh::trust::TrustContext;
use slymesh::Error;

#[test]
fn test_armored_identity_round_trip() {
    let alice = LocalIdentity::generate("alice", "Alice Liddell").unwrap();
    let armored = alice.identity().to_armored();
    assert!(armored.starts_with("### BEGIN SLYMESH SIGNED DATA"));

    let parsed = Identity::from_armored(&armored).unwrap();
    assert_eq!(&parsed, alice.identity());
    assert_eq!(parsed.user_id(), alice.user_id());
    assert_eq!(parsed.key_id(), alice.key_id());
    assert_eq!(parsed.full_name(), "Alice Liddell");
}

#[test]
fn test_tampered_identity_is_rejected() {
    let alice = LocalIdentity::generate("alice", "Alice").unwrap();
    let mut record = alice.identity().record().clone();
    record.set("fullname", "Mallory");
    let raw = record.to_bytes().unwrap();
    assert_matches!(Identity::parse(&raw), Err(Error::Authentication(_)));
}

#[test]
fn test_identity_file_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("identity.key");
    let first = LocalIdentity::load_or_generate(&path, "alice").unwrap();
    let second = LocalIdentity::load_or_generate(&path, "someone else").unwrap();
    assert_eq!(first.user_id(), second.user_id());
    assert_eq!(second.identity().name(), "alice");
}

#[test]
fn test_certified_user_keeps_id_across_keys() {
    let root_keys = KeyPair::generate();
    let root = Certificate::self_signed(&root_keys, "CN=Example Root");

    let old_keys = KeyPair::generate();
    let cert = Certificate::issue(&root_keys, root.subject(), "CN=Alice", &old_keys.verifying_key());
    let old = LocalIdentity::new(
        old_keys.clone(),
        Identity::create(&old_keys, "alice", "Alice", Some(cert)).unwrap(),
    )
    .unwrap();

    let new_keys = KeyPair::generate();
    let new_cert = Certificate::issue(&root_keys, root.subject(), "CN=Alice", &new_keys.verifying_key());
    let new = old.rotate(Some(new_cert), new_keys).unwrap();
    assert_eq!(new.user_id(), old.user_id());
    assert!(new.key_id() != old.key_id());

    // Someone who only trusts the root accepts the new key unseen
    let bob = LocalIdentity::generate("bob", "Bob").unwrap();
    let trust = TrustContext::new(bob.identity());
    assert!(!trust.is_trusted(new.identity()));
    trust.add_root(root).unwrap();
    assert!(trust.is_trusted(new.identity()));
}

#[test]
fn test_records_from_unknown_keys_need_trust() {
    let alice = LocalIdentity::generate("alice", "Alice").unwrap();
    let bob = LocalIdentity::generate("bob", "Bob").unwrap();
    let trust = TrustContext::new(bob.identity());

    let mut record = SignedRecord::from_props([("greeting", "hello")]);
    alice.sign(&mut record);
    assert_matches!(trust.signer_of(&record), Err(Error::Trust(_)));
    assert!(!trust.check_signature(&record));

    trust.add_contact(alice.identity());
    assert_eq!(trust.signer_of(&record).unwrap().user_id(), alice.user_id());

    record.set("greeting", "goodbye");
    assert_matches!(trust.signer_of(&record), Err(Error::Authentication(_)));
}

#[test]
fn test_contacts_persist_with_roots() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("contacts.json");
    let me = LocalIdentity::generate("me", "Me").unwrap();
    let alice = LocalIdentity::generate("alice", "Alice").unwrap();
    let root_keys = KeyPair::generate();
    let root = Certificate::self_signed(&root_keys, "CN=Root");

    let trust = TrustContext::new(me.identity());
    trust.add_contact(alice.identity());
    trust.add_root(root).unwrap();
    trust.save(&path).unwrap();

    let restored = TrustContext::new(me.identity());
    restored.load(&path).unwrap();
    assert_eq!(restored.contacts().len(), 1);
    assert!(restored.is_trusted(alice.identity()));

    let keys = KeyPair::generate();
    let cert = Certificate::issue(&root_keys, "CN=Root", "CN=Carol", &keys.verifying_key());
    let carol = Identity::create(&keys, "carol", "Carol", Some(cert)).unwrap();
    assert!(restored.is_trusted(&carol));
}
