//! Integration tests for the slymesh binary
//!
//! These run the built binary against a throwaway configuration directory
//! and check what it prints.

use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn slymesh(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_slymesh"))
        .args(args)
        .env("SLYMESH_CONFIG_DIR", config_dir)
        .env("RUST_LOG", "slymesh=warn")
        .output()
        .expect("failed to run slymesh")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_cli_init_and_id() {
    let dir = TempDir::new().unwrap();

    let init = slymesh(dir.path(), &["init", "--name", "alice"]);
    assert!(init.status.success());
    assert!(stdout(&init).contains("SlyMesh initialized successfully"));
    assert!(dir.path().join("config.toml").exists());
    assert!(dir.path().join("identity.key").exists());

    let id = slymesh(dir.path(), &["id"]);
    assert!(id.status.success());
    let user_id = stdout(&id).trim().to_string();
    assert!(stdout(&init).contains(&user_id));
}

#[test]
fn test_cli_requires_init() {
    let dir = TempDir::new().unwrap();
    let output = slymesh(dir.path(), &["share", "list"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"));
    assert!(stderr.contains("slymesh init"));
}

#[test]
fn test_cli_share_workflow() {
    let dir = TempDir::new().unwrap();
    assert!(slymesh(dir.path(), &["init"]).status.success());

    let create = slymesh(dir.path(), &["share", "create", "Notes"]);
    assert!(create.status.success());
    assert!(stdout(&create).contains("Created share 'Notes'"));

    assert!(slymesh(dir.path(), &["mkdir", "Notes", "drafts"]).status.success());
    let file = dir.path().join("todo.txt");
    std::fs::write(&file, "buy milk").unwrap();
    let put = slymesh(dir.path(), &["put", "Notes", file.to_str().unwrap(), "--folder", "/drafts"]);
    assert!(put.status.success());

    let show = slymesh(dir.path(), &["share", "show", "Notes"]);
    assert!(show.status.success());
    let text = stdout(&show);
    assert!(text.contains("/drafts/todo.txt (8 bytes)"));
    assert!(text.contains("CREATE_FOLDER"));
    assert!(text.contains("UPDATE_FILE"));

    let out = dir.path().join("copy.txt");
    let get = slymesh(dir.path(), &["get", "Notes", "/drafts/todo.txt", out.to_str().unwrap()]);
    assert!(get.status.success());
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "buy milk");

    let list = slymesh(dir.path(), &["share", "list"]);
    assert!(stdout(&list).contains("Notes"));
}

#[test]
fn test_cli_identity_exchange() {
    let alice = TempDir::new().unwrap();
    let bob = TempDir::new().unwrap();
    assert!(slymesh(alice.path(), &["init", "--name", "alice"]).status.success());
    assert!(slymesh(bob.path(), &["init", "--name", "bob"]).status.success());

    let exported = bob.path().join("bob.id");
    assert!(slymesh(bob.path(), &["identity", "export", exported.to_str().unwrap()]).status.success());
    let import = slymesh(alice.path(), &["identity", "import", exported.to_str().unwrap()]);
    assert!(import.status.success());
    assert!(stdout(&import).contains("Added contact bob"));

    assert!(slymesh(alice.path(), &["share", "create", "Shared"]).status.success());
    let invite = slymesh(alice.path(), &["invite", "Shared", exported.to_str().unwrap()]);
    assert!(invite.status.success());

    let show = slymesh(alice.path(), &["share", "show", "Shared"]);
    assert!(stdout(&show).contains("Invited:"));
}

#[test]
fn test_cli_invites_empty() {
    let dir = TempDir::new().unwrap();
    assert!(slymesh(dir.path(), &["init"]).status.success());
    let output = slymesh(dir.path(), &["invites"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("No pending invitations"));
    assert!(!slymesh(dir.path(), &["accept", "nobody:nothing"]).status.success());
}
