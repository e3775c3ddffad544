//! # Command Line Interface
//!
//! This module provides the command-line interface for SlyMesh, including
//! argument parsing, command definitions, and command implementations.
//!
//! ## Commands
//!
//! - `init` - Initialize configuration and generate the node identity
//! - `id` - Display the user id of this node
//! - `identity export|import` - Exchange armored identities with contacts
//! - `share create|list|show` - Manage shares
//! - `invite`, `invites`, `accept`, `reject` - Invitations
//! - `put`, `mkdir`, `get` - Work with share contents
//! - `lookup-server` - Run a rendezvous/relay server
//! - `daemon` - Run the node and keep shares in sync
//! - `status` - Show node status

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::{Config, DEFAULT_LOOKUP_PORT};
use crate::identity::{Certificate, LocalIdentity};
use crate::ids::ShareId;
use crate::lookup::LookupServer;
use crate::node::LocalNode;
use crate::record::SignedRecord;
use crate::share::ShareModel;

/// How long `get` waits for the whole file.
const GET_TIMEOUT: Duration = Duration::from_secs(300);

/// Command-line interface structure for SlyMesh.
#[derive(Parser)]
#[command(name = "slymesh")]
#[command(about = "Peer-to-peer shared folders built on a signed event log")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Initialize configuration and generate the node identity
    Init {
        /// Name to publish in the identity
        #[arg(short, long, default_value = "anonymous")]
        name: String,
    },

    /// Display this node's user id
    Id,

    /// Export or import armored identities
    Identity {
        #[command(subcommand)]
        command: IdentityCommands,
    },

    /// Create, list and inspect shares
    Share {
        #[command(subcommand)]
        command: ShareCommands,
    },

    /// Invite a contact into a share
    Invite {
        /// Share id or name
        share: String,
        /// File holding the invitee's armored identity
        identity_file: PathBuf,
        /// Message shown to the invitee
        #[arg(short, long, default_value = "")]
        greeting: String,
    },

    /// List invitations waiting for a decision
    Invites,

    /// Accept an invitation
    Accept {
        /// Share id from `invites`
        share: String,
    },

    /// Decline an invitation
    Reject {
        /// Share id from `invites`
        share: String,
    },

    /// Copy a local file into a share
    Put {
        share: String,
        file: PathBuf,
        /// Target folder path inside the share
        #[arg(short, long)]
        folder: Option<String>,
    },

    /// Create a folder in a share
    Mkdir {
        share: String,
        /// Folder path inside the share; parents must exist
        name: String,
    },

    /// Copy a file out of a share, downloading it if needed
    Get {
        share: String,
        /// Item path inside the share
        item: String,
        out: PathBuf,
    },

    /// Run a lookup (rendezvous and relay) server
    LookupServer {
        #[arg(short, long, default_value_t = DEFAULT_LOOKUP_PORT)]
        port: u16,
    },

    /// Run the node and keep shares in sync
    Daemon,

    /// Display node status
    Status,
}

#[derive(Subcommand)]
pub enum IdentityCommands {
    /// Write our armored identity to a file
    Export { file: PathBuf },
    /// Add the armored identity in a file to our contacts
    Import { file: PathBuf },
}

#[derive(Subcommand)]
pub enum ShareCommands {
    /// Create a new share
    Create { name: String },
    /// List shares
    List,
    /// Show a share's members, tree and event log
    Show { share: String },
}

pub async fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Init { name } => init(&name).await,
        Commands::Id => show_id().await,
        Commands::Identity { command } => match command {
            IdentityCommands::Export { file } => export_identity(file).await,
            IdentityCommands::Import { file } => import_identity(file).await,
        },
        Commands::Share { command } => match command {
            ShareCommands::Create { name } => create_share(&name).await,
            ShareCommands::List => list_shares().await,
            ShareCommands::Show { share } => show_share(&share).await,
        },
        Commands::Invite { share, identity_file, greeting } => invite(&share, identity_file, &greeting).await,
        Commands::Invites => show_invites().await,
        Commands::Accept { share } => answer_invite(&share, true).await,
        Commands::Reject { share } => answer_invite(&share, false).await,
        Commands::Put { share, file, folder } => put_file(&share, file, folder).await,
        Commands::Mkdir { share, name } => make_folder(&share, &name).await,
        Commands::Get { share, item, out } => get_file(&share, &item, out).await,
        Commands::LookupServer { port } => run_lookup_server(port).await,
        Commands::Daemon => run_daemon().await,
        Commands::Status => show_status().await,
    }
}

/// Initialize SlyMesh configuration and generate the node identity.
pub async fn init(name: &str) -> Result<()> {
    info!("Initializing SlyMesh...");

    let mut config = Config::init().await?;
    info!("Configuration initialized at: {}", config.config_path().display());

    let identity_path = config.identity_path()?;
    let local = LocalIdentity::load_or_generate(&identity_path, name)?;
    config.node_id = local.user_id().to_string();
    config.save().await?;
    info!("Node identity saved to: {}", identity_path.display());

    println!("✅ SlyMesh initialized successfully!");
    println!("User ID: {}", local.user_id());

    Ok(())
}

async fn load_identity(config: &Config) -> Result<LocalIdentity> {
    let path = config.identity_path()?;
    if !path.exists() {
        anyhow::bail!("No identity at {}. Run 'slymesh init' first.", path.display());
    }
    Ok(LocalIdentity::load(&path)?)
}

/// Load the configuration and open the node it describes.
async fn open_node() -> Result<(Config, Arc<LocalNode>)> {
    let config = Config::load().await?;
    let local = load_identity(&config).await?;
    let node = LocalNode::open(local, config.node_options()?).await?;
    for path in &config.trusted_roots {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read root certificate {}", path.display()))?;
        let root = SignedRecord::from_armored(&text).and_then(Certificate::from_record)?;
        node.trust().add_root(root)?;
    }
    Ok((config, node))
}

fn find_share(node: &LocalNode, key: &str) -> Result<Arc<ShareModel>> {
    Ok(node.find_share(key)?)
}

/// Display the user id of this node.
pub async fn show_id() -> Result<()> {
    let config = Config::load().await?;
    let local = load_identity(&config).await?;
    println!("{}", local.user_id());
    Ok(())
}

pub async fn export_identity(file: PathBuf) -> Result<()> {
    let config = Config::load().await?;
    let local = load_identity(&config).await?;
    tokio::fs::write(&file, local.identity().to_armored()).await?;
    println!("✅ Identity written to {}", file.display());
    Ok(())
}

pub async fn import_identity(file: PathBuf) -> Result<()> {
    let text = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;
    let (_, node) = open_node().await?;
    let contact = node.import_identity(&text)?;
    println!("✅ Added contact {} ({})", contact.display_name(), contact.user_id());
    Ok(())
}

pub async fn create_share(name: &str) -> Result<()> {
    let (mut config, node) = open_node().await?;
    let share = node.create_share(name)?;
    config.add_share(share.id().as_str(), name, share.created());
    config.save().await?;

    println!("✅ Created share '{}'", name);
    println!("   Share ID: {}", share.id());
    Ok(())
}

pub async fn list_shares() -> Result<()> {
    let (_, node) = open_node().await?;
    let shares = node.shares();
    if shares.is_empty() {
        println!("No shares yet.");
        println!("Create one with: slymesh share create <name>");
        return Ok(());
    }

    println!("📂 Shares\n");
    for share in shares {
        println!("  {} ({})", share.name().bold(), share.id());
        println!(
            "    {} members, {} items, {} events",
            share.members().len(),
            share.listing().len(),
            share.event_count()
        );
    }
    Ok(())
}

pub async fn show_share(key: &str) -> Result<()> {
    let (_, node) = open_node().await?;
    let share = find_share(&node, key)?;

    println!("📂 {} ({})", share.name().bold(), share.id());
    println!("   Created: {}", share.created().format("%Y-%m-%d %H:%M:%S UTC"));

    println!("\nMembers:");
    for member in share.members() {
        println!("  {} ({})", member.display_name(), member.user_id());
    }
    let invites = share.pending_invites();
    if !invites.is_empty() {
        println!("\nInvited:");
        for invite in invites {
            let state = if invite.sent { "sent" } else { "waiting" };
            println!("  {} ({})", invite.invitee.display_name(), state);
        }
    }

    println!("\nItems:");
    for (path, item) in share.listing() {
        if item.is_folder() {
            println!("  {}/", path.trim_end_matches('/'));
        } else {
            println!("  {} ({} bytes)", path, item.len());
        }
    }

    println!("\nEvents:");
    for line in share.print_log() {
        println!("  {}", line);
    }
    Ok(())
}

pub async fn invite(key: &str, identity_file: PathBuf, greeting: &str) -> Result<()> {
    let text = tokio::fs::read_to_string(&identity_file)
        .await
        .with_context(|| format!("cannot read {}", identity_file.display()))?;
    let (_, node) = open_node().await?;
    let share = find_share(&node, key)?;
    let invitee = node.import_identity(&text)?;
    node.invite(share.id(), &invitee, greeting)?;

    println!("📨 Invited {} to '{}'", invitee.display_name(), share.name());
    println!("   The invitation is delivered while the daemon runs.");
    Ok(())
}

pub async fn show_invites() -> Result<()> {
    let (_, node) = open_node().await?;
    let invites = node.pending_invites();
    if invites.is_empty() {
        println!("No pending invitations.");
        return Ok(());
    }
    for invite in invites {
        println!("📨 '{}' ({})", invite.name.bold(), invite.share);
        if !invite.greeting.is_empty() {
            println!("   \"{}\"", invite.greeting);
        }
        let inviters: Vec<String> = invite.inviters.iter().map(ToString::to_string).collect();
        println!("   From: {}", inviters.join(", "));
    }
    Ok(())
}

pub async fn answer_invite(key: &str, accept: bool) -> Result<()> {
    let share = ShareId::parse(key)?;
    let (mut config, node) = open_node().await?;
    if accept {
        let model = node.accept(&share)?;
        config.add_share(model.id().as_str(), &model.name(), model.created());
        config.save().await?;
        println!("✅ Accepted '{}'. The daemon will sync it.", model.name());
    } else {
        node.reject(&share)?;
        println!("Declined the invitation to {}", share);
    }
    node.shutdown();
    Ok(())
}

fn folder_at(share: &ShareModel, path: &str) -> Result<crate::ids::ItemId> {
    let item = share
        .find(path)
        .ok_or_else(|| anyhow::anyhow!("no folder {} in '{}'", path, share.name()))?;
    if !item.is_folder() {
        anyhow::bail!("{} is not a folder", path);
    }
    Ok(item.id)
}

pub async fn put_file(key: &str, file: PathBuf, folder: Option<String>) -> Result<()> {
    if !file.is_file() {
        anyhow::bail!("Not a file: {}", file.display());
    }
    let (_, node) = open_node().await?;
    let share = find_share(&node, key)?;
    let parent = folder.as_deref().map(|path| folder_at(&share, path)).transpose()?;
    share.put_file(parent.as_ref(), &file).await?;
    node.shutdown();

    println!("✅ Added {} to '{}'", file.display(), share.name());
    Ok(())
}

pub async fn make_folder(key: &str, path: &str) -> Result<()> {
    let (_, node) = open_node().await?;
    let share = find_share(&node, key)?;
    let trimmed = path.trim_matches('/');
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some((parent, name)) => (Some(folder_at(&share, &format!("/{}", parent))?), name),
        None => (None, trimmed),
    };
    share.create_folder(parent.as_ref(), name)?;
    node.shutdown();

    println!("✅ Created /{} in '{}'", trimmed, share.name());
    Ok(())
}

pub async fn get_file(key: &str, path: &str, out: PathBuf) -> Result<()> {
    let (config, node) = open_node().await?;
    let share = find_share(&node, key)?;
    let item = share
        .find(path)
        .ok_or_else(|| anyhow::anyhow!("no item {} in '{}'", path, share.name()))?;
    if item.is_folder() {
        anyhow::bail!("{} is a folder", path);
    }

    if let Some(content) = item.content() {
        if content.length() > 0 {
            node.start(None, &config.lookup_servers).await?;
        }
    }
    let data = tokio::time::timeout(GET_TIMEOUT, share.read_file(&item.id))
        .await
        .map_err(|_| anyhow::anyhow!("download of {} timed out", path))??;
    tokio::fs::write(&out, &data).await?;
    node.shutdown();

    println!("✅ Wrote {} bytes to {}", data.len(), out.display());
    Ok(())
}

pub async fn run_lookup_server(port: u16) -> Result<()> {
    let (local, accept_anonymous) = match Config::load().await {
        Ok(config) => (load_identity(&config).await.ok().map(Arc::new), config.accept_anonymous),
        Err(_) => (None, true),
    };
    let server = LookupServer::new(local, accept_anonymous);
    let addr = server.listen(&format!("0.0.0.0:{}", port)).await?;

    println!("🌐 Lookup server listening on {}", addr);
    println!("Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    let stats = server.stats();
    server.shutdown();
    println!("\n🛑 Lookup server stopped ({} clients registered)", stats.registered);
    Ok(())
}

pub async fn run_daemon() -> Result<()> {
    info!("Starting SlyMesh daemon...");
    let (mut config, node) = open_node().await?;

    let listen = config.listen_address();
    let bound = node.start(Some(&listen), &config.lookup_servers).await?;
    let reporter = node.bandwidth().start_stats_reporter(Duration::from_secs(30));

    println!("🚀 SlyMesh daemon starting...");
    println!("User ID: {}", node.user_id());
    if let Some(addr) = bound {
        println!("Listening on: {}", addr);
    }
    if config.lookup_servers.is_empty() {
        warn!("No lookup servers configured; only direct connections are possible");
    }

    let mut changed = false;
    for share in node.shares() {
        changed |= config.add_share(share.id().as_str(), &share.name(), share.created());
    }
    if changed {
        config.save().await?;
    }
    println!("💚 SlyMesh daemon is running with {} share(s). Press Ctrl+C to stop.", node.shares().len());

    let mut invites = node.subscribe_invites();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            received = invites.recv() => match received {
                Ok(invite) => println!(
                    "📨 Invitation to '{}' ({}). Run 'slymesh accept {}' to join.",
                    invite.name, invite.share, invite.share
                ),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tokio::signal::ctrl_c().await?;
                    break;
                }
            },
        }
    }

    println!("\n🛑 SlyMesh daemon stopping...");
    reporter.abort();
    node.shutdown();
    Ok(())
}

pub async fn show_status() -> Result<()> {
    let (config, node) = open_node().await?;
    let status = node.status();

    println!("📊 SlyMesh Status\n");
    println!("  User ID: {}", status.user_id);
    println!("  Listen port: {}", config.listen_port);
    println!("  Lookup servers: {}", config.lookup_servers.len());
    println!("  Shares: {}", status.shares);
    println!("  Pending invitations: {}", status.pending_invites);
    println!(
        "  Blob store: {} blobs ({} in use), {}",
        status.storage.blobs,
        status.storage.used,
        format_bytes(status.storage.total_size)
    );
    println!(
        "  Bandwidth limits: up {}, down {}",
        format_limit(config.bandwidth_limit_up),
        format_limit(config.bandwidth_limit_down)
    );
    println!("  Contacts: {}", node.trust().contacts().len());
    node.shutdown();
    Ok(())
}

fn format_limit(limit: Option<u64>) -> String {
    match limit {
        Some(bytes) => format!("{}/s", format_bytes(bytes)),
        None => "unlimited".to_string(),
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
