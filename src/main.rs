//! revfs - lazily-materialized virtual filesystem for source-control checkouts
//!
//! Usage:
//!   revfs init                  - Write a default configuration
//!   revfs show-config           - Print the effective configuration
//!   revfs demo                  - Run a checkout end-to-end in a temp dir
//!   revfs mount <mount_point>   - Mount a demo repository over FUSE

use anyhow::Context;
use clap::{Parser, Subcommand};
use revfs::checkout::CheckoutMode;
use revfs::fuse::RevFs;
use revfs::mount::RevMount;
use revfs::store::{EntryKind, MemoryStore};
use revfs::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "revfs")]
#[command(author = "revfs Contributors")]
#[command(version)]
#[command(about = "Lazily-materialized virtual filesystem for source-control checkouts")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/revfs/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Print the effective configuration
    ShowConfig,

    /// Build a two-commit demo repository, run a checkout between the
    /// commits, and print the result
    Demo,

    /// Mount a demo repository at the given mount point
    Mount {
        /// Mount point directory
        mount_point: PathBuf,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("failed to set subscriber");

    let config_path = expand_tilde(&cli.config);

    match cli.command {
        Commands::Init => cmd_init(&config_path),
        Commands::ShowConfig => cmd_show_config(&config_path),
        Commands::Demo => cmd_demo(&config_path),
        Commands::Mount {
            mount_point,
            allow_other,
        } => cmd_mount(&config_path, &mount_point, allow_other),
    }
}

fn load_or_default(config_path: &PathBuf) -> Config {
    if config_path.exists() {
        Config::load(config_path).unwrap_or_else(|e| {
            tracing::warn!("ignoring bad config: {}", e);
            Config::default()
        })
    } else {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }
}

fn cmd_init(config_path: &PathBuf) -> anyhow::Result<()> {
    let mut config = Config::default();
    config.apply_env_overrides();

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    config.save(config_path).context("failed to save config")?;
    config.ensure_directories()?;

    info!("configuration saved to {:?}", config_path);
    info!("state directory: {:?}", config.state_dir);
    Ok(())
}

fn cmd_show_config(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = load_or_default(config_path);
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Build a small two-commit repository in the store
fn demo_store() -> (Arc<MemoryStore>, revfs::store::Hash, revfs::store::Hash) {
    let store = Arc::new(MemoryStore::new());
    let base = store.commit_from_entries(&[
        ("README.md", "revfs demo\n", EntryKind::RegularFile),
        ("src/main.rs", "fn main() {}\n", EntryKind::RegularFile),
        ("src/lib.rs", "pub fn demo() {}\n", EntryKind::RegularFile),
        ("tools/build.sh", "#!/bin/sh\n", EntryKind::ExecutableFile),
    ]);
    let next = store.commit_from_entries(&[
        ("README.md", "revfs demo\n", EntryKind::RegularFile),
        ("src/main.rs", "fn main() { demo() }\n", EntryKind::RegularFile),
        ("src/util.rs", "pub fn util() {}\n", EntryKind::RegularFile),
        ("tools/build.sh", "#!/bin/sh\n", EntryKind::ExecutableFile),
    ]);
    (store, base, next)
}

fn cmd_demo(_config_path: &PathBuf) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let state_dir = std::env::temp_dir().join(format!("revfs-demo-{}", std::process::id()));
    let result = runtime.block_on(async {
        let mut config = Config::default();
        config.state_dir = state_dir.clone();

        let (store, base, next) = demo_store();
        let mount = RevMount::new(&config, store).await?;
        mount.start()?;

        let first = mount.checkout(base, CheckoutMode::Normal).await?;
        info!(
            "checked out base commit {} ({} conflicts)",
            base,
            first.conflicts.len()
        );

        let second = mount.checkout(next, CheckoutMode::Normal).await?;
        println!("checkout {} -> {}", base, next);
        println!("  changed paths: {:?}", second.changed_paths);
        println!("  conflicts: {:?}", second.conflicts);

        let status = mount.diff(next, false, true).await?;
        println!("  status clean: {}", status.is_clean());

        mount.shutdown(false).await?;
        Ok(())
    });
    let _ = std::fs::remove_dir_all(&state_dir);
    result
}

fn cmd_mount(config_path: &PathBuf, mount_point: &PathBuf, allow_other: bool) -> anyhow::Result<()> {
    let mut config = load_or_default(config_path);
    config.mount.mount_point = mount_point.clone();
    config.mount.allow_other = allow_other;
    config.ensure_directories()?;

    let runtime = tokio::runtime::Runtime::new()?;
    let handle = runtime.handle().clone();

    let mount = runtime.block_on(async {
        let (store, base, _next) = demo_store();
        let mount = RevMount::new(&config, store).await?;
        mount.start()?;
        if mount.parent_commits().await.is_empty() {
            mount.checkout(base, CheckoutMode::Normal).await?;
        }
        Ok::<_, revfs::Error>(mount)
    })?;

    std::fs::create_dir_all(mount_point)?;
    info!("mounting at {:?}", mount_point);

    let fs = RevFs::new(Arc::clone(&mount), handle);
    let serve_result = fs.serve(mount_point, allow_other);

    runtime.block_on(async {
        mount.begin_unmount();
        mount.shutdown(false).await
    })?;

    serve_result.context("fuse session ended with an error")?;
    Ok(())
}

/// Expand ~ to home directory
fn expand_tilde(path: &PathBuf) -> PathBuf {
    if path.starts_with("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(path.strip_prefix("~").unwrap());
        }
    }
    path.clone()
}
