//! dispersa - dispersed, fault-tolerant file storage
//!
//! Usage:
//!   dispersa init                         - Write a local configuration
//!   dispersa status                       - Show backends, escrow and service levels
//!   dispersa upload <file> [dir]          - Upload a file
//!   dispersa download <path> <file>       - Download a file
//!   dispersa list [dir]                   - List a directory

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use dispersa::{
    config::Config,
    context::StoreContext,
    metadata::FileRecord,
    pool::ServiceLevel,
    storage::{TransferObserver, TransferState},
    transfer::{Orchestrator, UploadOptions},
    Error, Result,
};
use tracing::{debug, error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "dispersa")]
#[command(author = "dispersa Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dispersed, fault-tolerant file storage")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/dispersa/config.json")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration with local directory backends and escrow
    Init {
        /// Directory holding metadata, backends and escrow
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Owner of uploaded files
        #[arg(long)]
        user: Option<String>,

        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show configuration, backends and escrow endpoints
    Status,

    /// Create a directory
    Mkdir {
        /// Remote path of the new directory
        path: String,
    },

    /// Upload a local file
    Upload {
        /// Local file
        source: PathBuf,

        /// Remote directory (defaults to the root)
        #[arg(default_value = "")]
        directory: String,

        /// Service level (Premium, Free, Open, Paranoid)
        #[arg(long)]
        sla: Option<String>,

        /// Remote name (defaults to the local file name)
        #[arg(long)]
        name: Option<String>,

        /// Store without encryption
        #[arg(long, conflicts_with = "encrypt")]
        no_encrypt: bool,

        /// Encrypt even if the service level does not
        #[arg(long)]
        encrypt: bool,
    },

    /// Download a file
    Download {
        /// Remote path
        path: String,

        /// Local target file
        target: PathBuf,
    },

    /// Delete a file or an empty directory
    Delete {
        /// Remote path
        path: String,
    },

    /// Move or rename a file or directory
    Move {
        /// Remote path
        path: String,

        /// Remote target directory
        directory: String,

        /// New name
        #[arg(long)]
        name: Option<String>,
    },

    /// List a directory
    List {
        /// Remote directory (defaults to the root)
        #[arg(default_value = "")]
        path: String,
    },
}

fn main() {
    let cli = Cli::parse();

    // Expand ~ in config path
    let config_path = expand_tilde(&cli.config);

    // Setup logging: -v, then RUST_LOG, then the configured level
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = Config::load(&config_path)
                .ok()
                .and_then(|config| Level::from_str(&config.logging.level).ok())
                .unwrap_or(Level::INFO);
            EnvFilter::new(level.as_str())
        })
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");

    // Run the command
    if let Err(e) = run_command(cli.command, &config_path) {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::Init {
            data_dir,
            user,
            force,
        } => cmd_init(config_path, data_dir, user, force),

        Commands::Status => cmd_status(config_path),

        Commands::Mkdir { path } => block_on(cmd_mkdir(config_path, &path)),

        Commands::Upload {
            source,
            directory,
            sla,
            name,
            no_encrypt,
            encrypt,
        } => {
            let encrypt = match (encrypt, no_encrypt) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            block_on(cmd_upload(config_path, &source, &directory, sla, name, encrypt))
        }

        Commands::Download { path, target } => block_on(cmd_download(config_path, &path, &target)),

        Commands::Delete { path } => block_on(cmd_delete(config_path, &path)),

        Commands::Move {
            path,
            directory,
            name,
        } => block_on(cmd_move(config_path, &path, &directory, name)),

        Commands::List { path } => block_on(cmd_list(config_path, &path)),
    }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
    runtime.block_on(future)
}

fn cmd_init(
    config_path: &Path,
    data_dir: Option<PathBuf>,
    user: Option<String>,
    force: bool,
) -> Result<()> {
    if config_path.exists() && !force {
        return Err(Error::AlreadyExists(format!(
            "{} (use --force to overwrite)",
            config_path.display()
        )));
    }
    info!("Initializing dispersa...");

    let mut config = match data_dir {
        Some(dir) => Config::local(expand_tilde(&dir)),
        None => Config::default(),
    };
    if let Some(user) = user {
        config.user = user;
    }
    config.validate()?;

    // Ensure config directory exists
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    config.save(config_path)?;
    config.ensure_directories()?;

    info!("Configuration saved to {:?}", config_path);
    info!("Data directory: {:?}", config.data_dir);
    info!(
        "{} backends, {} escrow endpoints (threshold {})",
        config.backends.len(),
        config.escrow.endpoints.len(),
        config.escrow.threshold
    );
    Ok(())
}

fn cmd_status(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;

    println!("dispersa Status");
    println!("===============");
    println!();
    println!("Configuration: {:?}", config_path);
    println!("Data directory: {:?}", config.data_dir);
    println!("User: {}", config.user);
    println!("Packet size: {} bytes", config.transfer.packet_size);
    println!("Default service level: {}", config.transfer.default_sla);
    println!();

    println!("Service levels:");
    for sla in ServiceLevel::catalog() {
        println!(
            "  {:<10} {} of {} stripes, tolerates {} lost, {}",
            sla.name,
            sla.data_stripes,
            sla.total_stripes,
            sla.fault_tolerance(),
            if sla.encrypt { "encrypted" } else { "plain" }
        );
    }
    println!();

    let ctx = StoreContext::from_config(&config)?;
    println!("Backends:");
    for endpoint in ctx.pool.endpoints() {
        println!("  {:<12} {:<10} {}", endpoint.name(), endpoint.kind(), endpoint.base_uri());
    }
    println!();

    let runtime = tokio::runtime::Runtime::new().map_err(|e| Error::Internal(e.to_string()))?;
    runtime.block_on(async {
        println!("Escrow endpoints (threshold {}):", ctx.escrow_threshold);
        for endpoint in ctx.escrow.endpoints() {
            match endpoint.version().await {
                Ok(version) => println!("  {:<12} online (v{})", endpoint.name(), version),
                Err(e) => println!("  {:<12} unreachable - {}", endpoint.name(), e),
            }
        }
        Ok::<_, Error>(())
    })?;

    Ok(())
}

async fn cmd_mkdir(config_path: &Path, path: &str) -> Result<()> {
    let (orchestrator, user) = open(config_path)?;
    let (parent, name) = split_parent(&remote_path(&user, path))?;
    let parent = orchestrator.find(&parent).await?;
    let dir = orchestrator.create_directory(parent.id, &name).await?;
    info!("Created {}", orchestrator.canonical_name(dir.id).await?);
    Ok(())
}

async fn cmd_upload(
    config_path: &Path,
    source: &Path,
    directory: &str,
    sla: Option<String>,
    name: Option<String>,
    encrypt: Option<bool>,
) -> Result<()> {
    let (orchestrator, user) = open(config_path)?;
    let sla = match sla {
        Some(sla) => ServiceLevel::by_name(&sla)?,
        None => ServiceLevel::by_name(&orchestrator.context().transfer.default_sla)?,
    };

    let parent = orchestrator.find(&remote_path(&user, directory)).await?;
    let mut options = UploadOptions::new(sla);
    if let Some(name) = name {
        options = options.with_name(name);
    }
    if let Some(encrypt) = encrypt {
        options = options.with_encryption(encrypt);
    }

    let record = orchestrator
        .upload(source, parent.id, &options, Some(Arc::new(LogObserver)))
        .await?;
    info!(
        "Uploaded {} as {} ({} bytes, {} service level)",
        source.display(),
        orchestrator.canonical_name(record.id).await?,
        record.length,
        record.sla
    );
    Ok(())
}

async fn cmd_download(config_path: &Path, path: &str, target: &Path) -> Result<()> {
    let (orchestrator, user) = open(config_path)?;
    let record = orchestrator.find(&remote_path(&user, path)).await?;
    let written = orchestrator
        .download_to_path(record.id, target, Some(Arc::new(LogObserver)))
        .await?;
    info!("Downloaded {} bytes to {}", written, target.display());
    Ok(())
}

async fn cmd_delete(config_path: &Path, path: &str) -> Result<()> {
    let (orchestrator, user) = open(config_path)?;
    let record = orchestrator.find(&remote_path(&user, path)).await?;
    orchestrator.delete(record.id, Some(Arc::new(LogObserver))).await?;
    info!("Deleted {}", path);
    Ok(())
}

async fn cmd_move(
    config_path: &Path,
    path: &str,
    directory: &str,
    name: Option<String>,
) -> Result<()> {
    let (orchestrator, user) = open(config_path)?;
    let record = orchestrator.find(&remote_path(&user, path)).await?;
    let target = orchestrator.find(&remote_path(&user, directory)).await?;
    let moved = orchestrator
        .move_entry(record.id, target.id, name.as_deref())
        .await?;
    info!("Moved to {}", orchestrator.canonical_name(moved.id).await?);
    Ok(())
}

async fn cmd_list(config_path: &Path, path: &str) -> Result<()> {
    let (orchestrator, user) = open(config_path)?;
    let dir = orchestrator.find(&remote_path(&user, path)).await?;
    let mut entries = orchestrator.list_directory(dir.id).await?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    println!("{}:", orchestrator.canonical_name(dir.id).await?);
    for entry in &entries {
        println!("  {}", describe(entry));
    }
    if entries.is_empty() {
        println!("  (empty)");
    }
    Ok(())
}

fn describe(record: &FileRecord) -> String {
    if record.is_directory() {
        format!("{}/", record.name)
    } else {
        format!(
            "{:<32} {:>12} bytes  {:<9} {}/{}{}",
            record.name,
            record.length,
            record.sla,
            record.min_stripes,
            record.stripes.len(),
            if record.encrypted { "  encrypted" } else { "" }
        )
    }
}

fn open(config_path: &Path) -> Result<(Orchestrator, String)> {
    let config = Config::load(config_path)?;
    let ctx = StoreContext::from_config(&config)?;
    Ok((Orchestrator::new(Arc::new(ctx)), config.user))
}

/// Absolute paths are taken as-is, anything else is below the user's root
fn remote_path(user: &str, path: &str) -> String {
    let path = path.trim_end_matches('/');
    if path.starts_with('/') {
        path.to_string()
    } else if path.is_empty() {
        format!("/{}", user)
    } else {
        format!("/{}/{}", user, path)
    }
}

fn split_parent(path: &str) -> Result<(String, String)> {
    match path.rsplit_once('/') {
        Some((parent, name)) if !parent.is_empty() && !name.is_empty() => {
            Ok((parent.to_string(), name.to_string()))
        }
        _ => Err(Error::PathNotFound(path.to_string())),
    }
}

/// Reports transfer progress through the log
struct LogObserver;

impl TransferObserver for LogObserver {
    fn progress_made(&self, percent: u8) {
        debug!("{}%", percent);
    }

    fn progress_with_state(&self, percent: u8, state: TransferState) {
        debug!("{}% ({:?})", percent, state);
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
