//! # Nudge — follow-up scheduler
//!
//! Usage:
//!   nudge serve                                   # HTTP triggers + periodic scan
//!   nudge serve --port 8080 --no-scan             # Triggers only
//!   nudge enqueue --contact c-1 --company acme    # One contact, best matching sequence
//!   nudge scan                                    # One inactivity sweep
//!   nudge init                                    # Write default config, create schema

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use nudge_core::NudgeConfig;
use nudge_scheduler::{
    ContactStateStore, Enqueuer, EnqueuerSettings, FollowUpDb, FollowUpQueue, SqliteDirectory,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nudge", version, about = "⏰ Nudge — automated follow-up scheduler")]
struct Cli {
    /// Config file (default: ~/.nudge/config.toml, or $NUDGE_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway and the periodic inactivity scan
    Serve {
        /// Gateway port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Disable the periodic scan loop
        #[arg(long)]
        no_scan: bool,
    },
    /// Enqueue a single contact
    Enqueue {
        #[arg(long)]
        contact: String,

        #[arg(long)]
        company: String,

        /// Explicit sequence (may rebind a contact already in a sequence)
        #[arg(long)]
        sequence: Option<String>,
    },
    /// Run one inactivity scan across every company
    Scan,
    /// Write the default config (if missing) and create the database schema
    Init,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .or_else(|| std::env::var("NUDGE_CONFIG").ok())
        .map(|p| PathBuf::from(expand_path(&p)))
        .unwrap_or_else(NudgeConfig::default_path)
}

fn load_config(path: &Path) -> Result<NudgeConfig> {
    if path.exists() {
        Ok(NudgeConfig::load_from(path)?)
    } else {
        tracing::debug!("No config at {}, using defaults", path.display());
        Ok(NudgeConfig::default())
    }
}

fn open_db(config: &NudgeConfig) -> Result<Arc<FollowUpDb>> {
    let db_path = expand_path(&config.database.path);
    if let Some(parent) = Path::new(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = FollowUpDb::open(Path::new(&db_path))?;
    tracing::info!("💾 Follow-up DB: {}", db_path);
    Ok(Arc::new(db))
}

fn build_enqueuer(config: &NudgeConfig, db: Arc<FollowUpDb>) -> Enqueuer {
    Enqueuer::new(
        Arc::new(SqliteDirectory::new(db.clone())),
        ContactStateStore::new(db.clone()),
        FollowUpQueue::new(db),
        EnqueuerSettings::from_config(&config.scheduler),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "nudge=debug,nudge_scheduler=debug,nudge_gateway=debug,tower_http=debug"
    } else {
        "nudge=info,nudge_scheduler=info,nudge_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let path = config_path(&cli);
    let mut config = load_config(&path)?;

    match cli.command {
        Command::Init => {
            if !path.exists() {
                config.save_to(&path)?;
                println!("✅ Config written: {}", path.display());
            } else {
                println!("⚠️  Config already exists: {}", path.display());
            }
            open_db(&config)?;
            println!("✅ Database ready: {}", expand_path(&config.database.path));
        }
        Command::Enqueue {
            contact,
            company,
            sequence,
        } => {
            let enqueuer = build_enqueuer(&config, open_db(&config)?);
            let outcome = enqueuer
                .enqueue_for_contact(&contact, &company, sequence.as_deref())
                .await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "success": true,
                    "message": outcome.message(),
                    "enqueued": outcome.enqueued,
                    "reason": outcome.reason,
                    "sequenceId": outcome.sequence_id,
                    "scheduledAt": outcome.scheduled_at,
                }))?
            );
        }
        Command::Scan => {
            let enqueuer = build_enqueuer(&config, open_db(&config)?);
            let summary = enqueuer.scan_and_enqueue_inactive_contacts().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "success": true,
                    "scanned": summary.scanned,
                    "enqueued": summary.enqueued,
                    "skipped": summary.skipped,
                    "failed": summary.failed,
                }))?
            );
        }
        Command::Serve {
            port,
            host,
            no_scan,
        } => {
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if let Some(host) = host {
                config.gateway.host = host;
            }
            let enqueuer = Arc::new(build_enqueuer(&config, open_db(&config)?));

            println!("⏰ Nudge v{}", env!("CARGO_PKG_VERSION"));
            if config.scheduler.scan_enabled && !no_scan {
                tokio::spawn(nudge_scheduler::spawn_scan_loop(
                    enqueuer.clone(),
                    config.scheduler.scan_interval_secs,
                ));
            } else {
                tracing::info!("Periodic scan disabled");
            }

            let state = nudge_gateway::AppState::new(config.gateway.clone(), enqueuer);
            nudge_gateway::start(state).await?;
        }
    }

    Ok(())
}
