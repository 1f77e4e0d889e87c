use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hushdrop_engine::{EngineConfig, NewSecret, RedeemError, RedemptionLedger};
use serde_json::json;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "hushdrop", about = "hushdrop — secrets with a reveal limit", version)]
struct Cli {
    /// Data directory holding hushdrop.db (default: $HUSHDROP_DATA_DIR or platform dir)
    #[arg(long, env = "HUSHDROP_DATA_DIR", global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new random master key file (never overwrites)
    Keygen {
        /// Destination path for the hex-encoded key
        path: PathBuf,
    },
    /// Create a secret from MESSAGE, or from stdin when MESSAGE is `-`
    Create {
        message: String,
        /// Time until expiry, e.g. 1h, 30m, 7d
        #[arg(long, default_value = "24h")]
        ttl: String,
        /// Number of distinct successful reveals allowed
        #[arg(long, default_value_t = 1)]
        winners: u32,
        /// Delete the secret right after its first reveal
        #[arg(long)]
        one_time: bool,
        /// Require this password to reveal ($HUSHDROP_PASSWORD)
        #[arg(long, env = "HUSHDROP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Show a secret's metadata (never its content)
    Meta { id: Uuid },
    /// Check a password without using up a reveal
    Unlock {
        id: Uuid,
        #[arg(long, env = "HUSHDROP_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Reveal a secret, consuming one slot
    View {
        id: Uuid,
        #[arg(long, env = "HUSHDROP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Identifier recorded against the reveal
        #[arg(long)]
        viewer: Option<String>,
    },
    /// Delete a secret (no error if it is already gone)
    Remove { id: Uuid },
    /// Delete all expired secrets
    Sweep {
        /// Keep running, sweeping every $HUSHDROP_SWEEP_SECS seconds
        #[arg(long)]
        watch: bool,
    },
    /// Print the shareable URL for a secret
    Share { id: Uuid },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("HUSHDROP_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        let kind = e
            .downcast_ref::<RedeemError>()
            .map(RedeemError::kind)
            .unwrap_or("error");
        eprintln!("{}", json!({ "error": kind, "message": format!("{e:#}") }));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut cfg = EngineConfig::default();
    if cli.data_dir.is_some() {
        cfg.data_dir = cli.data_dir;
    }

    match cli.command {
        Commands::Keygen { path } => {
            hushdrop_engine::config::write_new_key_file(&path)?;
            println!("{}", json!({ "key_file": path.display().to_string() }));
            Ok(())
        }
        Commands::Share { id } => {
            println!("{}", hushdrop_engine::config::share_url(&cfg.public_base_url, &id));
            Ok(())
        }
        Commands::Create {
            message,
            ttl,
            winners,
            one_time,
            password,
        } => cmd_create(&open(&cfg)?, message, &ttl, winners, one_time, password),
        Commands::Meta { id } => {
            let meta = open(&cfg)?.get_metadata(&id)?;
            println!("{}", serde_json::to_string(&meta)?);
            Ok(())
        }
        Commands::Unlock { id, password } => {
            open(&cfg)?.unlock(&id, &password)?;
            println!("{}", json!({ "id": id, "unlocked": true }));
            Ok(())
        }
        Commands::View {
            id,
            password,
            viewer,
        } => cmd_view(&open(&cfg)?, &id, password.as_deref(), viewer.as_deref()),
        Commands::Remove { id } => {
            open(&cfg)?.remove(&id)?;
            println!("{}", json!({ "id": id, "removed": true }));
            Ok(())
        }
        Commands::Sweep { watch } => cmd_sweep(open(&cfg)?, watch, cfg.sweep_interval).await,
    }
}

// ── Command implementations ───────────────────────────────────────────────────

/// Startup fails here if the master key is missing or malformed.
fn open(cfg: &EngineConfig) -> Result<RedemptionLedger> {
    let key = hushdrop_engine::resolve_master_key()?;
    hushdrop_engine::open_ledger(cfg, key)
}

fn cmd_create(
    ledger: &RedemptionLedger,
    message: String,
    ttl: &str,
    winners: u32,
    one_time: bool,
    password: Option<String>,
) -> Result<()> {
    let plaintext = if message == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("read secret from stdin")?;
        buf
    } else {
        message.into_bytes()
    };

    let expires_at = expiry_after(now(), parse_duration(ttl)?)?;

    let mut new = NewSecret::new(plaintext, expires_at).max_winners(winners);
    if one_time {
        new = new.one_time();
    }
    if let Some(p) = password {
        new = new.with_password(p);
    }

    let created = ledger.create(new)?;
    println!("{}", serde_json::to_string(&created)?);
    Ok(())
}

fn cmd_view(
    ledger: &RedemptionLedger,
    id: &Uuid,
    password: Option<&str>,
    viewer: Option<&str>,
) -> Result<()> {
    let revealed = ledger.view(id, password, viewer)?;
    eprintln!(
        "{}",
        json!({
            "id": id,
            "winners_remaining": revealed.winners_remaining,
            "solved": revealed.solved,
            "consumed": revealed.consumed,
        })
    );
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&revealed.plaintext).context("write secret")?;
    stdout.flush().context("flush stdout")?;
    Ok(())
}

async fn cmd_sweep(
    ledger: RedemptionLedger,
    watch: bool,
    interval: std::time::Duration,
) -> Result<()> {
    let removed = ledger.sweep()?;
    println!("{}", json!({ "pruned": removed.len(), "ids": removed }));
    if !watch {
        return Ok(());
    }

    tracing::info!(interval_secs = interval.as_secs(), "watching for expired secrets");
    let handle = ledger.spawn_sweep(interval);
    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    handle.abort();
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Parse human duration strings like "1h", "30m", "7d", "5s" into seconds.
fn parse_duration(s: &str) -> Result<u64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    Ok(d.as_secs())
}

/// Deadline `ttl_secs` after `now`, rejecting TTLs that overflow a timestamp.
fn expiry_after(now: i64, ttl_secs: u64) -> Result<i64> {
    i64::try_from(ttl_secs)
        .ok()
        .and_then(|ttl| now.checked_add(ttl))
        .context("ttl too large")
}

fn now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
