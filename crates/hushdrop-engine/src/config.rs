use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use crate::gate::{CredentialParams, Digest};
use crate::vault::{self, EncryptionKey, LayerKdfParams};

pub const DB_FILE: &str = "hushdrop.db";

/// Engine settings. `Default` reads `HUSHDROP_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub data_dir: Option<PathBuf>,
    /// Base for shareable references, e.g. `https://drop.example.com`.
    pub public_base_url: String,
    pub sweep_interval: Duration,
    pub credentials: CredentialParams,
    /// Add a password-keyed inner encryption layer for protected secrets.
    pub password_layer: bool,
    pub layer_kdf: LayerKdfParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = CredentialParams::default();
        Self {
            data_dir: std::env::var("HUSHDROP_DATA_DIR").ok().map(PathBuf::from),
            public_base_url: std::env::var("HUSHDROP_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            sweep_interval: Duration::from_secs(env_or("HUSHDROP_SWEEP_SECS", 300)),
            credentials: CredentialParams {
                iterations: env_or("HUSHDROP_PBKDF2_ITERATIONS", defaults.iterations),
                digest: env_or::<Digest>("HUSHDROP_PBKDF2_DIGEST", defaults.digest),
                ..defaults
            },
            password_layer: std::env::var("HUSHDROP_PASSWORD_LAYER")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
            layer_kdf: LayerKdfParams::default(),
        }
    }
}

/// Parse `var` if set, warning and keeping `default` when it does not parse.
fn env_or<T: FromStr + Display>(var: &str, default: T) -> T {
    let Ok(raw) = std::env::var(var) else {
        return default;
    };
    parse_or(var, &raw, default)
}

fn parse_or<T: FromStr + Display>(var: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(var, value = raw, default = %default, "ignoring malformed setting");
            default
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.credentials.validate().context("invalid password hashing settings")?;
        if self.password_layer {
            self.layer_kdf.validate().context("invalid password layer settings")?;
        }
        if self.sweep_interval.is_zero() {
            anyhow::bail!("sweep interval must be non-zero");
        }
        Ok(())
    }

    /// Resolve the data directory, creating it if needed.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(d) => {
                std::fs::create_dir_all(d).context("create data dir")?;
                Ok(d.clone())
            }
            None => crate::dirs::data_dir(),
        }
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        Ok(self.resolve_data_dir()?.join(DB_FILE))
    }
}

/// Shareable reference for a secret: `{base}/s/{id}`.
pub fn share_url(base: &str, id: &uuid::Uuid) -> String {
    format!("{}/s/{}", base.trim_end_matches('/'), id)
}

/// Read a master key from a file holding 32 raw bytes or 64 hex characters.
pub fn read_key_file(path: &Path) -> Result<EncryptionKey> {
    let content = zeroize::Zeroizing::new(
        std::fs::read(path).with_context(|| format!("read key file: {}", path.display()))?,
    );
    if content.iter().all(u8::is_ascii_whitespace) {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    EncryptionKey::from_material(&content)
        .with_context(|| format!("invalid key file: {}", path.display()))
}

/// Resolve the master key from `HUSHDROP_MASTER_KEY_FILE` (preferred) or
/// `HUSHDROP_MASTER_KEY` (hex).
///
/// There is no fallback: a missing or malformed key is a startup error,
/// since a substituted key would strand every stored ciphertext.
pub fn resolve_master_key() -> Result<EncryptionKey> {
    if let Ok(path) = std::env::var("HUSHDROP_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("HUSHDROP_MASTER_KEY").is_ok() {
            warn!("both HUSHDROP_MASTER_KEY and HUSHDROP_MASTER_KEY_FILE are set; using file");
        }
        return Ok(key);
    }
    let hex = zeroize::Zeroizing::new(std::env::var("HUSHDROP_MASTER_KEY").context(
        "HUSHDROP_MASTER_KEY or HUSHDROP_MASTER_KEY_FILE environment variable is required",
    )?);
    EncryptionKey::from_hex(&hex).context("invalid HUSHDROP_MASTER_KEY")
}

/// Write a freshly generated master key to `path` as hex.
/// Refuses to overwrite an existing file.
pub fn write_new_key_file(path: &Path) -> Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .with_context(|| format!("create key file: {}", path.display()))?;

    let key = vault::generate_key();
    file.write_all(key.to_hex().as_bytes())
        .context("write key file")?;
    file.write_all(b"\n").context("write key file")?;
    Ok(())
}
