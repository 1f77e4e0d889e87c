pub mod clock;
pub mod config;
pub mod dirs;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod store;
pub mod vault;

use std::sync::Arc;

use anyhow::Context;

pub use clock::{LifecycleClock, ManualClock, SystemClock};
pub use config::{read_key_file, resolve_master_key, EngineConfig};
pub use error::RedeemError;
pub use ledger::{Created, NewSecret, RedemptionLedger, Revealed};
pub use store::{ClaimOutcome, DbStore, MemoryStore, RecordStore, SecretMeta, SecretRecord};
pub use vault::EncryptionKey;

/// Open the durable store under the configured data directory and build a
/// ledger over it.
pub fn open_ledger(cfg: &EngineConfig, master_key: EncryptionKey) -> anyhow::Result<RedemptionLedger> {
    let db_path = cfg.db_path()?;
    tracing::info!(db = %db_path.display(), "opening secret store");
    let store = DbStore::open(&db_path).context("open store")?;
    RedemptionLedger::new(Arc::new(store), master_key, cfg)
}
