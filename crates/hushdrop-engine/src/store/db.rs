use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info};
use uuid::Uuid;

use super::model::SecretRecord;
use super::{ClaimOutcome, RecordStore};

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");

/// Leading byte of every stored record, reserved for layout changes.
const RECORD_V1_MARKER: u8 = 0x01;

/// Durable store backed by redb.
///
/// Every mutation runs inside a single redb write transaction, so the
/// read-check-increment in `claim_slot` commits atomically or not at all.
/// Readers use MVCC snapshots and never observe a partial write.
#[derive(Clone)]
pub struct DbStore {
    db: Arc<Database>,
}

impl DbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl RecordStore for DbStore {
    fn insert(&self, record: &SecretRecord) -> Result<()> {
        let key = record.id.to_string();
        let bytes = encode(record)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SECRETS)?;
            if table.get(key.as_str())?.is_some() {
                anyhow::bail!("secret id already exists: {key}");
            }
            table.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;

        debug!(id = %key, "stored secret");
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<SecretRecord>> {
        let key = id.to_string();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        let raw_bytes: Option<Vec<u8>> = table.get(key.as_str())?.map(|guard| guard.value().to_vec());
        raw_bytes.as_deref().map(decode).transpose()
    }

    fn claim_slot(&self, id: &Uuid, now: i64, viewer: Option<&str>) -> Result<ClaimOutcome> {
        let key = id.to_string();

        let write_txn = self.db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(SECRETS)?;

            // Copy the bytes out so the AccessGuard borrow on `table` ends
            // before any mutation.
            let raw_bytes: Option<Vec<u8>> =
                table.get(key.as_str())?.map(|guard| guard.value().to_vec());

            match raw_bytes {
                None => ClaimOutcome::NotFound,
                Some(bytes) => {
                    let mut record = decode(&bytes)?;

                    if record.is_expired(now) {
                        table.remove(key.as_str())?;
                        debug!(id = %key, "lazy-evicted expired secret");
                        ClaimOutcome::Expired
                    } else if !record.claim(viewer) {
                        ClaimOutcome::Exhausted
                    } else if record.one_time {
                        table.remove(key.as_str())?;
                        debug!(id = %key, "consumed one-time secret");
                        ClaimOutcome::Claimed(record)
                    } else {
                        let updated = encode(&record)?;
                        table.insert(key.as_str(), updated.as_slice())?;
                        ClaimOutcome::Claimed(record)
                    }
                }
            }
        };
        match outcome {
            ClaimOutcome::Exhausted | ClaimOutcome::NotFound => write_txn.abort()?,
            _ => write_txn.commit()?,
        }
        Ok(outcome)
    }

    fn remove(&self, id: &Uuid) -> Result<bool> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let existed = table.remove(key.as_str())?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn remove_if_expired(&self, id: &Uuid, now: i64) -> Result<bool> {
        let key = id.to_string();
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SECRETS)?;
            let raw_bytes: Option<Vec<u8>> =
                table.get(key.as_str())?.map(|guard| guard.value().to_vec());
            match raw_bytes {
                Some(bytes) if decode(&bytes)?.is_expired(now) => {
                    table.remove(key.as_str())?;
                    true
                }
                _ => false,
            }
        };
        if removed {
            write_txn.commit()?;
            debug!(id = %key, "lazy-evicted expired secret");
        }
        Ok(removed)
    }

    fn sweep_expired(&self, now: i64) -> Result<Vec<Uuid>> {
        // Collect and remove under one write transaction so a record cannot
        // change between the expiry check and its deletion.
        let write_txn = self.db.begin_write()?;
        let expired = {
            let mut table = write_txn.open_table(SECRETS)?;
            let mut keys = Vec::new();
            for item in table.iter()? {
                let (k, v) = item?;
                if decode(v.value())?.is_expired(now) {
                    keys.push(k.value().to_owned());
                }
            }
            for key in &keys {
                table.remove(key.as_str())?;
            }
            keys
        };
        write_txn.commit()?;

        if !expired.is_empty() {
            info!(removed = expired.len(), "pruned expired secrets");
        }
        expired
            .iter()
            .map(|k| Uuid::parse_str(k).with_context(|| format!("malformed secret key: {k}")))
            .collect()
    }

    fn len(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SECRETS)?;
        Ok(table.len()? as usize)
    }
}

/// Encode a record as `[RECORD_V1_MARKER] + bincode(record)`.
fn encode(record: &SecretRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode")?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_V1_MARKER);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord> {
    match bytes.split_first() {
        Some((&RECORD_V1_MARKER, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .context("bincode decode")?;
            Ok(record)
        }
        Some((marker, _)) => anyhow::bail!("unknown record format marker: {marker:#04x}"),
        None => anyhow::bail!("empty record"),
    }
}
