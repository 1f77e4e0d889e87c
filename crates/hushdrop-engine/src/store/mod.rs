pub mod db;
pub mod memory;
pub mod model;

use anyhow::Result;
use uuid::Uuid;

pub use db::DbStore;
pub use memory::MemoryStore;
pub use model::{SecretMeta, SecretRecord};

/// Result of an attempt to claim one redemption slot.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// This caller's increment landed. Holds the record as of just after the
    /// claim; for one-time records it has already been removed from the store.
    Claimed(SecretRecord),
    /// No slot was free at the moment of the attempt. Nothing was mutated.
    Exhausted,
    /// The deadline had passed. The record was removed.
    Expired,
    NotFound,
}

/// Keyed storage for secret records.
///
/// Implementations must make [`RecordStore::claim_slot`] a single atomic step
/// with respect to `current_winners`, scoped per record: concurrent claims on
/// different ids never wait on each other beyond what the backend requires.
/// Removal of every kind is idempotent, and readers observe either the whole
/// record or its absence.
pub trait RecordStore: Send + Sync {
    /// Persist a new record. Fails if the id is already present.
    fn insert(&self, record: &SecretRecord) -> Result<()>;

    /// Snapshot a record without mutating it.
    fn get(&self, id: &Uuid) -> Result<Option<SecretRecord>>;

    /// Atomically: remove if expired, else increment `current_winners` iff it
    /// is below `max_winners`, and remove a one-time record that was claimed.
    fn claim_slot(&self, id: &Uuid, now: i64, viewer: Option<&str>) -> Result<ClaimOutcome>;

    /// Delete a record. Returns true if it existed.
    fn remove(&self, id: &Uuid) -> Result<bool>;

    /// Delete the record only if it is expired at `now`, re-checked atomically.
    fn remove_if_expired(&self, id: &Uuid, now: i64) -> Result<bool>;

    /// Remove every record expired at `now`. Returns the removed ids.
    fn sweep_expired(&self, now: i64) -> Result<Vec<Uuid>>;

    /// Number of stored records, expired or not.
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
