use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::model::SecretRecord;
use super::{ClaimOutcome, RecordStore};

/// `None` once the record has been deleted.
type Slot = Arc<Mutex<Option<SecretRecord>>>;

/// In-process store with one mutual-exclusion domain per record.
///
/// The index lock is held only to look up, add or unlink an entry; claims
/// serialize on the record's own mutex.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<Uuid, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &Uuid) -> Option<Slot> {
        self.records.read().get(id).cloned()
    }

    fn unlink(&self, id: &Uuid, slot: &Slot) {
        let mut map = self.records.write();
        if map.get(id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            map.remove(id);
        }
    }
}

impl RecordStore for MemoryStore {
    fn insert(&self, record: &SecretRecord) -> Result<()> {
        let mut map = self.records.write();
        if map.contains_key(&record.id) {
            anyhow::bail!("secret id already exists: {}", record.id);
        }
        map.insert(record.id, Arc::new(Mutex::new(Some(record.clone()))));
        debug!(id = %record.id, "stored secret");
        Ok(())
    }

    fn get(&self, id: &Uuid) -> Result<Option<SecretRecord>> {
        Ok(self.slot(id).and_then(|slot| slot.lock().clone()))
    }

    fn claim_slot(&self, id: &Uuid, now: i64, viewer: Option<&str>) -> Result<ClaimOutcome> {
        let Some(slot) = self.slot(id) else {
            return Ok(ClaimOutcome::NotFound);
        };

        let mut guard = slot.lock();
        let Some(record) = guard.as_mut() else {
            return Ok(ClaimOutcome::NotFound);
        };

        if record.is_expired(now) {
            *guard = None;
            drop(guard);
            self.unlink(id, &slot);
            debug!(id = %id, "lazy-evicted expired secret");
            return Ok(ClaimOutcome::Expired);
        }

        if !record.claim(viewer) {
            return Ok(ClaimOutcome::Exhausted);
        }

        let snapshot = record.clone();
        if snapshot.one_time {
            *guard = None;
            drop(guard);
            self.unlink(id, &slot);
            debug!(id = %id, "consumed one-time secret");
        }
        Ok(ClaimOutcome::Claimed(snapshot))
    }

    fn remove(&self, id: &Uuid) -> Result<bool> {
        let Some(slot) = self.slot(id) else {
            return Ok(false);
        };
        let existed = slot.lock().take().is_some();
        self.unlink(id, &slot);
        Ok(existed)
    }

    fn remove_if_expired(&self, id: &Uuid, now: i64) -> Result<bool> {
        let Some(slot) = self.slot(id) else {
            return Ok(false);
        };
        let mut guard = slot.lock();
        if !guard.as_ref().is_some_and(|r| r.is_expired(now)) {
            return Ok(false);
        }
        *guard = None;
        drop(guard);
        self.unlink(id, &slot);
        debug!(id = %id, "lazy-evicted expired secret");
        Ok(true)
    }

    fn sweep_expired(&self, now: i64) -> Result<Vec<Uuid>> {
        let candidates: Vec<Uuid> = self.records.read().keys().copied().collect();
        let mut removed = Vec::new();
        for id in candidates {
            if self.remove_if_expired(&id, now)? {
                removed.push(id);
            }
        }
        Ok(removed)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}
