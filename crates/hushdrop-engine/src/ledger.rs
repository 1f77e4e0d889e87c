//! The redemption state machine.
//!
//! Observed per record, a secret is `ACTIVE` until its slots run out
//! (`EXHAUSTED`), its deadline passes (`EXPIRED`), or it is deleted. Deleted
//! records are indistinguishable from ids that never existed. The ledger is
//! the only component that asks a store to claim a slot.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::clock::{LifecycleClock, SystemClock};
use crate::config::{self, EngineConfig};
use crate::error::{RedeemError, Result};
use crate::gate::{CredentialGate, Digest};
use crate::store::model::SecretRecord;
use crate::store::{ClaimOutcome, RecordStore, SecretMeta};
use crate::vault::{CipherVault, EncryptionKey, OpenError};

/// Parameters for a new secret.
pub struct NewSecret {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub password_protected: bool,
    pub password: Option<Zeroizing<String>>,
    /// Unix timestamp (seconds).
    pub expires_at: i64,
    pub max_winners: u32,
    pub one_time: bool,
}

impl NewSecret {
    /// Single-winner, unprotected secret expiring at `expires_at`.
    pub fn new(plaintext: impl Into<Vec<u8>>, expires_at: i64) -> Self {
        Self {
            plaintext: Zeroizing::new(plaintext.into()),
            password_protected: false,
            password: None,
            expires_at,
            max_winners: 1,
            one_time: false,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password_protected = true;
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn max_winners(mut self, max_winners: u32) -> Self {
        self.max_winners = max_winners;
        self
    }

    pub fn one_time(mut self) -> Self {
        self.one_time = true;
        self
    }
}

/// Returned by [`RedemptionLedger::create`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct Created {
    pub id: Uuid,
    pub share_url: String,
    pub expires_at: i64,
    pub max_winners: u32,
}

/// A successful reveal.
pub struct Revealed {
    pub plaintext: Zeroizing<Vec<u8>>,
    pub winners_remaining: u32,
    pub solved: bool,
    /// The reveal destroyed the record (one-time secrets).
    pub consumed: bool,
}

impl std::fmt::Debug for Revealed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Revealed")
            .field("plaintext", &format_args!("<{} bytes>", self.plaintext.len()))
            .field("winners_remaining", &self.winners_remaining)
            .field("solved", &self.solved)
            .field("consumed", &self.consumed)
            .finish()
    }
}

/// Policy layer over a [`RecordStore`].
#[derive(Clone)]
pub struct RedemptionLedger {
    store: Arc<dyn RecordStore>,
    vault: CipherVault,
    gate: CredentialGate,
    clock: Arc<dyn LifecycleClock>,
    password_layer: bool,
    public_base_url: String,
}

impl RedemptionLedger {
    /// Build a ledger over `store` with the process master key.
    pub fn new(
        store: Arc<dyn RecordStore>,
        master_key: EncryptionKey,
        config: &EngineConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            vault: CipherVault::new(master_key, config.layer_kdf.clone()),
            gate: CredentialGate::new(config.credentials.clone()),
            clock: Arc::new(SystemClock),
            password_layer: config.password_layer,
            public_base_url: config.public_base_url.trim_end_matches('/').to_owned(),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn LifecycleClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Validate, encrypt and persist a new `ACTIVE` record.
    pub fn create(&self, new: NewSecret) -> Result<Created> {
        if new.max_winners == 0 {
            return Err(RedeemError::Validation("max_winners must be at least 1".into()));
        }
        let password = match (new.password_protected, new.password.as_deref()) {
            (true, Some(p)) if !p.is_empty() => Some(p.as_str()),
            (true, _) => {
                return Err(RedeemError::Validation(
                    "a non-empty password is required for a password-protected secret".into(),
                ))
            }
            (false, Some(_)) => {
                return Err(RedeemError::Validation(
                    "password supplied for a secret that is not password-protected".into(),
                ))
            }
            (false, None) => None,
        };
        let max_winners = if new.one_time { 1 } else { new.max_winners };

        let layer_password = password.filter(|_| self.password_layer);
        let sealed = self.vault.seal(&new.plaintext, layer_password)?;

        let (password_hash, password_salt, password_iterations, password_digest) = match password {
            Some(p) => {
                let e = self.gate.enroll(p);
                (e.hash, e.salt, e.iterations, e.digest)
            }
            None => (Vec::new(), Vec::new(), 0, Digest::Sha256),
        };

        let record = SecretRecord {
            id: Uuid::new_v4(),
            ciphertext: sealed.ciphertext,
            iv: sealed.iv,
            password_hash,
            password_salt,
            password_required: password.is_some(),
            password_iterations,
            password_digest,
            password_layer: sealed.layer,
            max_winners,
            current_winners: 0,
            one_time: new.one_time,
            expires_at: new.expires_at,
            created_at: self.clock.now(),
            solved: false,
            solved_by: BTreeSet::new(),
        };
        self.store.insert(&record)?;

        info!(
            id = %record.id,
            max_winners,
            one_time = record.one_time,
            password_required = record.password_required,
            expires_at = record.expires_at,
            "secret.create"
        );
        Ok(Created {
            id: record.id,
            share_url: config::share_url(&self.public_base_url, &record.id),
            expires_at: record.expires_at,
            max_winners,
        })
    }

    /// Load a record that is live at `now`, lazily evicting it if expired.
    ///
    /// `expired_as` picks how an expired record is reported to this caller.
    fn load_live(&self, id: &Uuid, now: i64, expired_as: RedeemError) -> Result<SecretRecord> {
        let record = self.store.get(id)?.ok_or(RedeemError::NotFound)?;
        if record.is_expired(now) {
            if self.store.remove_if_expired(id, now)? {
                debug!(id = %id, "secret.expired");
            }
            return Err(expired_as);
        }
        if record.is_consumed() {
            return Err(RedeemError::NotFound);
        }
        Ok(record)
    }

    /// Describe a secret without revealing anything derived from its content.
    /// Expired records are reported as `NotFound`.
    pub fn get_metadata(&self, id: &Uuid) -> Result<SecretMeta> {
        let now = self.clock.now();
        let record = self.load_live(id, now, RedeemError::NotFound)?;
        Ok(record.meta(now))
    }

    /// Check a password without consuming a slot.
    pub fn unlock(&self, id: &Uuid, password: &str) -> Result<()> {
        let now = self.clock.now();
        let record = self.load_live(id, now, RedeemError::Expired)?;
        if !record.has_slot() {
            return Err(RedeemError::Exhausted);
        }
        CredentialGate::check(&record, Some(password)).inspect_err(|_| {
            warn!(id = %id, "secret.unlock rejected");
        })
    }

    /// Reveal a secret, claiming one redemption slot.
    pub fn view(&self, id: &Uuid, password: Option<&str>, viewer: Option<&str>) -> Result<Revealed> {
        let now = self.clock.now();
        let record = self.load_live(id, now, RedeemError::Expired)?;

        CredentialGate::check(&record, password).inspect_err(|e| {
            warn!(id = %id, reason = e.kind(), "secret.view rejected");
        })?;

        // The claim is final once it lands. Nothing below gives the slot back.
        let claimed = match self.store.claim_slot(id, now, viewer)? {
            ClaimOutcome::Claimed(record) => record,
            ClaimOutcome::Exhausted => return Err(RedeemError::Exhausted),
            ClaimOutcome::Expired => return Err(RedeemError::Expired),
            ClaimOutcome::NotFound => return Err(RedeemError::NotFound),
        };

        let plaintext = self
            .vault
            .open(
                &claimed.ciphertext,
                &claimed.iv,
                claimed.password_layer.as_ref(),
                password,
            )
            .map_err(|e| {
                error!(id = %id, error = %e, "secret.view decrypt failure");
                match e {
                    OpenError::MissingPassword => RedeemError::PasswordRequired,
                    OpenError::Integrity(_) => RedeemError::Integrity,
                    OpenError::Kdf(err) => RedeemError::Storage(err),
                }
            })?;

        let revealed = Revealed {
            plaintext,
            winners_remaining: claimed.winners_remaining(),
            solved: claimed.solved,
            consumed: claimed.one_time,
        };
        info!(
            id = %id,
            winners_remaining = revealed.winners_remaining,
            solved = revealed.solved,
            consumed = revealed.consumed,
            "secret.view"
        );
        Ok(revealed)
    }

    /// Delete a secret. Deleting an absent id is not an error.
    pub fn remove(&self, id: &Uuid) -> Result<()> {
        let existed = self.store.remove(id)?;
        info!(id = %id, existed, "secret.delete");
        Ok(())
    }

    /// Remove every expired record. Returns the removed ids.
    pub fn sweep(&self) -> Result<Vec<Uuid>> {
        let removed = self.store.sweep_expired(self.clock.now())?;
        if !removed.is_empty() {
            info!(removed = removed.len(), "secret.sweep");
        }
        Ok(removed)
    }

    /// Spawn a background Tokio task that calls `sweep()` every `interval`.
    pub fn spawn_sweep(self, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep() {
                    warn!(error = %e, "background sweep error");
                }
            }
        })
    }
}
