use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::gate::Digest;

/// Inner encryption layer keyed by the viewer's password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct PasswordLayer {
    /// Argon2id salt for deriving the layer key from the password.
    pub kdf_salt: [u8; 16],
    /// Nonce used for the inner ChaCha20Poly1305 seal.
    pub nonce: [u8; 12],
}

/// Stored as bincode-encoded bytes.
/// `ciphertext` is ChaCha20Poly1305 output under the master key. All policy
/// fields are plaintext so the sweep can evict without decrypting.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    #[zeroize(skip)]
    #[serde(with = "uuid::serde::compact")]
    pub id: Uuid,
    /// ChaCha20Poly1305 ciphertext (payload + tag).
    pub ciphertext: Vec<u8>,
    /// Per-record random 12-byte nonce.
    pub iv: [u8; 12],
    /// Empty when no password is required.
    pub password_hash: Vec<u8>,
    /// Empty when no password is required.
    pub password_salt: Vec<u8>,
    pub password_required: bool,
    /// PBKDF2 iteration count used for `password_hash`; 0 without a password.
    pub password_iterations: u32,
    #[zeroize(skip)]
    pub password_digest: Digest,
    pub password_layer: Option<PasswordLayer>,
    pub max_winners: u32,
    /// Only ever changed by [`SecretRecord::claim`].
    pub current_winners: u32,
    pub one_time: bool,
    /// Unix timestamp (seconds) at which the record expires.
    pub expires_at: i64,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
    pub solved: bool,
    /// Viewer identifiers that claimed a slot. Bookkeeping only.
    #[zeroize(skip)]
    pub solved_by: BTreeSet<String>,
}

/// `solved` as a pure function of the counters.
pub fn derive_solved(current_winners: u32, max_winners: u32, one_time: bool) -> bool {
    current_winners >= max_winners || (one_time && current_winners >= 1)
}

impl SecretRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        crate::clock::is_expired(now, self.expires_at)
    }

    pub fn winners_remaining(&self) -> u32 {
        self.max_winners.saturating_sub(self.current_winners)
    }

    pub fn has_slot(&self) -> bool {
        self.current_winners < self.max_winners
    }

    /// A one-time record that has already been revealed. Stores delete these
    /// in the claiming step; anything still observing one is treated as gone.
    pub fn is_consumed(&self) -> bool {
        self.one_time && self.current_winners >= 1
    }

    /// Claim one redemption slot.
    ///
    /// Increments `current_winners` only while below `max_winners` and
    /// reports whether this call's increment landed. Callers must hold the
    /// store's per-record exclusion (or write transaction) around this.
    pub fn claim(&mut self, viewer: Option<&str>) -> bool {
        if !self.has_slot() {
            return false;
        }
        self.current_winners += 1;
        self.solved = derive_solved(self.current_winners, self.max_winners, self.one_time);
        if let Some(v) = viewer {
            self.solved_by.insert(v.to_owned());
        }
        true
    }

    pub fn meta(&self, now: i64) -> SecretMeta {
        SecretMeta {
            id: self.id,
            password_required: self.password_required,
            expired: self.is_expired(now),
            solved: self.solved,
            winners_remaining: self.winners_remaining(),
            max_winners: self.max_winners,
            one_time: self.one_time,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

/// Metadata returned by describe calls. Never includes content or ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub id: Uuid,
    pub password_required: bool,
    pub expired: bool,
    pub solved: bool,
    pub winners_remaining: u32,
    pub max_winners: u32,
    pub one_time: bool,
    pub created_at: i64,
    pub expires_at: i64,
}

#[cfg(test)]
pub(crate) fn make_record(max_winners: u32, one_time: bool, expires_at: i64) -> SecretRecord {
    SecretRecord {
        id: Uuid::new_v4(),
        ciphertext: vec![1, 2, 3],
        iv: [0u8; 12],
        password_hash: vec![],
        password_salt: vec![],
        password_required: false,
        password_iterations: 0,
        password_digest: Digest::Sha256,
        password_layer: None,
        max_winners,
        current_winners: 0,
        one_time,
        expires_at,
        created_at: 1000,
        solved: false,
        solved_by: BTreeSet::new(),
    }
}
