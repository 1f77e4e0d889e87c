//! Password verification for protected secrets.
//!
//! Passwords are stretched with PBKDF2-HMAC and a random per-record salt.
//! The iteration count and digest used at creation are stored on the record,
//! so changing the configured defaults never locks out existing secrets.

use std::fmt;
use std::str::FromStr;

use constant_time_eq::constant_time_eq;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

use crate::error::RedeemError;
use crate::store::model::SecretRecord;

/// HMAC digest used inside PBKDF2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Digest {
    Sha256,
    Sha512,
}

impl Digest {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha512" | "sha-512" => Ok(Self::Sha512),
            other => anyhow::bail!("unsupported PBKDF2 digest: {other}"),
        }
    }
}

/// Parameters applied when hashing a new password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialParams {
    pub iterations: u32,
    pub digest: Digest,
    pub output_len: usize,
    pub salt_len: usize,
}

impl Default for CredentialParams {
    fn default() -> Self {
        Self {
            iterations: 210_000,
            digest: Digest::Sha256,
            output_len: 32,
            salt_len: 16,
        }
    }
}

impl CredentialParams {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.iterations == 0 {
            anyhow::bail!("PBKDF2 iterations must be non-zero");
        }
        if self.output_len < 16 {
            anyhow::bail!("PBKDF2 output length must be at least 16 bytes");
        }
        if self.salt_len < 16 {
            anyhow::bail!("password salt must be at least 16 bytes");
        }
        Ok(())
    }
}

/// A freshly hashed password, ready to be stored on a record.
pub struct Enrollment {
    pub hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub digest: Digest,
}

#[derive(Debug, Clone)]
pub struct CredentialGate {
    params: CredentialParams,
}

impl CredentialGate {
    pub fn new(params: CredentialParams) -> Self {
        Self { params }
    }

    /// Hash `password` under a fresh random salt.
    pub fn enroll(&self, password: &str) -> Enrollment {
        let salt = generate_salt(self.params.salt_len);
        let hash = hash(
            password.as_bytes(),
            &salt,
            self.params.iterations,
            self.params.digest,
            self.params.output_len,
        );
        Enrollment {
            hash,
            salt,
            iterations: self.params.iterations,
            digest: self.params.digest,
        }
    }

    /// Decide whether `password` satisfies the record's policy.
    ///
    /// Bypass or rejection is driven by `password_required` alone, never by
    /// whether a hash happens to be stored. Pure read: nothing is mutated.
    pub fn check(record: &SecretRecord, password: Option<&str>) -> Result<(), RedeemError> {
        if !record.password_required {
            return Ok(());
        }
        let password = password.ok_or(RedeemError::PasswordRequired)?;
        if verify(
            password.as_bytes(),
            &record.password_hash,
            &record.password_salt,
            record.password_iterations,
            record.password_digest,
        ) {
            Ok(())
        } else {
            Err(RedeemError::InvalidPassword)
        }
    }
}

/// Derive `out_len` bytes from `password` and `salt`.
pub fn hash(password: &[u8], salt: &[u8], iterations: u32, digest: Digest, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    match digest {
        Digest::Sha256 => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out),
        Digest::Sha512 => pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out),
    }
    out
}

/// Recompute and constant-time compare against `stored_hash`.
pub fn verify(
    password: &[u8],
    stored_hash: &[u8],
    stored_salt: &[u8],
    iterations: u32,
    digest: Digest,
) -> bool {
    if stored_hash.is_empty() || stored_salt.is_empty() || iterations == 0 {
        return false;
    }
    let candidate = hash(password, stored_salt, iterations, digest, stored_hash.len());
    constant_time_eq(&candidate, stored_hash)
}

pub fn generate_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}
