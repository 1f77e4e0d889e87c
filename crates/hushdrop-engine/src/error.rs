use thiserror::Error;

/// Failure kinds surfaced by the redemption engine.
///
/// Each policy failure is its own variant so callers can render distinct
/// guidance. None of them are retried inside the engine.
#[derive(Debug, Error)]
pub enum RedeemError {
    /// Bad creation parameters. Nothing was persisted.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown, deleted, consumed one-time, or physically expired id.
    #[error("secret not found")]
    NotFound,

    /// The record exists but its deadline has passed.
    #[error("secret expired")]
    Expired,

    /// The record is password-protected and no password was supplied.
    #[error("password required")]
    PasswordRequired,

    #[error("invalid password")]
    InvalidPassword,

    /// Every redemption slot has been consumed.
    #[error("secret exhausted")]
    Exhausted,

    /// Decryption or authentication of stored ciphertext failed.
    #[error("integrity check failed")]
    Integrity,

    /// Backing store I/O or encoding failure.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl RedeemError {
    /// Short machine-readable name, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::PasswordRequired => "password_required",
            Self::InvalidPassword => "invalid_password",
            Self::Exhausted => "exhausted",
            Self::Integrity => "integrity_error",
            Self::Storage(_) => "storage_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, RedeemError>;
