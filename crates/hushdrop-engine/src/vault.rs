use std::sync::Arc;

use anyhow::Context;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroizing, ZeroizeOnDrop};

use crate::store::model::PasswordLayer;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// Authentication failed or the inputs were malformed.
#[derive(Debug, Error)]
#[error("ciphertext failed authentication")]
pub struct IntegrityError;

/// 32-byte ChaCha20Poly1305 key.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    /// Accepts the 64-character hex encoding (surrounding whitespace
    /// ignored) or 32 raw bytes. Material that reads as hex is always parsed
    /// as hex, so a short hex key is rejected instead of loading as raw bytes.
    pub fn from_material(material: &[u8]) -> anyhow::Result<Self> {
        let trimmed = material.trim_ascii();
        if !trimmed.is_empty() && trimmed.iter().all(u8::is_ascii_hexdigit) {
            let text = std::str::from_utf8(trimmed).context("master key is not valid hex")?;
            return Self::from_hex(text);
        }
        if material.len() != KEY_LEN {
            anyhow::bail!("master key must be {KEY_LEN} raw bytes or {} hex characters", KEY_LEN * 2);
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(material);
        Ok(Self(key))
    }

    pub fn from_hex(text: &str) -> anyhow::Result<Self> {
        let decoded = Zeroizing::new(hex::decode(text.trim()).context("master key is not valid hex")?);
        if decoded.len() != KEY_LEN {
            anyhow::bail!(
                "master key must be {KEY_LEN} bytes, got {} (expected {} hex characters)",
                decoded.len(),
                KEY_LEN * 2
            );
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&decoded);
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }
}

/// Generate a fresh random key. Only used by explicit key provisioning,
/// never as a fallback for missing configuration.
pub fn generate_key() -> EncryptionKey {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    EncryptionKey(key)
}

/// Argon2id cost parameters for password-derived layer keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerKdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for LayerKdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl LayerKdfParams {
    fn to_params(&self) -> anyhow::Result<Params> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.to_params().map(|_| ())
    }
}

/// Derive a 32-byte layer key from `password` and `salt` using Argon2id.
pub fn derive_key(password: &[u8], salt: &[u8], params: &LayerKdfParams) -> anyhow::Result<EncryptionKey> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_params()?);
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| anyhow::anyhow!("argon2 hash: {e}"))?;
    Ok(EncryptionKey(key))
}

/// Encrypt `plaintext` with `key`, returning `(ciphertext, nonce)`.
/// Every call draws a fresh random nonce.
pub fn encrypt(key: &EncryptionKey, plaintext: &[u8]) -> anyhow::Result<(Vec<u8>, [u8; NONCE_LEN])> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| anyhow::anyhow!("encrypt: {e}"))?;

    Ok((ciphertext, nonce_bytes))
}

/// Decrypt `ciphertext` with `key` and `nonce`, returning plaintext.
pub fn decrypt(
    key: &EncryptionKey,
    ciphertext: &[u8],
    nonce_bytes: &[u8; NONCE_LEN],
) -> Result<Zeroizing<Vec<u8>>, IntegrityError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let nonce = Nonce::from(*nonce_bytes);

    cipher
        .decrypt(&nonce, ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| IntegrityError)
}

/// Output of [`CipherVault::seal`].
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub iv: [u8; NONCE_LEN],
    pub layer: Option<PasswordLayer>,
}

/// Why [`CipherVault::open`] failed.
#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error("password layer present but no password supplied")]
    MissingPassword,
    #[error("layer key derivation: {0:#}")]
    Kdf(anyhow::Error),
}

/// Master-key encryption with an optional password-keyed inner layer.
/// The master key is shared read-only for the life of the process.
#[derive(Clone)]
pub struct CipherVault {
    master: Arc<EncryptionKey>,
    layer_kdf: LayerKdfParams,
}

impl CipherVault {
    pub fn new(master: EncryptionKey, layer_kdf: LayerKdfParams) -> Self {
        Self {
            master: Arc::new(master),
            layer_kdf,
        }
    }

    /// Encrypt `plaintext`. With `layer_password`, the payload is first sealed
    /// under a key derived from that password, then under the master key.
    pub fn seal(&self, plaintext: &[u8], layer_password: Option<&str>) -> anyhow::Result<Sealed> {
        let Some(password) = layer_password else {
            let (ciphertext, iv) = encrypt(&self.master, plaintext).context("encrypt payload")?;
            return Ok(Sealed {
                ciphertext,
                iv,
                layer: None,
            });
        };

        let mut kdf_salt = [0u8; 16];
        OsRng.fill_bytes(&mut kdf_salt);
        let layer_key = derive_key(password.as_bytes(), &kdf_salt, &self.layer_kdf)?;
        let (inner, nonce) = encrypt(&layer_key, plaintext).context("encrypt password layer")?;
        let (ciphertext, iv) = encrypt(&self.master, &inner).context("encrypt payload")?;
        Ok(Sealed {
            ciphertext,
            iv,
            layer: Some(PasswordLayer { kdf_salt, nonce }),
        })
    }

    /// Reverse [`CipherVault::seal`].
    pub fn open(
        &self,
        ciphertext: &[u8],
        iv: &[u8; NONCE_LEN],
        layer: Option<&PasswordLayer>,
        password: Option<&str>,
    ) -> Result<Zeroizing<Vec<u8>>, OpenError> {
        let outer = decrypt(&self.master, ciphertext, iv)?;
        let Some(layer) = layer else {
            return Ok(outer);
        };
        let password = password.ok_or(OpenError::MissingPassword)?;
        let layer_key =
            derive_key(password.as_bytes(), &layer.kdf_salt, &self.layer_kdf).map_err(OpenError::Kdf)?;
        Ok(decrypt(&layer_key, &outer, &layer.nonce)?)
    }
}

#[cfg(test)]
pub(crate) fn fast_kdf() -> LayerKdfParams {
    LayerKdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = generate_key();
        for plaintext in [&b""[..], b"hello, hushdrop!", "sécret — ключ 🔑".as_bytes()] {
            let (ct, nonce) = encrypt(&key, plaintext).unwrap();
            let pt = decrypt(&key, &ct, &nonce).unwrap();
            assert_eq!(pt.as_slice(), plaintext);
        }
    }

    #[test]
    fn wrong_key_fails() {
        let key1 = generate_key();
        let key2 = generate_key();
        let (ct, nonce) = encrypt(&key1, b"secret").unwrap();
        assert!(decrypt(&key2, &ct, &nonce).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = generate_key();
        let (mut ct, nonce) = encrypt(&key, b"secret").unwrap();
        ct[0] ^= 0x01;
        assert!(decrypt(&key, &ct, &nonce).is_err());
        assert!(decrypt(&key, &[], &nonce).is_err());
    }

    #[test]
    fn nonces_are_fresh() {
        let key = generate_key();
        let (_, n1) = encrypt(&key, b"x").unwrap();
        let (_, n2) = encrypt(&key, b"x").unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn derive_key_is_deterministic() {
        let a = derive_key(b"pw", b"0123456789abcdef", &fast_kdf()).unwrap();
        let b = derive_key(b"pw", b"0123456789abcdef", &fast_kdf()).unwrap();
        let c = derive_key(b"other", b"0123456789abcdef", &fast_kdf()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn key_material_parsing() {
        let key = generate_key();
        let hex = key.to_hex();
        let parsed = EncryptionKey::from_material(format!("{}\n", hex.as_str()).as_bytes()).unwrap();
        assert_eq!(parsed.as_bytes(), key.as_bytes());
        let mut raw_bytes = *key.as_bytes();
        raw_bytes[0] = 0xff; // not a hex digit
        let raw = EncryptionKey::from_material(&raw_bytes).unwrap();
        assert_eq!(raw.as_bytes(), &raw_bytes);

        // 32 hex characters is a 16-byte key, not 32 raw bytes.
        assert!(EncryptionKey::from_material(b"00112233445566778899aabbccddeeff").is_err());

        assert!(EncryptionKey::from_hex("abcd").is_err());
        assert!(EncryptionKey::from_hex(&"zz".repeat(32)).is_err());
        assert!(EncryptionKey::from_material(&[7u8; 16]).is_err());
    }

    #[test]
    fn password_layer_round_trip() {
        let vault = CipherVault::new(generate_key(), fast_kdf());
        let sealed = vault.seal(b"layered", Some("P1")).unwrap();
        let layer = sealed.layer.as_ref();
        assert!(layer.is_some());

        let pt = vault.open(&sealed.ciphertext, &sealed.iv, layer, Some("P1")).unwrap();
        assert_eq!(pt.as_slice(), b"layered");

        assert!(matches!(
            vault.open(&sealed.ciphertext, &sealed.iv, layer, Some("wrong")),
            Err(OpenError::Integrity(_))
        ));
        assert!(matches!(
            vault.open(&sealed.ciphertext, &sealed.iv, layer, None),
            Err(OpenError::MissingPassword)
        ));
    }

    #[test]
    fn vault_without_layer() {
        let vault = CipherVault::new(generate_key(), fast_kdf());
        let sealed = vault.seal(b"plain", None).unwrap();
        assert!(sealed.layer.is_none());
        let pt = vault.open(&sealed.ciphertext, &sealed.iv, None, None).unwrap();
        assert_eq!(pt.as_slice(), b"plain");
    }
}
