//! Hashing and field-level encryption
//!
//! Encrypted values are `ENC:gcm:` followed by base64(nonce || ciphertext || tag).
//! The AES-256 key is the SHA-256 digest of the configured secret, so any
//! secret length yields a 32-byte key.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Prefix of hashed values
pub const HASH_PREFIX: &str = "SHA256:";

/// Prefix of encrypted values
pub const ENCRYPTED_PREFIX: &str = "ENC:gcm:";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Render a value the way hashing and encryption see it.
///
/// Strings are used verbatim; everything else is its compact JSON form.
pub fn string_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `SHA256:` + lowercase hex digest of the value's string form.
pub fn hash_value(value: &Value) -> String {
    let digest = Sha256::digest(string_of(value).as_bytes());
    format!("{}{:x}", HASH_PREFIX, digest)
}

/// True for exactly the output of [`hash_value`]: the prefix and 64 lowercase hex digits.
pub fn is_hashed(value: &str) -> bool {
    value
        .strip_prefix(HASH_PREFIX)
        .is_some_and(|hex| hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')))
}

/// True for a well-formed [`FieldCipher::encrypt`] output.
///
/// The body must be valid base64 carrying at least a nonce and a tag.
pub fn is_encrypted(value: &str) -> bool {
    value.strip_prefix(ENCRYPTED_PREFIX).is_some_and(|encoded| {
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .is_ok_and(|data| data.len() >= NONCE_LEN + TAG_LEN)
    })
}

/// AES-256-GCM cipher for `Encrypt` rules.
#[derive(Clone)]
pub struct FieldCipher {
    key: [u8; 32],
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher").finish_non_exhaustive()
    }
}

impl FieldCipher {
    /// Derive the key from a secret of any length.
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::InvalidInput("encryption secret must not be empty".into()));
        }
        let digest = Sha256::digest(secret.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(Self { key })
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::SanitizationFailed(format!("invalid encryption key: {}", e)))
    }

    /// Encrypt a value with a fresh random nonce.
    pub fn encrypt(&self, value: &Value) -> Result<String> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, string_of(value).as_bytes())
            .map_err(|e| Error::SanitizationFailed(format!("encryption failed: {}", e)))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(format!(
            "{}{}",
            ENCRYPTED_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(&blob)
        ))
    }

    /// Reverse [`FieldCipher::encrypt`].
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let encoded = encrypted
            .strip_prefix(ENCRYPTED_PREFIX)
            .ok_or_else(|| Error::InvalidInput("value is not an encrypted field".into()))?;
        let data = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::InvalidInput(format!("invalid base64: {}", e)))?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::InvalidInput("ciphertext too short".into()));
        }

        let cipher = self.cipher()?;
        let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
        let plaintext = cipher
            .decrypt(nonce, &data[NONCE_LEN..])
            .map_err(|_| Error::InvalidInput("decryption failed (wrong key or tampered data)".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::InvalidInput("decrypted data is not valid UTF-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_full_sha256_hex() {
        let hashed = hash_value(&json!("hunter2"));
        assert!(hashed.starts_with(HASH_PREFIX));
        assert_eq!(hashed.len(), HASH_PREFIX.len() + 64);
        assert_eq!(hashed, hash_value(&json!("hunter2")));
        assert_ne!(hashed, hash_value(&json!("hunter3")));
    }

    #[test]
    fn test_hash_of_number_uses_decimal_form() {
        assert_eq!(hash_value(&json!(42)), hash_value(&json!("42")));
    }

    #[test]
    fn test_encrypt_round_trip_with_random_nonce() {
        let cipher = FieldCipher::from_secret("a short secret").unwrap();
        let a = cipher.encrypt(&json!("123-45-6789")).unwrap();
        let b = cipher.encrypt(&json!("123-45-6789")).unwrap();

        assert!(a.starts_with(ENCRYPTED_PREFIX));
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "123-45-6789");
        assert_eq!(cipher.decrypt(&b).unwrap(), "123-45-6789");
    }

    #[test]
    fn test_wrong_key_fails() {
        let encrypted = FieldCipher::from_secret("one")
            .unwrap()
            .encrypt(&json!("payload"))
            .unwrap();
        let other = FieldCipher::from_secret("two").unwrap();
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_output_shapes_are_exact() {
        assert!(is_hashed(&hash_value(&json!("hunter2"))));
        assert!(!is_hashed("SHA256:hunter2"));
        assert!(!is_hashed(&hash_value(&json!("x")).to_uppercase()));

        let cipher = FieldCipher::from_secret("k").unwrap();
        assert!(is_encrypted(&cipher.encrypt(&json!("")).unwrap()));
        assert!(!is_encrypted("ENC:gcm:plaintext!"));
        assert!(!is_encrypted("ENC:gcm:AAAA"));
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(FieldCipher::from_secret("").is_err());
    }
}
