//! Secret value decryption for the `c*` template functions.
//!
//! Encrypted values are stored hex encoded as
//! `nonce (12 bytes) || AES-256-GCM ciphertext || tag (16 bytes)`.
//! The key is derived from the keyring file contents with HKDF-SHA256.

use std::path::Path;

use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{ConfigError, ConfweaveError, Result};

/// Size of the AES-256 key in bytes.
const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes.
const TAG_SIZE: usize = 16;

/// HKDF salt.
const KDF_SALT: &[u8] = b"confweave-keyring";

/// HKDF context string.
const KDF_INFO: &[u8] = b"confweave-value-key-v1";

/// Decrypts (and encrypts) secret values with a key derived from a keyring.
pub struct Decryptor {
    cipher: Aes256Gcm,
}

impl Decryptor {
    /// Loads the keyring file and derives the value key from it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is empty.
    pub fn from_keyring(path: &Path) -> std::result::Result<Self, ConfigError> {
        let material = Zeroizing::new(std::fs::read(path).map_err(|e| ConfigError::Keyring {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?);

        Self::from_key_material(&material).map_err(|message| ConfigError::Keyring {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Derives the value key from raw key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the material is empty.
    pub fn from_key_material(material: &[u8]) -> std::result::Result<Self, String> {
        if material.iter().all(u8::is_ascii_whitespace) {
            return Err(String::from("keyring is empty"));
        }

        let hk = Hkdf::<Sha256>::new(Some(KDF_SALT), material);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(KDF_INFO, &mut key[..])
            .map_err(|_| String::from("key derivation failed"))?;

        let cipher = Aes256Gcm::new(GenericArray::from_slice(&key[..]));
        Ok(Self { cipher })
    }

    /// Decrypts a hex encoded value. Returns `None` if the value is not a
    /// valid ciphertext for this key.
    #[must_use]
    pub fn decrypt(&self, value: &str) -> Option<String> {
        let data = hex::decode(value.trim()).ok()?;
        if data.len() < NONCE_SIZE + TAG_SIZE {
            return None;
        }

        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .ok()?;

        String::from_utf8(plaintext).ok()
    }

    /// Encrypts a value into the hex encoded storage format.
    ///
    /// # Errors
    ///
    /// Returns an error if encryption fails.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| ConfweaveError::internal("value encryption failed"))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend(ciphertext);
        Ok(hex::encode(out))
    }
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor")
            .field("cipher", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn decryptor(material: &str) -> Decryptor {
        Decryptor::from_key_material(material.as_bytes()).expect("Failed to derive key")
    }

    #[test]
    fn test_encrypted_value_decrypts() {
        let crypt = decryptor("correct horse battery staple");
        let sealed = crypt.encrypt("s3cret").expect("encrypt failed");

        assert_ne!(sealed, "s3cret");
        assert_eq!(crypt.decrypt(&sealed).as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_wrong_key_or_plain_value_is_none() {
        let sealed = decryptor("key one").encrypt("s3cret").expect("encrypt failed");

        assert_eq!(decryptor("key two").decrypt(&sealed), None);
        assert_eq!(decryptor("key one").decrypt("plain-text"), None);
        assert_eq!(decryptor("key one").decrypt("abcd"), None);
    }

    #[test]
    fn test_keyring_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("keyring");
        std::fs::write(&path, "material\n").expect("Failed to write keyring");

        let crypt = Decryptor::from_keyring(&path).expect("Failed to load keyring");
        let sealed = crypt.encrypt("value").expect("encrypt failed");
        assert_eq!(crypt.decrypt(&sealed).as_deref(), Some("value"));

        std::fs::write(&path, "  \n").expect("Failed to write keyring");
        assert!(Decryptor::from_keyring(&path).is_err());
        assert!(Decryptor::from_keyring(&dir.path().join("missing")).is_err());
    }
}
