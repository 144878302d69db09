//! At-rest protection for key files.
//!
//! Key derivation: Argon2id(password, salt from the store index) → 32-byte key
//! Sealing:        AES-256-GCM, nonce prepended to ciphertext
//!
//! Sealed file layout: [ nonce (12 B) | ciphertext | GCM tag (16 B) ]
//!
//! This protects pads on disk only.  Symbols on the wire are enciphered by
//! the one-time-pad keystream in [`crate::cipher`].

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng};
use aes_gcm::Aes256Gcm;
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;

/// Byte length of the AES-GCM nonce prepended to every sealed file.
pub const NONCE_LEN: usize = 12;
/// Byte length of the Argon2id salt kept in the store index.
pub const SALT_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Sealing failed")]
    SealFailed,
    #[error("Unsealing failed: wrong password or corrupted key file")]
    UnsealFailed,
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("Sealed data too short (minimum {NONCE_LEN} bytes)")]
    TooShort,
}

/// Derive the 256-bit file key for a store from its password and salt.
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let params = Params::new(19 * 1024, 2, 1, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let mut key = [0u8; 32];
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Seal `plaintext` under `key` with a fresh random nonce.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let aead = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::SealFailed)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let sealed = aead.encrypt(&nonce, plaintext).map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(nonce.as_slice());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverse [`seal`].  Fails on a wrong key or any modification.
pub fn unseal(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::TooShort);
    }
    let (nonce, body) = data.split_at(NONCE_LEN);
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| CryptoError::UnsealFailed)?
        .decrypt(aes_gcm::Nonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::UnsealFailed)
}
