//! Key material sources.
//!
//! A [`KeyStore`] hands out [`Key`]s: named, finite streams of `A..=Z`
//! symbols.  The transmitting side allocates keys sequentially with
//! [`KeyStore::next_key`]; the receiving side opens the announced name with
//! [`KeyStore::open_key`].  Both sides must hold identical key material.
//!
//! Backends:
//! - [`MemoryKeyStore`]  ordered in-memory pads, deterministic constructor for tests
//! - [`DirKeyStore`]     one file per key plus a JSON index, optionally sealed with a password
//! - [`DummyKeyStore`]   a single endless all-`A` key (identity transform)

mod dir;
mod dummy;
mod memory;

pub use dir::DirKeyStore;
pub use dummy::{DummyKeyStore, DUMMY_KEY_NAME};
pub use memory::MemoryKeyStore;

use std::io::{self, Read};
use std::sync::Arc;

use rand::{Rng, RngCore};
use serde::Serialize;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::tables::ALPHABET_LEN;

/// Longest key name any backend accepts.
pub const MAX_STORE_KEY_NAME_LEN: usize = 32;
/// Length of names produced by [`random_name`].
pub const GENERATED_NAME_LEN: usize = 5;

#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("Key store has no more unallocated keys")]
    NoMoreKeys,
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    #[error("Key already exists: {0}")]
    KeyExists(String),
    #[error("Invalid key name {0:?} (1-{MAX_STORE_KEY_NAME_LEN} letters A-Z)")]
    InvalidKeyName(String),
    #[error("Key {0} holds symbols outside A-Z or has the wrong length")]
    InvalidKeyMaterial(String),
    #[error("Key store is not open")]
    NotOpen,
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Index error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A named stream of key symbols.  Reading consumes the key.
pub trait Key: Read + Send {
    fn name(&self) -> &str;
    /// Symbols that can still be read.
    fn bytes_left(&self) -> usize;
}

/// Summary line for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyInfo {
    pub name:      String,
    pub size:      usize,
    pub allocated: bool,
}

pub trait KeyStore: Send {
    fn open(&mut self) -> Result<(), KeyStoreError>;
    fn close(&mut self) -> Result<(), KeyStoreError>;
    /// Allocate the next unused key.  Fails with `NoMoreKeys` when exhausted.
    fn next_key(&mut self) -> Result<Box<dyn Key>, KeyStoreError>;
    /// Open a key by name, allocated or not.
    fn open_key(&mut self, name: &str) -> Result<Box<dyn Key>, KeyStoreError>;
    /// Create a key of `size` uniform random symbols.
    fn generate(&mut self, name: &str, size: usize, rng: &mut dyn RngCore) -> Result<(), KeyStoreError>;
    fn list(&self) -> Vec<KeyInfo>;
}

// ── Shared helpers ───────────────────────────────────────────────────────────

/// Key backed by a shared symbol buffer with its own read cursor.
#[derive(Debug, Clone)]
pub struct BufferKey {
    name: String,
    data: Arc<[u8]>,
    pos:  usize,
}

impl BufferKey {
    pub fn new(name: impl Into<String>, data: Arc<[u8]>) -> Self {
        Self { name: name.into(), data, pos: 0 }
    }
}

impl Read for BufferKey {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Key for BufferKey {
    fn name(&self) -> &str { &self.name }
    fn bytes_left(&self) -> usize { self.data.len() - self.pos }
}

pub fn validate_name(name: &str) -> Result<(), KeyStoreError> {
    let ok = !name.is_empty()
        && name.len() <= MAX_STORE_KEY_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_uppercase());
    if ok { Ok(()) } else { Err(KeyStoreError::InvalidKeyName(name.to_owned())) }
}

pub fn validate_material(name: &str, data: &[u8], size: usize) -> Result<(), KeyStoreError> {
    if data.len() != size || !data.iter().all(u8::is_ascii_uppercase) {
        return Err(KeyStoreError::InvalidKeyMaterial(name.to_owned()));
    }
    Ok(())
}

/// `size` uniformly distributed symbols `A..=Z`.
pub fn random_symbols(size: usize, rng: &mut dyn RngCore) -> Vec<u8> {
    (0..size)
        .map(|_| b'A' + rng.random_range(0..ALPHABET_LEN as u8))
        .collect()
}

/// A fresh key name of [`GENERATED_NAME_LEN`] letters.
pub fn random_name(rng: &mut dyn RngCore) -> String {
    String::from_utf8(random_symbols(GENERATED_NAME_LEN, rng)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn buffer_key_consumes_symbols() {
        let mut key = BufferKey::new("ABC", Arc::from(&b"KEYSTREAM"[..]));
        assert_eq!(key.bytes_left(), 9);
        let mut buf = [0u8; 3];
        key.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"KEY");
        assert_eq!(key.bytes_left(), 6);
        let mut rest = Vec::new();
        key.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"STREAM");
        assert_eq!(key.bytes_left(), 0);
    }

    #[test]
    fn cloned_keys_read_independently() {
        let a = BufferKey::new("K", Arc::from(&b"ABCDEF"[..]));
        let mut b = a.clone();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(a.bytes_left(), 6);
        assert_eq!(b.bytes_left(), 2);
    }

    #[test]
    fn names_are_uppercase_letters_only() {
        assert!(validate_name("ABCDE").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("abc").is_err());
        assert!(validate_name("AB CD").is_err());
        assert!(validate_name(&"A".repeat(MAX_STORE_KEY_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn random_symbols_stay_in_alphabet() {
        let mut rng = StdRng::seed_from_u64(431);
        let symbols = random_symbols(10_000, &mut rng);
        assert!(symbols.iter().all(u8::is_ascii_uppercase));
        // every letter shows up in a sample this large
        for letter in b'A'..=b'Z' {
            assert!(symbols.contains(&letter));
        }
        let name = random_name(&mut rng);
        assert_eq!(name.len(), GENERATED_NAME_LEN);
        assert!(validate_name(&name).is_ok());
    }
}
