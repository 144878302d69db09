//! One-time-pad keystream cipher over the 26-letter alphabet.
//!
//! `cipher = (plain + key) mod 26`, `plain = (cipher - key) mod 26`, with
//! letters taken as `0..26` offsets from `A`.  Each transformed symbol
//! consumes exactly one key symbol; key material must never be reused.
//!
//! [`Cipher`] owns the current [`Key`] and the [`KeyStore`] it came from.
//! Rotation policy lives in the encoder: the cipher only refuses to read
//! past the end of the current key.

use std::collections::VecDeque;
use std::io::{self, Read};

use log::debug;
use thiserror::Error;

use crate::keystore::{Key, KeyStore, KeyStoreError};
use crate::tables::ALPHABET_LEN;

const MODULUS: i16 = ALPHABET_LEN as i16;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("No key is open")]
    NoKey,
    #[error("Key underrun: {requested} symbols requested, {left} left")]
    KeyUnderrun { requested: usize, left: usize },
    #[error("Key {0} returned a symbol outside A-Z")]
    BadKeySymbol(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

#[inline]
fn offset(symbol: u8) -> i16 {
    i16::from(symbol) - i16::from(b'A')
}

#[inline]
fn letter(x: i16) -> u8 {
    // Normalise into [0, 26) before mapping back to a letter.
    b'A' + (((x % MODULUS) + MODULUS) % MODULUS) as u8
}

#[inline]
pub fn encrypt_symbol(plain: u8, key: u8) -> u8 {
    letter(offset(plain) + offset(key))
}

#[inline]
pub fn decrypt_symbol(cipher: u8, key: u8) -> u8 {
    letter(offset(cipher) - offset(key))
}

pub struct Cipher {
    store:     Box<dyn KeyStore>,
    key:       Option<Box<dyn Key>>,
    direction: Direction,
    /// Transformed symbols waiting to be read.
    fifo:      VecDeque<u8>,
    scratch:   Vec<u8>,
}

impl Cipher {
    pub fn new(store: Box<dyn KeyStore>, direction: Direction) -> Self {
        Self { store, key: None, direction, fifo: VecDeque::new(), scratch: Vec::new() }
    }

    pub fn direction(&self) -> Direction { self.direction }
    pub fn has_key(&self) -> bool { self.key.is_some() }
    pub fn key_name(&self) -> Option<&str> { self.key.as_deref().map(|k| k.name()) }

    /// Symbols left on the current key, zero when none is open.
    pub fn bytes_left(&self) -> usize {
        self.key.as_deref().map_or(0, |k| k.bytes_left())
    }

    /// Allocate the store's next key without installing it.
    pub fn next_key(&mut self) -> Result<Box<dyn Key>, KeyStoreError> {
        self.store.next_key()
    }

    /// Open `name` from the store and make it the current key.
    pub fn open_key(&mut self, name: &str) -> Result<(), KeyStoreError> {
        let key = self.store.open_key(name)?;
        self.rotate(key);
        Ok(())
    }

    /// Swap in `key`; the previous key is dropped and never read again.
    pub fn rotate(&mut self, key: Box<dyn Key>) {
        debug!(
            "cipher key {} -> {} ({} symbols)",
            self.key_name().unwrap_or("-"),
            key.name(),
            key.bytes_left(),
        );
        self.key = Some(key);
    }

    pub fn close_key(&mut self) {
        self.key = None;
    }

    /// Transform `buf` in place, consuming `buf.len()` key symbols.
    ///
    /// Callers must not ask for more than [`Cipher::bytes_left`]; doing so
    /// fails without consuming any key material.
    pub fn transform(&mut self, buf: &mut [u8]) -> Result<(), CipherError> {
        let key = self.key.as_deref_mut().ok_or(CipherError::NoKey)?;
        let left = key.bytes_left();
        if buf.len() > left {
            return Err(CipherError::KeyUnderrun { requested: buf.len(), left });
        }
        self.scratch.resize(buf.len(), 0);
        key.read_exact(&mut self.scratch)?;
        if !self.scratch.iter().all(u8::is_ascii_uppercase) {
            return Err(CipherError::BadKeySymbol(key.name().to_owned()));
        }

        let f = match self.direction {
            Direction::Encrypt => encrypt_symbol,
            Direction::Decrypt => decrypt_symbol,
        };
        for (b, &k) in buf.iter_mut().zip(&self.scratch) {
            debug_assert!(b.is_ascii_uppercase());
            *b = f(*b, k);
        }
        Ok(())
    }

    /// Transform `buf` and queue the result for reading.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, CipherError> {
        let mut out = buf.to_vec();
        self.transform(&mut out)?;
        self.fifo.extend(out);
        Ok(buf.len())
    }

    pub fn pending(&self) -> usize { self.fifo.len() }

    /// Move every queued symbol to the end of `out`.
    pub fn drain_into(&mut self, out: &mut Vec<u8>) {
        out.extend(self.fifo.drain(..));
    }
}

impl Read for Cipher {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.fifo.len());
        for (dst, src) in buf.iter_mut().zip(self.fifo.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::MemoryKeyStore;

    fn store_with(name: &str, symbols: &[u8]) -> Box<dyn KeyStore> {
        let mut s = MemoryKeyStore::new();
        s.insert(name, symbols).unwrap();
        Box::new(s)
    }

    #[test]
    fn modular_arithmetic_wraps_both_ways() {
        assert_eq!(encrypt_symbol(b'A', b'A'), b'A');
        assert_eq!(encrypt_symbol(b'Z', b'B'), b'A');
        assert_eq!(encrypt_symbol(b'H', b'D'), b'K');
        assert_eq!(decrypt_symbol(b'A', b'B'), b'Z');
        assert_eq!(decrypt_symbol(b'K', b'D'), b'H');
        for p in b'A'..=b'Z' {
            for k in b'A'..=b'Z' {
                assert_eq!(decrypt_symbol(encrypt_symbol(p, k), k), p);
            }
        }
    }

    #[test]
    fn write_then_read_through_fifo() {
        let mut enc = Cipher::new(store_with("PAD", b"LEMONLEMON"), Direction::Encrypt);
        enc.open_key("PAD").unwrap();
        enc.write(b"ATTACK").unwrap();
        enc.write(b"AT").unwrap();
        assert_eq!(enc.bytes_left(), 2);
        assert_eq!(enc.pending(), 8);

        let mut ct = [0u8; 8];
        enc.read_exact(&mut ct).unwrap();
        assert_eq!(&ct, b"LXFOPVEF");

        let mut dec = Cipher::new(store_with("PAD", b"LEMONLEMON"), Direction::Decrypt);
        dec.open_key("PAD").unwrap();
        let mut pt = ct;
        dec.transform(&mut pt).unwrap();
        assert_eq!(&pt, b"ATTACKAT");
    }

    #[test]
    fn underrun_is_refused_without_consuming_key() {
        let mut c = Cipher::new(store_with("PAD", b"ABC"), Direction::Encrypt);
        assert!(matches!(c.write(b"A"), Err(CipherError::NoKey)));
        c.open_key("PAD").unwrap();
        assert!(matches!(
            c.write(b"ABCD"),
            Err(CipherError::KeyUnderrun { requested: 4, left: 3 })
        ));
        assert_eq!(c.bytes_left(), 3);
        c.write(b"ABC").unwrap();
        assert_eq!(c.bytes_left(), 0);
    }

    #[test]
    fn rotate_replaces_current_key() {
        let mut store = MemoryKeyStore::new();
        store.insert("ONE", b"BBBB").unwrap();
        store.insert("TWO", b"CCCC").unwrap();
        let mut c = Cipher::new(Box::new(store), Direction::Encrypt);
        let first = c.next_key().unwrap();
        c.rotate(first);
        assert_eq!(c.key_name(), Some("ONE"));
        let second = c.next_key().unwrap();
        c.rotate(second);
        assert_eq!(c.key_name(), Some("TWO"));
        let mut out = [b'A'; 2];
        c.transform(&mut out).unwrap();
        assert_eq!(&out, b"CC");
        c.close_key();
        assert!(!c.has_key());
        assert_eq!(c.bytes_left(), 0);
    }
}
