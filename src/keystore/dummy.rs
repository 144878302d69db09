use std::io::{self, Read};

use rand::RngCore;

use super::{Key, KeyInfo, KeyStore, KeyStoreError};

pub const DUMMY_KEY_NAME: &str = "DUMMY";

/// Null backend: one endless key of `A` symbols.
///
/// `A` is the additive identity, so the cipher passes symbols through
/// unchanged.  Only useful for inspecting the codec output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyKeyStore;

struct DummyKey;

impl Read for DummyKey {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        buf.fill(b'A');
        Ok(buf.len())
    }
}

impl Key for DummyKey {
    fn name(&self) -> &str { DUMMY_KEY_NAME }
    fn bytes_left(&self) -> usize { usize::MAX }
}

impl KeyStore for DummyKeyStore {
    fn open(&mut self) -> Result<(), KeyStoreError> { Ok(()) }
    fn close(&mut self) -> Result<(), KeyStoreError> { Ok(()) }

    fn next_key(&mut self) -> Result<Box<dyn Key>, KeyStoreError> {
        Ok(Box::new(DummyKey))
    }

    fn open_key(&mut self, name: &str) -> Result<Box<dyn Key>, KeyStoreError> {
        if name == DUMMY_KEY_NAME {
            Ok(Box::new(DummyKey))
        } else {
            Err(KeyStoreError::KeyNotFound(name.to_owned()))
        }
    }

    fn generate(&mut self, _name: &str, _size: usize, _rng: &mut dyn RngCore) -> Result<(), KeyStoreError> {
        Ok(())
    }

    fn list(&self) -> Vec<KeyInfo> {
        vec![KeyInfo { name: DUMMY_KEY_NAME.to_owned(), size: usize::MAX, allocated: false }]
    }
}
