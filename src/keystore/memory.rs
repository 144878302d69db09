use std::sync::Arc;

use log::debug;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::{
    random_name, random_symbols, validate_material, validate_name, BufferKey, Key, KeyInfo,
    KeyStore, KeyStoreError,
};

#[derive(Debug, Clone)]
struct StoredKey {
    name:      String,
    data:      Arc<[u8]>,
    allocated: bool,
}

/// In-memory key store.  Keys are allocated in insertion order.
///
/// Cloning shares the key material but not the allocation state, which is
/// how a test gives the sender and the receiver the same pads.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    keys: Vec<StoredKey>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `count` keys of `size` symbols, names and material drawn from a
    /// seeded generator.  The same arguments always build the same store.
    pub fn deterministic(seed: u64, count: usize, size: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = Self::new();
        while store.keys.len() < count {
            let name = random_name(&mut rng);
            if store.find(&name).is_some() {
                continue;
            }
            store
                .generate(&name, size, &mut rng)
                .expect("generated name is valid and unique");
        }
        store
    }

    /// Add a key with caller-supplied material.
    pub fn insert(&mut self, name: &str, symbols: &[u8]) -> Result<(), KeyStoreError> {
        validate_name(name)?;
        validate_material(name, symbols, symbols.len())?;
        if self.find(name).is_some() {
            return Err(KeyStoreError::KeyExists(name.to_owned()));
        }
        self.keys.push(StoredKey {
            name:      name.to_owned(),
            data:      Arc::from(symbols),
            allocated: false,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn find(&self, name: &str) -> Option<&StoredKey> {
        self.keys.iter().find(|k| k.name == name)
    }
}

impl KeyStore for MemoryKeyStore {
    fn open(&mut self) -> Result<(), KeyStoreError> { Ok(()) }
    fn close(&mut self) -> Result<(), KeyStoreError> { Ok(()) }

    fn next_key(&mut self) -> Result<Box<dyn Key>, KeyStoreError> {
        let stored = self.keys.iter_mut()
            .find(|k| !k.allocated)
            .ok_or(KeyStoreError::NoMoreKeys)?;
        stored.allocated = true;
        debug!("allocated key {} ({} symbols)", stored.name, stored.data.len());
        Ok(Box::new(BufferKey::new(stored.name.clone(), Arc::clone(&stored.data))))
    }

    fn open_key(&mut self, name: &str) -> Result<Box<dyn Key>, KeyStoreError> {
        let stored = self.find(name)
            .ok_or_else(|| KeyStoreError::KeyNotFound(name.to_owned()))?;
        Ok(Box::new(BufferKey::new(stored.name.clone(), Arc::clone(&stored.data))))
    }

    fn generate(&mut self, name: &str, size: usize, rng: &mut dyn RngCore) -> Result<(), KeyStoreError> {
        let symbols = random_symbols(size, rng);
        self.insert(name, &symbols)
    }

    fn list(&self) -> Vec<KeyInfo> {
        self.keys.iter()
            .map(|k| KeyInfo { name: k.name.clone(), size: k.data.len(), allocated: k.allocated })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn deterministic_stores_match() {
        let mut a = MemoryKeyStore::deterministic(7, 3, 64);
        let mut b = MemoryKeyStore::deterministic(7, 3, 64);
        assert_eq!(a.list(), b.list());
        let mut ka = a.next_key().unwrap();
        let mut kb = b.open_key(ka.name()).unwrap();
        let (mut sa, mut sb) = (Vec::new(), Vec::new());
        ka.read_to_end(&mut sa).unwrap();
        kb.read_to_end(&mut sb).unwrap();
        assert_eq!(sa, sb);
        assert_eq!(sa.len(), 64);
    }

    #[test]
    fn next_key_allocates_in_order_until_exhausted() {
        let mut store = MemoryKeyStore::new();
        store.insert("ONE", b"AAAA").unwrap();
        store.insert("TWO", b"BBBB").unwrap();
        assert_eq!(store.next_key().unwrap().name(), "ONE");
        assert_eq!(store.next_key().unwrap().name(), "TWO");
        assert!(matches!(store.next_key(), Err(KeyStoreError::NoMoreKeys)));
        assert!(store.list().iter().all(|k| k.allocated));
    }

    #[test]
    fn open_key_ignores_allocation_and_reports_missing() {
        let mut store = MemoryKeyStore::new();
        store.insert("ONE", b"ABCD").unwrap();
        store.next_key().unwrap();
        assert_eq!(store.open_key("ONE").unwrap().bytes_left(), 4);
        assert!(matches!(store.open_key("NOPE"), Err(KeyStoreError::KeyNotFound(n)) if n == "NOPE"));
    }

    #[test]
    fn insert_rejects_duplicates_and_bad_material() {
        let mut store = MemoryKeyStore::new();
        store.insert("ONE", b"ABCD").unwrap();
        assert!(matches!(store.insert("ONE", b"ABCD"), Err(KeyStoreError::KeyExists(_))));
        assert!(matches!(store.insert("TWO", b"AB1D"), Err(KeyStoreError::InvalidKeyMaterial(_))));
        assert!(matches!(store.insert("two", b"ABCD"), Err(KeyStoreError::InvalidKeyName(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clones_share_material_not_allocation() {
        let mut a = MemoryKeyStore::deterministic(1, 2, 32);
        let b = a.clone();
        a.next_key().unwrap();
        assert!(a.list()[0].allocated);
        assert!(!b.list()[0].allocated);
    }
}
