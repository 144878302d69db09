//! Directory-backed key store.
//!
//! ```text
//! <dir>/keystore.json   index: salt + one record per key
//! <dir>/<NAME>.key      key symbols, raw A–Z or sealed with the store password
//! ```
//!
//! Allocation is persisted before the key is returned, so a crash can waste
//! a pad but never hand the same pad out twice.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::{
    random_symbols, validate_material, validate_name, BufferKey, Key, KeyInfo, KeyStore,
    KeyStoreError,
};
use crate::crypto::{self, SALT_LEN};

pub const INDEX_FILE: &str = "keystore.json";
pub const KEY_EXTENSION: &str = "key";
const INDEX_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct KeyRecord {
    name:      String,
    size:      usize,
    /// Unix seconds.
    created:   i64,
    allocated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Index {
    version: u32,
    /// Hex-encoded Argon2id salt; present when key files are sealed.
    #[serde(default)]
    salt:    Option<String>,
    keys:    Vec<KeyRecord>,
}

impl Default for Index {
    fn default() -> Self {
        Self { version: INDEX_VERSION, salt: None, keys: Vec::new() }
    }
}

pub struct DirKeyStore {
    path:     PathBuf,
    password: Option<String>,
    index:    Option<Index>,
    file_key: Option<[u8; 32]>,
}

impl DirKeyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_owned(), password: None, index: None, file_key: None }
    }

    /// Key files are sealed with AES-256-GCM under a key derived from `password`.
    pub fn with_password<P: AsRef<Path>>(path: P, password: &str) -> Self {
        Self { password: Some(password.to_owned()), ..Self::new(path) }
    }

    pub fn path(&self) -> &Path { &self.path }

    fn index_mut(&mut self) -> Result<&mut Index, KeyStoreError> {
        self.index.as_mut().ok_or(KeyStoreError::NotOpen)
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.path.join(name).with_extension(KEY_EXTENSION)
    }

    fn save_index(&self) -> Result<(), KeyStoreError> {
        let index = self.index.as_ref().ok_or(KeyStoreError::NotOpen)?;
        let tmp = self.path.join(format!("{INDEX_FILE}.tmp"));
        fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
        fs::rename(tmp, self.path.join(INDEX_FILE))?;
        Ok(())
    }

    fn load_key(&self, record: &KeyRecord) -> Result<Box<dyn Key>, KeyStoreError> {
        let raw = fs::read(self.key_path(&record.name))?;
        let symbols = match &self.file_key {
            Some(k) => crypto::unseal(k, &raw)?,
            None    => raw,
        };
        validate_material(&record.name, &symbols, record.size)?;
        Ok(Box::new(BufferKey::new(record.name.clone(), Arc::from(symbols))))
    }
}

impl KeyStore for DirKeyStore {
    fn open(&mut self) -> Result<(), KeyStoreError> {
        fs::create_dir_all(&self.path)?;
        let index_path = self.path.join(INDEX_FILE);
        let mut index: Index = if index_path.exists() {
            serde_json::from_slice(&fs::read(&index_path)?)?
        } else {
            Index::default()
        };

        let mut dirty = !index_path.exists();
        if let Some(pwd) = &self.password {
            let salt = match index.salt.as_deref().map(hex::decode) {
                Some(Ok(s)) => s,
                _ => {
                    let mut s = [0u8; SALT_LEN];
                    rand::rng().fill(&mut s);
                    index.salt = Some(hex::encode(s));
                    dirty = true;
                    s.to_vec()
                }
            };
            self.file_key = Some(crypto::derive_key(pwd, &salt)?);
        }

        debug!("opened key store {} ({} keys)", self.path.display(), index.keys.len());
        self.index = Some(index);
        if dirty {
            self.save_index()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), KeyStoreError> {
        if self.index.is_some() {
            self.save_index()?;
        }
        self.index = None;
        self.file_key = None;
        Ok(())
    }

    fn next_key(&mut self) -> Result<Box<dyn Key>, KeyStoreError> {
        let record = {
            let index = self.index_mut()?;
            let record = index.keys.iter_mut()
                .find(|k| !k.allocated)
                .ok_or(KeyStoreError::NoMoreKeys)?;
            record.allocated = true;
            record.clone()
        };
        self.save_index()?;
        info!("allocated key {} ({} symbols)", record.name, record.size);
        self.load_key(&record)
    }

    fn open_key(&mut self, name: &str) -> Result<Box<dyn Key>, KeyStoreError> {
        let record = self.index_mut()?
            .keys.iter()
            .find(|k| k.name == name)
            .cloned()
            .ok_or_else(|| KeyStoreError::KeyNotFound(name.to_owned()))?;
        self.load_key(&record)
    }

    fn generate(&mut self, name: &str, size: usize, rng: &mut dyn RngCore) -> Result<(), KeyStoreError> {
        validate_name(name)?;
        if self.index_mut()?.keys.iter().any(|k| k.name == name) {
            return Err(KeyStoreError::KeyExists(name.to_owned()));
        }

        let symbols = random_symbols(size, rng);
        let on_disk = match &self.file_key {
            Some(k) => crypto::seal(k, &symbols)?,
            None    => symbols,
        };
        fs::write(self.key_path(name), on_disk)?;

        self.index_mut()?.keys.push(KeyRecord {
            name:      name.to_owned(),
            size,
            created:   Utc::now().timestamp(),
            allocated: false,
        });
        self.save_index()
    }

    fn list(&self) -> Vec<KeyInfo> {
        self.index.iter()
            .flat_map(|i| i.keys.iter())
            .map(|k| KeyInfo { name: k.name.clone(), size: k.size, allocated: k.allocated })
            .collect()
    }
}
