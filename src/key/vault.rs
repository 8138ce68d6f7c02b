use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use super::KeyError;
use crate::store::StoreError;
use crate::store::disk::{open, seal};

/// Encrypted blob storage for key material, one `{alias}.key` file per key.
pub struct KeyVault {
    aes_key: [u8; 32],
    dir: Option<PathBuf>,
    cache: Mutex<HashMap<String, Vec<u8>>>,
}

impl KeyVault {
    pub fn open(aes_key: [u8; 32], dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { aes_key, dir: Some(dir), cache: Mutex::new(HashMap::new()) })
    }

    pub fn in_memory() -> Self {
        Self { aes_key: [0u8; 32], dir: None, cache: Mutex::new(HashMap::new()) }
    }

    fn path(&self, alias: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{alias}.key")))
    }

    pub fn put(&self, alias: &str, secret: &[u8]) -> Result<(), KeyError> {
        if let Some(path) = self.path(alias) {
            let sealed = seal(&self.aes_key, secret)?;
            std::fs::write(path, sealed).map_err(StoreError::from)?;
        }
        self.cache
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .insert(alias.to_string(), secret.to_vec());
        Ok(())
    }

    pub fn get(&self, alias: &str) -> Result<Option<Vec<u8>>, KeyError> {
        let mut cache = self.cache.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(secret) = cache.get(alias) {
            return Ok(Some(secret.clone()));
        }
        let Some(path) = self.path(alias) else {
            return Ok(None);
        };
        let sealed = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::from(e).into()),
        };
        let secret = open(&self.aes_key, &sealed)?;
        cache.insert(alias.to_string(), secret.clone());
        Ok(Some(secret))
    }

    pub fn contains(&self, alias: &str) -> bool {
        matches!(self.get(alias), Ok(Some(_)))
    }

    pub fn delete(&self, alias: &str) -> Result<(), KeyError> {
        self.cache.lock().map_err(|_| StoreError::Poisoned)?.remove(alias);
        if let Some(path) = self.path(alias) {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::from(e).into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vault_persists_encrypted() {
        let dir = tempfile::tempdir().unwrap();
        let key = [0x42u8; 32];
        {
            let vault = KeyVault::open(key, dir.path().to_path_buf()).unwrap();
            vault.put("credential-source-01", b"private").unwrap();
        }
        let raw = std::fs::read(dir.path().join("credential-source-01.key")).unwrap();
        assert!(!raw.windows(7).any(|w| w == b"private"), "key material must not be stored in clear");

        let vault = KeyVault::open(key, dir.path().to_path_buf()).unwrap();
        assert_eq!(vault.get("credential-source-01").unwrap().as_deref(), Some(&b"private"[..]));
    }

    #[test]
    fn test_vault_missing_alias() {
        let vault = KeyVault::in_memory();
        assert!(vault.get("nope").unwrap().is_none());
        assert!(!vault.contains("nope"));
    }

    #[test]
    fn test_vault_delete() {
        let dir = tempfile::tempdir().unwrap();
        let vault = KeyVault::open([1u8; 32], dir.path().to_path_buf()).unwrap();
        vault.put("a", b"x").unwrap();
        vault.delete("a").unwrap();
        assert!(!vault.contains("a"));
        vault.delete("a").unwrap();
    }
}
