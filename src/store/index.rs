use std::collections::HashMap;
use std::path::PathBuf;

use super::{CredentialSource, StoreError, disk};

pub struct CredentialStore {
    aes_key: [u8; 32],
    /// `None` keeps everything in memory.
    creds_dir: Option<PathBuf>,
    by_id: HashMap<Vec<u8>, CredentialSource>,
    by_rp: HashMap<String, Vec<Vec<u8>>>,
}

impl CredentialStore {
    /// Load all credentials from disk into memory.
    pub fn load(aes_key: [u8; 32], creds_dir: PathBuf) -> Result<Self, StoreError> {
        let sources = disk::load_all(&aes_key, &creds_dir)?;
        let mut store = Self {
            aes_key,
            creds_dir: Some(creds_dir),
            by_id: HashMap::new(),
            by_rp: HashMap::new(),
        };
        for source in sources {
            store.index(source);
        }
        Ok(store)
    }

    pub fn in_memory() -> Self {
        Self {
            aes_key: [0u8; 32],
            creds_dir: None,
            by_id: HashMap::new(),
            by_rp: HashMap::new(),
        }
    }

    fn index(&mut self, source: CredentialSource) {
        if let Some(previous) = self.by_id.get(&source.id) {
            if previous.rp_id != source.rp_id {
                let (old_rp, id) = (previous.rp_id.clone(), source.id.clone());
                self.unindex_rp(&old_rp, &id);
            }
        }
        let ids = self.by_rp.entry(source.rp_id.clone()).or_default();
        if !ids.contains(&source.id) {
            ids.push(source.id.clone());
        }
        self.by_id.insert(source.id.clone(), source);
    }

    fn unindex_rp(&mut self, rp_id: &str, id: &[u8]) {
        if let Some(ids) = self.by_rp.get_mut(rp_id) {
            ids.retain(|i| i.as_slice() != id);
            if ids.is_empty() {
                self.by_rp.remove(rp_id);
            }
        }
    }

    /// Insert or overwrite by id. Disk is written before the index changes,
    /// so a failed write leaves the previous state visible.
    pub fn save(&mut self, source: CredentialSource) -> Result<(), StoreError> {
        if let Some(dir) = &self.creds_dir {
            disk::write_credential(&self.aes_key, dir, &source)?;
        }
        tracing::debug!(cred_id = source.id_hex(), rp_id = %source.rp_id, "Credential saved");
        self.index(source);
        Ok(())
    }

    pub fn lookup(&self, id: &[u8]) -> Option<&CredentialSource> {
        self.by_id.get(id)
    }

    /// All credentials of a relying party, most recent first.
    pub fn load_all(&self, rp_id: &str) -> Vec<&CredentialSource> {
        let Some(ids) = self.by_rp.get(rp_id) else {
            return Vec::new();
        };
        let mut sources: Vec<&CredentialSource> =
            ids.iter().filter_map(|id| self.by_id.get(id)).collect();
        sources.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sources
    }

    /// Delete every credential registered for (rp_id, user_handle).
    /// Returns the removed records so their keys can be deleted too.
    pub fn delete_all(&mut self, rp_id: &str, user_handle: &[u8]) -> Result<Vec<CredentialSource>, StoreError> {
        let doomed: Vec<CredentialSource> = self
            .load_all(rp_id)
            .into_iter()
            .filter(|s| s.user_handle == user_handle)
            .cloned()
            .collect();
        for source in &doomed {
            self.remove(&source.id)?;
        }
        Ok(doomed)
    }

    /// Remove a credential by id; deletes from disk and memory index.
    pub fn remove(&mut self, id: &[u8]) -> Result<bool, StoreError> {
        if !self.by_id.contains_key(id) {
            return Ok(false);
        }
        if let Some(dir) = &self.creds_dir {
            disk::delete_credential(dir, id)?;
        }
        if let Some(source) = self.by_id.remove(id) {
            self.unindex_rp(&source.rp_id, id);
        }
        Ok(true)
    }

    pub fn credential_count(&self) -> usize {
        self.by_id.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(id: u8, rp_id: &str, user: &[u8], created_at: u64) -> CredentialSource {
        let mut s = CredentialSource::new(vec![id; 16], rp_id, user.to_vec(), -7, "user");
        s.created_at = created_at;
        s
    }

    #[test]
    fn test_save_overwrites_by_id() {
        let mut store = CredentialStore::in_memory();
        store.save(source(1, "a.example", b"u", 1)).unwrap();
        let mut updated = source(1, "a.example", b"u", 1);
        updated.sign_count = 5;
        store.save(updated).unwrap();

        assert_eq!(store.credential_count(), 1);
        assert_eq!(store.load_all("a.example").len(), 1, "rp index must not duplicate ids");
        assert_eq!(store.lookup(&[1; 16]).unwrap().sign_count, 5);
    }

    #[test]
    fn test_save_moves_rp_index() {
        let mut store = CredentialStore::in_memory();
        store.save(source(1, "a.example", b"u", 1)).unwrap();
        store.save(source(1, "b.example", b"u", 1)).unwrap();
        assert!(store.load_all("a.example").is_empty());
        assert_eq!(store.load_all("b.example").len(), 1);
    }

    #[test]
    fn test_delete_all_matches_user_handle() {
        let mut store = CredentialStore::in_memory();
        store.save(source(1, "rp.example", b"alice", 1)).unwrap();
        store.save(source(2, "rp.example", b"alice", 2)).unwrap();
        store.save(source(3, "rp.example", b"bob", 3)).unwrap();
        store.save(source(4, "other.example", b"alice", 4)).unwrap();

        let removed = store.delete_all("rp.example", b"alice").unwrap();
        let mut removed_ids: Vec<_> = removed.iter().map(|s| s.id.clone()).collect();
        removed_ids.sort();
        assert_eq!(removed_ids, vec![vec![1u8; 16], vec![2u8; 16]]);
        let left: Vec<_> = store.load_all("rp.example").iter().map(|s| s.user_handle.clone()).collect();
        assert_eq!(left, vec![b"bob".to_vec()]);
        assert_eq!(store.credential_count(), 2);
    }

    #[test]
    fn test_load_all_newest_first() {
        let mut store = CredentialStore::in_memory();
        store.save(source(1, "rp.example", b"a", 10)).unwrap();
        store.save(source(2, "rp.example", b"b", 30)).unwrap();
        store.save(source(3, "rp.example", b"c", 20)).unwrap();
        let order: Vec<u64> = store.load_all("rp.example").iter().map(|s| s.created_at).collect();
        assert_eq!(order, vec![30, 20, 10]);
    }

    #[test]
    fn test_remove_unknown_id() {
        let mut store = CredentialStore::in_memory();
        assert!(!store.remove(&[9; 16]).unwrap());
    }
}
