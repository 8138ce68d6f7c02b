use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use std::path::{Path, PathBuf};

use super::credential::hex;
use super::{CredentialSource, StoreError};

const NONCE_LEN: usize = 12;

/// nonce(12) ‖ AES-256-GCM(plaintext).
pub(crate) fn seal(aes_key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(aes_key)
        .map_err(|e| StoreError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| StoreError::Encryption(e.to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub(crate) fn open(aes_key: &[u8; 32], bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    if bytes.len() < NONCE_LEN {
        return Err(StoreError::Corrupt("file too short".into()));
    }
    let (nonce_bytes, ciphertext) = bytes.split_at(NONCE_LEN);

    let cipher = Aes256Gcm::new_from_slice(aes_key)
        .map_err(|e| StoreError::Encryption(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|e| StoreError::Encryption(e.to_string()))
}

fn credential_path(dir: &Path, id: &[u8]) -> PathBuf {
    dir.join(format!("{}.bin", hex(id)))
}

/// Encrypt + write credential to `dir/{id_hex}.bin`.
pub(crate) fn write_credential(
    aes_key: &[u8; 32],
    dir: &Path,
    source: &CredentialSource,
) -> Result<(), StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(source, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let file_bytes = seal(aes_key, &buf)?;
    std::fs::write(credential_path(dir, &source.id), file_bytes)?;
    Ok(())
}

/// Read + decrypt + deserialize credential from `path`.
pub(crate) fn read_credential(
    aes_key: &[u8; 32],
    path: &Path,
) -> Result<CredentialSource, StoreError> {
    let plaintext = open(aes_key, &std::fs::read(path)?)?;
    ciborium::from_reader(plaintext.as_slice())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn delete_credential(dir: &Path, id: &[u8]) -> Result<(), StoreError> {
    match std::fs::remove_file(credential_path(dir, id)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Load all valid credential files from `dir`. Logs and skips corrupt files.
pub(crate) fn load_all(
    aes_key: &[u8; 32],
    dir: &Path,
) -> Result<Vec<CredentialSource>, StoreError> {
    let mut sources = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("bin") {
            continue;
        }
        match read_credential(aes_key, &path) {
            Ok(source) => sources.push(source),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping corrupt credential file");
            }
        }
    }
    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = [7u8; 32];
        let sealed = seal(&key, b"secret").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 6 + 16, "nonce + ciphertext + tag");
        assert_eq!(open(&key, &sealed).unwrap(), b"secret");
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let sealed = seal(&[1u8; 32], b"secret").unwrap();
        assert!(matches!(open(&[2u8; 32], &sealed), Err(StoreError::Encryption(_))));
    }

    #[test]
    fn test_open_truncated() {
        assert!(matches!(open(&[1u8; 32], b"short"), Err(StoreError::Corrupt(_))));
    }
}
