use serde::{Deserialize, Serialize};

pub const CREDENTIAL_RECORD_VERSION: u8 = 1;

/// A stored credential. The private key lives with the key support under
/// `key_label`; this record only points at it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSource {
    pub version:     u8,
    pub id:          Vec<u8>,
    pub rp_id:       String,
    pub user_handle: Vec<u8>,
    pub alg:         i64,
    pub sign_count:  u32,
    pub key_label:   String,
    pub other_ui:    String,
    pub created_at:  u64,           // Unix timestamp
}

impl CredentialSource {
    pub fn new(id: Vec<u8>, rp_id: &str, user_handle: Vec<u8>, alg: i64, other_ui: &str) -> Self {
        let created_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self {
            version: CREDENTIAL_RECORD_VERSION,
            key_label: Self::key_label_for(&id),
            id,
            rp_id: rp_id.to_string(),
            user_handle,
            alg,
            sign_count: 0,
            other_ui: other_ui.to_string(),
            created_at,
        }
    }

    /// Alias of the credential's key pair inside the key support.
    pub fn key_label_for(id: &[u8]) -> String {
        format!("credential-source-{}", hex(id))
    }

    pub fn id_hex(&self) -> String {
        hex(&self.id)
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_label_derived_from_id() {
        let source = CredentialSource::new(vec![0xde, 0xad], "example.org", b"u".to_vec(), -7, "Alice");
        assert_eq!(source.key_label, "credential-source-dead");
        assert_eq!(source.sign_count, 0);
        assert_eq!(source.version, CREDENTIAL_RECORD_VERSION);
    }
}
