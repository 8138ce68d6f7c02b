use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;

use super::vault::KeyVault;
use super::{KeyError, KeySupport};
use crate::ctap2::cose::{COSE_ALG_ES256, CoseKey};

/// P-256 keys generated in process memory and kept in an encrypted vault.
/// Never hardware isolated, so attestation is always packed self-attestation.
pub struct SoftwareKeySupport {
    vault: KeyVault,
}

impl SoftwareKeySupport {
    pub fn new(vault: KeyVault) -> Self {
        Self { vault }
    }

    fn signing_key(&self, alias: &str) -> Result<SigningKey, KeyError> {
        let secret = self
            .vault
            .get(alias)?
            .ok_or_else(|| KeyError::NotFound(alias.to_string()))?;
        SigningKey::from_slice(&secret).map_err(|e| KeyError::Crypto(e.to_string()))
    }
}

pub(crate) fn cose_key_from_verifying_key(key: &VerifyingKey) -> Result<CoseKey, KeyError> {
    let point = key.to_encoded_point(false);
    let coord = |c: Option<&p256::FieldBytes>| -> Result<[u8; 32], KeyError> {
        c.and_then(|b| <[u8; 32]>::try_from(b.as_slice()).ok())
            .ok_or_else(|| KeyError::Crypto("public key is the identity point".into()))
    };
    Ok(CoseKey::es256(coord(point.x())?, coord(point.y())?))
}

impl KeySupport for SoftwareKeySupport {
    fn alg(&self) -> i64 {
        COSE_ALG_ES256
    }

    fn name(&self) -> &'static str {
        "software"
    }

    fn create_key_pair(&self, alias: &str, _client_data_hash: &[u8]) -> Result<CoseKey, KeyError> {
        let key = SigningKey::random(&mut OsRng);
        self.vault.put(alias, &key.to_bytes())?;
        tracing::debug!(alias, "Software key pair created");
        cose_key_from_verifying_key(key.verifying_key())
    }

    fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let signature: Signature = self.signing_key(alias)?.sign(data);
        Ok(signature.to_der().as_bytes().to_vec())
    }

    fn has_key(&self, alias: &str) -> bool {
        self.vault.contains(alias)
    }

    fn is_hardware_secured(&self, _alias: &str) -> bool {
        false
    }

    fn delete_key(&self, alias: &str) -> Result<(), KeyError> {
        self.vault.delete(alias)
    }
}
