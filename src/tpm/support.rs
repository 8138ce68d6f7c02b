use super::TpmContext;
use super::keys::{self, KeyBlob};
use crate::ctap2::authenticator_data::encode_der_ecdsa;
use crate::ctap2::cose::{COSE_ALG_ES256, CoseKey};
use crate::key::{KeyError, KeySupport, KeyVault};

/// ES256 keys generated inside a TPM. Only the wrapped blobs leave the chip;
/// they are kept in the vault under the credential's key alias.
pub struct TpmKeySupport {
    tpm: TpmContext,
    blobs: KeyVault,
    chain: Option<Vec<Vec<u8>>>,
}

impl TpmKeySupport {
    pub fn new(tpm: TpmContext, blobs: KeyVault) -> Self {
        Self { tpm, blobs, chain: None }
    }

    /// DER certificates (leaf first) presented for keys of this TPM.
    pub fn with_certificate_chain(mut self, chain: Vec<Vec<u8>>) -> Self {
        self.chain = Some(chain);
        self
    }

    fn blob(&self, alias: &str) -> Result<KeyBlob, KeyError> {
        let bytes = self
            .blobs
            .get(alias)?
            .ok_or_else(|| KeyError::NotFound(alias.to_string()))?;
        Ok(KeyBlob::from_bytes(&bytes)?)
    }
}

impl KeySupport for TpmKeySupport {
    fn alg(&self) -> i64 {
        COSE_ALG_ES256
    }

    fn name(&self) -> &'static str {
        "tpm"
    }

    fn create_key_pair(&self, alias: &str, _client_data_hash: &[u8]) -> Result<CoseKey, KeyError> {
        let blob = self
            .tpm
            .with_ctx(|ctx, primary| keys::create_child_key(ctx, primary))?;
        let (x, y) = keys::ecc_public_coords(&blob.public)?;
        self.blobs.put(alias, &blob.to_bytes())?;
        tracing::debug!(alias, "TPM key pair created");
        Ok(CoseKey::es256(x, y))
    }

    fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, KeyError> {
        let blob = self.blob(alias)?;
        let raw = self.tpm.with_ctx(|ctx, primary| {
            let handle = keys::load_key(ctx, primary, &blob)?;
            let signed = keys::sign(ctx, handle, data);
            keys::flush(ctx, handle)?;
            signed
        })?;
        Ok(encode_der_ecdsa(&raw))
    }

    fn has_key(&self, alias: &str) -> bool {
        self.blobs.contains(alias)
    }

    fn is_hardware_secured(&self, alias: &str) -> bool {
        self.has_key(alias)
    }

    fn delete_key(&self, alias: &str) -> Result<(), KeyError> {
        self.blobs.delete(alias)
    }

    fn certificate_chain(&self, _alias: &str) -> Option<Vec<Vec<u8>>> {
        self.chain.clone()
    }
}
