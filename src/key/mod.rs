pub mod software;
pub mod vault;

use std::sync::Arc;

use ciborium::value::Value;

use crate::ctap2::attestation::{AttestationFormat, AttestationObject};
use crate::ctap2::authenticator_data::AuthenticatorData;
use crate::ctap2::cose::CoseKey;
use crate::ctap2::types::Ctap2Error;
use crate::store::StoreError;
use crate::tpm::TpmError;

pub use software::SoftwareKeySupport;
pub use vault::KeyVault;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("no key under alias {0}")]
    NotFound(String),
    #[error("crypto: {0}")]
    Crypto(String),
    #[error("vault: {0}")]
    Vault(#[from] StoreError),
    #[error("tpm: {0}")]
    Tpm(#[from] TpmError),
    #[error("encoding: {0}")]
    Encoding(#[from] Ctap2Error),
}

/// Key generation, signing and attestation for one COSE algorithm.
///
/// Calls may block on hardware; sessions run them on the blocking pool.
pub trait KeySupport: Send + Sync {
    fn alg(&self) -> i64;

    /// Short label for logs.
    fn name(&self) -> &'static str;

    fn create_key_pair(&self, alias: &str, client_data_hash: &[u8]) -> Result<CoseKey, KeyError>;

    /// DER-encoded signature over `data`.
    fn sign(&self, alias: &str, data: &[u8]) -> Result<Vec<u8>, KeyError>;

    fn has_key(&self, alias: &str) -> bool;

    fn is_hardware_secured(&self, alias: &str) -> bool;

    fn delete_key(&self, alias: &str) -> Result<(), KeyError>;

    /// DER certificates, leaf first, vouching for a hardware-held key.
    fn certificate_chain(&self, _alias: &str) -> Option<Vec<Vec<u8>>> {
        None
    }

    /// Sign authData ‖ clientDataHash and wrap it in an attestation statement.
    /// Hardware keys with a certificate chain get "android-key" with `x5c`,
    /// everything else gets packed self-attestation.
    fn build_attestation_object(
        &self,
        alias: &str,
        client_data_hash: &[u8],
        authenticator_data: AuthenticatorData,
    ) -> Result<AttestationObject, KeyError> {
        let auth_data_bytes = authenticator_data.to_bytes()?;
        let mut to_sign = auth_data_bytes.clone();
        to_sign.extend_from_slice(client_data_hash);
        let signature = self.sign(alias, &to_sign)?;

        let mut att_stmt = vec![
            ("alg".to_string(), Value::Integer(self.alg().into())),
            ("sig".to_string(), Value::Bytes(signature)),
        ];
        let chain = self
            .certificate_chain(alias)
            .filter(|c| !c.is_empty() && self.is_hardware_secured(alias));
        let fmt = match chain {
            Some(chain) => {
                att_stmt.push((
                    "x5c".to_string(),
                    Value::Array(chain.into_iter().map(Value::Bytes).collect()),
                ));
                AttestationFormat::AndroidKey
            }
            None => AttestationFormat::Packed,
        };
        tracing::debug!(alias, fmt = fmt.as_str(), support = self.name(), "Attestation built");
        Ok(AttestationObject::from_parts(fmt, authenticator_data, auth_data_bytes, att_stmt))
    }
}

/// Picks a key support by algorithm. Order of `supports` is the order of
/// preference when several handle the same algorithm.
#[derive(Clone, Default)]
pub struct KeySupportChooser {
    supports: Vec<Arc<dyn KeySupport>>,
}

impl KeySupportChooser {
    pub fn new(supports: Vec<Arc<dyn KeySupport>>) -> Self {
        Self { supports }
    }

    /// First algorithm in the caller's order that any support handles.
    pub fn choose(&self, algorithms: &[i64]) -> Option<Arc<dyn KeySupport>> {
        for alg in algorithms {
            if let Some(support) = self.supports.iter().find(|s| s.alg() == *alg) {
                tracing::debug!(alg, support = support.name(), "Key support chosen");
                return Some(Arc::clone(support));
            }
        }
        tracing::warn!(?algorithms, "No key support for requested algorithms");
        None
    }

    /// Support holding the key of an existing credential.
    pub fn for_key(&self, alg: i64, alias: &str) -> Option<Arc<dyn KeySupport>> {
        self.supports
            .iter()
            .find(|s| s.alg() == alg && s.has_key(alias))
            .cloned()
    }

    pub fn supports(&self) -> &[Arc<dyn KeySupport>] {
        &self.supports
    }
}
