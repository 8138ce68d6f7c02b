use super::TpmError;
use sha2::Digest as ShaDigest;
use sha2::Sha256;
use std::convert::TryFrom;
use std::convert::TryInto;
use tss_esapi::Context;
use tss_esapi::attributes::{ObjectAttributes, ObjectAttributesBuilder};
use tss_esapi::constants::tss::TPM2_RH_NULL;
use tss_esapi::constants::tss::TPM2_ST_HASHCHECK;
use tss_esapi::handles::KeyHandle;
use tss_esapi::handles::ObjectHandle;
use tss_esapi::interface_types::algorithm::HashingAlgorithm;
use tss_esapi::interface_types::algorithm::PublicAlgorithm;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::Hierarchy;
use tss_esapi::structures::Digest;
use tss_esapi::structures::EccPoint;
use tss_esapi::structures::EccScheme;
use tss_esapi::structures::HashScheme;
use tss_esapi::structures::HashcheckTicket;
use tss_esapi::structures::Private;
use tss_esapi::structures::Public;
use tss_esapi::structures::PublicBuilder;
use tss_esapi::structures::PublicEccParameters;
use tss_esapi::structures::PublicEccParametersBuilder;
use tss_esapi::structures::Signature;
use tss_esapi::structures::SignatureScheme;
use tss_esapi::structures::SymmetricDefinitionObject;
use tss_esapi::traits::Marshall;
use tss_esapi::traits::UnMarshall;
use tss_esapi::tss2_esys::TPMT_TK_HASHCHECK;

fn key_err<E: std::fmt::Display>(e: E) -> TpmError {
    TpmError::Key(e.to_string())
}

/// TPM2B_PRIVATE and TPM2B_PUBLIC of a child key, as stored in the vault:
/// private_len(4, BE) ‖ private ‖ public.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlob {
    pub private: Vec<u8>,
    pub public: Vec<u8>,
}

impl KeyBlob {
    pub fn to_bytes(&self) -> Vec<u8> {
        let private_len = self.private.len() as u32;
        let mut blob = Vec::with_capacity(4 + self.private.len() + self.public.len());
        blob.extend_from_slice(&private_len.to_be_bytes());
        blob.extend_from_slice(&self.private);
        blob.extend_from_slice(&self.public);
        blob
    }

    pub fn from_bytes(blob: &[u8]) -> Result<Self, TpmError> {
        let (len, rest) = blob
            .split_first_chunk::<4>()
            .ok_or_else(|| TpmError::Key("key blob is truncated".into()))?;
        let private_len = u32::from_be_bytes(*len) as usize;
        if rest.len() < private_len {
            return Err(TpmError::Key("key blob private section truncated".into()));
        }
        let (private, public) = rest.split_at(private_len);
        Ok(Self { private: private.to_vec(), public: public.to_vec() })
    }
}

fn ecc_template(attrs: ObjectAttributes, params: PublicEccParameters) -> Result<Public, TpmError> {
    PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Ecc)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attrs)
        .with_ecc_parameters(params)
        .with_ecc_unique_identifier(EccPoint::default())
        .build()
        .map_err(key_err)
}

/// Owner-hierarchy storage key. Same template every time, so the TPM
/// re-derives the same primary and previously wrapped children stay loadable.
pub fn create_primary(ctx: &mut Context) -> Result<KeyHandle, TpmError> {
    let params = PublicEccParametersBuilder::new_restricted_decryption_key(
        SymmetricDefinitionObject::AES_128_CFB,
        EccCurve::NistP256,
    )
    .build()
    .map_err(key_err)?;
    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()
        .map_err(key_err)?;
    let template = ecc_template(attrs, params)?;

    let result = ctx
        .execute_with_nullauth_session(|ctx| {
            ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
        })
        .map_err(|e: tss_esapi::Error| key_err(e))?;
    Ok(result.key_handle)
}

/// Non-exportable P-256 ECDSA signing key wrapped by `primary`.
pub fn create_child_key(ctx: &mut Context, primary: KeyHandle) -> Result<KeyBlob, TpmError> {
    let scheme = EccScheme::EcDsa(HashScheme::new(HashingAlgorithm::Sha256));
    let params = PublicEccParametersBuilder::new_unrestricted_signing_key(scheme, EccCurve::NistP256)
        .build()
        .map_err(key_err)?;
    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_sign_encrypt(true)
        .with_no_da(true)
        .build()
        .map_err(key_err)?;
    let template = ecc_template(attrs, params)?;

    let result = ctx
        .execute_with_nullauth_session(|ctx| ctx.create(primary, template, None, None, None, None))
        .map_err(|e: tss_esapi::Error| key_err(e))?;
    Ok(KeyBlob {
        private: result.out_private.value().to_vec(),
        public: result.out_public.marshall().map_err(key_err)?,
    })
}

pub fn load_key(ctx: &mut Context, primary: KeyHandle, blob: &KeyBlob) -> Result<KeyHandle, TpmError> {
    let private = Private::try_from(blob.private.clone()).map_err(key_err)?;
    let public = Public::unmarshall(&blob.public).map_err(key_err)?;
    ctx.execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))
        .map_err(|e: tss_esapi::Error| key_err(e))
}

fn left_pad32(bytes: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    let len = bytes.len().min(32);
    out[32 - len..].copy_from_slice(&bytes[bytes.len() - len..]);
    out
}

/// Sign `data` with the loaded key.
/// Returns raw (r, s) concatenated, each component zero-padded to 32 bytes.
pub fn sign(ctx: &mut Context, key: KeyHandle, data: &[u8]) -> Result<[u8; 64], TpmError> {
    let hash: [u8; 32] = Sha256::digest(data).into();
    let digest = Digest::try_from(hash.to_vec()).map_err(key_err)?;

    // Null ticket: the digest was computed outside the TPM.
    let validation: HashcheckTicket = TPMT_TK_HASHCHECK {
        tag: TPM2_ST_HASHCHECK,
        hierarchy: TPM2_RH_NULL,
        digest: Default::default(),
    }
    .try_into()
    .map_err(|e: tss_esapi::Error| key_err(e))?;

    let signature = ctx
        .execute_with_nullauth_session(|ctx| ctx.sign(key, digest, SignatureScheme::Null, validation))
        .map_err(|e: tss_esapi::Error| key_err(e))?;

    let Signature::EcDsa(ecc_sig) = signature else {
        return Err(TpmError::Key("Expected ECDSA signature".into()));
    };
    let mut raw = [0u8; 64];
    raw[..32].copy_from_slice(&left_pad32(ecc_sig.signature_r().value()));
    raw[32..].copy_from_slice(&left_pad32(ecc_sig.signature_s().value()));
    Ok(raw)
}

pub fn flush(ctx: &mut Context, handle: KeyHandle) -> Result<(), TpmError> {
    ctx.flush_context(ObjectHandle::from(handle)).map_err(key_err)
}

/// Extract (x, y) coordinates from a marshalled TPM2B_PUBLIC blob.
pub fn ecc_public_coords(public_bytes: &[u8]) -> Result<([u8; 32], [u8; 32]), TpmError> {
    match Public::unmarshall(public_bytes).map_err(key_err)? {
        Public::Ecc { unique, .. } => Ok((
            left_pad32(unique.x().value()),
            left_pad32(unique.y().value()),
        )),
        _ => Err(TpmError::Key("Not an ECC key".into())),
    }
}
