use rand::RngCore;
use tss_esapi::Context;
use tss_esapi::attributes::ObjectAttributesBuilder;
use tss_esapi::handles::{KeyHandle, ObjectHandle};
use tss_esapi::interface_types::algorithm::{HashingAlgorithm, PublicAlgorithm};
use tss_esapi::structures::{
    KeyedHashScheme, Private, Public, PublicBuilder, PublicKeyedHashParameters, SensitiveData,
};
use tss_esapi::traits::{Marshall, UnMarshall};

use super::TpmError;
use super::keys::KeyBlob;

fn seal_err<E: std::fmt::Display>(e: E) -> TpmError {
    TpmError::Seal(e.to_string())
}

/// Fresh 32-byte master key plus the TPM-sealed copy to persist.
pub fn seal_master_key(ctx: &mut Context, primary: KeyHandle) -> Result<(KeyBlob, [u8; 32]), TpmError> {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    let sensitive = SensitiveData::try_from(key.to_vec()).map_err(seal_err)?;

    let attrs = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .build()
        .map_err(seal_err)?;
    let template = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::KeyedHash)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attrs)
        .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
        .with_keyed_hash_unique_identifier(Default::default())
        .build()
        .map_err(seal_err)?;

    let created = ctx
        .execute_with_nullauth_session(|ctx| ctx.create(primary, template, None, Some(sensitive), None, None))
        .map_err(|e: tss_esapi::Error| seal_err(e))?;
    let blob = KeyBlob {
        private: created.out_private.value().to_vec(),
        public: created.out_public.marshall().map_err(seal_err)?,
    };
    Ok((blob, key))
}

pub fn unseal_master_key(ctx: &mut Context, primary: KeyHandle, blob: &KeyBlob) -> Result<[u8; 32], TpmError> {
    let private = Private::try_from(blob.private.clone()).map_err(seal_err)?;
    let public = Public::unmarshall(&blob.public).map_err(seal_err)?;
    let handle = ctx
        .execute_with_nullauth_session(|ctx| ctx.load(primary, private, public))
        .map_err(|e: tss_esapi::Error| seal_err(e))?;

    let unsealed = ctx.execute_with_nullauth_session(|ctx| ctx.unseal(ObjectHandle::from(handle)));
    ctx.flush_context(ObjectHandle::from(handle)).map_err(seal_err)?;
    let sensitive = unsealed.map_err(|e: tss_esapi::Error| seal_err(e))?;

    sensitive
        .value()
        .try_into()
        .map_err(|_| TpmError::Seal(format!("expected 32-byte key, got {}", sensitive.value().len())))
}
