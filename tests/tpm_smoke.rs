use ciborium::value::Value;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};

use fidolink::ctap2::{AttestationFormat, AuthenticatorData, CoseKey};
use fidolink::key::{KeySupport, KeyVault};
use fidolink::tpm::{self, TpmContext, TpmKeySupport};

/// TCTI from FIDOLINK_TEST_TCTI (e.g. `swtpm:host=localhost,port=2321`),
/// falling back to the kernel resource manager. `None` skips the test.
fn test_context() -> Option<TpmContext> {
    let tcti = std::env::var("FIDOLINK_TEST_TCTI").unwrap_or_else(|_| "/dev/tpmrm0".into());
    match TpmContext::new(&tcti) {
        Ok(ctx) => Some(ctx),
        Err(e) => {
            println!("SKIP: TPM not accessible via '{tcti}' ({e}), skipping TPM smoke tests");
            None
        }
    }
}

fn verifying_key(key: &CoseKey) -> VerifyingKey {
    let CoseKey::Ec2 { x, y, .. } = key;
    let point = p256::EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(x),
        p256::FieldBytes::from_slice(y),
        false,
    );
    VerifyingKey::from_encoded_point(&point).expect("valid P-256 point")
}

#[test]
fn test_child_key_create_load_sign() {
    let Some(ctx) = test_context() else { return };

    let blob = ctx
        .with_ctx(|ctx, primary| tpm::keys::create_child_key(ctx, primary))
        .expect("create child key");
    let restored = tpm::keys::KeyBlob::from_bytes(&blob.to_bytes()).expect("blob survives serialization");

    let sig = ctx
        .with_ctx(|ctx, primary| {
            let key = tpm::keys::load_key(ctx, primary, &restored)?;
            let sig = tpm::keys::sign(ctx, key, b"hello fidolink");
            tpm::keys::flush(ctx, key)?;
            sig
        })
        .expect("load and sign");

    assert_eq!(sig.len(), 64, "signature must be 64 bytes (r||s)");
    assert_ne!(&sig[..32], &[0u8; 32], "r must be non-zero");
    assert_ne!(&sig[32..], &[0u8; 32], "s must be non-zero");
}

#[test]
fn test_master_key_seal_unseal() {
    let Some(ctx) = test_context() else { return };

    let (blob, key) = ctx
        .with_ctx(|ctx, primary| tpm::seal::seal_master_key(ctx, primary))
        .expect("seal master key");
    let blob = tpm::keys::KeyBlob::from_bytes(&blob.to_bytes()).unwrap();
    let recovered = ctx
        .with_ctx(|ctx, primary| tpm::seal::unseal_master_key(ctx, primary, &blob))
        .expect("unseal master key");

    assert_eq!(key, recovered, "unsealed key must match original");
    assert_ne!(key, [0u8; 32]);
}

#[test]
fn test_key_support_signs_with_credential_key() {
    let Some(ctx) = test_context() else { return };
    let support = TpmKeySupport::new(ctx, KeyVault::in_memory());
    let alias = "credential-source-0102";

    let public = support.create_key_pair(alias, &[0u8; 32]).expect("create key pair");
    assert!(support.has_key(alias));
    assert!(support.is_hardware_secured(alias));

    let der = support.sign(alias, b"authData || clientDataHash").expect("sign");
    verifying_key(&public)
        .verify(b"authData || clientDataHash", &Signature::from_der(&der).unwrap())
        .expect("TPM signature verifies with the reported public key");

    support.delete_key(alias).unwrap();
    assert!(!support.has_key(alias));
    assert!(support.sign(alias, b"gone").is_err(), "deleted key cannot sign");
}

#[test]
fn test_key_support_with_chain_builds_android_key_attestation() {
    let Some(ctx) = test_context() else { return };
    let leaf = vec![0x30, 0x03, 0x02, 0x01, 0x01];
    let support = TpmKeySupport::new(ctx, KeyVault::in_memory()).with_certificate_chain(vec![leaf.clone()]);
    let alias = "credential-source-0304";
    support.create_key_pair(alias, &[0u8; 32]).unwrap();

    let attestation = support
        .build_attestation_object(alias, &[0x44; 32], AuthenticatorData::new("example.org", true, false, 0))
        .expect("attestation");
    assert_eq!(attestation.fmt(), AttestationFormat::AndroidKey);
    assert_eq!(attestation.att_stmt_get("x5c"), Some(&Value::Array(vec![Value::Bytes(leaf)])));
    assert!(!attestation.is_self_attestation());
}
