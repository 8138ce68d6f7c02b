use super::attestation::AttestationObject;
use super::types::{CTAP2_OK, Ctap2Error};

/// Complete CTAP2 response bytes: [0x00] ++ CBOR({1: fmt, 2: authData, 3: attStmt}).
pub(crate) fn encode_make_credential_response(
    attestation: &AttestationObject,
) -> Result<Vec<u8>, Ctap2Error> {
    let mut buf = vec![CTAP2_OK];
    ciborium::into_writer(&attestation.to_ctap2_value(), &mut buf)
        .map_err(|e| Ctap2Error::Cbor(e.to_string()))?;
    Ok(buf)
}
