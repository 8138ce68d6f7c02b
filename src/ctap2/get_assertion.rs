use ciborium::value::Value;

use super::types::{CTAP2_OK, Ctap2Error};

/// Complete CTAP2 response bytes for authenticatorGetAssertion.
/// The credential descriptor is left out when the platform already knows it.
pub(crate) fn encode_get_assertion_response(
    credential_id: Option<&[u8]>,
    auth_data: &[u8],
    signature: &[u8],
    user_handle: &[u8],
) -> Result<Vec<u8>, Ctap2Error> {
    let mut entries = Vec::with_capacity(4);
    if let Some(id) = credential_id {
        entries.push((Value::Integer(1i64.into()), Value::Map(vec![
            (Value::Text("type".to_string()), Value::Text("public-key".to_string())),
            (Value::Text("id".to_string()), Value::Bytes(id.to_vec())),
        ])));
    }
    entries.push((Value::Integer(2i64.into()), Value::Bytes(auth_data.to_vec())));
    entries.push((Value::Integer(3i64.into()), Value::Bytes(signature.to_vec())));
    entries.push((Value::Integer(4i64.into()), Value::Map(vec![
        (Value::Text("id".to_string()), Value::Bytes(user_handle.to_vec())),
    ])));

    let mut buf = vec![CTAP2_OK];
    ciborium::into_writer(&Value::Map(entries), &mut buf)
        .map_err(|e| Ctap2Error::Cbor(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctap2::types::{cbor_bytes, cbor_get, cbor_get_str, cbor_map, parse_cbor};

    #[test]
    fn test_get_assertion_response_with_credential() {
        let resp = encode_get_assertion_response(Some(&[9; 16]), &[1; 37], &[0x30, 0x00], b"uh").unwrap();
        assert_eq!(resp[0], 0x00);
        let map = parse_cbor(&resp[1..]).unwrap();
        let cred = cbor_get(&map, 1).and_then(cbor_map).expect("credential descriptor");
        assert_eq!(cbor_get_str(cred, "id").and_then(cbor_bytes), Some(&[9u8; 16][..]));
        assert_eq!(cbor_get(&map, 2).and_then(cbor_bytes).map(<[u8]>::len), Some(37));
        let user = cbor_get(&map, 4).and_then(cbor_map).expect("user entity");
        assert_eq!(cbor_get_str(user, "id").and_then(cbor_bytes), Some(&b"uh"[..]));
    }

    #[test]
    fn test_get_assertion_response_omits_known_credential() {
        let resp = encode_get_assertion_response(None, &[1; 37], &[0x30, 0x00], b"uh").unwrap();
        let map = parse_cbor(&resp[1..]).unwrap();
        assert!(cbor_get(&map, 1).is_none(), "descriptor must be omitted");
        assert_eq!(map.len(), 3);
    }
}
