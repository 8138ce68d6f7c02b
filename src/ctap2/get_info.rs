use ciborium::value::Value;

use super::cose::COSE_ALG_ES256;
use super::types::CTAP2_OK;

/// Returns complete CTAP2 response bytes: [0x00] ++ CBOR(GetInfo response).
pub(crate) fn handle_get_info(resident_key: bool, user_verification: bool) -> Vec<u8> {
    let map = Value::Map(vec![
        (
            Value::Integer(1i64.into()),
            Value::Array(vec![Value::Text("FIDO_2_0".to_string())]),
        ),
        (Value::Integer(2i64.into()), Value::Array(vec![])),
        (
            Value::Integer(3i64.into()),
            Value::Bytes(crate::config::AAGUID.to_vec()),
        ),
        (
            Value::Integer(4i64.into()),
            Value::Map(vec![
                (Value::Text("rk".to_string()), Value::Bool(resident_key)),
                (Value::Text("up".to_string()), Value::Bool(true)),
                (Value::Text("uv".to_string()), Value::Bool(user_verification)),
                (Value::Text("plat".to_string()), Value::Bool(false)),
            ]),
        ),
        (Value::Integer(5i64.into()), Value::Integer(1200i64.into())),
        (
            Value::Integer(0x0Ai64.into()),
            Value::Array(vec![Value::Map(vec![
                (Value::Text("alg".to_string()), Value::Integer(COSE_ALG_ES256.into())),
                (Value::Text("type".to_string()), Value::Text("public-key".to_string())),
            ])]),
        ),
    ]);
    let mut buf = vec![CTAP2_OK];
    ciborium::into_writer(&map, &mut buf).expect("GetInfo encoding is infallible");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctap2::types::{cbor_bool, cbor_get, cbor_get_str, cbor_map, parse_cbor};

    #[test]
    fn test_get_info_reports_policy() {
        let resp = handle_get_info(true, false);
        assert_eq!(resp[0], 0x00);
        let map = parse_cbor(&resp[1..]).unwrap();
        let options = cbor_get(&map, 4).and_then(cbor_map).expect("options map");
        assert_eq!(cbor_get_str(options, "rk").and_then(cbor_bool), Some(true));
        assert_eq!(cbor_get_str(options, "uv").and_then(cbor_bool), Some(false));
        assert_eq!(cbor_get_str(options, "up").and_then(cbor_bool), Some(true));
    }
}
