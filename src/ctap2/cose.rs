use ciborium::value::Value;

use super::types::{Ctap2Error, cbor_bytes, cbor_get, cbor_int, cbor_map};

/// ECDSA w/ SHA-256.
pub const COSE_ALG_ES256: i64 = -7;

const COSE_KTY_EC2: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoseCurve {
    P256,
}

impl CoseCurve {
    pub fn id(self) -> i64 {
        match self {
            Self::P256 => 1,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::P256),
            _ => None,
        }
    }
}

/// Public key of a credential, keyed by key type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoseKey {
    Ec2 {
        alg: i64,
        curve: CoseCurve,
        x: [u8; 32],
        y: [u8; 32],
    },
}

impl CoseKey {
    pub fn es256(x: [u8; 32], y: [u8; 32]) -> Self {
        Self::Ec2 { alg: COSE_ALG_ES256, curve: CoseCurve::P256, x, y }
    }

    pub fn alg(&self) -> i64 {
        match self {
            Self::Ec2 { alg, .. } => *alg,
        }
    }

    /// COSE_Key map (kty=2, alg, crv, x, y).
    pub fn to_cbor_value(&self) -> Value {
        match self {
            Self::Ec2 { alg, curve, x, y } => Value::Map(vec![
                (Value::Integer(1i64.into()), Value::Integer(COSE_KTY_EC2.into())),
                (Value::Integer(3i64.into()), Value::Integer((*alg).into())),
                (Value::Integer((-1i64).into()), Value::Integer(curve.id().into())),
                (Value::Integer((-2i64).into()), Value::Bytes(x.to_vec())),
                (Value::Integer((-3i64).into()), Value::Bytes(y.to_vec())),
            ]),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.to_cbor_value(), &mut buf)
            .expect("COSE key encoding is infallible");
        buf
    }

    pub fn from_cbor(value: &Value) -> Result<Self, Ctap2Error> {
        let map = cbor_map(value).ok_or_else(|| Ctap2Error::Cbor("COSE key is not a map".into()))?;
        let kty = cbor_get(map, 1).and_then(cbor_int);
        if kty != Some(COSE_KTY_EC2) {
            return Err(Ctap2Error::Cbor(format!("unsupported COSE key type {kty:?}")));
        }
        let alg = cbor_get(map, 3)
            .and_then(cbor_int)
            .ok_or(Ctap2Error::MissingParameter)?;
        let curve = cbor_get(map, -1)
            .and_then(cbor_int)
            .and_then(CoseCurve::from_id)
            .ok_or_else(|| Ctap2Error::Cbor("unsupported COSE curve".into()))?;
        let coord = |label: i64| -> Result<[u8; 32], Ctap2Error> {
            cbor_get(map, label)
                .and_then(cbor_bytes)
                .and_then(|b| <[u8; 32]>::try_from(b).ok())
                .ok_or_else(|| Ctap2Error::Cbor(format!("bad EC2 coordinate {label}")))
        };
        Ok(Self::Ec2 { alg, curve, x: coord(-2)?, y: coord(-3)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cose_key_fields() {
        let key = CoseKey::es256([0xAA; 32], [0xBB; 32]);
        let val: Value = ciborium::from_reader(key.to_bytes().as_slice()).expect("must be valid CBOR");
        let Value::Map(map) = val else {
            panic!("COSE key must be a CBOR map")
        };

        assert_eq!(cbor_get(&map, 1).and_then(cbor_int), Some(2), "kty must be EC2");
        assert_eq!(cbor_get(&map, 3).and_then(cbor_int), Some(-7), "alg must be ES256");
        assert_eq!(cbor_get(&map, -1).and_then(cbor_int), Some(1), "crv must be P-256");
        assert_eq!(cbor_get(&map, -2).and_then(cbor_bytes), Some(&[0xAA; 32][..]));
        assert_eq!(cbor_get(&map, -3).and_then(cbor_bytes), Some(&[0xBB; 32][..]));
    }

    #[test]
    fn test_cose_key_decodes_what_it_encodes() {
        let key = CoseKey::es256([0x11; 32], [0x22; 32]);
        let decoded = CoseKey::from_cbor(&key.to_cbor_value()).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(decoded.alg(), COSE_ALG_ES256);
    }

    #[test]
    fn test_cose_key_rejects_rsa_kty() {
        let value = Value::Map(vec![
            (Value::Integer(1i64.into()), Value::Integer(3i64.into())),
            (Value::Integer(3i64.into()), Value::Integer((-257i64).into())),
        ]);
        assert!(matches!(CoseKey::from_cbor(&value), Err(Ctap2Error::Cbor(_))));
    }

    #[test]
    fn test_cose_key_rejects_short_coordinate() {
        let value = Value::Map(vec![
            (Value::Integer(1i64.into()), Value::Integer(2i64.into())),
            (Value::Integer(3i64.into()), Value::Integer((-7i64).into())),
            (Value::Integer((-1i64).into()), Value::Integer(1i64.into())),
            (Value::Integer((-2i64).into()), Value::Bytes(vec![0; 31])),
            (Value::Integer((-3i64).into()), Value::Bytes(vec![0; 32])),
        ]);
        assert!(CoseKey::from_cbor(&value).is_err());
    }
}
