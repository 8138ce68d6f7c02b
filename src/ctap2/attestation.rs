use ciborium::value::Value;

use super::authenticator_data::{AAGUID_RANGE, AuthenticatorData};
use super::types::{Ctap2Error, cbor_bytes, cbor_get_str, cbor_map, cbor_text, parse_cbor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationFormat {
    Packed,
    AndroidKey,
    None,
}

impl AttestationFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Packed => "packed",
            Self::AndroidKey => "android-key",
            Self::None => "none",
        }
    }
}

impl std::str::FromStr for AttestationFormat {
    type Err = Ctap2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "packed" => Ok(Self::Packed),
            "android-key" => Ok(Self::AndroidKey),
            "none" => Ok(Self::None),
            other => Err(Ctap2Error::Cbor(format!("unknown attestation format {other:?}"))),
        }
    }
}

/// Attestation object. Keeps the encoded authenticator data next to its
/// decoded form so transforms operate on the exact bytes that were signed.
#[derive(Debug, Clone, PartialEq)]
pub struct AttestationObject {
    fmt: AttestationFormat,
    auth_data: AuthenticatorData,
    auth_data_bytes: Vec<u8>,
    att_stmt: Vec<(String, Value)>,
}

impl AttestationObject {
    pub fn new(
        fmt: AttestationFormat,
        auth_data: AuthenticatorData,
        att_stmt: Vec<(String, Value)>,
    ) -> Result<Self, Ctap2Error> {
        let auth_data_bytes = auth_data.to_bytes()?;
        Ok(Self { fmt, auth_data, auth_data_bytes, att_stmt })
    }

    pub(crate) fn from_parts(
        fmt: AttestationFormat,
        auth_data: AuthenticatorData,
        auth_data_bytes: Vec<u8>,
        att_stmt: Vec<(String, Value)>,
    ) -> Self {
        Self { fmt, auth_data, auth_data_bytes, att_stmt }
    }

    pub fn fmt(&self) -> AttestationFormat {
        self.fmt
    }

    pub fn auth_data(&self) -> &AuthenticatorData {
        &self.auth_data
    }

    pub fn auth_data_bytes(&self) -> &[u8] {
        &self.auth_data_bytes
    }

    pub fn att_stmt(&self) -> &[(String, Value)] {
        &self.att_stmt
    }

    pub fn att_stmt_get(&self, key: &str) -> Option<&Value> {
        self.att_stmt.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn credential_id(&self) -> Option<&[u8]> {
        self.auth_data
            .attested_credential_data
            .as_ref()
            .map(|a| a.credential_id.as_slice())
    }

    /// Packed statement without a certificate chain or ECDAA key, over a
    /// credential whose AAGUID is all zero.
    pub fn is_self_attestation(&self) -> bool {
        self.fmt == AttestationFormat::Packed
            && self.att_stmt_get("x5c").is_none()
            && self.att_stmt_get("ecdaaKeyId").is_none()
            && self
                .auth_data
                .attested_credential_data
                .as_ref()
                .is_some_and(|a| a.aaguid == [0u8; 16])
    }

    /// "none" variant: empty statement, AAGUID bytes zeroed in place.
    pub fn to_none(&self) -> Self {
        let mut auth_data = self.auth_data.clone();
        let mut auth_data_bytes = self.auth_data_bytes.clone();
        if let Some(attested) = auth_data.attested_credential_data.as_mut() {
            attested.aaguid = [0u8; 16];
            if auth_data_bytes.len() >= AAGUID_RANGE.end {
                auth_data_bytes[AAGUID_RANGE].fill(0);
            }
        }
        Self {
            fmt: AttestationFormat::None,
            auth_data,
            auth_data_bytes,
            att_stmt: Vec::new(),
        }
    }

    fn att_stmt_value(&self) -> Value {
        Value::Map(
            self.att_stmt
                .iter()
                .map(|(k, v)| (Value::Text(k.clone()), v.clone()))
                .collect(),
        )
    }

    /// WebAuthn encoding: string-keyed map `fmt`, `attStmt`, `authData`.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Ctap2Error> {
        let map = Value::Map(vec![
            (Value::Text("fmt".into()), Value::Text(self.fmt.as_str().into())),
            (Value::Text("attStmt".into()), self.att_stmt_value()),
            (Value::Text("authData".into()), Value::Bytes(self.auth_data_bytes.clone())),
        ]);
        let mut buf = Vec::new();
        ciborium::into_writer(&map, &mut buf).map_err(|e| Ctap2Error::Cbor(e.to_string()))?;
        Ok(buf)
    }

    /// CTAP2 authenticatorMakeCredential layout: {1: fmt, 2: authData, 3: attStmt}.
    pub fn to_ctap2_value(&self) -> Value {
        Value::Map(vec![
            (Value::Integer(1i64.into()), Value::Text(self.fmt.as_str().into())),
            (Value::Integer(2i64.into()), Value::Bytes(self.auth_data_bytes.clone())),
            (Value::Integer(3i64.into()), self.att_stmt_value()),
        ])
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Ctap2Error> {
        let map = parse_cbor(data)?;
        let fmt: AttestationFormat = cbor_get_str(&map, "fmt")
            .and_then(cbor_text)
            .ok_or(Ctap2Error::MissingParameter)?
            .parse()?;
        let auth_data_bytes = cbor_get_str(&map, "authData")
            .and_then(cbor_bytes)
            .ok_or(Ctap2Error::MissingParameter)?
            .to_vec();
        let att_stmt = cbor_get_str(&map, "attStmt")
            .and_then(cbor_map)
            .ok_or(Ctap2Error::MissingParameter)?
            .iter()
            .map(|(k, v)| {
                cbor_text(k)
                    .map(|k| (k.to_string(), v.clone()))
                    .ok_or_else(|| Ctap2Error::Cbor("attStmt key is not text".into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let auth_data = AuthenticatorData::from_bytes(&auth_data_bytes)?;
        Ok(Self { fmt, auth_data, auth_data_bytes, att_stmt })
    }
}
