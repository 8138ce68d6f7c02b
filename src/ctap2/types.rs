use ciborium::value::Value;

use crate::client::types::{
    AuthenticatorTransport, PublicKeyCredentialDescriptor, PublicKeyCredentialParameters,
    PublicKeyCredentialRpEntity, PublicKeyCredentialUserEntity,
};
use crate::error::{ErrorReason, WebAuthnError};

pub(crate) const CTAP2_CMD_MAKE_CREDENTIAL: u8 = 0x01;
pub(crate) const CTAP2_CMD_GET_ASSERTION:   u8 = 0x02;
pub(crate) const CTAP2_CMD_GET_INFO:        u8 = 0x04;

pub(crate) const CTAP2_OK: u8 = 0x00;

#[derive(Debug, thiserror::Error)]
pub enum Ctap2Error {
    #[error("invalid command")]       InvalidCommand,
    #[error("invalid length")]        InvalidLength,
    #[error("channel busy")]          ChannelBusy,
    #[error("missing parameter")]     MissingParameter,
    #[error("unsupported algorithm")] UnsupportedAlgorithm,
    #[error("credential excluded")]   CredentialExcluded,
    #[error("operation denied")]      OperationDenied,
    #[error("unsupported option")]    UnsupportedOption,
    #[error("user action timeout")]   UserActionTimeout,
    #[error("keepalive cancel")]      KeepaliveCancel,
    #[error("no credentials")]        NoCredentials,
    #[error("cbor: {0}")]             Cbor(String),
    #[error("other")]                 Other,
}

impl Ctap2Error {
    pub fn status_byte(&self) -> u8 {
        match self {
            Self::InvalidCommand       => 0x01,
            Self::InvalidLength        => 0x03,
            Self::ChannelBusy          => 0x06,
            Self::MissingParameter     => 0x14,
            Self::UnsupportedAlgorithm => 0x26,
            Self::CredentialExcluded   => 0x19,
            Self::OperationDenied      => 0x27,
            Self::UnsupportedOption    => 0x2B,
            Self::UserActionTimeout    => 0x2A,
            Self::KeepaliveCancel      => 0x2D,
            Self::NoCredentials        => 0x2E,
            Self::Cbor(_)              => 0x11,
            Self::Other                => 0x7F,
        }
    }
}

impl From<ErrorReason> for Ctap2Error {
    fn from(reason: ErrorReason) -> Self {
        match reason {
            ErrorReason::NotAllowed  => Self::NoCredentials,
            ErrorReason::Cancelled   => Self::KeepaliveCancel,
            ErrorReason::Timeout     => Self::UserActionTimeout,
            ErrorReason::Unsupported => Self::UnsupportedAlgorithm,
            ErrorReason::Constraint  => Self::UnsupportedOption,
            ErrorReason::Unknown     => Self::Other,
        }
    }
}

impl From<WebAuthnError> for Ctap2Error {
    fn from(err: WebAuthnError) -> Self {
        match err {
            WebAuthnError::NotAllowed   => Self::NoCredentials,
            WebAuthnError::Cancelled    => Self::KeepaliveCancel,
            WebAuthnError::Timeout      => Self::UserActionTimeout,
            WebAuthnError::Unsupported  => Self::UnsupportedAlgorithm,
            WebAuthnError::Constraint   => Self::UnsupportedOption,
            WebAuthnError::Unknown      => Self::Other,
            WebAuthnError::BadOperation => Self::ChannelBusy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MakeCredentialRequest {
    pub client_data_hash:    Vec<u8>,
    pub rp:                  PublicKeyCredentialRpEntity,
    pub user:                PublicKeyCredentialUserEntity,
    pub pub_key_cred_params: Vec<PublicKeyCredentialParameters>,
    pub exclude_list:        Vec<PublicKeyCredentialDescriptor>,
    pub resident_key:        bool,
    pub user_verification:   bool,
}

impl MakeCredentialRequest {
    pub fn rp_id(&self) -> &str {
        self.rp.id.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct GetAssertionRequest {
    pub rp_id:             String,
    pub client_data_hash:  Vec<u8>,
    pub allow_list:        Vec<PublicKeyCredentialDescriptor>,
    pub user_verification: bool,
}

// CBOR parsing helpers

pub(crate) fn parse_cbor(data: &[u8]) -> Result<Vec<(Value, Value)>, Ctap2Error> {
    let value: Value = ciborium::from_reader(data)
        .map_err(|e| Ctap2Error::Cbor(e.to_string()))?;
    match value {
        Value::Map(map) => Ok(map),
        _ => Err(Ctap2Error::Cbor("expected map".into())),
    }
}

pub(crate) fn cbor_get<'a>(map: &'a [(Value, Value)], key: i64) -> Option<&'a Value> {
    let target = Value::Integer(key.into());
    map.iter().find(|(k, _)| k == &target).map(|(_, v)| v)
}

pub(crate) fn cbor_get_str<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| matches!(k, Value::Text(s) if s == key))
        .map(|(_, v)| v)
}

/// Integer key first, then the member name some bridges send instead.
fn cbor_field<'a>(map: &'a [(Value, Value)], key: i64, name: &str) -> Option<&'a Value> {
    cbor_get(map, key).or_else(|| cbor_get_str(map, name))
}

pub(crate) fn cbor_bytes(v: &Value) -> Option<&[u8]> {
    match v { Value::Bytes(b) => Some(b), _ => None }
}

pub(crate) fn cbor_text(v: &Value) -> Option<&str> {
    match v { Value::Text(s) => Some(s), _ => None }
}

pub(crate) fn cbor_bool(v: &Value) -> Option<bool> {
    match v { Value::Bool(b) => Some(*b), _ => None }
}

pub(crate) fn cbor_int(v: &Value) -> Option<i64> {
    match v { Value::Integer(i) => i64::try_from(*i).ok(), _ => None }
}

pub(crate) fn cbor_map(v: &Value) -> Option<&[(Value, Value)]> {
    match v { Value::Map(m) => Some(m), _ => None }
}

pub(crate) fn cbor_array(v: &Value) -> Option<&[Value]> {
    match v { Value::Array(a) => Some(a), _ => None }
}

fn parse_transport(name: &str) -> Option<AuthenticatorTransport> {
    match name {
        "usb"      => Some(AuthenticatorTransport::Usb),
        "nfc"      => Some(AuthenticatorTransport::Nfc),
        "ble"      => Some(AuthenticatorTransport::Ble),
        "internal" => Some(AuthenticatorTransport::Internal),
        _ => None,
    }
}

fn parse_descriptors(value: Option<&Value>) -> Vec<PublicKeyCredentialDescriptor> {
    value.and_then(cbor_array).map_or(vec![], |arr| {
        arr.iter()
            .filter_map(|item| {
                let m = cbor_map(item)?;
                let id = cbor_get_str(m, "id").and_then(cbor_bytes)?;
                let transports = cbor_get_str(m, "transports")
                    .and_then(cbor_array)
                    .map_or(vec![], |t| {
                        t.iter().filter_map(cbor_text).filter_map(parse_transport).collect()
                    });
                Some(PublicKeyCredentialDescriptor::new(id.to_vec()).with_transports(transports))
            })
            .collect()
    })
}

fn parse_option(map: &[(Value, Value)], key: i64, option: &str) -> bool {
    cbor_field(map, key, "options")
        .and_then(cbor_map)
        .and_then(|m| cbor_get_str(m, option))
        .and_then(cbor_bool)
        .unwrap_or(false)
}

fn required_bytes(map: &[(Value, Value)], key: i64, name: &str) -> Result<Vec<u8>, Ctap2Error> {
    Ok(cbor_bytes(cbor_field(map, key, name).ok_or(Ctap2Error::MissingParameter)?)
        .ok_or(Ctap2Error::MissingParameter)?
        .to_vec())
}

fn optional_text(map: &[(Value, Value)], key: &str) -> String {
    cbor_get_str(map, key).and_then(cbor_text).unwrap_or_default().to_string()
}

impl TryFrom<&[u8]> for MakeCredentialRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = parse_cbor(data)?;

        // 1: clientDataHash
        let client_data_hash = required_bytes(&map, 1, "clientDataHash")?;

        // 2: rp
        let rp_map = cbor_field(&map, 2, "rp")
            .and_then(cbor_map)
            .ok_or(Ctap2Error::MissingParameter)?;
        let rp_id = cbor_get_str(rp_map, "id")
            .and_then(cbor_text)
            .ok_or(Ctap2Error::MissingParameter)?
            .to_string();
        let rp = PublicKeyCredentialRpEntity { id: Some(rp_id), name: optional_text(rp_map, "name") };

        // 3: user
        let user_map = cbor_field(&map, 3, "user")
            .and_then(cbor_map)
            .ok_or(Ctap2Error::MissingParameter)?;
        let user = PublicKeyCredentialUserEntity {
            id: cbor_get_str(user_map, "id")
                .and_then(cbor_bytes)
                .ok_or(Ctap2Error::MissingParameter)?
                .to_vec(),
            name: optional_text(user_map, "name"),
            display_name: optional_text(user_map, "displayName"),
        };

        // 4: pubKeyCredParams
        let pub_key_cred_params = cbor_field(&map, 4, "pubKeyCredParams")
            .and_then(cbor_array)
            .map_or(vec![], |arr| {
                arr.iter()
                    .filter_map(|item| {
                        let alg = cbor_map(item).and_then(|m| cbor_get_str(m, "alg")).and_then(cbor_int)?;
                        Some(PublicKeyCredentialParameters::public_key(alg))
                    })
                    .collect()
            });

        // 5: excludeList
        let exclude_list = parse_descriptors(cbor_field(&map, 5, "excludeList"));

        // 7: options
        Ok(MakeCredentialRequest {
            client_data_hash,
            rp,
            user,
            pub_key_cred_params,
            exclude_list,
            resident_key: parse_option(&map, 7, "rk"),
            user_verification: parse_option(&map, 7, "uv"),
        })
    }
}

impl TryFrom<&[u8]> for GetAssertionRequest {
    type Error = Ctap2Error;

    fn try_from(data: &[u8]) -> Result<Self, Self::Error> {
        let map = parse_cbor(data)?;

        // 1: rpId
        let rp_id = cbor_text(cbor_field(&map, 1, "rpId").ok_or(Ctap2Error::MissingParameter)?)
            .ok_or(Ctap2Error::MissingParameter)?
            .to_string();

        // 2: clientDataHash
        let client_data_hash = required_bytes(&map, 2, "clientDataHash")?;

        // 3: allowList (optional)
        let allow_list = parse_descriptors(cbor_field(&map, 3, "allowList"));

        // 5: options
        let user_verification = parse_option(&map, 5, "uv");

        Ok(GetAssertionRequest { rp_id, client_data_hash, allow_list, user_verification })
    }
}
