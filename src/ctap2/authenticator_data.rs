use ciborium::value::Value;
use sha2::{Digest, Sha256};

use super::cose::CoseKey;
use super::types::Ctap2Error;

pub const FLAG_UP: u8 = 0x01;
pub const FLAG_UV: u8 = 0x04;
pub const FLAG_AT: u8 = 0x40;
pub const FLAG_ED: u8 = 0x80;

/// rpIdHash(32) + flags(1) + signCount(4).
pub const AUTH_DATA_HEADER_LEN: usize = 37;
/// Byte range of the AAGUID inside encoded authenticator data.
pub const AAGUID_RANGE: std::ops::Range<usize> = 37..53;

pub fn rp_id_hash(rp_id: &str) -> [u8; 32] {
    Sha256::digest(rp_id.as_bytes()).into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestedCredentialData {
    pub aaguid: [u8; 16],
    pub credential_id: Vec<u8>,
    pub credential_public_key: CoseKey,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatorData {
    pub rp_id_hash: [u8; 32],
    pub user_present: bool,
    pub user_verified: bool,
    pub sign_count: u32,
    pub attested_credential_data: Option<AttestedCredentialData>,
    /// Extension outputs; encoded only when non-empty.
    pub extensions: Vec<(Value, Value)>,
}

impl AuthenticatorData {
    pub fn new(rp_id: &str, user_present: bool, user_verified: bool, sign_count: u32) -> Self {
        Self {
            rp_id_hash: rp_id_hash(rp_id),
            user_present,
            user_verified,
            sign_count,
            attested_credential_data: None,
            extensions: Vec::new(),
        }
    }

    pub fn with_attested_credential_data(mut self, data: AttestedCredentialData) -> Self {
        self.attested_credential_data = Some(data);
        self
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0u8;
        if self.user_present {
            flags |= FLAG_UP;
        }
        if self.user_verified {
            flags |= FLAG_UV;
        }
        if self.attested_credential_data.is_some() {
            flags |= FLAG_AT;
        }
        if !self.extensions.is_empty() {
            flags |= FLAG_ED;
        }
        flags
    }

    /// rpIdHash ‖ flags ‖ signCount(BE) ‖ [aaguid ‖ credIdLen(BE) ‖ credId ‖ COSE key] ‖ [extensions]
    pub fn to_bytes(&self) -> Result<Vec<u8>, Ctap2Error> {
        let mut data = Vec::with_capacity(AUTH_DATA_HEADER_LEN);
        data.extend_from_slice(&self.rp_id_hash);
        data.push(self.flags());
        data.extend_from_slice(&self.sign_count.to_be_bytes());
        if let Some(attested) = &self.attested_credential_data {
            let cred_id_len = u16::try_from(attested.credential_id.len())
                .map_err(|_| Ctap2Error::InvalidLength)?;
            data.extend_from_slice(&attested.aaguid);
            data.extend_from_slice(&cred_id_len.to_be_bytes());
            data.extend_from_slice(&attested.credential_id);
            data.extend_from_slice(&attested.credential_public_key.to_bytes());
        }
        if !self.extensions.is_empty() {
            ciborium::into_writer(&Value::Map(self.extensions.clone()), &mut data)
                .map_err(|e| Ctap2Error::Cbor(e.to_string()))?;
        }
        Ok(data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, Ctap2Error> {
        if data.len() < AUTH_DATA_HEADER_LEN {
            return Err(Ctap2Error::InvalidLength);
        }
        let mut rp_id_hash = [0u8; 32];
        rp_id_hash.copy_from_slice(&data[..32]);
        let flags = data[32];
        let sign_count = u32::from_be_bytes([data[33], data[34], data[35], data[36]]);
        let mut rest = &data[AUTH_DATA_HEADER_LEN..];

        let attested_credential_data = if flags & FLAG_AT != 0 {
            if rest.len() < 18 {
                return Err(Ctap2Error::InvalidLength);
            }
            let mut aaguid = [0u8; 16];
            aaguid.copy_from_slice(&rest[..16]);
            let cred_id_len = u16::from_be_bytes([rest[16], rest[17]]) as usize;
            rest = &rest[18..];
            if rest.len() < cred_id_len {
                return Err(Ctap2Error::InvalidLength);
            }
            let credential_id = rest[..cred_id_len].to_vec();
            rest = &rest[cred_id_len..];
            let key: Value =
                ciborium::from_reader(&mut rest).map_err(|e| Ctap2Error::Cbor(e.to_string()))?;
            Some(AttestedCredentialData {
                aaguid,
                credential_id,
                credential_public_key: CoseKey::from_cbor(&key)?,
            })
        } else {
            None
        };

        let extensions = if flags & FLAG_ED != 0 {
            let value: Value =
                ciborium::from_reader(&mut rest).map_err(|e| Ctap2Error::Cbor(e.to_string()))?;
            match value {
                Value::Map(map) => map,
                _ => return Err(Ctap2Error::Cbor("extensions are not a map".into())),
            }
        } else {
            Vec::new()
        };

        if !rest.is_empty() {
            return Err(Ctap2Error::Cbor(format!("{} trailing bytes", rest.len())));
        }

        Ok(Self {
            rp_id_hash,
            user_present: flags & FLAG_UP != 0,
            user_verified: flags & FLAG_UV != 0,
            sign_count,
            attested_credential_data,
            extensions,
        })
    }
}

/// DER-encode a raw 64-byte P-256 ECDSA signature (r || s).
pub(crate) fn encode_der_ecdsa(raw: &[u8; 64]) -> Vec<u8> {
    let r_der = der_integer(&raw[0..32]);
    let s_der = der_integer(&raw[32..64]);
    let inner_len = (r_der.len() + s_der.len()) as u8;
    let mut out = vec![0x30u8, inner_len];
    out.extend_from_slice(&r_der);
    out.extend_from_slice(&s_der);
    out
}

fn der_integer(n: &[u8]) -> Vec<u8> {
    let n: Vec<u8> = n.iter().skip_while(|&&b| b == 0).copied().collect();
    let n = if n.is_empty() { vec![0u8] } else { n };
    let pad = n[0] & 0x80 != 0;
    let mut out = vec![0x02u8, n.len() as u8 + pad as u8];
    if pad {
        out.push(0);
    }
    out.extend_from_slice(&n);
    out
}
