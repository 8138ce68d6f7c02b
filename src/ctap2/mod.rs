pub mod attestation;
pub mod authenticator_data;
pub mod cose;
pub(crate) mod get_assertion;
pub(crate) mod get_info;
pub(crate) mod make_credential;
pub mod types;

pub use attestation::{AttestationFormat, AttestationObject};
pub use authenticator_data::{AttestedCredentialData, AuthenticatorData};
pub use cose::{COSE_ALG_ES256, CoseCurve, CoseKey};
pub use types::{Ctap2Error, GetAssertionRequest, MakeCredentialRequest};
