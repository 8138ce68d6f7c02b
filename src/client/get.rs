use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::types::{
    AuthenticatorAssertionResponse, PublicKeyCredential, PublicKeyCredentialRequestOptions,
    PublicKeyCredentialType, UserVerificationRequirement,
};
use super::{ClientData, judge_user_verification};
use crate::authenticator::{AuthenticatorAssertionResult, GetAssertionArgs, GetAssertionSession};
use crate::error::ErrorReason;
use crate::lock;
use crate::operation::{OperationHandler, OperationType};

/// `navigator.credentials.get()` on top of a get-assertion session.
pub struct ClientGet {
    options: PublicKeyCredentialRequestOptions,
    rp_id: String,
    client_data: ClientData,
    /// The only allowed credential, when the allow list narrows to one.
    single_credential: Mutex<Option<Vec<u8>>>,
}

impl ClientGet {
    pub fn new(options: PublicKeyCredentialRequestOptions, rp_id: String, client_data: ClientData) -> Self {
        Self { options, rp_id, client_data, single_credential: Mutex::new(None) }
    }
}

impl OperationHandler for ClientGet {
    type Session = GetAssertionSession;
    type Output = PublicKeyCredential<AuthenticatorAssertionResponse>;

    const KIND: OperationType = OperationType::Get;

    fn on_available(&self, session: &GetAssertionSession) -> Result<(), ErrorReason> {
        let requirement = self.options.user_verification;
        if requirement == UserVerificationRequirement::Required && !session.can_perform_user_verification() {
            tracing::info!("User verification required but not available");
            return Err(ErrorReason::Unsupported);
        }

        let transport = session.transport();
        let allowed: Vec<Vec<u8>> = self
            .options
            .allow_credentials
            .iter()
            .filter(|d| d.matches_transport(transport))
            .map(|d| d.id.clone())
            .collect();
        if !self.options.allow_credentials.is_empty() && allowed.is_empty() {
            tracing::info!(?transport, "No allowed credential reachable over this transport");
            return Err(ErrorReason::NotAllowed);
        }
        if let [only] = allowed.as_slice() {
            *lock(&self.single_credential) = Some(only.clone());
        }

        let require_user_verification =
            judge_user_verification(requirement, session.can_perform_user_verification());
        session.get_assertion(GetAssertionArgs {
            rp_id: self.rp_id.clone(),
            client_data_hash: self.client_data.hash.clone(),
            allow_credential_ids: allowed,
            require_user_presence: !require_user_verification,
            require_user_verification,
        });
        Ok(())
    }

    fn on_completed(&self, result: AuthenticatorAssertionResult) -> Result<Self::Output, ErrorReason> {
        let raw_id = result
            .credential_id
            .or_else(|| lock(&self.single_credential).clone())
            .ok_or(ErrorReason::Unknown)?;
        Ok(PublicKeyCredential {
            type_: PublicKeyCredentialType::PublicKey,
            id: URL_SAFE_NO_PAD.encode(&raw_id),
            raw_id,
            response: AuthenticatorAssertionResponse {
                client_data_json: self.client_data.json.clone(),
                authenticator_data: result.authenticator_data,
                signature: result.signature,
                user_handle: result.user_handle,
            },
        })
    }
}
