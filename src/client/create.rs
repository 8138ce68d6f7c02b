use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use super::types::{
    AttestationConveyancePreference, AuthenticatorAttestationResponse, PublicKeyCredential,
    PublicKeyCredentialCreationOptions, PublicKeyCredentialRpEntity, PublicKeyCredentialType,
    UserVerificationRequirement,
};
use super::{ClientData, judge_user_verification};
use crate::authenticator::{MakeCredentialArgs, MakeCredentialSession};
use crate::ctap2::attestation::AttestationObject;
use crate::error::ErrorReason;
use crate::operation::{OperationHandler, OperationType};

/// `navigator.credentials.create()` on top of a make-credential session.
pub struct ClientCreate {
    options: PublicKeyCredentialCreationOptions,
    rp_id: String,
    client_data: ClientData,
}

impl ClientCreate {
    pub fn new(options: PublicKeyCredentialCreationOptions, rp_id: String, client_data: ClientData) -> Self {
        Self { options, rp_id, client_data }
    }

    fn args(&self, session: &MakeCredentialSession) -> Result<MakeCredentialArgs, ErrorReason> {
        let selection = self.options.authenticator_selection.clone().unwrap_or_default();
        if let Some(attachment) = selection.authenticator_attachment {
            if attachment != session.attachment() {
                tracing::info!(?attachment, "Authenticator attachment not offered");
                return Err(ErrorReason::Unsupported);
            }
        }
        if selection.require_resident_key && !session.can_store_resident_key() {
            tracing::info!("Resident keys not supported");
            return Err(ErrorReason::Unsupported);
        }
        if selection.user_verification == UserVerificationRequirement::Required
            && !session.can_perform_user_verification()
        {
            tracing::info!("User verification required but not available");
            return Err(ErrorReason::Unsupported);
        }

        let require_user_verification =
            judge_user_verification(selection.user_verification, session.can_perform_user_verification());
        let transport = session.transport();
        Ok(MakeCredentialArgs {
            client_data_hash: self.client_data.hash.clone(),
            rp: PublicKeyCredentialRpEntity {
                id: Some(self.rp_id.clone()),
                name: self.options.rp.name.clone(),
            },
            user: self.options.user.clone(),
            algorithms: self
                .options
                .pub_key_cred_params
                .iter()
                .filter(|p| p.type_ == PublicKeyCredentialType::PublicKey)
                .map(|p| p.alg)
                .collect(),
            exclude_credential_ids: self
                .options
                .exclude_credentials
                .iter()
                .filter(|d| d.matches_transport(transport))
                .map(|d| d.id.clone())
                .collect(),
            require_resident_key: selection.require_resident_key,
            require_user_presence: !require_user_verification,
            require_user_verification,
        })
    }
}

impl OperationHandler for ClientCreate {
    type Session = MakeCredentialSession;
    type Output = PublicKeyCredential<AuthenticatorAttestationResponse>;

    const KIND: OperationType = OperationType::Create;

    fn on_available(&self, session: &MakeCredentialSession) -> Result<(), ErrorReason> {
        session.make_credential(self.args(session)?);
        Ok(())
    }

    fn on_completed(&self, attestation: AttestationObject) -> Result<Self::Output, ErrorReason> {
        let attestation = if self.options.attestation == AttestationConveyancePreference::None
            && attestation.is_self_attestation()
        {
            tracing::debug!(rp_id = %self.rp_id, "Self attestation replaced with none");
            attestation.to_none()
        } else {
            attestation
        };
        let raw_id = attestation.credential_id().ok_or(ErrorReason::Unknown)?.to_vec();
        let attestation_object = attestation.to_bytes().map_err(|e| {
            tracing::warn!(error = %e, "Attestation object encoding failed");
            ErrorReason::Unknown
        })?;
        Ok(PublicKeyCredential {
            type_: PublicKeyCredentialType::PublicKey,
            id: URL_SAFE_NO_PAD.encode(&raw_id),
            raw_id,
            response: AuthenticatorAttestationResponse {
                client_data_json: self.client_data.json.clone(),
                attestation_object,
            },
        })
    }
}
