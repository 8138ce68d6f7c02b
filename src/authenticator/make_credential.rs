use std::sync::Arc;

use uuid::Uuid;

use super::session::{SessionCore, SessionListener, SessionState};
use super::{Authenticator, run_key_op, store_failure};
use crate::client::types::{
    AuthenticatorAttachment, AuthenticatorTransport, PublicKeyCredentialRpEntity,
    PublicKeyCredentialUserEntity,
};
use crate::config::AAGUID;
use crate::ctap2::attestation::AttestationObject;
use crate::ctap2::authenticator_data::{AttestedCredentialData, AuthenticatorData};
use crate::error::ErrorReason;
use crate::store::CredentialSource;

#[derive(Debug, Clone)]
pub struct MakeCredentialArgs {
    pub client_data_hash: Vec<u8>,
    pub rp: PublicKeyCredentialRpEntity,
    pub user: PublicKeyCredentialUserEntity,
    /// COSE algorithm ids in the caller's order of preference.
    pub algorithms: Vec<i64>,
    pub exclude_credential_ids: Vec<Vec<u8>>,
    pub require_resident_key: bool,
    pub require_user_presence: bool,
    pub require_user_verification: bool,
}

impl MakeCredentialArgs {
    pub fn rp_id(&self) -> &str {
        self.rp.id.as_deref().unwrap_or_default()
    }
}

/// One registration attempt. Reports an `AttestationObject` or a stop
/// reason to its listener.
pub struct MakeCredentialSession {
    core: Arc<SessionCore<AttestationObject>>,
    authenticator: Authenticator,
}

impl MakeCredentialSession {
    pub(crate) fn new(authenticator: Authenticator) -> Self {
        let core = SessionCore::new("make_credential", Arc::clone(authenticator.consent()));
        Self { core, authenticator }
    }

    pub fn can_perform_user_verification(&self) -> bool {
        self.authenticator.allow_user_verification()
    }

    pub fn can_store_resident_key(&self) -> bool {
        self.authenticator.allow_resident_key()
    }

    pub fn attachment(&self) -> AuthenticatorAttachment {
        self.authenticator.attachment()
    }

    pub fn transport(&self) -> AuthenticatorTransport {
        self.authenticator.transport()
    }

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn set_listener(&self, listener: SessionListener<AttestationObject>) {
        self.core.set_listener(listener);
    }

    pub fn start(&self) {
        self.core.start();
    }

    /// Runs the registration in the background; the outcome arrives
    /// through the listener. Only the first call after `start` does anything.
    pub fn make_credential(&self, args: MakeCredentialArgs) {
        if !self.core.begin_protocol() {
            return;
        }
        let core = Arc::clone(&self.core);
        let authenticator = self.authenticator.clone();
        tokio::spawn(async move {
            let result = register(&core, &authenticator, args).await;
            core.finish(result);
        });
    }

    pub async fn cancel(&self, reason: ErrorReason) {
        self.core.cancel(reason).await;
    }
}

async fn register(
    core: &SessionCore<AttestationObject>,
    authenticator: &Authenticator,
    args: MakeCredentialArgs,
) -> Result<AttestationObject, ErrorReason> {
    let rp_id = args.rp_id().to_string();
    let Some(support) = authenticator.chooser().choose(&args.algorithms) else {
        return Err(ErrorReason::Unsupported);
    };

    {
        let store = crate::lock(authenticator.store());
        if let Some(excluded) = args
            .exclude_credential_ids
            .iter()
            .find(|id| store.lookup(id).is_some())
        {
            tracing::info!(rp_id, cred_id = crate::store::credential::hex(excluded), "Excluded credential present");
            return Err(ErrorReason::Unknown);
        }
    }

    if args.require_user_verification && !authenticator.allow_user_verification() {
        tracing::warn!(rp_id, "User verification requested but not allowed");
        return Err(ErrorReason::Constraint);
    }

    let other_ui = core
        .with_consent(|id| {
            core.consent()
                .request_consent(id, &args.rp, &args.user, args.require_user_verification)
        })
        .await?;

    let credential_id = Uuid::new_v4().as_bytes().to_vec();
    let source = CredentialSource::new(
        credential_id.clone(),
        &rp_id,
        args.user.id.clone(),
        support.alg(),
        &other_ui,
    );
    let cred_id = source.id_hex();

    let replaced = crate::lock(authenticator.store())
        .delete_all(&rp_id, &args.user.id)
        .map_err(|e| store_failure(&cred_id, e))?;
    if !replaced.is_empty() {
        tracing::debug!(rp_id, replaced = replaced.len(), "Replaced previous credentials for user");
        delete_replaced_keys(authenticator, replaced).await;
    }

    let public_key = {
        let support = Arc::clone(&support);
        let alias = source.key_label.clone();
        let client_data_hash = args.client_data_hash.clone();
        run_key_op("create_key_pair", move || support.create_key_pair(&alias, &client_data_hash)).await?
    };

    let key_label = source.key_label.clone();
    authenticator.save_source(source)?;

    let authenticator_data = AuthenticatorData::new(
        &rp_id,
        args.require_user_presence || args.require_user_verification,
        args.require_user_verification,
        0,
    )
    .with_attested_credential_data(AttestedCredentialData {
        aaguid: AAGUID,
        credential_id,
        credential_public_key: public_key,
    });

    let attestation = {
        let client_data_hash = args.client_data_hash;
        run_key_op("build_attestation_object", move || {
            support.build_attestation_object(&key_label, &client_data_hash, authenticator_data)
        })
        .await?
    };

    tracing::info!(rp_id, cred_id, fmt = attestation.fmt().as_str(), "Credential created");
    Ok(attestation)
}

/// A key that cannot be deleted is logged and left behind; the registration
/// still goes ahead.
async fn delete_replaced_keys(authenticator: &Authenticator, replaced: Vec<CredentialSource>) {
    for source in replaced {
        let cred_id = source.id_hex();
        let Some(support) = authenticator.chooser().for_key(source.alg, &source.key_label) else {
            tracing::warn!(cred_id, "No key support holds the replaced credential's key");
            continue;
        };
        let alias = source.key_label;
        match run_key_op("delete_key", move || support.delete_key(&alias)).await {
            Ok(()) => tracing::debug!(cred_id, "Deleted key of replaced credential"),
            Err(_) => tracing::warn!(cred_id, "Key of replaced credential left behind"),
        }
    }
}
