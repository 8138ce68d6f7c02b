use std::sync::Arc;

use super::session::{SessionCore, SessionListener, SessionState};
use super::{Authenticator, run_key_op};
use crate::client::types::{AuthenticatorAttachment, AuthenticatorTransport};
use crate::ctap2::authenticator_data::AuthenticatorData;
use crate::error::ErrorReason;
use crate::store::CredentialSource;

#[derive(Debug, Clone)]
pub struct GetAssertionArgs {
    pub rp_id: String,
    pub client_data_hash: Vec<u8>,
    /// Empty means every credential of `rp_id` is a candidate.
    pub allow_credential_ids: Vec<Vec<u8>>,
    pub require_user_presence: bool,
    pub require_user_verification: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatorAssertionResult {
    /// `None` when the caller allowed exactly one credential.
    pub credential_id: Option<Vec<u8>>,
    pub user_handle: Vec<u8>,
    pub signature: Vec<u8>,
    pub authenticator_data: Vec<u8>,
}

/// One authentication attempt.
pub struct GetAssertionSession {
    core: Arc<SessionCore<AuthenticatorAssertionResult>>,
    authenticator: Authenticator,
}

impl GetAssertionSession {
    pub(crate) fn new(authenticator: Authenticator) -> Self {
        let core = SessionCore::new("get_assertion", Arc::clone(authenticator.consent()));
        Self { core, authenticator }
    }

    pub fn can_perform_user_verification(&self) -> bool {
        self.authenticator.allow_user_verification()
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

    pub fn set_listener(&self, listener: SessionListener<AuthenticatorAssertionResult>) {
        self.core.set_listener(listener);
    }

    pub fn start(&self) {
        self.core.start();
    }

    pub fn get_assertion(&self, args: GetAssertionArgs) {
        if !self.core.begin_protocol() {
            return;
        }
        let core = Arc::clone(&self.core);
        let authenticator = self.authenticator.clone();
        tokio::spawn(async move {
            let result = assert(&core, &authenticator, args).await;
            core.finish(result);
        });
    }

    pub async fn cancel(&self, reason: ErrorReason) {
        self.core.cancel(reason).await;
    }
}

fn candidates(authenticator: &Authenticator, args: &GetAssertionArgs) -> Vec<CredentialSource> {
    let store = crate::lock(authenticator.store());
    if args.allow_credential_ids.is_empty() {
        return store.load_all(&args.rp_id).into_iter().cloned().collect();
    }
    args.allow_credential_ids
        .iter()
        .filter_map(|id| store.lookup(id))
        .filter(|source| {
            let same_rp = source.rp_id == args.rp_id;
            if !same_rp {
                tracing::debug!(cred_id = source.id_hex(), rp_id = %args.rp_id, "Allowed credential belongs to another RP");
            }
            same_rp
        })
        .cloned()
        .collect()
}

async fn assert(
    core: &SessionCore<AuthenticatorAssertionResult>,
    authenticator: &Authenticator,
    args: GetAssertionArgs,
) -> Result<AuthenticatorAssertionResult, ErrorReason> {
    let candidates = candidates(authenticator, &args);
    if candidates.is_empty() {
        tracing::info!(rp_id = %args.rp_id, "No credentials for assertion");
        return Err(ErrorReason::NotAllowed);
    }

    let mut source = core
        .with_consent(|id| {
            core.consent()
                .request_selection(id, candidates, args.require_user_verification)
        })
        .await?;

    source.sign_count = source.sign_count.saturating_add(authenticator.counter_step());
    let sign_count = source.sign_count;
    authenticator.save_source(source.clone())?;

    let authenticator_data = AuthenticatorData::new(
        &args.rp_id,
        args.require_user_presence || args.require_user_verification,
        args.require_user_verification,
        sign_count,
    )
    .to_bytes()
    .map_err(|e| {
        tracing::warn!(error = %e, "Authenticator data encoding failed");
        ErrorReason::Unknown
    })?;

    let Some(support) = authenticator.chooser().for_key(source.alg, &source.key_label) else {
        tracing::warn!(cred_id = source.id_hex(), alg = source.alg, "No key support holds the credential key");
        return Err(ErrorReason::Unsupported);
    };

    let signature = {
        let alias = source.key_label.clone();
        let mut to_sign = authenticator_data.clone();
        to_sign.extend_from_slice(&args.client_data_hash);
        run_key_op("sign", move || support.sign(&alias, &to_sign)).await?
    };

    tracing::info!(rp_id = %args.rp_id, cred_id = source.id_hex(), sign_count, "Assertion signed");
    let credential_id = (args.allow_credential_ids.len() != 1).then(|| source.id.clone());
    Ok(AuthenticatorAssertionResult {
        credential_id,
        user_handle: source.user_handle,
        signature,
        authenticator_data,
    })
}
