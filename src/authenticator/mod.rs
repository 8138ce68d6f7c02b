pub mod get_assertion;
pub mod make_credential;
pub mod session;

use std::sync::Arc;

use crate::client::types::{AuthenticatorAttachment, AuthenticatorTransport};
use crate::config::DEFAULT_COUNTER_STEP;
use crate::error::ErrorReason;
use crate::key::{KeyError, KeySupportChooser};
use crate::store::{CredentialSource, SharedStore, StoreError};
use crate::up::UserConsent;

pub use get_assertion::{AuthenticatorAssertionResult, GetAssertionArgs, GetAssertionSession};
pub use make_credential::{MakeCredentialArgs, MakeCredentialSession};
pub use session::{SessionEvent, SessionListener, SessionState};

/// Static capabilities of the authenticator.
#[derive(Debug, Clone)]
pub struct AuthenticatorSetting {
    pub attachment: AuthenticatorAttachment,
    pub transport: AuthenticatorTransport,
    /// Added to a credential's sign count on every assertion.
    pub counter_step: u32,
    pub allow_resident_key: bool,
    pub allow_user_verification: bool,
}

impl Default for AuthenticatorSetting {
    fn default() -> Self {
        Self {
            attachment: AuthenticatorAttachment::Platform,
            transport: AuthenticatorTransport::Internal,
            counter_step: DEFAULT_COUNTER_STEP,
            allow_resident_key: true,
            allow_user_verification: true,
        }
    }
}

/// Session factory. Cheap to clone; every session gets its own state and
/// listener and only shares the store, key supports and consent UI.
#[derive(Clone)]
pub struct Authenticator {
    setting: AuthenticatorSetting,
    consent: Arc<dyn UserConsent>,
    store: SharedStore,
    chooser: KeySupportChooser,
}

impl Authenticator {
    pub fn new(
        setting: AuthenticatorSetting,
        consent: Arc<dyn UserConsent>,
        store: SharedStore,
        chooser: KeySupportChooser,
    ) -> Self {
        Self { setting, consent, store, chooser }
    }

    pub fn setting(&self) -> &AuthenticatorSetting {
        &self.setting
    }

    pub fn attachment(&self) -> AuthenticatorAttachment {
        self.setting.attachment
    }

    pub fn transport(&self) -> AuthenticatorTransport {
        self.setting.transport
    }

    pub fn counter_step(&self) -> u32 {
        self.setting.counter_step
    }

    pub fn allow_resident_key(&self) -> bool {
        self.setting.allow_resident_key
    }

    pub fn allow_user_verification(&self) -> bool {
        self.setting.allow_user_verification
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn chooser(&self) -> &KeySupportChooser {
        &self.chooser
    }

    pub fn new_make_credential_session(&self) -> MakeCredentialSession {
        MakeCredentialSession::new(self.clone())
    }

    pub fn new_get_assertion_session(&self) -> GetAssertionSession {
        GetAssertionSession::new(self.clone())
    }

    pub(crate) fn consent(&self) -> &Arc<dyn UserConsent> {
        &self.consent
    }

    pub(crate) fn save_source(&self, source: CredentialSource) -> Result<(), ErrorReason> {
        let cred_id = source.id_hex();
        crate::lock(&self.store).save(source).map_err(|e| store_failure(&cred_id, e))
    }
}

fn store_failure(cred_id: &str, e: StoreError) -> ErrorReason {
    tracing::warn!(cred_id, error = %e, "Credential store failure");
    ErrorReason::Unknown
}

/// Run a key-support call on the blocking pool. Any failure is `Unknown`.
pub(crate) async fn run_key_op<R, F>(what: &'static str, op: F) -> Result<R, ErrorReason>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, KeyError> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            tracing::warn!(op = what, error = %e, "Key support failed");
            Err(ErrorReason::Unknown)
        }
        Err(e) => {
            tracing::warn!(op = what, error = %e, "Key support task failed");
            Err(ErrorReason::Unknown)
        }
    }
}
