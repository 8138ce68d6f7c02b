#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use fidolink::authenticator::{Authenticator, AuthenticatorSetting};
use fidolink::client::WebAuthnClient;
use fidolink::client::types::{
    AttestationConveyancePreference, AuthenticatorSelectionCriteria, PublicKeyCredentialCreationOptions,
    PublicKeyCredentialParameters, PublicKeyCredentialRequestOptions, PublicKeyCredentialRpEntity,
    PublicKeyCredentialUserEntity, UserVerificationRequirement,
};
use fidolink::ctap2::COSE_ALG_ES256;
use fidolink::error::ErrorReason;
use fidolink::key::{KeySupport, KeySupportChooser, KeyVault, SoftwareKeySupport};
use fidolink::store::{self, CredentialSource, CredentialStore, SharedStore};
use fidolink::up::{ConsentId, UserConsent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Approve,
    Fail(ErrorReason),
    /// Never answers; only `cancel` ends the request.
    Hang,
}

/// Consent double answering from a script.
pub struct ScriptedConsent {
    script: Mutex<Script>,
    pending: Mutex<HashMap<ConsentId, oneshot::Sender<ErrorReason>>>,
    requests: AtomicUsize,
    cancels: Mutex<Vec<ErrorReason>>,
}

impl ScriptedConsent {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            pending: Mutex::new(HashMap::new()),
            requests: AtomicUsize::new(0),
            cancels: Mutex::new(Vec::new()),
        })
    }

    pub fn set(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> Vec<ErrorReason> {
        self.cancels.lock().unwrap().clone()
    }

    /// Requests currently parked on `Script::Hang`.
    pub fn open_requests(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Wait until a request is parked on `Script::Hang`.
    pub async fn wait_open(&self) {
        self.wait_open_count(1).await;
    }

    pub async fn wait_open_count(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.open_requests() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consent request never arrived");
    }

    async fn answer<T>(&self, id: ConsentId, approved: T) -> Result<T, ErrorReason> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock().unwrap();
        match script {
            Script::Approve => Ok(approved),
            Script::Fail(reason) => Err(reason),
            Script::Hang => {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().unwrap().insert(id, tx);
                Err(rx.await.unwrap_or(ErrorReason::Unknown))
            }
        }
    }
}

#[async_trait]
impl UserConsent for ScriptedConsent {
    async fn request_consent(
        &self,
        id: ConsentId,
        _rp: &PublicKeyCredentialRpEntity,
        user: &PublicKeyCredentialUserEntity,
        _require_user_verification: bool,
    ) -> Result<String, ErrorReason> {
        self.answer(id, user.display_name.clone()).await
    }

    async fn request_selection(
        &self,
        id: ConsentId,
        candidates: Vec<CredentialSource>,
        _require_user_verification: bool,
    ) -> Result<CredentialSource, ErrorReason> {
        let first = candidates.into_iter().next().ok_or(ErrorReason::NotAllowed)?;
        self.answer(id, first).await
    }

    fn is_open(&self, id: ConsentId) -> bool {
        self.pending.lock().unwrap().contains_key(&id)
    }

    async fn cancel(&self, id: ConsentId, reason: ErrorReason) {
        self.cancels.lock().unwrap().push(reason);
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(reason);
        }
    }
}

pub struct Harness {
    pub consent: Arc<ScriptedConsent>,
    pub store: SharedStore,
    pub authenticator: Authenticator,
}

pub fn harness(script: Script, setting: AuthenticatorSetting) -> Harness {
    let consent = ScriptedConsent::new(script);
    let store = store::shared(CredentialStore::in_memory());
    let software: Arc<dyn KeySupport> = Arc::new(SoftwareKeySupport::new(KeyVault::in_memory()));
    let chooser = KeySupportChooser::new(vec![software]);
    let authenticator = Authenticator::new(setting, consent.clone(), store.clone(), chooser);
    Harness { consent, store, authenticator }
}

pub fn client(harness: &Harness) -> WebAuthnClient {
    WebAuthnClient::new(harness.authenticator.clone(), "https://example.org").with_timeouts(
        Duration::from_secs(5),
        Duration::from_millis(50),
        Duration::from_secs(10),
    )
}

pub fn creation_options(rp_id: &str, user_id: &[u8]) -> PublicKeyCredentialCreationOptions {
    PublicKeyCredentialCreationOptions {
        rp: PublicKeyCredentialRpEntity { id: Some(rp_id.to_string()), name: "Example".into() },
        user: PublicKeyCredentialUserEntity {
            id: user_id.to_vec(),
            name: "alice".into(),
            display_name: "Alice".into(),
        },
        challenge: vec![7; 32],
        pub_key_cred_params: vec![PublicKeyCredentialParameters::public_key(COSE_ALG_ES256)],
        timeout: None,
        exclude_credentials: Vec::new(),
        authenticator_selection: Some(AuthenticatorSelectionCriteria {
            user_verification: UserVerificationRequirement::Discouraged,
            ..AuthenticatorSelectionCriteria::default()
        }),
        attestation: AttestationConveyancePreference::None,
    }
}

pub fn request_options(rp_id: &str) -> PublicKeyCredentialRequestOptions {
    PublicKeyCredentialRequestOptions {
        challenge: vec![9; 32],
        timeout: None,
        rp_id: Some(rp_id.to_string()),
        allow_credentials: Vec::new(),
        user_verification: UserVerificationRequirement::Discouraged,
    }
}
