use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use uuid::Uuid;

use crate::authenticator::{
    Authenticator, AuthenticatorAssertionResult, GetAssertionArgs, GetAssertionSession,
    MakeCredentialArgs, MakeCredentialSession,
};
use crate::client::types::PublicKeyCredentialType;
use crate::ctap2::attestation::AttestationObject;
use crate::ctap2::get_assertion::encode_get_assertion_response;
use crate::ctap2::make_credential::encode_make_credential_response;
use crate::ctap2::types::{GetAssertionRequest, MakeCredentialRequest};
use crate::error::{ErrorReason, WebAuthnError};
use crate::lock;
use crate::operation::{Operation, OperationHandler, OperationListener, OperationRegistry, OperationType};

/// A registered BLE operation. Awaiting it runs the session and yields the
/// encoded CTAP2 response.
pub type PendingResponse = Pin<Box<dyn Future<Output = Result<Vec<u8>, WebAuthnError>> + Send>>;

/// Runs CTAP2 requests arriving over BLE on the authenticator. At most one
/// create and one get are outstanding at a time.
pub struct BleOperationManager {
    authenticator: Authenticator,
    registry: Arc<OperationRegistry>,
}

impl BleOperationManager {
    pub fn new(authenticator: Authenticator) -> Self {
        Self { authenticator, registry: Arc::new(OperationRegistry::new()) }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    fn listener(&self) -> Weak<dyn OperationListener> {
        let listener: Arc<dyn OperationListener> = self.registry.clone();
        Arc::downgrade(&listener)
    }

    /// Registers the operation now, so `cancel_all` reaches it even before
    /// the returned future is first polled.
    fn register<H: OperationHandler<Output = Vec<u8>>>(
        &self,
        handler: H,
        session: H::Session,
        timeout: Duration,
    ) -> Result<PendingResponse, WebAuthnError> {
        let op_id = Uuid::new_v4().to_string();
        let op = Operation::new(op_id.clone(), handler, session, timeout, Some(self.listener()));
        if !self.registry.insert_exclusive(op_id.clone(), op.clone()) {
            tracing::warn!(kind = ?H::KIND, "BLE operation already in flight");
            return Err(WebAuthnError::BadOperation);
        }
        tracing::debug!(op_id, kind = ?H::KIND, "BLE operation registered");
        Ok(Box::pin(async move { op.start().await }))
    }

    pub fn begin_create(&self, request: MakeCredentialRequest, timeout: Duration) -> Result<PendingResponse, WebAuthnError> {
        self.register(BleCreate { request }, self.authenticator.new_make_credential_session(), timeout)
    }

    pub fn begin_get(&self, request: GetAssertionRequest, timeout: Duration) -> Result<PendingResponse, WebAuthnError> {
        let handler = BleGet { request, single_credential: Mutex::new(None) };
        self.register(handler, self.authenticator.new_get_assertion_session(), timeout)
    }

    /// Encoded CTAP2 makeCredential response, status byte included.
    pub async fn create(&self, request: MakeCredentialRequest, timeout: Duration) -> Result<Vec<u8>, WebAuthnError> {
        self.begin_create(request, timeout)?.await
    }

    pub async fn get(&self, request: GetAssertionRequest, timeout: Duration) -> Result<Vec<u8>, WebAuthnError> {
        self.begin_get(request, timeout)?.await
    }

    pub async fn cancel_all(&self, reason: ErrorReason) -> usize {
        self.registry.cancel_all(reason).await
    }

    pub fn has_active_operation(&self) -> bool {
        !self.registry.is_empty()
    }
}

struct BleCreate {
    request: MakeCredentialRequest,
}

impl OperationHandler for BleCreate {
    type Session = MakeCredentialSession;
    type Output = Vec<u8>;

    const KIND: OperationType = OperationType::Create;

    fn on_available(&self, session: &MakeCredentialSession) -> Result<(), ErrorReason> {
        let request = &self.request;
        if request.resident_key && !session.can_store_resident_key() {
            return Err(ErrorReason::Constraint);
        }
        let transport = session.transport();
        session.make_credential(MakeCredentialArgs {
            client_data_hash: request.client_data_hash.clone(),
            rp: request.rp.clone(),
            user: request.user.clone(),
            algorithms: request
                .pub_key_cred_params
                .iter()
                .filter(|p| p.type_ == PublicKeyCredentialType::PublicKey)
                .map(|p| p.alg)
                .collect(),
            exclude_credential_ids: request
                .exclude_list
                .iter()
                .filter(|d| d.matches_transport(transport))
                .map(|d| d.id.clone())
                .collect(),
            require_resident_key: request.resident_key,
            require_user_presence: true,
            require_user_verification: request.user_verification,
        });
        Ok(())
    }

    fn on_completed(&self, attestation: AttestationObject) -> Result<Vec<u8>, ErrorReason> {
        encode_make_credential_response(&attestation).map_err(|e| {
            tracing::warn!(error = %e, "makeCredential response encoding failed");
            ErrorReason::Unknown
        })
    }
}

struct BleGet {
    request: GetAssertionRequest,
    single_credential: Mutex<Option<Vec<u8>>>,
}

impl OperationHandler for BleGet {
    type Session = GetAssertionSession;
    type Output = Vec<u8>;

    const KIND: OperationType = OperationType::Get;

    fn on_available(&self, session: &GetAssertionSession) -> Result<(), ErrorReason> {
        let request = &self.request;
        let transport = session.transport();
        let allowed: Vec<Vec<u8>> = request
            .allow_list
            .iter()
            .filter(|d| d.matches_transport(transport))
            .map(|d| d.id.clone())
            .collect();
        if !request.allow_list.is_empty() && allowed.is_empty() {
            return Err(ErrorReason::NotAllowed);
        }
        if let [only] = allowed.as_slice() {
            *lock(&self.single_credential) = Some(only.clone());
        }
        session.get_assertion(GetAssertionArgs {
            rp_id: request.rp_id.clone(),
            client_data_hash: request.client_data_hash.clone(),
            allow_credential_ids: allowed,
            require_user_presence: true,
            require_user_verification: request.user_verification,
        });
        Ok(())
    }

    fn on_completed(&self, result: AuthenticatorAssertionResult) -> Result<Vec<u8>, ErrorReason> {
        let credential_id = result
            .credential_id
            .or_else(|| lock(&self.single_credential).clone());
        encode_get_assertion_response(
            credential_id.as_deref(),
            &result.authenticator_data,
            &result.signature,
            &result.user_handle,
        )
        .map_err(|e| {
            tracing::warn!(error = %e, "getAssertion response encoding failed");
            ErrorReason::Unknown
        })
    }
}
