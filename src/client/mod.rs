pub mod create;
pub mod get;
pub mod types;

use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::authenticator::Authenticator;
use crate::config::{DEFAULT_TIMEOUT_SECS, MAX_TIMEOUT_SECS, MIN_TIMEOUT_SECS};
use crate::error::WebAuthnError;
use crate::operation::{Operation, OperationListener, OperationRegistry};
use types::{
    AuthenticatorAssertionResponse, AuthenticatorAttestationResponse, CollectedClientData,
    CollectedClientDataType, PublicKeyCredential, PublicKeyCredentialCreationOptions,
    PublicKeyCredentialRequestOptions, UserVerificationRequirement,
};

pub use create::ClientCreate;
pub use get::ClientGet;

/// Serialized client data and its SHA-256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientData {
    pub json: String,
    pub hash: Vec<u8>,
}

impl ClientData {
    pub fn new(type_: CollectedClientDataType, challenge: &[u8], origin: &str) -> Result<Self, WebAuthnError> {
        let collected = CollectedClientData {
            type_,
            challenge: URL_SAFE_NO_PAD.encode(challenge),
            origin: origin.to_string(),
        };
        let json = serde_json::to_string(&collected).map_err(|e| {
            tracing::warn!(error = %e, "Client data serialization failed");
            WebAuthnError::Unknown
        })?;
        let hash = Sha256::digest(json.as_bytes()).to_vec();
        Ok(Self { json, hash })
    }
}

/// Host part of an origin such as `https://example.org:8443`.
pub fn origin_host(origin: &str) -> &str {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Verification wanted for this request, given what the session can do.
pub(crate) fn judge_user_verification(requirement: UserVerificationRequirement, capable: bool) -> bool {
    match requirement {
        UserVerificationRequirement::Required => true,
        UserVerificationRequirement::Discouraged => false,
        UserVerificationRequirement::Preferred => capable,
    }
}

/// Relying-party facing entry point: `create` registers a credential,
/// `get` produces an assertion. Every call is an operation tracked until
/// it resolves.
pub struct WebAuthnClient {
    authenticator: Authenticator,
    origin: String,
    default_timeout: Duration,
    min_timeout: Duration,
    max_timeout: Duration,
    registry: Arc<OperationRegistry>,
}

impl WebAuthnClient {
    pub fn new(authenticator: Authenticator, origin: impl Into<String>) -> Self {
        Self {
            authenticator,
            origin: origin.into(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            min_timeout: Duration::from_secs(MIN_TIMEOUT_SECS),
            max_timeout: Duration::from_secs(MAX_TIMEOUT_SECS),
            registry: Arc::new(OperationRegistry::new()),
        }
    }

    pub fn with_timeouts(mut self, default: Duration, min: Duration, max: Duration) -> Self {
        self.min_timeout = min;
        self.max_timeout = max.max(min);
        self.default_timeout = default;
        self
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Lifetime of an operation: the caller's value clamped to the bounds,
    /// or the default.
    pub fn timeout_for(&self, requested_secs: Option<u64>) -> Duration {
        match requested_secs {
            Some(secs) => Duration::from_secs(secs).clamp(self.min_timeout, self.max_timeout),
            None => self.default_timeout,
        }
    }

    fn listener(&self) -> Weak<dyn OperationListener> {
        let listener: Arc<dyn OperationListener> = self.registry.clone();
        Arc::downgrade(&listener)
    }

    pub async fn create(
        &self,
        options: PublicKeyCredentialCreationOptions,
    ) -> Result<PublicKeyCredential<AuthenticatorAttestationResponse>, WebAuthnError> {
        let client_data = ClientData::new(CollectedClientDataType::Create, &options.challenge, &self.origin)?;
        let rp_id = options
            .rp
            .id
            .clone()
            .unwrap_or_else(|| origin_host(&self.origin).to_string());
        let timeout = self.timeout_for(options.timeout);
        let op_id = Uuid::new_v4().to_string();
        tracing::info!(op_id, rp_id, ?timeout, "Create requested");

        let handler = ClientCreate::new(options, rp_id, client_data);
        let op = Operation::new(
            op_id.clone(),
            handler,
            self.authenticator.new_make_credential_session(),
            timeout,
            Some(self.listener()),
        );
        self.registry.insert(op_id, op.clone());
        op.start().await
    }

    pub async fn get(
        &self,
        options: PublicKeyCredentialRequestOptions,
    ) -> Result<PublicKeyCredential<AuthenticatorAssertionResponse>, WebAuthnError> {
        let client_data = ClientData::new(CollectedClientDataType::Get, &options.challenge, &self.origin)?;
        let rp_id = options
            .rp_id
            .clone()
            .unwrap_or_else(|| origin_host(&self.origin).to_string());
        let timeout = self.timeout_for(options.timeout);
        let op_id = Uuid::new_v4().to_string();
        tracing::info!(op_id, rp_id, ?timeout, "Get requested");

        let handler = ClientGet::new(options, rp_id, client_data);
        let op = Operation::new(
            op_id.clone(),
            handler,
            self.authenticator.new_get_assertion_session(),
            timeout,
            Some(self.listener()),
        );
        self.registry.insert(op_id, op.clone());
        op.start().await
    }

    /// Cancel every in-flight create and get. Returns how many there were.
    pub async fn cancel(&self) -> usize {
        self.registry.cancel_all(crate::error::ErrorReason::Cancelled).await
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }
}
