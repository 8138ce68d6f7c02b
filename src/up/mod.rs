pub mod pinentry;
pub(crate) mod prompt;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::client::types::{PublicKeyCredentialRpEntity, PublicKeyCredentialUserEntity};
use crate::error::ErrorReason;
use crate::store::CredentialSource;

pub use pinentry::PinentryConsent;

/// Identifies one consent request so that `cancel` reaches only its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsentId(u64);

impl ConsentId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConsentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consent-{}", self.0)
    }
}

/// Asks the user to approve a registration or pick a credential.
///
/// Failures are reported as `Cancelled`, `Timeout` or `Unknown`. `cancel`
/// dismisses the prompt of the given request and leaves every other
/// request alone.
#[async_trait]
pub trait UserConsent: Send + Sync {
    /// Returns the label shown for the new credential.
    async fn request_consent(
        &self,
        id: ConsentId,
        rp: &PublicKeyCredentialRpEntity,
        user: &PublicKeyCredentialUserEntity,
        require_user_verification: bool,
    ) -> Result<String, ErrorReason>;

    async fn request_selection(
        &self,
        id: ConsentId,
        candidates: Vec<CredentialSource>,
        require_user_verification: bool,
    ) -> Result<CredentialSource, ErrorReason>;

    /// Whether the prompt of request `id` is on screen.
    fn is_open(&self, id: ConsentId) -> bool;

    async fn cancel(&self, id: ConsentId, reason: ErrorReason);
}
