use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::prompt::{UpPrompt, account_label, get_assertion_prompt, make_credential_prompt};
use super::{ConsentId, UserConsent};
use crate::client::types::{PublicKeyCredentialRpEntity, PublicKeyCredentialUserEntity};
use crate::error::ErrorReason;
use crate::lock;
use crate::store::CredentialSource;

/// Consent through a `pinentry` dialog. One dialog is shown at a time.
///
/// The pinentry child is owned by the `pinentry` crate and cannot be killed
/// from here. A cancelled request returns at once while its dialog stays up
/// until the user answers it or pinentry's own timeout closes it. The next
/// dialog waits for that child to exit.
pub struct PinentryConsent {
    binary: String,
    timeout: Duration,
    auto_select_single: bool,
    dialog: Arc<tokio::sync::Mutex<()>>,
    pending: Mutex<Option<(ConsentId, oneshot::Sender<ErrorReason>)>>,
}

impl PinentryConsent {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            timeout: Duration::from_secs(crate::config::CONSENT_TIMEOUT_SECS),
            auto_select_single: true,
            dialog: Arc::new(tokio::sync::Mutex::new(())),
            pending: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip the dialog when exactly one credential matches and no
    /// verification is required.
    pub fn with_auto_select(mut self, auto_select_single: bool) -> Self {
        self.auto_select_single = auto_select_single;
        self
    }

    /// `Ok(true)` confirmed, `Ok(false)` declined in the dialog.
    async fn confirm(&self, id: ConsentId, prompt: UpPrompt) -> Result<bool, ErrorReason> {
        // Moved into the blocking task: released when the child exits.
        let dialog = Arc::clone(&self.dialog).lock_owned().await;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        *lock(&self.pending) = Some((id, cancel_tx));

        let UpPrompt { title, description } = prompt;
        let bin = self.binary.clone();
        let child_timeout = u16::try_from(self.timeout.as_secs().max(1)).unwrap_or(u16::MAX);
        let join = tokio::task::spawn_blocking(move || {
            let _dialog = dialog;
            let input = pinentry::PassphraseInput::with_binary(&bin);
            match input {
                None => Err(pinentry::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "pinentry binary not found",
                ))),
                Some(mut input) => input
                    .with_title(&title)
                    .with_description(&description)
                    .with_ok("Confirm")
                    .with_cancel("Deny")
                    .with_timeout(child_timeout)
                    .interact(),
            }
        });

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.timeout, join) => match result {
                Err(_) => Err(ErrorReason::Timeout),
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "pinentry task failed");
                    Err(ErrorReason::Unknown)
                }
                Ok(Ok(Ok(_))) => Ok(true),
                Ok(Ok(Err(pinentry::Error::Io(e)))) => {
                    tracing::warn!(error = %e, binary = %self.binary, "pinentry failed");
                    Err(ErrorReason::Unknown)
                }
                Ok(Ok(Err(_))) => Ok(false),
            },
            reason = cancel_rx => Err(reason.unwrap_or(ErrorReason::Cancelled)),
        };

        let mut pending = lock(&self.pending);
        if pending.as_ref().is_some_and(|(open, _)| *open == id) {
            pending.take();
        }
        outcome
    }
}

#[async_trait]
impl UserConsent for PinentryConsent {
    async fn request_consent(
        &self,
        id: ConsentId,
        rp: &PublicKeyCredentialRpEntity,
        user: &PublicKeyCredentialUserEntity,
        require_user_verification: bool,
    ) -> Result<String, ErrorReason> {
        let prompt = make_credential_prompt(rp, user, require_user_verification);
        if self.confirm(id, prompt).await? {
            tracing::info!(rp_id = ?rp.id, %id, "User approved registration");
            Ok(account_label(user))
        } else {
            Err(ErrorReason::Cancelled)
        }
    }

    async fn request_selection(
        &self,
        id: ConsentId,
        mut candidates: Vec<CredentialSource>,
        require_user_verification: bool,
    ) -> Result<CredentialSource, ErrorReason> {
        if candidates.len() == 1 && self.auto_select_single && !require_user_verification {
            return candidates.pop().ok_or(ErrorReason::Unknown);
        }
        let total = candidates.len();
        for (index, candidate) in candidates.into_iter().enumerate() {
            let position = (total > 1).then_some((index, total));
            let prompt = get_assertion_prompt(&candidate, position, require_user_verification);
            if self.confirm(id, prompt).await? {
                tracing::info!(cred_id = candidate.id_hex(), %id, "User selected credential");
                return Ok(candidate);
            }
        }
        Err(ErrorReason::Cancelled)
    }

    fn is_open(&self, id: ConsentId) -> bool {
        lock(&self.pending).as_ref().is_some_and(|(open, _)| *open == id)
    }

    async fn cancel(&self, id: ConsentId, reason: ErrorReason) {
        let tx = {
            let mut pending = lock(&self.pending);
            match pending.as_ref() {
                Some((open, _)) if *open == id => pending.take().map(|(_, tx)| tx),
                _ => None,
            }
        };
        match tx {
            Some(tx) => {
                tracing::debug!(%id, %reason, "Dismissing pinentry dialog");
                let _ = tx.send(reason);
            }
            None => tracing::debug!(%id, "No pinentry dialog open for request"),
        }
    }
}
