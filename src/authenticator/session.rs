use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use crate::error::ErrorReason;
use crate::lock;
use crate::up::{ConsentId, UserConsent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Started,
    Completed,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }
}

/// What a session reports to its listener. At most one of `Stopped` and
/// `Completed` is ever sent.
#[derive(Debug)]
pub enum SessionEvent<T> {
    Available,
    Unavailable,
    Stopped(ErrorReason),
    Completed(T),
}

pub type SessionListener<T> = mpsc::UnboundedSender<SessionEvent<T>>;

struct Inner<T> {
    state: SessionState,
    protocol_started: bool,
    listener: Option<SessionListener<T>>,
    consent_abort: Option<(ConsentId, oneshot::Sender<ErrorReason>)>,
}

/// State machine shared by both session kinds and their protocol task.
pub(crate) struct SessionCore<T> {
    name: &'static str,
    inner: Mutex<Inner<T>>,
    consent: Arc<dyn UserConsent>,
}

impl<T: Send + 'static> SessionCore<T> {
    pub(crate) fn new(name: &'static str, consent: Arc<dyn UserConsent>) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                protocol_started: false,
                listener: None,
                consent_abort: None,
            }),
            consent,
        })
    }

    pub(crate) fn consent(&self) -> &Arc<dyn UserConsent> {
        &self.consent
    }

    pub(crate) fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub(crate) fn set_listener(&self, listener: SessionListener<T>) {
        lock(&self.inner).listener = Some(listener);
    }

    fn emit(inner: &Inner<T>, event: SessionEvent<T>) {
        if let Some(listener) = &inner.listener {
            // A dropped receiver means nobody waits for this session any more.
            let _ = listener.send(event);
        }
    }

    pub(crate) fn start(&self) {
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Created {
            tracing::debug!(session = self.name, state = ?inner.state, "start ignored");
            return;
        }
        inner.state = SessionState::Started;
        tracing::debug!(session = self.name, "started");
        Self::emit(&inner, SessionEvent::Available);
    }

    /// Claims the single protocol run of this session.
    pub(crate) fn begin_protocol(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Started || inner.protocol_started {
            tracing::warn!(session = self.name, state = ?inner.state, "protocol refused");
            return false;
        }
        inner.protocol_started = true;
        true
    }

    pub(crate) fn stop(&self, reason: ErrorReason) {
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Started {
            tracing::debug!(session = self.name, state = ?inner.state, %reason, "stop ignored");
            return;
        }
        inner.state = SessionState::Stopped;
        inner.consent_abort = None;
        tracing::debug!(session = self.name, %reason, "stopped");
        Self::emit(&inner, SessionEvent::Stopped(reason));
    }

    pub(crate) fn complete(&self, outcome: T) {
        let mut inner = lock(&self.inner);
        if inner.state != SessionState::Started {
            tracing::debug!(session = self.name, state = ?inner.state, "completion dropped");
            return;
        }
        inner.state = SessionState::Completed;
        tracing::debug!(session = self.name, "completed");
        Self::emit(&inner, SessionEvent::Completed(outcome));
    }

    /// Report the protocol's result through the terminal transition.
    pub(crate) fn finish(&self, result: Result<T, ErrorReason>) {
        match result {
            Ok(outcome) => self.complete(outcome),
            Err(reason) => self.stop(reason),
        }
    }

    /// Run a consent request that `cancel` can abort. The request is built
    /// from a fresh `ConsentId` owned by this session.
    pub(crate) async fn with_consent<R, F, Fut>(&self, request: F) -> Result<R, ErrorReason>
    where
        F: FnOnce(ConsentId) -> Fut,
        Fut: Future<Output = Result<R, ErrorReason>>,
    {
        let id = ConsentId::next();
        let (abort_tx, abort_rx) = oneshot::channel();
        {
            let mut inner = lock(&self.inner);
            if inner.state != SessionState::Started {
                return Err(ErrorReason::Cancelled);
            }
            inner.consent_abort = Some((id, abort_tx));
        }
        let result = tokio::select! {
            result = request(id) => result,
            Ok(reason) = abort_rx => Err(reason),
        };
        lock(&self.inner).consent_abort = None;
        result
    }

    /// While consent is engaged this session's prompt is dismissed first and
    /// the protocol reports `Stopped` itself; otherwise the session stops here.
    pub(crate) async fn cancel(&self, reason: ErrorReason) {
        let abort = {
            let mut inner = lock(&self.inner);
            if inner.state.is_terminal() {
                tracing::debug!(session = self.name, "cancel after terminal state ignored");
                return;
            }
            inner.consent_abort.take()
        };
        match abort {
            Some((id, abort)) => {
                tracing::debug!(session = self.name, %id, %reason, "forwarding cancel to user consent");
                if self.consent.is_open(id) {
                    self.consent.cancel(id, reason).await;
                }
                let _ = abort.send(reason);
            }
            None => self.stop(reason),
        }
    }
}
