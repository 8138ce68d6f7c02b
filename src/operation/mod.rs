pub mod registry;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::authenticator::{
    AuthenticatorAssertionResult, GetAssertionSession, MakeCredentialSession, SessionEvent,
    SessionListener,
};
use crate::client::types::AuthenticatorTransport;
use crate::ctap2::attestation::AttestationObject;
use crate::error::{ErrorReason, WebAuthnError};
use crate::lock;

pub use registry::OperationRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Create,
    Get,
}

/// The session side of an operation.
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    type Outcome: Send + 'static;

    fn transport(&self) -> AuthenticatorTransport;
    fn set_listener(&self, listener: SessionListener<Self::Outcome>);
    fn start(&self);
    async fn cancel(&self, reason: ErrorReason);
}

#[async_trait]
impl SessionHandle for MakeCredentialSession {
    type Outcome = AttestationObject;

    fn transport(&self) -> AuthenticatorTransport {
        MakeCredentialSession::transport(self)
    }

    fn set_listener(&self, listener: SessionListener<AttestationObject>) {
        MakeCredentialSession::set_listener(self, listener);
    }

    fn start(&self) {
        MakeCredentialSession::start(self);
    }

    async fn cancel(&self, reason: ErrorReason) {
        MakeCredentialSession::cancel(self, reason).await;
    }
}

#[async_trait]
impl SessionHandle for GetAssertionSession {
    type Outcome = AuthenticatorAssertionResult;

    fn transport(&self) -> AuthenticatorTransport {
        GetAssertionSession::transport(self)
    }

    fn set_listener(&self, listener: SessionListener<AuthenticatorAssertionResult>) {
        GetAssertionSession::set_listener(self, listener);
    }

    fn start(&self) {
        GetAssertionSession::start(self);
    }

    async fn cancel(&self, reason: ErrorReason) {
        GetAssertionSession::cancel(self, reason).await;
    }
}

/// What a concrete operation does when its session becomes available and
/// when it produces an outcome.
pub trait OperationHandler: Send + Sync + 'static {
    type Session: SessionHandle;
    type Output: Send + 'static;

    const KIND: OperationType;

    /// Check the caller's constraints and kick off the session protocol.
    fn on_available(&self, session: &Self::Session) -> Result<(), ErrorReason>;

    fn on_completed(
        &self,
        outcome: <Self::Session as SessionHandle>::Outcome,
    ) -> Result<Self::Output, ErrorReason>;
}

/// Told when an operation has resolved, so it can be evicted.
pub trait OperationListener: Send + Sync {
    fn on_finish(&self, op_type: OperationType, op_id: &str);
}

/// Registry view of an operation.
#[async_trait]
pub trait Cancellable: Send + Sync {
    fn op_type(&self) -> OperationType;
    async fn cancel(&self, reason: ErrorReason);
}

type ResultSender<T> = oneshot::Sender<Result<T, WebAuthnError>>;

struct Slot<T> {
    started: bool,
    stopped: bool,
    /// Set when cancelled before `start`; `start` then resolves with it.
    cancelled: Option<ErrorReason>,
    sender: Option<ResultSender<T>>,
}

/// Adapts a session's event stream into one result, bounded by a timer.
pub struct Operation<H: OperationHandler> {
    id: String,
    handler: H,
    session: H::Session,
    timeout: Duration,
    slot: Mutex<Slot<H::Output>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    listener: Option<Weak<dyn OperationListener>>,
}

impl<H: OperationHandler> Operation<H> {
    pub fn new(
        id: impl Into<String>,
        handler: H,
        session: H::Session,
        timeout: Duration,
        listener: Option<Weak<dyn OperationListener>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            handler,
            session,
            timeout,
            slot: Mutex::new(Slot { started: false, stopped: false, cancelled: None, sender: None }),
            timer: Mutex::new(None),
            listener,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Drive the session to a single result.
    pub async fn start(self: &Arc<Self>) -> Result<H::Output, WebAuthnError> {
        let (tx, mut rx) = oneshot::channel();
        {
            let mut slot = lock(&self.slot);
            if let Some(reason) = slot.cancelled {
                tracing::debug!(op_id = %self.id, %reason, "Operation cancelled before start");
                return Err(reason.into());
            }
            if slot.started || slot.stopped {
                tracing::warn!(op_id = %self.id, "Operation started twice");
                return Err(WebAuthnError::BadOperation);
            }
            slot.started = true;
            slot.sender = Some(tx);
        }

        let (events_tx, mut events) = mpsc::unbounded_channel();
        self.session.set_listener(events_tx);
        self.start_timer();
        tracing::debug!(op_id = %self.id, kind = ?H::KIND, timeout = ?self.timeout, "Operation started");
        self.session.start();

        loop {
            tokio::select! {
                result = &mut rx => {
                    return result.unwrap_or(Err(WebAuthnError::Unknown));
                }
                event = events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    // The session is gone without a terminal event.
                    None => self.stop(ErrorReason::Unknown).await,
                },
            }
        }
    }

    async fn on_event(&self, event: SessionEvent<<H::Session as SessionHandle>::Outcome>) {
        match event {
            SessionEvent::Available => {
                if let Err(reason) = self.handler.on_available(&self.session) {
                    self.stop(reason).await;
                }
            }
            SessionEvent::Unavailable => self.stop(ErrorReason::NotAllowed).await,
            SessionEvent::Stopped(reason) => self.stop(reason).await,
            SessionEvent::Completed(outcome) => match self.handler.on_completed(outcome) {
                Ok(output) => self.complete(output).await,
                Err(reason) => self.stop(reason).await,
            },
        }
    }

    fn is_pending(&self) -> bool {
        let slot = lock(&self.slot);
        slot.started && slot.sender.is_some()
    }

    /// An in-process session is asked to stop itself, so a consent prompt
    /// can be dismissed first. Other transports are stopped here. A
    /// registered operation that has not started yet is marked cancelled and
    /// evicted right away.
    pub async fn cancel(&self, reason: ErrorReason) {
        let internal = self.session.transport() == AuthenticatorTransport::Internal;
        let reason = match reason {
            ErrorReason::Timeout => ErrorReason::Timeout,
            _ if internal => ErrorReason::Cancelled,
            other => other,
        };
        if self.cancel_unstarted(reason) {
            tracing::debug!(op_id = %self.id, %reason, "Operation cancelled before start");
            self.notify_finished();
            return;
        }
        if !self.is_pending() {
            return;
        }
        tracing::debug!(op_id = %self.id, %reason, "Cancelling operation");
        if internal {
            self.session.cancel(reason).await;
        } else {
            self.stop(reason).await;
        }
    }

    fn cancel_unstarted(&self, reason: ErrorReason) -> bool {
        let mut slot = lock(&self.slot);
        if slot.started || slot.stopped {
            return false;
        }
        slot.stopped = true;
        slot.cancelled = Some(reason);
        true
    }

    async fn stop(&self, reason: ErrorReason) {
        let Some(sender) = self.take_sender() else {
            return;
        };
        tracing::debug!(op_id = %self.id, %reason, "Operation stopped");
        self.session.cancel(reason).await;
        self.notify_finished();
        let _ = sender.send(Err(reason.into()));
    }

    async fn complete(&self, output: H::Output) {
        let Some(sender) = self.take_sender() else {
            return;
        };
        tracing::debug!(op_id = %self.id, "Operation completed");
        self.notify_finished();
        let _ = sender.send(Ok(output));
    }

    /// Claims the right to resolve. At most one caller ever gets the sender.
    fn take_sender(&self) -> Option<ResultSender<H::Output>> {
        let sender = {
            let mut slot = lock(&self.slot);
            let sender = slot.sender.take()?;
            slot.stopped = true;
            sender
        };
        self.stop_timer();
        Some(sender)
    }

    fn notify_finished(&self) {
        if let Some(listener) = self.listener.as_ref().and_then(Weak::upgrade) {
            listener.on_finish(H::KIND, &self.id);
        }
    }

    fn start_timer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(op) = weak.upgrade() {
                op.on_timeout().await;
            }
        });
        *lock(&self.timer) = Some(handle);
    }

    async fn on_timeout(&self) {
        // The timer task is the caller; dropping the handle must not abort it.
        lock(&self.timer).take();
        tracing::info!(op_id = %self.id, "Operation timed out");
        self.cancel(ErrorReason::Timeout).await;
    }

    fn stop_timer(&self) {
        if let Some(handle) = lock(&self.timer).take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl<H: OperationHandler> Cancellable for Operation<H> {
    fn op_type(&self) -> OperationType {
        H::KIND
    }

    async fn cancel(&self, reason: ErrorReason) {
        Operation::cancel(self, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Session double that only records calls; tests drive its events.
    #[derive(Default)]
    struct FakeSession {
        transport: Option<AuthenticatorTransport>,
        listener: Mutex<Option<SessionListener<u32>>>,
        cancels: Mutex<Vec<ErrorReason>>,
    }

    impl FakeSession {
        fn emit(&self, event: SessionEvent<u32>) {
            if let Some(l) = lock(&self.listener).as_ref() {
                let _ = l.send(event);
            }
        }
    }

    #[async_trait]
    impl SessionHandle for FakeSession {
        type Outcome = u32;

        fn transport(&self) -> AuthenticatorTransport {
            self.transport.unwrap_or(AuthenticatorTransport::Ble)
        }

        fn set_listener(&self, listener: SessionListener<u32>) {
            *lock(&self.listener) = Some(listener);
        }

        fn start(&self) {
            self.emit(SessionEvent::Available);
        }

        async fn cancel(&self, reason: ErrorReason) {
            lock(&self.cancels).push(reason);
            if self.transport == Some(AuthenticatorTransport::Internal) {
                self.emit(SessionEvent::Stopped(reason));
            }
        }
    }

    #[derive(Default)]
    struct Doubler {
        available: AtomicUsize,
        complete_with: Option<u32>,
    }

    impl OperationHandler for Doubler {
        type Session = FakeSession;
        type Output = u32;
        const KIND: OperationType = OperationType::Create;

        fn on_available(&self, session: &FakeSession) -> Result<(), ErrorReason> {
            self.available.fetch_add(1, Ordering::SeqCst);
            if let Some(value) = self.complete_with {
                session.emit(SessionEvent::Completed(value));
            }
            Ok(())
        }

        fn on_completed(&self, outcome: u32) -> Result<u32, ErrorReason> {
            Ok(outcome * 2)
        }
    }

    struct Finished(Mutex<Vec<String>>);

    impl OperationListener for Finished {
        fn on_finish(&self, _op_type: OperationType, op_id: &str) {
            lock(&self.0).push(op_id.to_string());
        }
    }

    #[tokio::test]
    async fn test_completion_resolves_once_and_notifies() {
        let finished = Arc::new(Finished(Mutex::new(Vec::new())));
        let weak: Weak<dyn OperationListener> = Arc::downgrade(&(finished.clone() as Arc<dyn OperationListener>));
        let handler = Doubler { complete_with: Some(21), ..Default::default() };
        let op = Operation::new("op-1", handler, FakeSession::default(), Duration::from_secs(5), Some(weak));

        assert_eq!(op.start().await, Ok(42));
        assert_eq!(*lock(&finished.0), vec!["op-1".to_string()]);
        assert_eq!(op.start().await, Err(WebAuthnError::BadOperation), "second start is misuse");
        assert_eq!(op.handler().available.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_stops_out_of_process_session() {
        let op = Operation::new("op-2", Doubler::default(), FakeSession::default(), Duration::from_secs(15), None);
        assert_eq!(op.start().await, Err(WebAuthnError::Timeout));
        assert_eq!(*lock(&op.session.cancels), vec![ErrorReason::Timeout]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_forwarded_to_internal_session() {
        let session = FakeSession { transport: Some(AuthenticatorTransport::Internal), ..Default::default() };
        let op = Operation::new("op-3", Doubler::default(), session, Duration::from_secs(15), None);
        assert_eq!(op.start().await, Err(WebAuthnError::Timeout));
    }

    #[tokio::test]
    async fn test_cancel_maps_to_cancelled_for_internal() {
        let session = FakeSession { transport: Some(AuthenticatorTransport::Internal), ..Default::default() };
        let op = Operation::new("op-4", Doubler::default(), session, Duration::from_secs(60), None);
        let runner = {
            let op = Arc::clone(&op);
            tokio::spawn(async move { op.start().await })
        };
        while !op.is_pending() {
            tokio::task::yield_now().await;
        }
        op.cancel(ErrorReason::NotAllowed).await;
        assert_eq!(runner.await.unwrap(), Err(WebAuthnError::Cancelled));
        op.cancel(ErrorReason::Cancelled).await;
        assert_eq!(lock(&op.session.cancels).len(), 2, "cancel after resolution is ignored");
    }

    #[tokio::test]
    async fn test_cancel_before_start_resolves_on_start() {
        let finished = Arc::new(Finished(Mutex::new(Vec::new())));
        let weak: Weak<dyn OperationListener> = Arc::downgrade(&(finished.clone() as Arc<dyn OperationListener>));
        let op = Operation::new("op-5", Doubler::default(), FakeSession::default(), Duration::from_secs(60), Some(weak));

        op.cancel(ErrorReason::Cancelled).await;
        assert_eq!(*lock(&finished.0), vec!["op-5".to_string()], "evicted at cancel time");
        assert_eq!(op.start().await, Err(WebAuthnError::Cancelled));
        assert_eq!(op.handler().available.load(Ordering::SeqCst), 0, "session never started");
        assert!(lock(&op.session.cancels).is_empty());
        assert_eq!(lock(&finished.0).len(), 1);
    }

    fn racing_op(id: &str, finished: &Arc<Finished>) -> Arc<Operation<Doubler>> {
        let weak: Weak<dyn OperationListener> = Arc::downgrade(&(finished.clone() as Arc<dyn OperationListener>));
        Operation::new(id, Doubler::default(), FakeSession::default(), Duration::from_secs(15), Some(weak))
    }

    async fn started(op: &Arc<Operation<Doubler>>) -> JoinHandle<Result<u32, WebAuthnError>> {
        let runner = {
            let op = Arc::clone(op);
            tokio::spawn(async move { op.start().await })
        };
        while op.handler().available.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        runner
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_and_completion_in_same_tick_resolve_once() {
        // Timeout claims the slot first.
        let finished = Arc::new(Finished(Mutex::new(Vec::new())));
        let op = racing_op("timeout-first", &finished);
        let runner = started(&op).await;
        tokio::join!(op.on_timeout(), op.complete(1));
        assert_eq!(runner.await.unwrap(), Err(WebAuthnError::Timeout));
        assert_eq!(*lock(&op.session.cancels), vec![ErrorReason::Timeout]);
        assert_eq!(lock(&finished.0).len(), 1, "one eviction");
        assert!(op.take_sender().is_none(), "nothing left to send");

        // Completion claims the slot first.
        let finished = Arc::new(Finished(Mutex::new(Vec::new())));
        let op = racing_op("completion-first", &finished);
        let runner = started(&op).await;
        tokio::join!(op.complete(4), op.on_timeout());
        assert_eq!(runner.await.unwrap(), Ok(4));
        assert!(lock(&op.session.cancels).is_empty(), "late timeout does not touch the session");
        assert_eq!(lock(&finished.0).len(), 1, "one eviction");
        assert!(op.take_sender().is_none(), "nothing left to send");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_as_session_completes() {
        let finished = Arc::new(Finished(Mutex::new(Vec::new())));
        let op = racing_op("op-6", &finished);
        let runner = started(&op).await;

        op.session.emit(SessionEvent::Completed(21));
        tokio::time::advance(Duration::from_secs(15)).await;
        let result = runner.await.unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;
        tokio::task::yield_now().await;

        match result {
            Ok(42) => assert!(lock(&op.session.cancels).is_empty()),
            Err(WebAuthnError::Timeout) => assert_eq!(*lock(&op.session.cancels), vec![ErrorReason::Timeout]),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(*lock(&finished.0), vec!["op-6".to_string()], "exactly one on_finish");
        op.cancel(ErrorReason::Cancelled).await;
        assert_eq!(lock(&finished.0).len(), 1, "cancel after resolution is ignored");
        assert!(lock(&op.timer).is_none(), "timer cleared");
    }
}
