mod common;

use std::time::Duration;

use tokio::sync::mpsc;

use common::{Script, harness};
use fidolink::authenticator::{
    AuthenticatorSetting, GetAssertionArgs, MakeCredentialArgs, SessionEvent, SessionState,
};
use fidolink::client::types::{PublicKeyCredentialRpEntity, PublicKeyCredentialUserEntity};
use fidolink::ctap2::{AttestationFormat, COSE_ALG_ES256};
use fidolink::error::ErrorReason;
use fidolink::key::KeySupport;

fn args(uv: bool) -> MakeCredentialArgs {
    MakeCredentialArgs {
        client_data_hash: vec![0x33; 32],
        rp: PublicKeyCredentialRpEntity { id: Some("example.org".into()), name: "Example".into() },
        user: PublicKeyCredentialUserEntity {
            id: b"user-1".to_vec(),
            name: "alice".into(),
            display_name: "Alice".into(),
        },
        algorithms: vec![COSE_ALG_ES256],
        exclude_credential_ids: Vec::new(),
        require_resident_key: false,
        require_user_presence: !uv,
        require_user_verification: uv,
    }
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<SessionEvent<T>>) -> SessionEvent<T> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("session event within 5s")
        .expect("listener channel open")
}

#[tokio::test]
async fn test_make_credential_session_lifecycle() {
    let h = harness(Script::Approve, AuthenticatorSetting::default());
    let session = h.authenticator.new_make_credential_session();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.set_listener(tx);
    assert_eq!(session.state(), SessionState::Created);

    session.start();
    session.start();
    assert!(matches!(next(&mut rx).await, SessionEvent::Available));
    assert_eq!(session.state(), SessionState::Started);

    session.make_credential(args(false));
    let SessionEvent::Completed(attestation) = next(&mut rx).await else {
        panic!("registration completes");
    };
    assert_eq!(attestation.fmt(), AttestationFormat::Packed);
    assert_eq!(session.state(), SessionState::Completed);
    assert_eq!(h.store.lock().unwrap().credential_count(), 1);

    session.cancel(ErrorReason::Cancelled).await;
    assert_eq!(session.state(), SessionState::Completed, "cancel after completion is a no-op");
    assert!(rx.try_recv().is_err(), "exactly one terminal event");
}

#[tokio::test]
async fn test_protocol_before_start_is_ignored() {
    let h = harness(Script::Approve, AuthenticatorSetting::default());
    let session = h.authenticator.new_make_credential_session();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.set_listener(tx);

    session.make_credential(args(false));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(h.consent.requests(), 0);
    assert_eq!(session.state(), SessionState::Created);
}

#[tokio::test]
async fn test_user_verification_disallowed_stops_with_constraint() {
    let setting = AuthenticatorSetting { allow_user_verification: false, ..AuthenticatorSetting::default() };
    let h = harness(Script::Approve, setting);
    let session = h.authenticator.new_make_credential_session();
    assert!(!session.can_perform_user_verification());
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.set_listener(tx);
    session.start();
    next(&mut rx).await;

    session.make_credential(args(true));
    assert!(matches!(next(&mut rx).await, SessionEvent::Stopped(ErrorReason::Constraint)));
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(h.consent.requests(), 0, "no prompt for a refused request");
}

#[tokio::test]
async fn test_cancel_before_protocol_stops_session() {
    let h = harness(Script::Approve, AuthenticatorSetting::default());
    let session = h.authenticator.new_get_assertion_session();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.set_listener(tx);
    session.start();
    next(&mut rx).await;

    session.cancel(ErrorReason::Timeout).await;
    assert!(matches!(next(&mut rx).await, SessionEvent::Stopped(ErrorReason::Timeout)));

    session.get_assertion(GetAssertionArgs {
        rp_id: "example.org".into(),
        client_data_hash: vec![0; 32],
        allow_credential_ids: Vec::new(),
        require_user_presence: true,
        require_user_verification: false,
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err(), "stopped session runs no protocol");
    assert_eq!(h.consent.requests(), 0);
}

#[tokio::test]
async fn test_cancel_during_consent_reports_reason() {
    let h = harness(Script::Hang, AuthenticatorSetting::default());
    let session = h.authenticator.new_make_credential_session();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.set_listener(tx);
    session.start();
    next(&mut rx).await;

    session.make_credential(args(false));
    h.consent.wait_open().await;
    session.cancel(ErrorReason::Timeout).await;

    assert!(matches!(next(&mut rx).await, SessionEvent::Stopped(ErrorReason::Timeout)));
    assert_eq!(h.consent.cancels(), vec![ErrorReason::Timeout]);
    assert_eq!(h.store.lock().unwrap().credential_count(), 0);
}

#[tokio::test]
async fn test_cancel_dismisses_only_own_prompt() {
    let h = harness(Script::Hang, AuthenticatorSetting::default());
    let first = h.authenticator.new_make_credential_session();
    let second = h.authenticator.new_make_credential_session();
    let (first_tx, mut first_rx) = mpsc::unbounded_channel();
    let (second_tx, mut second_rx) = mpsc::unbounded_channel();
    first.set_listener(first_tx);
    second.set_listener(second_tx);
    first.start();
    second.start();
    next(&mut first_rx).await;
    next(&mut second_rx).await;

    first.make_credential(args(false));
    second.make_credential(args(false));
    h.consent.wait_open_count(2).await;

    second.cancel(ErrorReason::Cancelled).await;
    assert!(matches!(next(&mut second_rx).await, SessionEvent::Stopped(ErrorReason::Cancelled)));
    assert_eq!(h.consent.open_requests(), 1, "first prompt is still shown");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(first_rx.try_recv().is_err(), "first session is unaffected");
    assert_eq!(first.state(), SessionState::Started);

    first.cancel(ErrorReason::Timeout).await;
    assert!(matches!(next(&mut first_rx).await, SessionEvent::Stopped(ErrorReason::Timeout)));
    assert_eq!(h.consent.cancels(), vec![ErrorReason::Cancelled, ErrorReason::Timeout]);
    assert_eq!(h.consent.open_requests(), 0);
}

async fn register(h: &common::Harness) {
    let session = h.authenticator.new_make_credential_session();
    let (tx, mut rx) = mpsc::unbounded_channel();
    session.set_listener(tx);
    session.start();
    next(&mut rx).await;
    session.make_credential(args(false));
    assert!(matches!(next(&mut rx).await, SessionEvent::Completed(_)), "registration completes");
}

#[tokio::test]
async fn test_reregistration_deletes_previous_key() {
    let h = harness(Script::Approve, AuthenticatorSetting::default());
    let keys = &h.authenticator.chooser().supports()[0];

    register(&h).await;
    let first = h.store.lock().unwrap().load_all("example.org")[0].clone();
    assert!(keys.has_key(&first.key_label));

    register(&h).await;
    let store = h.store.lock().unwrap();
    let sources = store.load_all("example.org");
    assert_eq!(sources.len(), 1, "previous credential replaced");
    assert_ne!(sources[0].id, first.id);
    assert!(keys.has_key(&sources[0].key_label));
    assert!(!keys.has_key(&first.key_label), "replaced credential's key deleted");
}
