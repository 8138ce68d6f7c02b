use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::frame::{BleCommand, BleFrame, BleFrameParser, BleFrameParserResult};
use super::manager::{BleOperationManager, PendingResponse};
use super::{ERR_BUSY, ERR_INVALID_CMD};
use crate::config::{BLE_KEEPALIVE_INTERVAL_MS, BLE_OPERATION_TIMEOUT_SECS};
use crate::ctap2::get_info::handle_get_info;
use crate::ctap2::types::{
    CTAP2_CMD_GET_ASSERTION, CTAP2_CMD_GET_INFO, CTAP2_CMD_MAKE_CREDENTIAL, Ctap2Error,
    GetAssertionRequest, MakeCredentialRequest,
};
use crate::error::{ErrorReason, WebAuthnError};

/// KEEPALIVE status while the user is being asked.
pub const KEEPALIVE_STATUS_UPNEEDED: u8 = 0x02;

/// Serve one BLE connection: reassemble incoming fragments, answer PING,
/// run MSG payloads as CTAP2 commands, honour CANCEL. Closing `incoming_rx`
/// cancels whatever is still outstanding.
pub async fn run_ble_loop(
    mut incoming_rx: mpsc::Receiver<Vec<u8>>,
    outgoing_tx: mpsc::Sender<Vec<u8>>,
    manager: Arc<BleOperationManager>,
    fragment_len: usize,
) {
    let mut parser = BleFrameParser::new();
    let mut in_flight: Option<JoinHandle<Vec<u8>>> = None;
    let mut keepalive = tokio::time::interval(Duration::from_millis(BLE_KEEPALIVE_INTERVAL_MS));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tracing::info!(fragment_len, "BLE loop running");

    loop {
        let reply = tokio::select! {
            fragment = incoming_rx.recv() => match fragment {
                Some(fragment) => process_fragment(&mut parser, &fragment, &manager, &mut in_flight).await,
                None => break,
            },
            response = wait_for(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                Some(BleFrame::new(BleCommand::Msg, response))
            }
            _ = keepalive.tick(), if in_flight.is_some() => {
                Some(BleFrame::new(BleCommand::Keepalive, vec![KEEPALIVE_STATUS_UPNEEDED]))
            }
        };
        if let Some(frame) = reply {
            if !send_frame(&outgoing_tx, &frame, fragment_len).await {
                break;
            }
        }
    }

    let cancelled = manager.cancel_all(ErrorReason::Cancelled).await;
    if let Some(task) = in_flight.take() {
        task.abort();
    }
    tracing::info!(cancelled, "BLE loop exiting");
}

async fn wait_for(task: &mut Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match task {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "CTAP2 task failed");
            vec![Ctap2Error::Other.status_byte()]
        }),
        None => std::future::pending().await,
    }
}

async fn send_frame(tx: &mpsc::Sender<Vec<u8>>, frame: &BleFrame, fragment_len: usize) -> bool {
    let fragments = match frame.fragments(fragment_len) {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(error = %e, "Cannot fragment response");
            return false;
        }
    };
    for fragment in fragments {
        if tx.send(fragment).await.is_err() {
            tracing::error!("Outgoing channel closed");
            return false;
        }
    }
    true
}

async fn process_fragment(
    parser: &mut BleFrameParser,
    fragment: &[u8],
    manager: &Arc<BleOperationManager>,
    in_flight: &mut Option<JoinHandle<Vec<u8>>>,
) -> Option<BleFrame> {
    match parser.update(fragment) {
        Ok(BleFrameParserResult::MoreFragmentsExpected) => None,
        Ok(BleFrameParserResult::Done) => {
            let frame = parser.frame();
            parser.reset();
            dispatch_frame(frame?, manager, in_flight).await
        }
        Err(e) => {
            tracing::warn!(error = %e, "Bad BLE fragment");
            parser.reset();
            Some(BleFrame::error(e.error_code()))
        }
    }
}

async fn dispatch_frame(
    frame: BleFrame,
    manager: &Arc<BleOperationManager>,
    in_flight: &mut Option<JoinHandle<Vec<u8>>>,
) -> Option<BleFrame> {
    match frame.cmd {
        BleCommand::Ping => {
            tracing::debug!(len = frame.data.len(), "PING");
            Some(BleFrame::new(BleCommand::Ping, frame.data))
        }
        BleCommand::Cancel => {
            let cancelled = manager.cancel_all(ErrorReason::Cancelled).await;
            tracing::debug!(cancelled, "CANCEL");
            None
        }
        BleCommand::Msg if in_flight.is_some() => {
            tracing::warn!("MSG while another request is processing");
            Some(BleFrame::error(ERR_BUSY))
        }
        BleCommand::Msg => match prepare_ctap_message(manager, &frame.data) {
            CtapReply::Ready(response) => Some(BleFrame::new(BleCommand::Msg, response)),
            CtapReply::Pending(pending) => {
                *in_flight = Some(tokio::spawn(CtapReply::Pending(pending).resolve()));
                None
            }
        },
        BleCommand::Keepalive | BleCommand::Error => {
            tracing::warn!(cmd = ?frame.cmd, "Unexpected command from client");
            Some(BleFrame::error(ERR_INVALID_CMD))
        }
    }
}

/// Reply to one CTAP2 command: already known, or an operation that is
/// registered with the manager and still has to run.
pub enum CtapReply {
    Ready(Vec<u8>),
    Pending(PendingResponse),
}

impl CtapReply {
    /// Status byte plus CBOR body.
    pub async fn resolve(self) -> Vec<u8> {
        match self {
            Self::Ready(response) => response,
            Self::Pending(pending) => pending.await.unwrap_or_else(|e| failure(e.into())),
        }
    }
}

fn failure(e: Ctap2Error) -> Vec<u8> {
    tracing::info!(error = %e, "CTAP2 command failed");
    vec![e.status_byte()]
}

fn begun(result: Result<PendingResponse, WebAuthnError>) -> CtapReply {
    match result {
        Ok(pending) => CtapReply::Pending(pending),
        Err(e) => CtapReply::Ready(failure(e.into())),
    }
}

/// Parse one CTAP2 command and register its operation before returning, so a
/// CANCEL or disconnect handled right after sees it.
pub fn prepare_ctap_message(manager: &BleOperationManager, message: &[u8]) -> CtapReply {
    let Some((&cmd, params)) = message.split_first() else {
        return CtapReply::Ready(vec![Ctap2Error::InvalidLength.status_byte()]);
    };
    let timeout = Duration::from_secs(BLE_OPERATION_TIMEOUT_SECS);
    tracing::debug!(cmd = format!("{cmd:#04x}"), len = params.len(), "CTAP2 command");

    match cmd {
        CTAP2_CMD_MAKE_CREDENTIAL => match MakeCredentialRequest::try_from(params) {
            Ok(request) => begun(manager.begin_create(request, timeout)),
            Err(e) => CtapReply::Ready(failure(e)),
        },
        CTAP2_CMD_GET_ASSERTION => match GetAssertionRequest::try_from(params) {
            Ok(request) => begun(manager.begin_get(request, timeout)),
            Err(e) => CtapReply::Ready(failure(e)),
        },
        CTAP2_CMD_GET_INFO => {
            let setting = manager.authenticator().setting();
            CtapReply::Ready(handle_get_info(setting.allow_resident_key, setting.allow_user_verification))
        }
        other => {
            tracing::warn!(cmd = format!("{other:#04x}"), "Unknown CTAP2 command");
            CtapReply::Ready(failure(Ctap2Error::InvalidCommand))
        }
    }
}

/// Execute one CTAP2 command; returns status byte plus CBOR body.
pub async fn process_ctap_message(manager: &BleOperationManager, message: &[u8]) -> Vec<u8> {
    prepare_ctap_message(manager, message).resolve().await
}
