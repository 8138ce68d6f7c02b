/// Why a session stopped. Closed set shared by every layer below the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ErrorReason {
    #[error("not allowed")]
    NotAllowed,
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("unsupported")]
    Unsupported,
    #[error("unknown error")]
    Unknown,
    #[error("constraint violated")]
    Constraint,
}

/// Failure reported to callers of the client and the BLE manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WebAuthnError {
    #[error("not allowed")]
    NotAllowed,
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("unsupported")]
    Unsupported,
    #[error("unknown error")]
    Unknown,
    #[error("constraint violated")]
    Constraint,
    #[error("bad operation")]
    BadOperation,
}

impl From<ErrorReason> for WebAuthnError {
    fn from(reason: ErrorReason) -> Self {
        match reason {
            ErrorReason::NotAllowed => Self::NotAllowed,
            ErrorReason::Cancelled => Self::Cancelled,
            ErrorReason::Timeout => Self::Timeout,
            ErrorReason::Unsupported => Self::Unsupported,
            ErrorReason::Unknown => Self::Unknown,
            ErrorReason::Constraint => Self::Constraint,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("BLE: {0}")]
    Ble(#[from] crate::ble::BleError),
    #[error("CTAP2: {0}")]
    Ctap2(#[from] crate::ctap2::Ctap2Error),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("Key: {0}")]
    Key(#[from] crate::key::KeyError),
    #[error("TPM: {0}")]
    Tpm(#[from] crate::tpm::TpmError),
    #[error("Store: {0}")]
    Store(#[from] crate::store::StoreError),
    #[error("WebAuthn: {0}")]
    WebAuthn(#[from] WebAuthnError),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_maps_to_same_webauthn_error() {
        let pairs = [
            (ErrorReason::NotAllowed, WebAuthnError::NotAllowed),
            (ErrorReason::Cancelled, WebAuthnError::Cancelled),
            (ErrorReason::Timeout, WebAuthnError::Timeout),
            (ErrorReason::Unsupported, WebAuthnError::Unsupported),
            (ErrorReason::Unknown, WebAuthnError::Unknown),
            (ErrorReason::Constraint, WebAuthnError::Constraint),
        ];
        for (reason, expected) in pairs {
            assert_eq!(WebAuthnError::from(reason), expected, "{reason:?}");
        }
    }
}
