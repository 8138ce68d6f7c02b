pub mod dispatch;
pub mod frame;
pub mod manager;

pub use dispatch::run_ble_loop;
pub use frame::{BleCommand, BleFrame, BleFrameParser, BleFrameParserResult, ContinuationFrame};
pub use manager::BleOperationManager;

pub const ERR_INVALID_CMD: u8 = 0x01;
pub const ERR_INVALID_PAR: u8 = 0x02;
pub const ERR_INVALID_LEN: u8 = 0x03;
pub const ERR_INVALID_SEQ: u8 = 0x04;
pub const ERR_REQ_TIMEOUT: u8 = 0x05;
pub const ERR_BUSY: u8 = 0x06;
pub const ERR_OTHER: u8 = 0x7F;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BleError {
    #[error("Invalid length")]
    InvalidLength,
    #[error("Invalid command: {0:#04x}")]
    InvalidCommand(u8),
    #[error("Bad sequence number: expected {expected}, got {got}")]
    InvalidSeq { expected: u8, got: u8 },
    #[error("Continuation without an initial fragment")]
    UnexpectedContinuation,
    #[error("Fragment length {0} too small")]
    FragmentTooSmall(usize),
    #[error("Busy")]
    Busy,
    #[error("Request timed out")]
    Timeout,
}

impl BleError {
    /// Code carried in an ERROR frame.
    pub fn error_code(&self) -> u8 {
        match self {
            Self::InvalidLength | Self::FragmentTooSmall(_) => ERR_INVALID_LEN,
            Self::InvalidCommand(_) => ERR_INVALID_CMD,
            Self::InvalidSeq { .. } => ERR_INVALID_SEQ,
            Self::UnexpectedContinuation => ERR_INVALID_PAR,
            Self::Busy => ERR_BUSY,
            Self::Timeout => ERR_REQ_TIMEOUT,
        }
    }
}
