//! CAN bus errors

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("Failed to open bus: {0}")]
    OpenFailed(String),

    #[error("Bus offline")]
    Offline,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Invalid CAN identifier: {0}")]
    InvalidId(String),

    #[error("Invalid bus number: {0}")]
    InvalidBus(u8),

    #[error("Bus not supported: {0}")]
    Unsupported(String),
}
