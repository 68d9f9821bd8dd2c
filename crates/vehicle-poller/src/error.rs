//! Poller errors

use thiserror::Error;

use crate::bus::BusError;
use crate::uds::NegativeResponseCode;

/// Result code of a successful single request
pub const POLLSINGLE_OK: i32 = 0;
/// Result code: timeout or poller unavailable
pub const POLLSINGLE_TIMEOUT: i32 = -1;
/// Result code: request could not be transmitted
pub const POLLSINGLE_TXFAILURE: i32 = -2;

/// Crate level error
#[derive(Debug, Error)]
pub enum PollerError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Poller task is not running")]
    NotRunning,
}

/// Configuration loading / validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Failure of a single request
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PollSingleError {
    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Transmission failed")]
    TxFailure,

    #[error("Negative response: {0}")]
    Negative(NegativeResponseCode),

    #[error("Poller unavailable")]
    Unavailable,

    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),
}

impl PollSingleError {
    /// Numeric result code: `-1` timeout/unavailable, `-2` transmit failure,
    /// `>0` negative response code
    pub fn result_code(&self) -> i32 {
        match self {
            Self::Timeout | Self::Unavailable | Self::InvalidRequest(_) => POLLSINGLE_TIMEOUT,
            Self::TxFailure => POLLSINGLE_TXFAILURE,
            Self::Negative(nrc) => i32::from(nrc.code()),
        }
    }
}

/// Text for a single request result code
pub fn poll_result_code_name(code: i32) -> String {
    match code {
        POLLSINGLE_OK => "OK".to_string(),
        POLLSINGLE_TIMEOUT => "TIMEOUT".to_string(),
        POLLSINGLE_TXFAILURE => "TXFAILURE".to_string(),
        _ => match u8::try_from(code) {
            Ok(byte) => {
                let nrc = NegativeResponseCode::from(byte);
                nrc.name()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("NRC 0x{:02X}", byte))
            }
            Err(_) => format!("unknown result {}", code),
        },
    }
}
