//! UDS Negative Response Codes (ISO 14229-1 Annex A.1)

use std::fmt;

macro_rules! negative_response_codes {
    ($($variant:ident = $code:literal => $name:literal,)*) => {
        /// Negative Response Code carried in a `7F <service> <code>` response
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NegativeResponseCode {
            $($variant,)*
            /// Reserved or manufacturer specific code
            Unknown(u8),
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $($code => Self::$variant,)*
                    other => Self::Unknown(other),
                }
            }
        }

        impl From<NegativeResponseCode> for u8 {
            fn from(nrc: NegativeResponseCode) -> Self {
                match nrc {
                    $(NegativeResponseCode::$variant => $code,)*
                    NegativeResponseCode::Unknown(v) => v,
                }
            }
        }

        impl NegativeResponseCode {
            /// ISO 14229 name, `None` for codes outside the table
            pub fn name(&self) -> Option<&'static str> {
                match self {
                    $(Self::$variant => Some($name),)*
                    Self::Unknown(_) => None,
                }
            }
        }
    };
}

negative_response_codes! {
    GeneralReject = 0x10 => "generalReject",
    ServiceNotSupported = 0x11 => "serviceNotSupported",
    SubFunctionNotSupported = 0x12 => "subFunctionNotSupported",
    IncorrectMessageLengthOrFormat = 0x13 => "incorrectMessageLengthOrInvalidFormat",
    ResponseTooLong = 0x14 => "responseTooLong",
    BusyRepeatRequest = 0x21 => "busyRepeatRequest",
    ConditionsNotCorrect = 0x22 => "conditionsNotCorrect",
    RequestSequenceError = 0x24 => "requestSequenceError",
    NoResponseFromSubnet = 0x25 => "noResponseFromSubnetComponent",
    FailurePreventsExecution = 0x26 => "failurePreventsExecutionOfRequestedAction",
    RequestOutOfRange = 0x31 => "requestOutOfRange",
    SecurityAccessDenied = 0x33 => "securityAccessDenied",
    InvalidKey = 0x35 => "invalidKey",
    ExceededNumberOfAttempts = 0x36 => "exceedNumberOfAttempts",
    RequiredTimeDelayNotExpired = 0x37 => "requiredTimeDelayNotExpired",
    UploadDownloadNotAccepted = 0x70 => "uploadDownloadNotAccepted",
    TransferDataSuspended = 0x71 => "transferDataSuspended",
    GeneralProgrammingFailure = 0x72 => "generalProgrammingFailure",
    WrongBlockSequenceCounter = 0x73 => "wrongBlockSequenceCounter",
    ResponsePending = 0x78 => "requestCorrectlyReceived-ResponsePending",
    SubFunctionNotSupportedInActiveSession = 0x7E => "subFunctionNotSupportedInActiveSession",
    ServiceNotSupportedInActiveSession = 0x7F => "serviceNotSupportedInActiveSession",
}

impl NegativeResponseCode {
    /// Raw code byte
    pub fn code(self) -> u8 {
        self.into()
    }

    /// `0x78`: the server is still working on the request
    pub fn is_response_pending(self) -> bool {
        self == Self::ResponsePending
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&self.code(), f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} (0x{:02X})", name, self.code()),
            None => write!(f, "0x{:02X}", self.code()),
        }
    }
}
