//! Negative response codes returned by diagnostic servers

use std::fmt;

/// Negative response codes (NRC)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    BusyRepeatRequest,
    ConditionsNotCorrect,
    RequestSequenceError,
    NoResponseFromSubnet,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    /// Too many event-driven transmissions registered
    UploadDownloadNotAccepted,
    GeneralProgrammingFailure,
    ResponsePending,
    ServiceNotSupportedInActiveSession,
    /// Unknown/reserved NRC
    Unknown(u8),
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        match value {
            0x10 => Self::GeneralReject,
            0x11 => Self::ServiceNotSupported,
            0x12 => Self::SubFunctionNotSupported,
            0x13 => Self::IncorrectMessageLengthOrFormat,
            0x21 => Self::BusyRepeatRequest,
            0x22 => Self::ConditionsNotCorrect,
            0x24 => Self::RequestSequenceError,
            0x25 => Self::NoResponseFromSubnet,
            0x31 => Self::RequestOutOfRange,
            0x33 => Self::SecurityAccessDenied,
            0x35 => Self::InvalidKey,
            0x36 => Self::ExceededNumberOfAttempts,
            0x37 => Self::RequiredTimeDelayNotExpired,
            0x70 => Self::UploadDownloadNotAccepted,
            0x72 => Self::GeneralProgrammingFailure,
            0x78 => Self::ResponsePending,
            0x7F => Self::ServiceNotSupportedInActiveSession,
            other => Self::Unknown(other),
        }
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            NegativeResponseCode::GeneralReject => 0x10,
            NegativeResponseCode::ServiceNotSupported => 0x11,
            NegativeResponseCode::SubFunctionNotSupported => 0x12,
            NegativeResponseCode::IncorrectMessageLengthOrFormat => 0x13,
            NegativeResponseCode::BusyRepeatRequest => 0x21,
            NegativeResponseCode::ConditionsNotCorrect => 0x22,
            NegativeResponseCode::RequestSequenceError => 0x24,
            NegativeResponseCode::NoResponseFromSubnet => 0x25,
            NegativeResponseCode::RequestOutOfRange => 0x31,
            NegativeResponseCode::SecurityAccessDenied => 0x33,
            NegativeResponseCode::InvalidKey => 0x35,
            NegativeResponseCode::ExceededNumberOfAttempts => 0x36,
            NegativeResponseCode::RequiredTimeDelayNotExpired => 0x37,
            NegativeResponseCode::UploadDownloadNotAccepted => 0x70,
            NegativeResponseCode::GeneralProgrammingFailure => 0x72,
            NegativeResponseCode::ResponsePending => 0x78,
            NegativeResponseCode::ServiceNotSupportedInActiveSession => 0x7F,
            NegativeResponseCode::Unknown(v) => v,
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GeneralReject => write!(f, "general reject"),
            Self::ServiceNotSupported => write!(f, "service not supported"),
            Self::SubFunctionNotSupported => write!(f, "sub-function not supported"),
            Self::IncorrectMessageLengthOrFormat => {
                write!(f, "incorrect message length or format")
            }
            Self::BusyRepeatRequest => write!(f, "busy, repeat request"),
            Self::ConditionsNotCorrect => write!(f, "conditions not correct"),
            Self::RequestSequenceError => write!(f, "request sequence error"),
            Self::NoResponseFromSubnet => write!(f, "no response from subnet"),
            Self::RequestOutOfRange => write!(f, "request out of range"),
            Self::SecurityAccessDenied => write!(f, "security access denied"),
            Self::InvalidKey => write!(f, "invalid key"),
            Self::ExceededNumberOfAttempts => write!(f, "exceeded number of attempts"),
            Self::RequiredTimeDelayNotExpired => write!(f, "required time delay not expired"),
            Self::UploadDownloadNotAccepted => {
                write!(f, "too many transmissions already registered")
            }
            Self::GeneralProgrammingFailure => write!(f, "general programming failure"),
            Self::ResponsePending => write!(f, "response pending"),
            Self::ServiceNotSupportedInActiveSession => {
                write!(f, "service not supported in active session")
            }
            Self::Unknown(v) => write!(f, "unknown (0x{:02X})", v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_known_and_unknown() {
        assert_eq!(NegativeResponseCode::from(0x31), NegativeResponseCode::RequestOutOfRange);
        assert_eq!(u8::from(NegativeResponseCode::from(0x70)), 0x70);
        assert_eq!(NegativeResponseCode::from(0xE0), NegativeResponseCode::Unknown(0xE0));
        assert_eq!(format!("{:02X}", NegativeResponseCode::Unknown(0xE0)), "E0");
    }
}
