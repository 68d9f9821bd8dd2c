//! OBD-II / UDS request and response envelope
//!
//! A request is `<service> [pid] [data...]`. The "PID" is the part of the
//! request parameters that every valid response echoes back, so its width
//! depends on the service. The poller uses it to match responses to the
//! request in flight.

mod envelope;
mod nrc;

pub use envelope::Envelope;
pub use nrc::NegativeResponseCode;

/// Response type of a negative response (`7F <service> <code>`)
pub const NEGATIVE_RESPONSE: u8 = 0x7F;

/// Positive response type = request service + 0x40
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Service types used as poll entry `service_type`
pub mod service_type {
    /// OBD mode 01: current powertrain data
    pub const OBDII_CURRENT: u8 = 0x01;
    /// OBD mode 02: freeze frame data
    pub const OBDII_FREEZE: u8 = 0x02;
    /// OBD mode 03: emission related DTCs
    pub const READ_ERDTC: u8 = 0x03;
    /// OBD mode 04: clear emission related DTCs
    pub const CLEAR_ERDTC: u8 = 0x04;
    /// OBD mode 05: oxygen sensor test results
    pub const READ_OXS_TEST: u8 = 0x05;
    /// OBD mode 07: DTCs detected during the current drive cycle
    pub const READ_DCERDTC: u8 = 0x07;
    /// OBD mode 09: vehicle information
    pub const OBDII_VEHICLE: u8 = 0x09;
    /// OBD mode 0A: permanent DTCs
    pub const READ_PERMDTC: u8 = 0x0A;
    /// UDS DiagnosticSessionControl
    pub const SESSION_CONTROL: u8 = 0x10;
    /// UDS ECUReset
    pub const ECU_RESET: u8 = 0x11;
    /// UDS ClearDiagnosticInformation
    pub const CLEAR_DTC: u8 = 0x14;
    /// KWP2000 ReadDTCByStatus
    pub const OBDII_18: u8 = 0x18;
    /// UDS ReadDTCInformation
    pub const READ_DTC: u8 = 0x19;
    /// KWP2000 ReadDataByLocalIdentifier (8 bit)
    pub const READ_LOCAL_ID: u8 = 0x21;
    /// UDS ReadDataByIdentifier
    pub const READ_DATA: u8 = 0x22;
    /// UDS ReadMemoryByAddress
    pub const READ_MEMORY: u8 = 0x23;
    /// UDS ReadScalingDataByIdentifier
    pub const READ_SCALING: u8 = 0x24;
    /// UDS SecurityAccess
    pub const SECURITY_ACCESS: u8 = 0x27;
    /// UDS WriteDataByIdentifier
    pub const WRITE_DATA: u8 = 0x2E;
    /// UDS InputOutputControlByIdentifier
    pub const IO_CONTROL: u8 = 0x2F;
    /// UDS RoutineControl
    pub const ROUTINE_CONTROL: u8 = 0x31;
    /// UDS TesterPresent
    pub const TESTER_PRESENT: u8 = 0x3E;
}

/// Width of the PID echoed in responses to a service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidWidth {
    None,
    Byte,
    Word,
}

impl PidWidth {
    /// PID width for a request service type
    pub fn of(service: u8) -> Self {
        use service_type::*;
        match service {
            READ_DATA | READ_SCALING | WRITE_DATA | IO_CONTROL | READ_OXS_TEST => Self::Word,
            CLEAR_ERDTC | CLEAR_DTC | READ_MEMORY | READ_ERDTC | READ_DCERDTC | READ_PERMDTC
            | OBDII_18 => Self::None,
            _ => Self::Byte,
        }
    }

    /// Number of PID bytes on the wire
    pub fn len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Byte => 1,
            Self::Word => 2,
        }
    }

    /// Write `pid` into the start of `buf`, returning the bytes used
    pub fn encode(self, pid: u16, buf: &mut [u8]) -> usize {
        match self {
            Self::None => 0,
            Self::Byte => {
                buf[0] = (pid & 0xff) as u8;
                1
            }
            Self::Word => {
                buf[0] = (pid >> 8) as u8;
                buf[1] = (pid & 0xff) as u8;
                2
            }
        }
    }
}

/// Encode the request header `<service> [pid]` followed by `data`
pub fn encode_request(service: u8, pid: u16, data: &[u8]) -> Vec<u8> {
    let width = PidWidth::of(service);
    let mut out = vec![0u8; 1 + width.len()];
    out[0] = service;
    width.encode(pid, &mut out[1..]);
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(service_type::READ_DATA, PidWidth::Word)]
    #[case(service_type::IO_CONTROL, PidWidth::Word)]
    #[case(service_type::READ_OXS_TEST, PidWidth::Word)]
    #[case(service_type::OBDII_CURRENT, PidWidth::Byte)]
    #[case(service_type::READ_LOCAL_ID, PidWidth::Byte)]
    #[case(service_type::SESSION_CONTROL, PidWidth::Byte)]
    #[case(service_type::CLEAR_DTC, PidWidth::None)]
    #[case(service_type::READ_MEMORY, PidWidth::None)]
    #[case(service_type::READ_PERMDTC, PidWidth::None)]
    fn test_pid_width(#[case] service: u8, #[case] width: PidWidth) {
        assert_eq!(PidWidth::of(service), width);
    }

    #[test]
    fn test_encode_request() {
        assert_eq!(encode_request(0x22, 0xF190, &[]), vec![0x22, 0xF1, 0x90]);
        assert_eq!(encode_request(0x01, 0x0C, &[]), vec![0x01, 0x0C]);
        assert_eq!(
            encode_request(0x14, 0, &[0xFF, 0xFF, 0xFF]),
            vec![0x14, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            encode_request(0x2E, 0x1234, &[0xAA]),
            vec![0x2E, 0x12, 0x34, 0xAA]
        );
    }
}
