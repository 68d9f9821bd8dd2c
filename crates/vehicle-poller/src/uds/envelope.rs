//! Response envelope parsing

use super::{NegativeResponseCode, PidWidth, NEGATIVE_RESPONSE, POSITIVE_RESPONSE_OFFSET};

/// First (or only) segment of an OBD/UDS response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Envelope<'a> {
    /// `7F <service> <code>`
    Negative {
        service: u8,
        code: NegativeResponseCode,
    },
    /// `<service + 0x40> [pid] [data...]`
    Positive {
        response_type: u8,
        pid: u16,
        data: &'a [u8],
    },
}

impl<'a> Envelope<'a> {
    /// Parse the leading segment of a response
    ///
    /// Services without a PID in their responses report `request_pid` so
    /// that matching always compares like with like. Returns `None` for
    /// segments too short to hold the header.
    pub fn parse(segment: &'a [u8], request_pid: u16) -> Option<Self> {
        let response_type = *segment.first()?;

        if response_type == NEGATIVE_RESPONSE {
            if segment.len() < 3 {
                return None;
            }
            return Some(Self::Negative {
                service: segment[1],
                code: NegativeResponseCode::from(segment[2]),
            });
        }

        let width = PidWidth::of(response_type.wrapping_sub(POSITIVE_RESPONSE_OFFSET));
        let header = 1 + width.len();
        if segment.len() < header {
            return None;
        }
        let pid = match width {
            PidWidth::None => request_pid,
            PidWidth::Byte => u16::from(segment[1]),
            PidWidth::Word => u16::from(segment[1]) << 8 | u16::from(segment[2]),
        };

        Some(Self::Positive {
            response_type,
            pid,
            data: &segment[header..],
        })
    }

    /// Number of envelope header bytes preceding the payload
    pub fn header_len(&self) -> usize {
        match self {
            Self::Negative { .. } => 3,
            Self::Positive { response_type, .. } => {
                1 + PidWidth::of(response_type.wrapping_sub(POSITIVE_RESPONSE_OFFSET)).len()
            }
        }
    }

    /// Positive response to `service` / `pid`
    pub fn answers(&self, service: u8, pid: u16) -> bool {
        matches!(self, Self::Positive { response_type, pid: p, .. }
            if *response_type == service.wrapping_add(POSITIVE_RESPONSE_OFFSET) && *p == pid)
    }
}
