//! Poll list entry

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::POLL_STATES;

/// Max payload bytes stored inline in an entry
pub const INLINE_PAYLOAD_MAX: usize = 6;

/// Transport protocol variant of a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// ISO-TP with 11 bit identifiers
    #[default]
    IsoTp,
    /// ISO-TP extended addressing: 19 bit module id, low byte in data[0]
    IsoTpExtAddr,
    /// ISO-TP with 29 bit identifiers
    IsoTpExtFrame,
    /// VW TP 2.0 channel protocol
    Vwtp20,
}

impl Protocol {
    /// Numeric protocol code (0, 1, 2, 20)
    pub fn code(self) -> u8 {
        match self {
            Self::IsoTp => 0,
            Self::IsoTpExtAddr => 1,
            Self::IsoTpExtFrame => 2,
            Self::Vwtp20 => 20,
        }
    }

    pub fn is_isotp(self) -> bool {
        !matches!(self, Self::Vwtp20)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IsoTp => write!(f, "ISOTP-STD"),
            Self::IsoTpExtAddr => write!(f, "ISOTP-EXTADR"),
            Self::IsoTpExtFrame => write!(f, "ISOTP-EXTFRAME"),
            Self::Vwtp20 => write!(f, "VWTP-20"),
        }
    }
}

/// Request payload following service type and PID
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollPayload {
    /// Short payload stored in the entry itself
    Inline {
        len: u8,
        data: [u8; INLINE_PAYLOAD_MAX],
    },
    /// Longer payload (up to 4095 bytes) held by reference
    External(Bytes),
}

impl PollPayload {
    pub fn empty() -> Self {
        Self::Inline {
            len: 0,
            data: [0; INLINE_PAYLOAD_MAX],
        }
    }

    /// Store `data` inline if it fits, otherwise as a shared buffer
    pub fn from_slice(data: &[u8]) -> Self {
        if data.len() <= INLINE_PAYLOAD_MAX {
            let mut buf = [0; INLINE_PAYLOAD_MAX];
            buf[..data.len()].copy_from_slice(data);
            Self::Inline {
                len: data.len() as u8,
                data: buf,
            }
        } else {
            Self::External(Bytes::copy_from_slice(data))
        }
    }

    /// Reference a static payload without copying
    pub fn from_static(data: &'static [u8]) -> Self {
        Self::External(Bytes::from_static(data))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Inline { len, data } => &data[..usize::from(*len)],
            Self::External(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PollPayload {
    fn default() -> Self {
        Self::empty()
    }
}

/// One row of the periodic poll table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollEntry {
    /// Request id (VWTP: channel base id). `0` terminates a list.
    pub tx_module_id: u32,
    /// Response id, `0` = OBD broadcast (VWTP: logical module id)
    pub rx_module_id: u32,
    pub service_type: u8,
    pub pid: u16,
    pub payload: PollPayload,
    /// Poll interval in ticks per poll state, `0` = not polled in that state
    pub intervals: [u16; POLL_STATES],
    /// Bus number, `0` = default bus of the list
    pub bus: u8,
    pub protocol: Protocol,
}

impl PollEntry {
    pub fn new(tx_module_id: u32, rx_module_id: u32, service_type: u8, pid: u16) -> Self {
        Self {
            tx_module_id,
            rx_module_id,
            service_type,
            pid,
            payload: PollPayload::empty(),
            intervals: [0; POLL_STATES],
            bus: 0,
            protocol: Protocol::IsoTp,
        }
    }

    pub fn with_intervals(mut self, intervals: [u16; POLL_STATES]) -> Self {
        self.intervals = intervals;
        self
    }

    pub fn with_payload(mut self, payload: PollPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn on_bus(mut self, bus: u8) -> Self {
        self.bus = bus;
        self
    }

    /// List terminator (`tx_module_id == 0`)
    pub fn is_terminator(&self) -> bool {
        self.tx_module_id == 0
    }

    /// Whether the entry is due in `state` at `ticker`
    pub fn is_due(&self, state: u8, ticker: u32) -> bool {
        match self.intervals.get(usize::from(state)) {
            Some(&interval) if interval > 0 => ticker % u32::from(interval) == 0,
            _ => false,
        }
    }
}

/// Shared, immutable poll list
pub type PollList = Arc<[PollEntry]>;
