//! CAN frame and bus number types

use std::fmt;

use serde::{Deserialize, Serialize};

use super::BusError;

/// Filler byte for unused data bytes of transmitted frames
pub const FRAME_PADDING: u8 = 0x55;

/// CAN bus number (1..=4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct BusId(u8);

impl BusId {
    /// Highest supported bus number
    pub const MAX: u8 = 4;

    pub fn new(number: u8) -> Option<Self> {
        (1..=Self::MAX).contains(&number).then_some(Self(number))
    }

    pub fn number(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for BusId {
    type Error = BusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value).ok_or(BusError::InvalidBus(value))
    }
}

impl From<BusId> for u8 {
    fn from(id: BusId) -> Self {
        id.0
    }
}

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "can{}", self.0)
    }
}

/// A classic CAN frame (up to 8 data bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    /// Bus the frame was received on / is to be sent on
    pub bus: BusId,
    /// 11 or 29 bit identifier
    pub id: u32,
    /// 29 bit identifier flag
    pub extended: bool,
    /// Data length code (0..=8)
    pub dlc: u8,
    pub data: [u8; 8],
}

impl CanFrame {
    /// Create a frame carrying `data` (truncated to 8 bytes)
    pub fn new(bus: BusId, id: u32, extended: bool, data: &[u8]) -> Self {
        let len = data.len().min(8);
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&data[..len]);
        Self {
            bus,
            id,
            extended,
            dlc: len as u8,
            data: buf,
        }
    }

    /// Create a full length frame with all data bytes set to the padding value
    pub fn padded(bus: BusId, id: u32, extended: bool) -> Self {
        Self {
            bus,
            id,
            extended,
            dlc: 8,
            data: [FRAME_PADDING; 8],
        }
    }

    /// Data bytes covered by the DLC
    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.dlc.min(8))]
    }

    /// Hex dump of the payload for log output
    pub fn hex(&self) -> String {
        hex::encode(self.payload())
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extended {
            write!(f, "{} {:08X} [{}] {}", self.bus, self.id, self.dlc, self.hex())
        } else {
            write!(f, "{} {:03X} [{}] {}", self.bus, self.id, self.dlc, self.hex())
        }
    }
}
