//! Poll list entries and in-flight job state

mod entry;
mod job;

pub use entry::{PollEntry, PollList, PollPayload, Protocol, INLINE_PAYLOAD_MAX};
pub use job::PollJob;

/// Number of poll states (per-state interval slots in every entry)
pub const POLL_STATES: usize = 4;

/// OBD-II functional broadcast request id
pub const BROADCAST_TX_ID: u32 = 0x7DF;

/// Response id range accepted for broadcast requests
pub const BROADCAST_RX_RANGE: (u32, u32) = (0x7E8, 0x7EF);
