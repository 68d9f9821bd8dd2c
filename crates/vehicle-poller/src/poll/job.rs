//! In-flight request context

use super::{PollEntry, Protocol};
use crate::bus::BusId;

/// State of the request currently in flight on one bus
///
/// `ml_remain > 0` means more response frames are expected; the engine
/// keeps its wait counter armed until they arrive or time out.
#[derive(Debug, Clone)]
pub struct PollJob {
    pub bus: BusId,
    pub protocol: Protocol,
    pub service_type: u8,
    pub pid: u16,
    /// Id the request was sent to
    pub module_id_sent: u32,
    /// Accepted response id range
    pub module_id_low: u32,
    pub module_id_high: u32,
    /// Id the current response came from
    pub module_id_rec: u32,
    /// Response frame counter
    pub ml_frame: u16,
    /// Response payload offset of the current frame
    pub ml_offset: u16,
    /// Response bytes still expected
    pub ml_remain: u16,
    /// Copy of the entry being polled
    pub entry: Option<PollEntry>,
    /// Scheduler ticker at dispatch
    pub ticker: u32,
    /// Id of the last frame transmitted for this job
    pub tx_msg_id: u32,
}

impl PollJob {
    pub fn new(bus: BusId) -> Self {
        Self {
            bus,
            protocol: Protocol::IsoTp,
            service_type: 0,
            pid: 0,
            module_id_sent: 0,
            module_id_low: 0,
            module_id_high: 0,
            module_id_rec: 0,
            ml_frame: 0,
            ml_offset: 0,
            ml_remain: 0,
            entry: None,
            ticker: 0,
            tx_msg_id: 0,
        }
    }

    /// Start a fresh job for `entry`
    pub fn start(&mut self, entry: &PollEntry, ticker: u32) {
        self.protocol = entry.protocol;
        self.service_type = entry.service_type;
        self.pid = entry.pid;
        self.entry = Some(entry.clone());
        self.ticker = ticker;
        self.module_id_rec = 0;
        self.reset_multiframe();
    }

    pub fn reset_multiframe(&mut self) {
        self.ml_frame = 0;
        self.ml_offset = 0;
        self.ml_remain = 0;
    }

    /// Whether `id` is in the accepted response range
    pub fn accepts(&self, id: u32) -> bool {
        id >= self.module_id_low && id <= self.module_id_high
    }

    /// Broadcast request (responses from any OBD module)
    pub fn is_broadcast(&self) -> bool {
        self.module_id_sent == super::BROADCAST_TX_ID
    }
}
