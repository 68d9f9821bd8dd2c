//! Response delivery to the vehicle specific interpreter

use std::fmt;

use crate::bus::BusId;
use crate::poll::PollJob;
use crate::uds::NegativeResponseCode;

/// Outcome of a poll that did not produce a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollFailure {
    /// The ECU answered with a negative response
    Negative(NegativeResponseCode),
    /// A request frame could not be transmitted
    TransmitFailed,
    /// The transport channel went away and no response will follow
    ChannelClosed,
}

impl fmt::Display for PollFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negative(nrc) => write!(f, "negative response {}", nrc),
            Self::TransmitFailed => write!(f, "transmit failure"),
            Self::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

/// Receiver of poll results
///
/// Callbacks run on the poller task. They must not block; hand work off to
/// another task if interpretation is expensive.
pub trait ResponseSink: Send + Sync {
    /// One frame's worth of response payload
    ///
    /// # Arguments
    /// * `job` - The poll the data belongs to (`ml_frame` / `ml_offset`
    ///   locate the chunk within the response)
    /// * `data` - Payload bytes of this frame, envelope header stripped
    /// * `remain` - Response bytes still to come, `0` on the last call
    fn on_poll_reply(&self, job: &PollJob, data: &[u8], remain: u16);

    /// Negative response or transport failure for a poll
    fn on_poll_error(&self, job: &PollJob, failure: PollFailure) {
        let _ = (job, failure);
    }

    /// Transmission result for every frame sent on behalf of a poll
    fn on_poll_tx_result(&self, job: &PollJob, success: bool) {
        let _ = (job, success);
    }

    /// Every due entry of the poll list on `bus` has been sent in this pass
    fn on_poll_run_finished(&self, bus: BusId) {
        let _ = bus;
    }

    /// Primary tick on `bus`, before anything is sent
    fn on_poll_state_ticker(&self, bus: BusId) {
        let _ = bus;
    }
}

/// Sink discarding everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ResponseSink for NullSink {
    fn on_poll_reply(&self, _job: &PollJob, _data: &[u8], _remain: u16) {}
}
