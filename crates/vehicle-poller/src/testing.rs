//! Test utilities
//!
//! A recording [`ResponseSink`] and builders for ECU side frames, used by
//! the crate's own tests and by sinks written against the poller.

use parking_lot::Mutex;

use crate::bus::{BusId, CanFrame, FRAME_PADDING};
use crate::poll::PollJob;
use crate::sink::{PollFailure, ResponseSink};

/// One sink callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Reply {
        module_id: u32,
        service_type: u8,
        pid: u16,
        offset: u16,
        data: Vec<u8>,
        remain: u16,
    },
    Error {
        module_id: u32,
        service_type: u8,
        pid: u16,
        failure: PollFailure,
    },
    TxResult {
        tx_id: u32,
        service_type: u8,
        pid: u16,
        success: bool,
    },
}

/// Per-bus scheduling callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSignal {
    RunFinished(BusId),
    StateTicker(BusId),
}

/// Sink recording every callback in order
///
/// Poll callbacks and bus signals are kept apart so tests on one are not
/// disturbed by the other.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    signals: Mutex<Vec<BusSignal>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all events recorded since the last call
    pub fn take(&self) -> Vec<SinkEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    /// Take all bus signals recorded since the last call
    pub fn take_signals(&self) -> Vec<BusSignal> {
        std::mem::take(&mut *self.signals.lock())
    }

    /// Reply and error events only
    pub fn results(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| !matches!(e, SinkEvent::TxResult { .. }))
            .cloned()
            .collect()
    }

    /// Concatenated reply payload
    pub fn reply_data(&self) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Reply { data, .. } => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }
}

impl ResponseSink for RecordingSink {
    fn on_poll_reply(&self, job: &PollJob, data: &[u8], remain: u16) {
        self.events.lock().push(SinkEvent::Reply {
            module_id: job.module_id_rec,
            service_type: job.service_type,
            pid: job.pid,
            offset: job.ml_offset,
            data: data.to_vec(),
            remain,
        });
    }

    fn on_poll_error(&self, job: &PollJob, failure: PollFailure) {
        self.events.lock().push(SinkEvent::Error {
            module_id: job.module_id_rec,
            service_type: job.service_type,
            pid: job.pid,
            failure,
        });
    }

    fn on_poll_tx_result(&self, job: &PollJob, success: bool) {
        self.events.lock().push(SinkEvent::TxResult {
            tx_id: job.tx_msg_id,
            service_type: job.service_type,
            pid: job.pid,
            success,
        });
    }

    fn on_poll_run_finished(&self, bus: BusId) {
        self.signals.lock().push(BusSignal::RunFinished(bus));
    }

    fn on_poll_state_ticker(&self, bus: BusId) {
        self.signals.lock().push(BusSignal::StateTicker(bus));
    }
}

/// 8 byte frame with `data` followed by padding
pub fn padded_frame(bus: BusId, id: u32, data: &[u8]) -> CanFrame {
    let mut frame = CanFrame::padded(bus, id, id > 0x7FF);
    let len = data.len().min(8);
    frame.data[..len].copy_from_slice(&data[..len]);
    frame
}

/// ISO-TP single frame carrying `payload`
pub fn isotp_single(bus: BusId, id: u32, payload: &[u8]) -> CanFrame {
    let mut data = vec![payload.len() as u8 & 0x0f];
    data.extend_from_slice(payload);
    padded_frame(bus, id, &data)
}

/// ISO-TP first frame announcing `total_len` bytes
pub fn isotp_first(bus: BusId, id: u32, total_len: u16, payload: &[u8]) -> CanFrame {
    let mut data = vec![0x10 | ((total_len >> 8) & 0x0f) as u8, (total_len & 0xff) as u8];
    data.extend_from_slice(payload);
    padded_frame(bus, id, &data)
}

/// ISO-TP consecutive frame with sequence `index`
pub fn isotp_consecutive(bus: BusId, id: u32, index: u8, payload: &[u8]) -> CanFrame {
    let mut data = vec![0x20 | (index & 0x0f)];
    data.extend_from_slice(payload);
    padded_frame(bus, id, &data)
}

/// ISO-TP flow control frame
pub fn isotp_flow_control(bus: BusId, id: u32, command: u8, block_size: u8, septime: u8) -> CanFrame {
    padded_frame(bus, id, &[0x30 | (command & 0x0f), block_size, septime])
}

/// Unpadded 11 bit frame as used by VW TP 2.0
pub fn vwtp_frame(bus: BusId, id: u32, data: &[u8]) -> CanFrame {
    CanFrame::new(bus, id, false, data)
}

/// Data bytes of `frame` with trailing padding removed
pub fn unpadded(frame: &CanFrame) -> Vec<u8> {
    let payload = frame.payload();
    let end = payload
        .iter()
        .rposition(|&b| b != FRAME_PADDING)
        .map_or(0, |i| i + 1);
    payload[..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_frame_builders() {
        let bus = BusId::new(1).unwrap();
        let sf = isotp_single(bus, 0x7E8, &[0x62, 0x12, 0x34]);
        assert_eq!(sf.data, [0x03, 0x62, 0x12, 0x34, 0x55, 0x55, 0x55, 0x55]);
        assert!(!sf.extended);

        let ff = isotp_first(bus, 0x18DAF110, 20, &[0x62, 0x12, 0x34, 1, 2, 3]);
        assert_eq!(ff.data, [0x10, 0x14, 0x62, 0x12, 0x34, 1, 2, 3]);
        assert!(ff.extended);

        let fc = isotp_flow_control(bus, 0x7E8, 0, 2, 10);
        assert_eq!(unpadded(&fc), vec![0x30, 0x02, 0x0A]);

        let vw = vwtp_frame(bus, 0x300, &[0xB1]);
        assert_eq!(vw.dlc, 1);
    }
}
