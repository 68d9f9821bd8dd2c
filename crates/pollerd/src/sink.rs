//! Response sink logging complete poll responses

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use vehicle_poller::{PollFailure, PollJob, ResponseSink};

/// Collects the frames of each response and logs it once complete
#[derive(Default)]
pub struct LogSink {
    /// Partial responses by (bus, responding module, service, PID)
    partial: Mutex<HashMap<(u8, u32, u8, u16), Vec<u8>>>,
}

impl LogSink {
    fn key(job: &PollJob) -> (u8, u32, u8, u16) {
        (job.bus.number(), job.module_id_rec, job.service_type, job.pid)
    }
}

impl ResponseSink for LogSink {
    fn on_poll_reply(&self, job: &PollJob, data: &[u8], remain: u16) {
        let key = Self::key(job);
        let mut partial = self.partial.lock();

        // a new response restarts collection
        if job.ml_offset == 0 {
            partial.remove(&key);
        }
        let buffer = partial.entry(key).or_default();
        buffer.extend_from_slice(data);
        if remain > 0 {
            return;
        }

        if let Some(response) = partial.remove(&key) {
            info!(
                bus = %job.bus,
                module = format!("0x{:X}", job.module_id_rec),
                service = format!("0x{:02X}", job.service_type),
                pid = format!("0x{:X}", job.pid),
                len = response.len(),
                data = %hex::encode(&response),
                "Poll response"
            );
        }
    }

    fn on_poll_error(&self, job: &PollJob, failure: PollFailure) {
        self.partial.lock().remove(&Self::key(job));
        warn!(
            bus = %job.bus,
            module = format!("0x{:X}", job.module_id_rec),
            service = format!("0x{:02X}", job.service_type),
            pid = format!("0x{:X}", job.pid),
            %failure,
            "Poll failed"
        );
    }

    fn on_poll_tx_result(&self, job: &PollJob, success: bool) {
        if !success {
            debug!(bus = %job.bus, tx_id = format!("0x{:X}", job.tx_msg_id), "Poll request not sent");
        }
    }
}
