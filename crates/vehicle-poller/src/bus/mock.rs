//! Mock CAN bus for testing

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{BusError, CanBus, CanFrame};
use crate::config::MockBusConfig;

/// Mock bus recording every written frame
pub struct MockBus {
    name: String,
    online: AtomicBool,
    written: Mutex<Vec<CanFrame>>,
}

impl MockBus {
    pub fn new(config: &MockBusConfig) -> Self {
        Self {
            name: config.name.clone(),
            online: AtomicBool::new(true),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Take all frames written since the last call
    pub fn take_written(&self) -> Vec<CanFrame> {
        std::mem::take(&mut *self.written.lock())
    }

    /// Frames written since the last [`take_written`](Self::take_written)
    pub fn written(&self) -> Vec<CanFrame> {
        self.written.lock().clone()
    }

    /// Simulate the bus going offline (all writes fail)
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new(&MockBusConfig::default())
    }
}

impl CanBus for MockBus {
    fn write(&self, frame: &CanFrame) -> Result<(), BusError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BusError::Offline);
        }
        tracing::trace!(%frame, "Mock bus: frame written");
        self.written.lock().push(*frame);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
