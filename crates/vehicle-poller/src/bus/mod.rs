//! CAN bus abstraction
//!
//! The poller only needs a way to put frames on a bus. Reception is driven
//! from outside: whoever reads the bus feeds frames into the poller through
//! [`PollerHandle::frame_received`](crate::PollerHandle::frame_received).
//!
//! # Example
//!
//! ```ignore
//! use vehicle_poller::bus::{create_bus, BusId};
//! use vehicle_poller::config::BusKind;
//!
//! let bus = create_bus(&BusKind::Mock(Default::default()))?;
//! runtime.add_bus(BusId::new(1).unwrap(), bus);
//! ```

mod error;
mod frame;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use error::BusError;
pub use frame::{BusId, CanFrame, FRAME_PADDING};
pub use mock::MockBus;

use std::sync::Arc;

use crate::config::BusKind;

/// Transmit side of a CAN interface
pub trait CanBus: Send + Sync {
    /// Queue a frame for transmission
    ///
    /// # Returns
    /// `Ok` if the frame was accepted by the driver. A rejected frame is
    /// handled by the poller as a failed transmission.
    fn write(&self, frame: &CanFrame) -> Result<(), BusError>;

    /// Whether the driver reports transmit completion later on
    ///
    /// Drivers returning `true` must call
    /// [`PollerHandle::tx_complete`](crate::PollerHandle::tx_complete) exactly
    /// once per accepted frame. For all other drivers an accepted write counts
    /// as a completed transmission.
    fn reports_tx_completion(&self) -> bool {
        false
    }

    /// Interface name for log output
    fn name(&self) -> &str;
}

/// Create a bus from configuration
pub fn create_bus(kind: &BusKind) -> Result<Arc<dyn CanBus>, BusError> {
    match kind {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        BusKind::SocketCan(config) => {
            let bus = socketcan::SocketCanBus::open(&config.interface)?;
            Ok(Arc::new(bus))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        BusKind::SocketCan(_) => Err(BusError::Unsupported(
            "SocketCAN is only available on Linux with the 'socketcan' feature".to_string(),
        )),
        BusKind::Mock(config) => Ok(Arc::new(MockBus::new(config))),
    }
}
