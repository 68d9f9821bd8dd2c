//! SocketCAN raw frame bus (Linux only)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socketcan::{CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BusError, BusId, CanBus, CanFrame};
use crate::pollers::PollerHandle;

/// Raw CAN socket bus
pub struct SocketCanBus {
    interface: String,
    socket: Mutex<CanSocket>,
    running: Arc<AtomicBool>,
}

impl SocketCanBus {
    /// Open a raw CAN socket on `interface` (e.g. "can0", "vcan0")
    pub fn open(interface: &str) -> Result<Self, BusError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            BusError::OpenFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                interface, e
            ))
        })?;

        info!(interface = %interface, "SocketCAN bus opened");

        Ok(Self {
            interface: interface.to_string(),
            socket: Mutex::new(socket),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Start forwarding received frames into the poller
    ///
    /// Uses a second socket on the same interface so reads never contend
    /// with writes.
    pub fn spawn_reader(&self, bus: BusId, handle: PollerHandle) -> Result<JoinHandle<()>, BusError> {
        let socket = CanSocket::open(&self.interface).map_err(|e| {
            BusError::OpenFailed(format!("Failed to open reader socket: {}", e))
        })?;
        socket
            .set_nonblocking(true)
            .map_err(|e| BusError::OpenFailed(format!("Failed to set non-blocking: {}", e)))?;

        let running = self.running.clone();
        let interface = self.interface.clone();

        Ok(tokio::task::spawn_blocking(move || {
            debug!(interface = %interface, %bus, "SocketCAN reader started");
            while running.load(Ordering::SeqCst) {
                match socket.read_frame() {
                    Ok(socketcan::CanFrame::Data(frame)) => {
                        let received =
                            CanFrame::new(bus, frame.raw_id(), frame.is_extended(), frame.data());
                        if handle.blocking_frame_received(received).is_err() {
                            debug!(interface = %interface, "Poller stopped, reader exiting");
                            break;
                        }
                    }
                    Ok(_) => {
                        // Remote and error frames carry nothing for the poller
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        error!(?e, interface = %interface, "Socket read error");
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            debug!(interface = %interface, "SocketCAN reader stopped");
        }))
    }
}

impl CanBus for SocketCanBus {
    fn write(&self, frame: &CanFrame) -> Result<(), BusError> {
        let out = if frame.extended {
            let id = ExtendedId::new(frame.id)
                .ok_or_else(|| BusError::InvalidId(format!("0x{:08X}", frame.id)))?;
            socketcan::CanFrame::new(id, frame.payload())
        } else {
            let id = u16::try_from(frame.id)
                .ok()
                .and_then(StandardId::new)
                .ok_or_else(|| BusError::InvalidId(format!("0x{:03X}", frame.id)))?;
            socketcan::CanFrame::new(id, frame.payload())
        }
        .ok_or_else(|| BusError::WriteFailed(format!("Invalid frame: {}", frame)))?;

        self.socket.lock().write_frame(&out).map_err(|e| {
            warn!(?e, interface = %self.interface, "CAN write failed");
            BusError::WriteFailed(e.to_string())
        })
    }

    fn name(&self) -> &str {
        &self.interface
    }
}

impl Drop for SocketCanBus {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
