//! vehicle-poller - OBD-II/UDS diagnostic poller over CAN
//!
//! Periodically polls a list of PIDs from vehicle ECUs and hands the
//! reassembled responses to a vehicle specific [`ResponseSink`]. Requests
//! travel over ISO-TP (ISO 15765-2, standard/extended addressing, 11/29 bit
//! ids) or VW TP 2.0. One-off requests can be interleaved with the periodic
//! list through [`PollerHandle::poll_single_request`].
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        PollerRuntime                           │
//! │  one task, command queue fed by PollerHandle clones            │
//! │                                                               │
//! │  ┌─────────────────────────┐   ┌─────────────────────────┐    │
//! │  │ PollerEngine (can1)     │   │ PollerEngine (can2)     │    │
//! │  │ ┌─────────────────────┐ │   │                         │    │
//! │  │ │ PollScheduler       │ │   │          ...            │    │
//! │  │ │ (list, ticker)      │ │   │                         │    │
//! │  │ └──────────┬──────────┘ │   └─────────────────────────┘    │
//! │  │      ┌─────┴─────┐      │                                  │
//! │  │   ISO-TP      VW TP 2.0 │                                  │
//! │  │      └─────┬─────┘      │                                  │
//! │  │        PollJob          │                                  │
//! │  └───────┬─────────┬───────┘                                  │
//! │          │         │                                          │
//! │       CanBus   ResponseSink                                    │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vehicle_poller::{BusId, MockBus, PollEntry, PollerConfig, PollerRuntime, NullSink};
//!
//! let (mut runtime, handle) = PollerRuntime::new(PollerConfig::default(), Arc::new(NullSink))?;
//! let can1 = BusId::new(1).unwrap();
//! runtime.add_bus(can1, Arc::new(MockBus::default()));
//! runtime.spawn();
//!
//! let list = vec![PollEntry::new(0x7E0, 0x7E8, 0x22, 0xF40C).with_intervals([0, 10, 2, 0])];
//! handle.set_pid_list(list, can1).await?;
//! handle.set_state(1, None).await?;
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod poll;
pub mod pollers;
pub mod sink;
pub mod testing;
pub mod uds;

mod engine;
mod isotp;
mod scheduler;
mod vwtp;

pub use bus::{BusError, BusId, CanBus, CanFrame, MockBus};
pub use config::{PollerConfig, SequencePolicy};
pub use engine::{PollerEngine, PollerStatus, TickKind, SINGLE_INTERVAL};
pub use error::{poll_result_code_name, ConfigError, PollSingleError, PollerError};
pub use isotp::{separation_delay, IsoTpFrame, ISOTP_MAX_LEN};
pub use poll::{PollEntry, PollJob, PollList, PollPayload, Protocol};
pub use pollers::{PollerHandle, PollerRuntime};
pub use scheduler::TICKER_WRAP;
pub use sink::{NullSink, PollFailure, ResponseSink};
pub use uds::NegativeResponseCode;
pub use vwtp::{decode_timing, VwtpState};
