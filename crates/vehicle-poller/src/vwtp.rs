//! VW TP 2.0 channel transport
//!
//! TP 2.0 is connection oriented: a channel to a logical module is opened
//! through the base id, parameters are negotiated, then requests and
//! responses travel as sequence numbered data frames acknowledged per
//! block. The channel stays open between polls and is closed on
//! inactivity, on timeouts or when a poll targets a different module.
//!
//! ```text
//!   Closed ──setup──▶ ChannelSetup ──D0──▶ ChannelParams ──A1──▶ StartPoll
//!     ▲                   │ D1..D8                                   │
//!     │                   ▼                                          ▼
//!     └──────────────── Closed          Idle ◀──complete── Receive ◀── Transmit
//!                                         │                          ▲   │ B_
//!                                         └──────── next poll ───────┘   └─▶ next block
//! ```
//!
//! Opcodes (high nibble of byte 0 unless noted):
//!
//! | Opcode | Meaning |
//! |--------|---------|
//! | `C0` (byte 1) | Channel setup request |
//! | `D0`..`D8` (byte 1) | Setup response, `D0` = accepted |
//! | `A0` / `A1` | Parameter request / response |
//! | `A3` | Channel test (ping) |
//! | `A8` | Disconnect |
//! | `0_` / `1_` | Data, ACK expected (`1_` = last frame) |
//! | `2_` / `3_` | Data, no ACK expected (`3_` = last frame) |
//! | `9_` / `B_` | ACK, not ready / ready for next block |

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::bus::CanFrame;
use crate::engine::PollerEngine;
use crate::isotp::ISOTP_MAX_LEN;
use crate::poll::Protocol;
use crate::sink::PollFailure;
use crate::uds::{encode_request, Envelope};

const OP_SETUP_REQUEST: u8 = 0xC0;
const OP_SETUP_ACCEPT: u8 = 0xD0;
const OP_SETUP_REJECT_MAX: u8 = 0xD8;
const OP_PARAMS_REQUEST: u8 = 0xA0;
const OP_PARAMS_RESPONSE: u8 = 0xA1;
const OP_PING: u8 = 0xA3;
const OP_DISCONNECT: u8 = 0xA8;

const DATA_WAIT_ACK: u8 = 0x00;
const DATA_LAST_WAIT_ACK: u8 = 0x10;
const DATA_NO_ACK: u8 = 0x20;
const DATA_LAST_NO_ACK: u8 = 0x30;
const ACK_NOT_READY: u8 = 0x90;
const ACK_READY: u8 = 0xB0;

/// Parameters we offer: block size 15, ACK timeout 100 ms, 1 ms separation
const CHANNEL_PARAMS: [u8; 5] = [0x0F, 0x8A, 0xFF, 0x0A, 0xFF];

/// Minimum time before a pending wait may time out
const WAIT_GRACE: Duration = Duration::from_millis(200);

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum VwtpState {
    #[default]
    Closed,
    ChannelClose,
    ChannelSetup,
    ChannelParams,
    Idle,
    StartPoll,
    Transmit,
    Receive,
    AbortXfer,
}

impl fmt::Display for VwtpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::ChannelClose => "closing",
            Self::ChannelSetup => "setup",
            Self::ChannelParams => "params",
            Self::Idle => "idle",
            Self::StartPoll => "start-poll",
            Self::Transmit => "transmit",
            Self::Receive => "receive",
            Self::AbortXfer => "abort",
        };
        f.write_str(name)
    }
}

/// Open (or opening) channel
#[derive(Debug, Clone, Default)]
pub(crate) struct VwtpChannel {
    pub state: VwtpState,
    /// Channel belongs to this bus; cleared when the module rejects setup
    pub bound: bool,
    pub base_id: u32,
    pub module_id: u32,
    pub tx_id: u32,
    pub rx_id: u32,
    /// Frames per block before an ACK is expected
    pub block_size: u8,
    pub ack_time: Duration,
    pub sep_time: Duration,
    pub tx_seq: u8,
    pub rx_seq: u8,
    pub last_used: Option<Instant>,
}

impl VwtpChannel {
    fn touch(&mut self) {
        self.last_used = Some(Instant::now());
    }

    /// Time since the channel was last used, `None` if never
    fn idle_time(&self) -> Option<Duration> {
        self.last_used.map(|t| t.elapsed())
    }
}

/// Decode a TP 2.0 timing parameter byte
///
/// Bits 6-7 select the unit (0.1 ms, 1 ms, 10 ms, 100 ms), bits 0-5 the count.
pub fn decode_timing(value: u8) -> Duration {
    const UNIT_US: [u64; 4] = [100, 1_000, 10_000, 100_000];
    Duration::from_micros(u64::from(value & 0x3f) * UNIT_US[usize::from(value >> 6)])
}

impl PollerEngine {
    fn vwtp_frame(&self, data: &[u8]) -> CanFrame {
        CanFrame::new(self.bus_id, self.vwtp.tx_id, false, data)
    }

    /// Point the job at the channel ids
    fn vwtp_expect(&mut self) {
        if self.job.protocol != Protocol::Vwtp20 {
            return;
        }
        self.job.tx_msg_id = self.vwtp.tx_id;
        self.job.module_id_sent = self.vwtp.tx_id;
        self.job.module_id_low = self.vwtp.rx_id;
        self.job.module_id_high = self.vwtp.rx_id;
    }

    /// Drop the channel after a transmit failure
    pub(crate) fn vwtp_reset(&mut self) {
        debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP channel lost");
        self.vwtp = Default::default();
        self.wait = 0;
    }

    /// Start the current job on a (possibly new) channel
    pub(crate) async fn vwtp_start(&mut self) {
        let Some(entry) = self.job.entry.clone() else {
            return;
        };
        self.vwtp.touch();

        if !self.vwtp.bound
            || self.vwtp.base_id != entry.tx_module_id
            || self.vwtp.module_id != entry.rx_module_id
        {
            if self.vwtp.state != VwtpState::Closed {
                self.vwtp_enter(VwtpState::ChannelClose).await;
            } else if entry.rx_module_id != 0 {
                self.vwtp_enter(VwtpState::ChannelSetup).await;
            } else {
                // a module id of 0 only closes the channel
                self.deliver_error(PollFailure::ChannelClosed);
            }
            return;
        }

        if self.vwtp.state < VwtpState::Idle {
            // setup or close still in progress
            self.vwtp_enter(VwtpState::ChannelSetup).await;
            return;
        }

        match self.vwtp.state {
            VwtpState::Transmit => self.vwtp_enter(VwtpState::AbortXfer).await,
            VwtpState::Receive => {
                self.vwtp_enter(VwtpState::AbortXfer).await;
                let drain = self.vwtp.sep_time * u32::from(self.vwtp.block_size);
                if !drain.is_zero() {
                    tokio::time::sleep(drain).await;
                }
            }
            _ => {}
        }
        self.vwtp_enter(VwtpState::StartPoll).await;
    }

    /// Channel state transition
    pub(crate) async fn vwtp_enter(&mut self, state: VwtpState) {
        // re-entering transmit sends the next block
        if self.vwtp.state == state && state != VwtpState::Transmit {
            return;
        }

        match state {
            VwtpState::ChannelSetup => {
                let Some(entry) = self.job.entry.as_ref().filter(|_| self.job.protocol == Protocol::Vwtp20) else {
                    debug!(bus = %self.bus_id, "VWTP channel setup without VWTP poll, ignoring");
                    return;
                };
                let (base_id, module_id) = (entry.tx_module_id, entry.rx_module_id);
                self.vwtp.bound = true;
                self.vwtp.base_id = base_id;
                self.vwtp.module_id = module_id;
                self.vwtp.tx_id = base_id;
                self.vwtp.rx_id = base_id + module_id;
                // the module assigns the final ids, offer base + 0x100 for its tx
                let offer = base_id + 0x100;

                debug!(
                    bus = %self.bus_id,
                    module = format!("0x{:02X}", module_id),
                    tx_id = format!("0x{:03X}", self.vwtp.tx_id),
                    rx_id = format!("0x{:03X}", self.vwtp.rx_id),
                    "VWTP channel setup request"
                );

                let frame = self.vwtp_frame(&[
                    (module_id & 0xff) as u8,
                    OP_SETUP_REQUEST,
                    0x00,
                    0x10,
                    (offer & 0xff) as u8,
                    ((offer >> 8) & 0xff) as u8,
                    0x01,
                ]);
                self.vwtp_expect();
                self.wait = 2;
                self.vwtp.state = VwtpState::ChannelSetup;
                self.vwtp.touch();
                self.transmit(frame);
            }

            VwtpState::ChannelParams => {
                debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP channel params request");
                let mut data = [OP_PARAMS_REQUEST; 6];
                data[1..].copy_from_slice(&CHANNEL_PARAMS);
                let frame = self.vwtp_frame(&data);
                self.vwtp_expect();
                self.wait = 2;
                self.vwtp.state = VwtpState::ChannelParams;
                self.transmit(frame);
            }

            VwtpState::ChannelClose => {
                debug!(
                    bus = %self.bus_id,
                    module = format!("0x{:02X}", self.vwtp.module_id),
                    tx_id = format!("0x{:03X}", self.vwtp.tx_id),
                    "VWTP channel close"
                );
                let frame = self.vwtp_frame(&[OP_DISCONNECT]);
                self.vwtp_expect();
                self.wait = 2;
                self.vwtp.state = VwtpState::ChannelClose;
                self.transmit(frame);
            }

            VwtpState::Closed => {
                debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP channel closed");
                self.vwtp = Default::default();
                self.wait = 0;
            }

            VwtpState::Idle => {
                self.vwtp.state = VwtpState::Idle;
                self.vwtp.touch();
                self.wait = 0;
            }

            VwtpState::StartPoll | VwtpState::Transmit => {
                if state == VwtpState::StartPoll {
                    let Some(entry) = self.job.entry.as_ref() else {
                        return;
                    };
                    debug!(
                        bus = %self.bus_id,
                        module = format!("0x{:02X}", self.vwtp.module_id),
                        service = format!("0x{:02X}", entry.service_type),
                        pid = format!("0x{:X}", entry.pid),
                        "VWTP start poll"
                    );
                    let header_len = encode_request(entry.service_type, entry.pid, &[]).len();
                    let payload = entry.payload.clone();
                    self.tx.load(payload, 0, ISOTP_MAX_LEN - header_len);
                    self.job.reset_multiframe();
                }
                self.vwtp_transmit_block().await;
            }

            VwtpState::Receive => {
                self.vwtp.state = VwtpState::Receive;
                self.vwtp.touch();
                self.wait = 2;
            }

            VwtpState::AbortXfer => {
                debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP abort transfer");
                let opcode = if self.vwtp.state == VwtpState::Receive {
                    ACK_NOT_READY | (self.vwtp.rx_seq & 0x0f)
                } else {
                    let seq = self.vwtp.tx_seq;
                    self.vwtp.tx_seq = seq.wrapping_add(1);
                    DATA_LAST_NO_ACK | (seq & 0x0f)
                };
                let frame = self.vwtp_frame(&[opcode]);
                self.vwtp_expect();
                self.tx.clear();
                self.job.ml_remain = 0;
                self.vwtp.state = VwtpState::Idle;
                self.vwtp.touch();
                self.wait = 0;
                self.transmit(frame);
            }
        }
    }

    /// Send the next block of request frames
    async fn vwtp_transmit_block(&mut self) {
        let Some(entry) = self.job.entry.as_ref() else {
            return;
        };
        let header = encode_request(entry.service_type, entry.pid, &[]);
        let block_size = self.vwtp.block_size.max(1);

        debug!(
            bus = %self.bus_id,
            module = format!("0x{:02X}", self.vwtp.module_id),
            frame = self.tx.frame,
            remain = self.tx.remaining(),
            "VWTP transmit"
        );

        for block in 1..=block_size {
            let mut data = [0u8; 8];
            let mut len = 1;
            if self.tx.frame == 0 {
                let total = header.len() + self.tx.remaining();
                data[1] = ((total >> 8) & 0xff) as u8;
                data[2] = (total & 0xff) as u8;
                data[3..3 + header.len()].copy_from_slice(&header);
                len = 3 + header.len();
            }
            len += self.tx.fill(&mut data[len..]);

            let opcode = if self.tx.remaining() == 0 {
                DATA_LAST_WAIT_ACK
            } else if block < block_size {
                DATA_NO_ACK
            } else {
                DATA_WAIT_ACK
            };
            data[0] = opcode | (self.vwtp.tx_seq & 0x0f);

            if self.vwtp.tx_seq > 0 && !self.vwtp.sep_time.is_zero() {
                tokio::time::sleep(self.vwtp.sep_time).await;
            }
            self.vwtp.tx_seq = self.vwtp.tx_seq.wrapping_add(1);
            self.tx.frame = self.tx.frame.wrapping_add(1);
            let frame = self.vwtp_frame(&data[..len]);
            self.transmit(frame);

            if self.tx.remaining() == 0 {
                break;
            }
        }

        self.vwtp_expect();
        self.wait = 2;
        self.vwtp.state = VwtpState::Transmit;
        self.vwtp.touch();
    }

    fn vwtp_send_pong(&mut self) {
        let mut data = [OP_PARAMS_RESPONSE; 6];
        data[1..].copy_from_slice(&CHANNEL_PARAMS);
        let frame = self.vwtp_frame(&data);
        self.transmit(frame);
    }

    fn vwtp_send_ack(&mut self) {
        let frame = self.vwtp_frame(&[ACK_READY | (self.vwtp.rx_seq & 0x0f)]);
        self.transmit(frame);
    }

    /// Disconnect from the module: acknowledge and close
    async fn vwtp_peer_close(&mut self) {
        debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP channel closed by module");
        self.vwtp_enter(VwtpState::ChannelClose).await;
        self.vwtp_enter(VwtpState::Closed).await;
        if self.job_active && self.job.protocol == Protocol::Vwtp20 {
            self.deliver_error(PollFailure::ChannelClosed);
        }
    }

    fn vwtp_dump(&self, frame: &CanFrame, message: &str) {
        warn!(
            bus = %self.bus_id,
            module = format!("0x{:02X}", self.vwtp.module_id),
            state = %self.vwtp.state,
            frame = %frame.hex(),
            "VWTP {}",
            message
        );
    }

    /// Process a frame received on the channel rx id
    pub(crate) async fn vwtp_receive(&mut self, frame: &CanFrame) {
        if self.vwtp.state == VwtpState::Closed || !self.vwtp.bound || frame.id != self.vwtp.rx_id {
            self.vwtp_dump(frame, "dropping unexpected frame");
            return;
        }

        let dlc = usize::from(frame.dlc.min(8));
        let d = frame.data;

        match self.vwtp.state {
            VwtpState::ChannelSetup => {
                let opcode = d[1];
                if dlc != 7 || !(OP_SETUP_ACCEPT..=OP_SETUP_REJECT_MAX).contains(&opcode) {
                    self.vwtp_dump(frame, "channel setup: invalid or unexpected frame");
                    return;
                }
                if opcode != OP_SETUP_ACCEPT {
                    debug!(
                        bus = %self.bus_id,
                        module = format!("0x{:02X}", self.vwtp.module_id),
                        opcode = format!("0x{:02X}", opcode),
                        "VWTP channel setup rejected"
                    );
                    self.vwtp = Default::default();
                    self.wait = 0;
                    self.deliver_error(PollFailure::ChannelClosed);
                } else {
                    self.vwtp.rx_id = u32::from(d[3]) << 8 | u32::from(d[2]);
                    self.vwtp.tx_id = u32::from(d[5]) << 8 | u32::from(d[4]);
                    debug!(
                        bus = %self.bus_id,
                        module = format!("0x{:02X}", self.vwtp.module_id),
                        tx_id = format!("0x{:03X}", self.vwtp.tx_id),
                        rx_id = format!("0x{:03X}", self.vwtp.rx_id),
                        "VWTP channel setup accepted"
                    );
                    self.vwtp_enter(VwtpState::ChannelParams).await;
                }
            }

            VwtpState::ChannelParams => {
                let opcode = if dlc > 0 { d[0] } else { 0 };
                match opcode {
                    OP_PARAMS_RESPONSE => {
                        self.vwtp.block_size = d[1];
                        self.vwtp.ack_time = decode_timing(d[2]);
                        self.vwtp.sep_time = decode_timing(d[4]);
                        debug!(
                            bus = %self.bus_id,
                            module = format!("0x{:02X}", self.vwtp.module_id),
                            block_size = self.vwtp.block_size,
                            ack_time = ?self.vwtp.ack_time,
                            sep_time = ?self.vwtp.sep_time,
                            "VWTP channel params accepted"
                        );
                        self.vwtp_enter(VwtpState::StartPoll).await;
                    }
                    OP_DISCONNECT => self.vwtp_peer_close().await,
                    _ => {
                        self.vwtp_dump(frame, "channel params: invalid or unexpected frame");
                        return;
                    }
                }
            }

            VwtpState::ChannelClose => {
                let opcode = if dlc == 1 { d[0] } else { 0 };
                if opcode != OP_DISCONNECT {
                    self.vwtp_dump(frame, "channel close: invalid or unexpected frame");
                    return;
                }
                self.vwtp_enter(VwtpState::Closed).await;
                if self.job_active && self.job.protocol == Protocol::Vwtp20 {
                    let reopen = self
                        .job
                        .entry
                        .as_ref()
                        .is_some_and(|entry| entry.rx_module_id != 0);
                    if reopen {
                        self.vwtp_enter(VwtpState::ChannelSetup).await;
                    } else {
                        self.deliver_error(PollFailure::ChannelClosed);
                    }
                }
            }

            VwtpState::Idle => {
                let opcode = d[0];
                if opcode == OP_PING {
                    self.vwtp_send_pong();
                } else if opcode == OP_DISCONNECT {
                    self.vwtp_peer_close().await;
                } else if opcode & 0xf0 <= DATA_LAST_NO_ACK {
                    // out of band data
                    self.vwtp.rx_seq = self.vwtp.rx_seq.wrapping_add(1);
                    let frame = self.vwtp_frame(&[ACK_NOT_READY | (self.vwtp.rx_seq & 0x0f)]);
                    self.transmit(frame);
                }
            }

            VwtpState::Transmit => {
                let opcode = if dlc == 1 { d[0] } else { 0 };
                if opcode & 0xf0 == ACK_READY {
                    if self.tx.remaining() > 0 {
                        self.vwtp_enter(VwtpState::Transmit).await;
                    } else {
                        self.vwtp_enter(VwtpState::Receive).await;
                    }
                } else if opcode & 0xf0 == ACK_NOT_READY {
                    debug!(
                        bus = %self.bus_id,
                        module = format!("0x{:02X}", self.vwtp.module_id),
                        frame = self.tx.frame,
                        remain = self.tx.remaining(),
                        "VWTP transmission aborted by module"
                    );
                    self.tx.clear();
                    self.vwtp_enter(VwtpState::Idle).await;
                } else if opcode == OP_PING {
                    self.vwtp_send_pong();
                } else if opcode == OP_DISCONNECT {
                    self.vwtp_peer_close().await;
                } else {
                    // possibly left over from an aborted transfer
                    self.vwtp_dump(frame, "unhandled frame during transmission");
                }
            }

            VwtpState::Receive => {
                let opcode = d[0];
                if opcode == OP_PING {
                    self.vwtp_send_pong();
                } else if opcode == OP_DISCONNECT {
                    self.vwtp_peer_close().await;
                } else if opcode < 0x40 {
                    if !self.vwtp_receive_data(frame, opcode, &d[..dlc]).await {
                        return;
                    }
                } else {
                    self.vwtp_dump(frame, "unhandled frame during reception");
                }
            }

            _ => {}
        }

        if self.wait == 0 {
            self.poll_next().await;
        }
    }

    /// Data frame in receive state; `false` if the response was abandoned
    /// or is still pending
    async fn vwtp_receive_data(&mut self, frame: &CanFrame, opcode: u8, data: &[u8]) -> bool {
        self.vwtp.touch();
        let seq = self.vwtp.rx_seq;
        self.vwtp.rx_seq = seq.wrapping_add(1);
        if opcode & 0x0f != seq & 0x0f {
            self.vwtp_dump(frame, "out of sequence frame, aborting");
            self.vwtp_enter(VwtpState::AbortXfer).await;
            return false;
        }
        let wants_ack = opcode & 0xf0 <= DATA_LAST_WAIT_ACK;

        let first = self.job.ml_frame == 0;
        let tp: &[u8] = if first {
            // upper nibble of the length is not part of it
            self.job.ml_remain = u16::from(data.get(1).copied().unwrap_or(0) & 0x0f) << 8
                | u16::from(data.get(2).copied().unwrap_or(0));
            data.get(3..).unwrap_or(&[])
        } else {
            data.get(1..).unwrap_or(&[])
        };

        let payload: &[u8] = if first {
            match Envelope::parse(tp, self.job.pid) {
                Some(Envelope::Negative { service, code }) if service == self.job.service_type => {
                    if wants_ack {
                        self.vwtp_send_ack();
                    }
                    if code.is_response_pending() {
                        debug!(
                            bus = %self.bus_id,
                            module = format!("0x{:02X}", self.vwtp.module_id),
                            service = format!("0x{:02X}", self.job.service_type),
                            pid = format!("0x{:X}", self.job.pid),
                            "Response pending"
                        );
                        // the final response starts over
                        self.job.reset_multiframe();
                        self.wait = 2;
                        return false;
                    }
                    self.job.module_id_rec = self.job.module_id_sent;
                    self.job.ml_remain = 0;
                    self.deliver_error(PollFailure::Negative(code));
                    self.vwtp_enter(VwtpState::Idle).await;
                    return true;
                }
                Some(envelope) if envelope.answers(self.job.service_type, self.job.pid) => {
                    &tp[envelope.header_len()..]
                }
                _ => {
                    self.vwtp_dump(frame, "response type/PID mismatch, aborting");
                    self.vwtp_enter(VwtpState::AbortXfer).await;
                    return false;
                }
            }
        } else {
            tp
        };

        if wants_ack {
            self.vwtp_send_ack();
        }
        self.job.ml_remain = self.job.ml_remain.saturating_sub(tp.len() as u16);
        self.job.module_id_rec = self.vwtp.rx_id;
        self.deliver_reply(payload);

        if self.job.ml_remain > 0 {
            self.job.ml_frame = self.job.ml_frame.wrapping_add(1);
            self.job.ml_offset = self.job.ml_offset.wrapping_add(payload.len() as u16);
            self.wait = 2;
        } else {
            self.vwtp_enter(VwtpState::Idle).await;
        }
        true
    }

    /// Per tick channel maintenance: state timeouts and keepalive
    pub(crate) async fn vwtp_ticker(&mut self) {
        let idle = self.vwtp.idle_time();

        // an operation started just before this tick gets another one
        if self.wait == 1 && idle.is_some_and(|t| t < WAIT_GRACE) {
            self.wait = 2;
            return;
        }

        if self.wait > 0 {
            match self.vwtp.state {
                VwtpState::ChannelSetup | VwtpState::ChannelParams => {
                    debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP setup timeout");
                    self.vwtp_enter(VwtpState::Closed).await;
                }
                VwtpState::ChannelClose => {
                    debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP close timeout");
                    self.vwtp_enter(VwtpState::Closed).await;
                    if self.job_active && self.job.protocol == Protocol::Vwtp20 {
                        self.vwtp_start().await;
                    }
                }
                _ => {}
            }
        } else if self.vwtp.state != VwtpState::Closed && self.vwtp.state != VwtpState::Idle {
            debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), state = %self.vwtp.state, "VWTP poll timeout");
            self.vwtp_enter(VwtpState::ChannelClose).await;
        }

        if self.vwtp.state == VwtpState::Idle
            && self.wait == 0
            && !self.keepalive.is_zero()
            && self.vwtp.idle_time().is_some_and(|t| t > self.keepalive)
        {
            debug!(bus = %self.bus_id, module = format!("0x{:02X}", self.vwtp.module_id), "VWTP channel inactivity timeout");
            self.vwtp_enter(VwtpState::ChannelClose).await;
        }
    }
}
