//! ISO 15765-2 (ISO-TP) transport
//!
//! Request segmentation into single/first/consecutive frames, response
//! reassembly and flow control. All frames sent are 8 bytes padded with
//! [`FRAME_PADDING`](crate::bus::FRAME_PADDING). With extended addressing
//! the first data byte carries the low byte of the module id and the
//! protocol data starts at byte 1.

use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::CanFrame;
use crate::config::SequencePolicy;
use crate::engine::PollerEngine;
use crate::poll::{Protocol, BROADCAST_RX_RANGE, BROADCAST_TX_ID};
use crate::sink::PollFailure;
use crate::uds::{encode_request, Envelope, NegativeResponseCode};

/// Largest ISO-TP message length (12 bit)
pub const ISOTP_MAX_LEN: usize = 4095;

const FT_SINGLE: u8 = 0;
const FT_FIRST: u8 = 1;
const FT_CONSECUTIVE: u8 = 2;
const FT_FLOW_CONTROL: u8 = 3;

/// Flow control: clear to send
pub const FC_CONTINUE: u8 = 0;
/// Flow control: wait
pub const FC_WAIT: u8 = 1;
/// Flow control: overflow / abort
pub const FC_ABORT: u8 = 2;

/// Protocol control information of a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoTpFrame<'a> {
    Single {
        data: &'a [u8],
    },
    First {
        total_len: u16,
        data: &'a [u8],
    },
    /// `data` is everything after the PCI byte, padding included
    Consecutive {
        index: u8,
        data: &'a [u8],
    },
    FlowControl {
        command: u8,
        block_size: u8,
        septime: u8,
    },
}

impl<'a> IsoTpFrame<'a> {
    /// Decode the ISO-TP portion of a frame (after any address byte)
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let pci = *data.first()?;
        match pci >> 4 {
            FT_SINGLE => {
                let len = usize::from(pci & 0x0f).min(data.len() - 1);
                Some(Self::Single {
                    data: &data[1..1 + len],
                })
            }
            FT_FIRST => {
                let total_len = u16::from(pci & 0x0f) << 8 | u16::from(*data.get(1)?);
                let len = usize::from(total_len).min(data.len() - 2);
                Some(Self::First {
                    total_len,
                    data: &data[2..2 + len],
                })
            }
            FT_CONSECUTIVE => Some(Self::Consecutive {
                index: pci & 0x0f,
                data: &data[1..],
            }),
            FT_FLOW_CONTROL => Some(Self::FlowControl {
                command: pci & 0x0f,
                block_size: data.get(1).copied().unwrap_or(0),
                septime: data.get(2).copied().unwrap_or(0),
            }),
            _ => None,
        }
    }
}

/// Decode a flow control separation time
///
/// `0..=127` are milliseconds, `241..=249` are 100..900 microseconds.
/// Reserved `128..=240` send without delay; reserved `250..=255` continue
/// the microsecond range.
pub fn separation_delay(septime: u8) -> Duration {
    match septime {
        0..=127 => Duration::from_millis(u64::from(septime)),
        241..=255 => Duration::from_micros(u64::from(septime - 240) * 100),
        _ => Duration::ZERO,
    }
}

impl PollerEngine {
    /// Frame to `module_id` in the job's addressing mode, with the index of
    /// the first ISO-TP byte
    fn isotp_frame(&self, module_id: u32) -> (CanFrame, usize) {
        match self.job.protocol {
            Protocol::IsoTpExtAddr => {
                let mut frame = CanFrame::padded(self.bus_id, module_id >> 8, false);
                frame.data[0] = (module_id & 0xff) as u8;
                (frame, 1)
            }
            Protocol::IsoTpExtFrame => (CanFrame::padded(self.bus_id, module_id, true), 0),
            _ => (CanFrame::padded(self.bus_id, module_id, false), 0),
        }
    }

    /// Id for flow control / consecutive frames answering `msg_id`
    fn isotp_reply_target(&self, msg_id: u32) -> u32 {
        if self.job.is_broadcast() {
            // SAE 11 bit scheme: request id = response id - 8
            msg_id.wrapping_sub(8)
        } else {
            self.job.module_id_sent
        }
    }

    /// Send the single or first frame of the current job's request
    pub(crate) fn isotp_start(&mut self) {
        let Some(entry) = self.job.entry.clone() else {
            return;
        };

        if entry.rx_module_id != 0 {
            self.job.module_id_sent = entry.tx_module_id;
            self.job.module_id_low = entry.rx_module_id;
            self.job.module_id_high = entry.rx_module_id;
        } else {
            self.job.module_id_sent = BROADCAST_TX_ID;
            self.job.module_id_low = BROADCAST_RX_RANGE.0;
            self.job.module_id_high = BROADCAST_RX_RANGE.1;
        }

        debug!(
            bus = %self.bus_id,
            protocol = %entry.protocol,
            service = format!("0x{:02X}", entry.service_type),
            pid = format!("0x{:X}", entry.pid),
            tx_id = format!("0x{:X}", self.job.module_id_sent),
            rx_low = format!("0x{:X}", self.job.module_id_low),
            rx_high = format!("0x{:X}", self.job.module_id_high),
            "ISO-TP request"
        );

        let header = encode_request(entry.service_type, entry.pid, &[]);
        let limit = ISOTP_MAX_LEN - header.len();
        let payload = entry.payload.as_slice();
        let payload = &payload[..payload.len().min(limit)];
        let tp_len = header.len() + payload.len();

        let (mut frame, base) = self.isotp_frame(self.job.module_id_sent);
        let fr = &mut frame.data[base..];
        let max = fr.len();

        let tp_start = if tp_len < max {
            fr[0] = (FT_SINGLE << 4) | tp_len as u8;
            1
        } else {
            fr[0] = (FT_FIRST << 4) | ((tp_len >> 8) & 0x0f) as u8;
            fr[1] = (tp_len & 0xff) as u8;
            2
        };
        let data_start = tp_start + header.len();
        fr[tp_start..data_start].copy_from_slice(&header);
        let sent = payload.len().min(max - data_start);
        fr[data_start..data_start + sent].copy_from_slice(&payload[..sent]);

        self.tx.load(entry.payload.clone(), sent, limit);
        self.job.tx_msg_id = frame.id;
        self.job.reset_multiframe();
        self.wait = 2;

        self.transmit(frame);
    }

    /// Process a frame from the expected response id range
    pub(crate) async fn isotp_receive(&mut self, frame: &CanFrame, msg_id: u32) {
        if self.wait == 0 || self.job.entry.is_none() || frame.bus != self.bus_id {
            debug!(bus = %self.bus_id, msg_id = format!("0x{:X}", msg_id), "Dropping expired poll response");
            return;
        }
        if !self.job.accepts(msg_id) {
            debug!(
                bus = %self.bus_id,
                msg_id = format!("0x{:X}", msg_id),
                "Dropping out of range poll response"
            );
            return;
        }

        let base = usize::from(self.job.protocol == Protocol::IsoTpExtAddr);
        let fr = &frame.data[base..];
        let max = fr.len();

        let Some(pci) = IsoTpFrame::parse(fr) else {
            // most likely a non ISO-TP device in our id range
            warn!(
                bus = %self.bus_id,
                msg_id = format!("0x{:X}", msg_id),
                frame = %hex::encode(frame.data),
                "Ignoring unknown ISO-TP frame type"
            );
            return;
        };

        let (tp_len, segment, first) = match pci {
            IsoTpFrame::FlowControl {
                command,
                block_size,
                septime,
            } => {
                self.isotp_flow_control(frame, msg_id, command, block_size, septime)
                    .await;
                return;
            }
            IsoTpFrame::Single { data } => (data.len() as u16, data, false),
            IsoTpFrame::First { total_len, data } => (total_len, data, true),
            IsoTpFrame::Consecutive { index, data } => {
                if !self.consecutive_index_ok(index) {
                    warn!(
                        bus = %self.bus_id,
                        msg_id = format!("0x{:X}", msg_id),
                        index,
                        expected = self.job.ml_frame & 0x0f,
                        service = format!("0x{:02X}", self.job.service_type),
                        pid = format!("0x{:X}", self.job.pid),
                        frame = %hex::encode(frame.data),
                        "Out of sequence ISO-TP frame, aborting poll"
                    );
                    // ignore the rest, let remaining frames pass
                    self.job.module_id_low = 0;
                    self.job.module_id_high = 0;
                    self.wait = 2;
                    return;
                }
                let remain = self.job.ml_remain;
                let len = usize::from(remain).min(max - 1).min(data.len());
                (remain, &data[..len], false)
            }
        };

        let mut negative: Option<NegativeResponseCode> = None;
        let payload: &[u8] = if matches!(pci, IsoTpFrame::Consecutive { .. }) {
            segment
        } else {
            match Envelope::parse(segment, self.job.pid) {
                Some(Envelope::Negative { service, code }) if service == self.job.service_type => {
                    if code.is_response_pending() {
                        debug!(
                            bus = %self.bus_id,
                            msg_id = format!("0x{:X}", msg_id),
                            service = format!("0x{:02X}", self.job.service_type),
                            pid = format!("0x{:X}", self.job.pid),
                            "Response pending"
                        );
                        self.wait = self.wait.saturating_add(1);
                        return;
                    }
                    negative = Some(code);
                    &[]
                }
                Some(envelope) if envelope.answers(self.job.service_type, self.job.pid) => {
                    &segment[envelope.header_len()..]
                }
                _ => {
                    // most likely a late response to a previous poll
                    warn!(
                        bus = %self.bus_id,
                        msg_id = format!("0x{:X}", msg_id),
                        service = format!("0x{:02X}", self.job.service_type),
                        pid = format!("0x{:X}", self.job.pid),
                        frame = %hex::encode(frame.data),
                        "Response type/PID mismatch, ignoring"
                    );
                    return;
                }
            }
        };

        self.job.module_id_rec = msg_id;
        match negative {
            Some(code) => {
                self.job.reset_multiframe();
                self.deliver_error(PollFailure::Negative(code));
            }
            None => {
                self.job.ml_remain = tp_len.saturating_sub(segment.len() as u16);
                self.deliver_reply(payload);
            }
        }

        if self.job.ml_remain > 0 {
            if first {
                self.isotp_send_flow_control(msg_id);
                self.job.ml_frame = 1;
            } else {
                self.job.ml_frame = self.job.ml_frame.wrapping_add(1);
            }
            self.job.ml_offset = self.job.ml_offset.wrapping_add(payload.len() as u16);
            self.wait = 2;
        } else {
            self.wait = 0;
        }

        // a broadcast may still get answers from other modules
        if self.job.ml_remain == 0 && !self.job.is_broadcast() {
            self.poll_next().await;
        }
    }

    fn consecutive_index_ok(&self, index: u8) -> bool {
        if self.job.ml_remain == 0 {
            return false;
        }
        let expected = (self.job.ml_frame & 0x0f) as u8;
        match self.sequence_policy {
            SequencePolicy::Lenient => index <= expected,
            SequencePolicy::Strict => index == expected,
        }
    }

    /// Authorize all remaining frames of a response
    fn isotp_send_flow_control(&mut self, msg_id: u32) {
        let (mut frame, base) = self.isotp_frame(self.isotp_reply_target(msg_id));
        frame.data[base] = FT_FLOW_CONTROL << 4 | FC_CONTINUE;
        frame.data[base + 1] = 0;
        frame.data[base + 2] = self.fc_septime;
        self.transmit(frame);
    }

    /// Flow control for our own multi frame request
    async fn isotp_flow_control(
        &mut self,
        frame: &CanFrame,
        msg_id: u32,
        command: u8,
        block_size: u8,
        septime: u8,
    ) {
        if command > FC_ABORT || self.tx.remaining() == 0 {
            warn!(
                bus = %self.bus_id,
                msg_id = format!("0x{:X}", msg_id),
                frame = %hex::encode(frame.data),
                "Ignoring unexpected ISO-TP flow control frame"
            );
            return;
        }

        match command {
            FC_WAIT => {
                self.wait = self.wait.saturating_add(1);
            }
            FC_ABORT => {
                debug!(bus = %self.bus_id, remain = self.tx.remaining(), "Request aborted by receiver");
                // still wait for a response
                self.tx.clear();
            }
            _ => {
                let target = self.isotp_reply_target(msg_id);
                let delay = separation_delay(septime);
                let mut budget = block_size;

                while self.tx.remaining() > 0 {
                    self.tx.frame = self.tx.frame.wrapping_add(1);
                    let (mut out, base) = self.isotp_frame(target);
                    out.data[base] = FT_CONSECUTIVE << 4 | (self.tx.frame & 0x0f) as u8;
                    self.tx.fill(&mut out.data[base + 1..]);
                    self.transmit(out);

                    if self.tx.remaining() == 0 {
                        break;
                    }
                    if budget > 0 {
                        budget -= 1;
                        if budget == 0 {
                            break;
                        }
                    }
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }

                if self.tx.remaining() > 0 {
                    self.wait = 2;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_parse_single() {
        let data = [0x05, 0x62, 0x12, 0x34, 0xAA, 0xBB, 0x55, 0x55];
        assert_eq!(
            IsoTpFrame::parse(&data),
            Some(IsoTpFrame::Single {
                data: &[0x62, 0x12, 0x34, 0xAA, 0xBB]
            })
        );
    }

    #[test]
    fn test_parse_single_length_clamped() {
        let data = [0x0F, 1, 2, 3, 4, 5, 6, 7];
        match IsoTpFrame::parse(&data) {
            Some(IsoTpFrame::Single { data }) => assert_eq!(data.len(), 7),
            other => panic!("Expected single frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_first() {
        let data = [0x10, 0x14, 0x62, 0x12, 0x34, 1, 2, 3];
        assert_eq!(
            IsoTpFrame::parse(&data),
            Some(IsoTpFrame::First {
                total_len: 20,
                data: &[0x62, 0x12, 0x34, 1, 2, 3]
            })
        );

        let long = [0x1F, 0xFF, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            IsoTpFrame::parse(&long),
            Some(IsoTpFrame::First { total_len: 4095, .. })
        ));
    }

    #[test]
    fn test_parse_consecutive_and_flow_control() {
        let cf = [0x2A, 1, 2, 3, 4, 5, 6, 7];
        assert_eq!(
            IsoTpFrame::parse(&cf),
            Some(IsoTpFrame::Consecutive {
                index: 0x0A,
                data: &[1, 2, 3, 4, 5, 6, 7]
            })
        );

        let fc = [0x30, 0x04, 0x19, 0x55, 0x55, 0x55, 0x55, 0x55];
        assert_eq!(
            IsoTpFrame::parse(&fc),
            Some(IsoTpFrame::FlowControl {
                command: 0,
                block_size: 4,
                septime: 25
            })
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(IsoTpFrame::parse(&[]), None);
        assert_eq!(IsoTpFrame::parse(&[0x40, 0, 0, 0, 0, 0, 0, 0]), None);
        assert_eq!(IsoTpFrame::parse(&[0xF0, 0, 0, 0, 0, 0, 0, 0]), None);
        // extended addressing leaves 7 bytes
        assert!(IsoTpFrame::parse(&[0x06, 1, 2, 3, 4, 5, 6]).is_some());
    }

    #[rstest]
    #[case(0, Duration::ZERO)]
    #[case(25, Duration::from_millis(25))]
    #[case(127, Duration::from_millis(127))]
    #[case(241, Duration::from_micros(100))]
    #[case(249, Duration::from_micros(900))]
    #[case(128, Duration::ZERO)]
    #[case(240, Duration::ZERO)]
    #[case(250, Duration::from_micros(1000))]
    #[case(255, Duration::from_micros(1500))]
    fn test_separation_delay(#[case] septime: u8, #[case] expected: Duration) {
        assert_eq!(separation_delay(septime), expected);
    }
}
