//! Per-bus poller engine
//!
//! One [`PollerEngine`] owns everything that is live on a single CAN bus:
//! the scheduler position, the in-flight [`PollJob`], the wait counter, the
//! VWTP channel and the single request capture. The engine is driven by the
//! poller task through three entry points: received frames, ticks and
//! transmit results. All protocol work happens inside those calls.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bus::{BusId, CanBus, CanFrame};
use crate::config::{PollerConfig, SequencePolicy};
use crate::error::PollSingleError;
use crate::poll::{PollEntry, PollJob, PollList, PollPayload, Protocol};
use crate::scheduler::{NextPoll, PollScheduler, SchedulerSnapshot};
use crate::sink::{PollFailure, ResponseSink};
use crate::vwtp::{VwtpChannel, VwtpState};

/// Interval used for single request entries (due once, at ticker 0)
pub const SINGLE_INTERVAL: u16 = 999;

/// Result sent back to a single request caller
pub(crate) type SingleResult = Result<Vec<u8>, PollSingleError>;

/// Timer tick flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    /// Full tick: timeouts, channel maintenance, ticker advance
    Primary,
    /// Intermediate tick: only resets throttling and tries to dispatch
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendSource {
    Primary,
    Secondary,
    Successful,
}

/// Snapshot of an engine for status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerStatus {
    pub bus: BusId,
    pub bus_name: String,
    pub state: u8,
    pub ticker: u32,
    pub wait: u8,
    pub paused: bool,
    pub list_len: usize,
    pub sequence_max: u8,
    pub channel: VwtpState,
    pub single_active: bool,
    pub single_queued: usize,
}

/// Single request waiting for its turn
pub(crate) struct SingleRequest {
    pub entry: PollEntry,
    pub deadline: Instant,
    pub reply: oneshot::Sender<SingleResult>,
}

/// Single request in flight, periodic list parked in `saved`
struct SingleCapture {
    reply: oneshot::Sender<SingleResult>,
    deadline: Instant,
    response: Vec<u8>,
    saved: SchedulerSnapshot,
}

/// Outbound payload remainder of the current request
#[derive(Debug, Default)]
pub(crate) struct TxBuffer {
    payload: PollPayload,
    offset: usize,
    end: usize,
    /// Frames sent for this request
    pub frame: u16,
}

impl TxBuffer {
    /// Load `payload` (limited to `limit` bytes), `offset` bytes already sent
    pub fn load(&mut self, payload: PollPayload, offset: usize, limit: usize) {
        self.end = payload.len().min(limit);
        self.offset = offset.min(self.end);
        self.payload = payload;
        self.frame = 0;
    }

    pub fn remaining(&self) -> usize {
        self.end - self.offset
    }

    /// Copy the next bytes into `buf`, returning the count
    pub fn fill(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.remaining());
        buf[..n].copy_from_slice(&self.payload.as_slice()[self.offset..self.offset + n]);
        self.offset += n;
        n
    }

    pub fn clear(&mut self) {
        self.offset = self.end;
    }
}

/// Poll engine for one bus
pub struct PollerEngine {
    pub(crate) bus_id: BusId,
    pub(crate) bus: Arc<dyn CanBus>,
    sink: Arc<dyn ResponseSink>,
    scheduler: PollScheduler,
    pub(crate) job: PollJob,
    /// A poll has been dispatched and not yet finished
    pub(crate) job_active: bool,
    /// Response wait counter in ticks, `0` = nothing expected
    pub(crate) wait: u8,
    paused: bool,
    pub(crate) fc_septime: u8,
    pub(crate) sequence_policy: SequencePolicy,
    pub(crate) keepalive: Duration,
    between_success: Duration,
    /// Chained poll after a successful response, delayed by `between_success`
    success_due: Option<Instant>,
    pub(crate) tx: TxBuffer,
    pub(crate) vwtp: VwtpChannel,
    single: Option<SingleCapture>,
    queued: VecDeque<SingleRequest>,
    tx_results: VecDeque<(CanFrame, bool)>,
}

impl PollerEngine {
    pub fn new(
        bus_id: BusId,
        bus: Arc<dyn CanBus>,
        sink: Arc<dyn ResponseSink>,
        config: &PollerConfig,
    ) -> Self {
        Self {
            bus_id,
            bus,
            sink,
            scheduler: PollScheduler::new(bus_id, config.sequence_max),
            job: PollJob::new(bus_id),
            job_active: false,
            wait: 0,
            paused: false,
            fc_septime: config.fc_septime,
            sequence_policy: config.isotp_sequence,
            keepalive: Duration::from_secs(u64::from(config.channel_keepalive_secs)),
            between_success: config.time_between_success(),
            success_due: None,
            tx: TxBuffer::default(),
            vwtp: VwtpChannel::default(),
            single: None,
            queued: VecDeque::new(),
            tx_results: VecDeque::new(),
        }
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Route a received frame to the protocol handler expecting it
    pub async fn handle_frame(&mut self, frame: CanFrame) {
        if frame.bus != self.bus_id {
            return;
        }
        trace!(%frame, "rx");

        if self.vwtp.state != VwtpState::Closed && !frame.extended && frame.id == self.vwtp.rx_id
        {
            self.vwtp_receive(&frame).await;
        } else if self.job.protocol.is_isotp() {
            let msg_id = match self.job.protocol {
                Protocol::IsoTpExtAddr => frame.id << 8 | u32::from(frame.data[0]),
                _ => frame.id,
            };
            if self.wait > 0 && self.job.accepts(msg_id) {
                self.isotp_receive(&frame, msg_id).await;
            }
        }

        self.settle().await;
    }

    /// Timer tick
    pub async fn tick(&mut self, kind: TickKind) {
        let source = match kind {
            TickKind::Primary => {
                self.sink.on_poll_state_ticker(self.bus_id);
                SendSource::Primary
            }
            TickKind::Secondary => SendSource::Secondary,
        };
        self.scheduler.reset_sequence();
        self.poll_send(source).await;
        self.settle().await;
    }

    /// Transmit result reported by the bus driver
    pub async fn tx_complete(&mut self, frame: &CanFrame, success: bool) {
        self.on_tx_result(frame, success);
        self.settle().await;
    }

    /// Deadline of a delayed chained poll, if one is armed
    pub fn success_deadline(&self) -> Option<Instant> {
        self.success_due
    }

    /// Send the chained poll armed by a successful response once its delay
    /// has passed
    pub async fn send_success(&mut self) {
        match self.success_due {
            Some(due) if due <= Instant::now() => self.success_due = None,
            _ => return,
        }
        if self.wait == 0 && (self.scheduler.can_poll() || !self.queued.is_empty()) {
            self.poll_send(SendSource::Successful).await;
        }
        self.settle().await;
    }

    /// Queue a single request; it starts as soon as no other single is active
    pub(crate) async fn submit_single(&mut self, request: SingleRequest) {
        self.queued.push_back(request);
        self.settle().await;
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Install a poll list, restarting the scheduler
    pub fn set_list(&mut self, list: Option<PollList>, default_bus: Option<BusId>) {
        match self.single.as_mut() {
            Some(capture) => {
                // takes effect once the single request is done
                capture.saved =
                    SchedulerSnapshot::at_start(list, default_bus, self.scheduler.state());
            }
            None => {
                self.scheduler.set_list(list, default_bus);
                self.wait = 0;
            }
        }
    }

    /// Select the poll state
    pub fn set_state(&mut self, state: u8) {
        if self.scheduler.set_state(state) {
            debug!(bus = %self.bus_id, state, "Poll state changed");
            if self.single.is_none() {
                self.wait = 0;
            }
        }
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn set_sequence_max(&mut self, sequence_max: u8) {
        self.scheduler.set_sequence_max(sequence_max);
    }

    pub fn set_fc_septime(&mut self, septime: u8) {
        self.fc_septime = septime;
    }

    pub fn set_keepalive(&mut self, seconds: u16) {
        self.keepalive = Duration::from_secs(u64::from(seconds));
    }

    pub fn set_time_between_success(&mut self, ms: u16) {
        self.between_success = Duration::from_millis(u64::from(ms));
    }

    pub fn status(&self) -> PollerStatus {
        PollerStatus {
            bus: self.bus_id,
            bus_name: self.bus.name().to_string(),
            state: self.scheduler.state(),
            ticker: self.scheduler.ticker(),
            wait: self.wait,
            paused: self.paused,
            list_len: self.scheduler.len(),
            sequence_max: self.scheduler.sequence_max(),
            channel: self.vwtp.state,
            single_active: self.single.is_some(),
            single_queued: self.queued.len(),
        }
    }

    /// Stop: fail pending single requests and close an open channel
    pub async fn shutdown(&mut self) {
        self.finish_single(Err(PollSingleError::Unavailable));
        for request in self.queued.drain(..) {
            let _ = request.reply.send(Err(PollSingleError::Unavailable));
        }
        if self.vwtp.state != VwtpState::Closed {
            self.vwtp_enter(VwtpState::ChannelClose).await;
            self.vwtp_enter(VwtpState::Closed).await;
        }
        self.tx_results.clear();
        self.success_due = None;
        self.job_active = false;
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// Start the next due poll (or the next queued single request)
    async fn poll_send(&mut self, source: SendSource) {
        if source == SendSource::Primary {
            self.wait = self.wait.saturating_sub(1);
            self.vwtp_ticker().await;
            self.expire_single();
        }

        if self.wait > 0 {
            trace!(bus = %self.bus_id, wait = self.wait, "Waiting for response");
            return;
        }
        self.job_active = false;

        if self.single.is_some() {
            return;
        }
        if let Some(request) = self.queued.pop_front() {
            self.start_single(request).await;
            return;
        }

        if source == SendSource::Primary {
            let pass_open = !self.scheduler.is_pass_complete();
            if self.scheduler.start_next_pass() {
                // pass ended with its last entry, never reported complete
                if pass_open {
                    self.sink.on_poll_run_finished(self.bus_id);
                }
                trace!(bus = %self.bus_id, ticker = self.scheduler.ticker(), "Next poll pass");
            }
        }
        if self.paused {
            return;
        }
        if !self.scheduler.can_poll() {
            trace!(bus = %self.bus_id, "Throttled");
            return;
        }

        let pass_open = !self.scheduler.is_pass_complete();
        match self.scheduler.next_due() {
            NextPoll::Due(entry) => {
                debug!(
                    bus = %self.bus_id,
                    ?source,
                    service = format!("0x{:02X}", entry.service_type),
                    pid = format!("0x{:X}", entry.pid),
                    ticker = self.scheduler.ticker(),
                    "Poll due"
                );
                self.dispatch(entry).await;
            }
            NextPoll::PassComplete => {
                if pass_open {
                    trace!(bus = %self.bus_id, ticker = self.scheduler.ticker(), "Pass complete");
                    self.sink.on_poll_run_finished(self.bus_id);
                }
            }
            NextPoll::Empty => {}
        }
    }

    /// Response complete: chain into the next due poll
    pub(crate) async fn poll_next(&mut self) {
        self.job_active = false;
        if self.wait == 0 && (self.scheduler.can_poll() || !self.queued.is_empty()) {
            if self.between_success.is_zero() {
                self.poll_send(SendSource::Successful).await;
            } else {
                self.success_due = Some(Instant::now() + self.between_success);
            }
        }
    }

    /// Hand `entry` to its protocol handler
    async fn dispatch(&mut self, entry: PollEntry) {
        self.job.start(&entry, self.scheduler.ticker());
        self.job_active = true;
        match entry.protocol {
            Protocol::Vwtp20 => self.vwtp_start().await,
            _ => self.isotp_start(),
        }
    }

    /// Drain transmit results and start queued single requests
    async fn settle(&mut self) {
        loop {
            while let Some((frame, success)) = self.tx_results.pop_front() {
                self.on_tx_result(&frame, success);
            }
            if self.single.is_some() {
                break;
            }
            let Some(request) = self.queued.pop_front() else {
                break;
            };
            self.start_single(request).await;
        }
    }

    // =========================================================================
    // Transmission
    // =========================================================================

    /// Write a frame to the bus, recording the result for [`Self::settle`]
    pub(crate) fn transmit(&mut self, frame: CanFrame) -> bool {
        trace!(%frame, "tx");
        match self.bus.write(&frame) {
            Ok(()) => {
                if !self.bus.reports_tx_completion() {
                    self.tx_results.push_back((frame, true));
                }
                true
            }
            Err(e) => {
                warn!(bus = %self.bus_id, error = %e, %frame, "Frame transmission failed");
                self.tx_results.push_back((frame, false));
                false
            }
        }
    }

    fn on_tx_result(&mut self, frame: &CanFrame, success: bool) {
        // late result of an earlier poll
        if self.wait == 0 || !self.job_active || frame.id != self.job.tx_msg_id {
            return;
        }

        let periodic = self.single.is_none();
        if self.job.protocol == Protocol::Vwtp20 && !success {
            self.vwtp_reset();
        }
        if !success {
            self.wait = 0;
            self.deliver_error(PollFailure::TransmitFailed);
        }

        if periodic {
            self.job.module_id_rec = 0;
            self.sink.on_poll_tx_result(&self.job, success);
        }
    }

    // =========================================================================
    // Response delivery
    // =========================================================================

    /// One frame's worth of response payload; `job.ml_remain` must be current
    pub(crate) fn deliver_reply(&mut self, data: &[u8]) {
        let remain = self.job.ml_remain;
        if let Some(capture) = self.single.as_mut() {
            capture.response.extend_from_slice(data);
            if remain == 0 {
                let response = std::mem::take(&mut capture.response);
                self.finish_single(Ok(response));
            }
            return;
        }
        debug!(
            bus = %self.bus_id,
            service = format!("0x{:02X}", self.job.service_type),
            pid = format!("0x{:X}", self.job.pid),
            frame = self.job.ml_frame,
            offset = self.job.ml_offset,
            remain,
            data = %hex::encode(data),
            "Poll reply"
        );
        self.sink.on_poll_reply(&self.job, data, remain);
    }

    pub(crate) fn deliver_error(&mut self, failure: PollFailure) {
        if let Some(capture) = self.single.as_mut() {
            let result = match failure {
                PollFailure::Negative(nrc) => Err(PollSingleError::Negative(nrc)),
                PollFailure::TransmitFailed => Err(PollSingleError::TxFailure),
                PollFailure::ChannelClosed => Ok(std::mem::take(&mut capture.response)),
            };
            self.finish_single(result);
            return;
        }
        debug!(
            bus = %self.bus_id,
            service = format!("0x{:02X}", self.job.service_type),
            pid = format!("0x{:X}", self.job.pid),
            %failure,
            "Poll error"
        );
        self.sink.on_poll_error(&self.job, failure);
    }

    // =========================================================================
    // Single requests
    // =========================================================================

    async fn start_single(&mut self, request: SingleRequest) {
        if request.reply.is_closed() || Instant::now() >= request.deadline {
            debug!(bus = %self.bus_id, "Dropping abandoned single request");
            return;
        }

        debug!(
            bus = %self.bus_id,
            tx_id = format!("0x{:X}", request.entry.tx_module_id),
            rx_id = format!("0x{:X}", request.entry.rx_module_id),
            service = format!("0x{:02X}", request.entry.service_type),
            pid = format!("0x{:X}", request.entry.pid),
            protocol = %request.entry.protocol,
            "Single request"
        );

        let saved = self.scheduler.snapshot();
        let list: PollList = Arc::from(vec![request.entry]);
        self.scheduler.set_list(Some(list), Some(self.bus_id));
        self.single = Some(SingleCapture {
            reply: request.reply,
            deadline: request.deadline,
            response: Vec::new(),
            saved,
        });

        // preempt whatever is in flight
        self.wait = 0;
        self.job.reset_multiframe();

        match self.scheduler.next_due() {
            NextPoll::Due(entry) => self.dispatch(entry).await,
            _ => self.finish_single(Err(PollSingleError::InvalidRequest(
                "request is not pollable on this bus",
            ))),
        }
    }

    /// Resolve the active single request and restore the periodic list
    fn finish_single(&mut self, result: SingleResult) {
        let Some(capture) = self.single.take() else {
            return;
        };
        match &result {
            Ok(data) => debug!(bus = %self.bus_id, len = data.len(), "Single request done"),
            Err(e) => debug!(bus = %self.bus_id, error = %e, "Single request failed"),
        }
        // the caller may have given up already
        let _ = capture.reply.send(result);
        self.scheduler.restore(capture.saved);
        self.wait = 0;
    }

    /// Abandon a single request whose caller timed out or got no response
    fn expire_single(&mut self) {
        let Some(capture) = self.single.as_ref() else {
            return;
        };
        if capture.reply.is_closed() || Instant::now() >= capture.deadline || self.wait == 0 {
            debug!(bus = %self.bus_id, wait = self.wait, "Single request timed out");
            self.finish_single(Err(PollSingleError::Timeout));
        }
    }
}
