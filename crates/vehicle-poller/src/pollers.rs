//! Poller task and its handle
//!
//! All engines live on one task. Received frames, transmit results, timer
//! ticks, settings and single requests reach it as [`Command`]s through a
//! bounded queue, so engine state is only ever touched from that task and
//! callers never hold a lock across a poll. The [`PollerHandle`] is the
//! cloneable sending side.
//!
//! ```text
//!  CAN reader ──frame_received──┐
//!  bus driver ──tx_complete─────┤
//!  callers ─────set_*/single────┼──▶ mpsc ──▶ PollerRuntime::run ──▶ PollerEngine (per bus)
//!  interval timer ──────────────┘                                      │
//!                                                                      ▼
//!                                                               ResponseSink
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{BusId, CanBus, CanFrame};
use crate::config::{validate_septime, PollerConfig};
use crate::engine::{PollerEngine, SingleRequest, SINGLE_INTERVAL};
use crate::error::{ConfigError, PollSingleError, PollerError};
use crate::isotp::ISOTP_MAX_LEN;
use crate::poll::{PollEntry, PollList, PollPayload, Protocol, POLL_STATES};
use crate::sink::ResponseSink;
use crate::uds::{encode_request, PidWidth};

pub use crate::engine::{PollerStatus, TickKind};

/// Work item for the poller task
enum Command {
    Frame(CanFrame),
    TxComplete {
        frame: CanFrame,
        success: bool,
    },
    Tick(TickKind),
    /// A delayed chained poll is due on some engine
    SendSuccess,
    SetPidList {
        list: Option<PollList>,
        default_bus: Option<BusId>,
    },
    SetState {
        state: u8,
        bus: Option<BusId>,
    },
    Pause(bool),
    SetThrottling(u8),
    SetSeptime(u8),
    SetKeepalive(u16),
    SetTimeBetweenSuccess(u16),
    Single {
        bus: BusId,
        request: SingleRequest,
    },
    Status(oneshot::Sender<Vec<PollerStatus>>),
    Shutdown(oneshot::Sender<()>),
}

/// Owner of all bus engines, run as one task
pub struct PollerRuntime {
    config: PollerConfig,
    sink: Arc<dyn ResponseSink>,
    engines: BTreeMap<BusId, PollerEngine>,
    commands: mpsc::Receiver<Command>,
}

impl PollerRuntime {
    /// Create the runtime and its handle
    pub fn new(
        config: PollerConfig,
        sink: Arc<dyn ResponseSink>,
    ) -> Result<(Self, PollerHandle), ConfigError> {
        config.validate()?;
        let (tx, rx) = mpsc::channel(config.command_queue);
        let handle = PollerHandle {
            commands: tx,
            single_timeout: config.single_timeout(),
        };
        Ok((
            Self {
                config,
                sink,
                engines: BTreeMap::new(),
                commands: rx,
            },
            handle,
        ))
    }

    /// Attach a bus; replaces an engine already registered for `id`
    pub fn add_bus(&mut self, id: BusId, bus: Arc<dyn CanBus>) {
        debug!(bus = %id, name = bus.name(), "Bus attached");
        let engine = PollerEngine::new(id, bus, self.sink.clone(), &self.config);
        self.engines.insert(id, engine);
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process commands until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            buses = self.engines.len(),
            tick_ms = self.config.tick_ms,
            sequence_max = self.config.sequence_max,
            "Poller started"
        );

        let mut timer = self.config.tick_period().map(|period| {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let secondary = u64::from(self.config.secondary_ticks.max(1));
        let mut tick_count: u64 = 0;

        loop {
            let success_due = self
                .engines
                .values()
                .filter_map(PollerEngine::success_deadline)
                .min();
            let command = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                _ = next_tick(timer.as_mut()) => {
                    let kind = if tick_count % secondary == 0 {
                        TickKind::Primary
                    } else {
                        TickKind::Secondary
                    };
                    tick_count = tick_count.wrapping_add(1);
                    Command::Tick(kind)
                }
                _ = sleep_until(success_due) => Command::SendSuccess,
            };

            if let Command::Shutdown(done) = command {
                self.shutdown().await;
                let _ = done.send(());
                return;
            }
            self.execute(command).await;
        }

        debug!("All poller handles dropped");
        self.shutdown().await;
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Frame(frame) => {
                if let Some(engine) = self.engines.get_mut(&frame.bus) {
                    engine.handle_frame(frame).await;
                }
            }
            Command::TxComplete { frame, success } => {
                if let Some(engine) = self.engines.get_mut(&frame.bus) {
                    engine.tx_complete(&frame, success).await;
                }
            }
            Command::Tick(kind) => {
                for engine in self.engines.values_mut() {
                    engine.tick(kind).await;
                }
            }
            Command::SendSuccess => {
                for engine in self.engines.values_mut() {
                    engine.send_success().await;
                }
            }
            Command::SetPidList { list, default_bus } => {
                info!(
                    entries = list.as_ref().map_or(0, |l| l.len()),
                    default_bus = ?default_bus,
                    "Poll list installed"
                );
                for engine in self.engines.values_mut() {
                    engine.set_list(list.clone(), default_bus);
                }
            }
            Command::SetState { state, bus } => {
                for (id, engine) in self.engines.iter_mut() {
                    if bus.map_or(true, |b| b == *id) {
                        engine.set_state(state);
                    }
                }
            }
            Command::Pause(paused) => {
                info!(paused, "Poller pause state changed");
                for engine in self.engines.values_mut() {
                    engine.set_paused(paused);
                }
            }
            Command::SetThrottling(sequence_max) => {
                for engine in self.engines.values_mut() {
                    engine.set_sequence_max(sequence_max);
                }
            }
            Command::SetSeptime(septime) => {
                for engine in self.engines.values_mut() {
                    engine.set_fc_septime(septime);
                }
            }
            Command::SetKeepalive(seconds) => {
                for engine in self.engines.values_mut() {
                    engine.set_keepalive(seconds);
                }
            }
            Command::SetTimeBetweenSuccess(ms) => {
                for engine in self.engines.values_mut() {
                    engine.set_time_between_success(ms);
                }
            }
            Command::Single { bus, request } => match self.engines.get_mut(&bus) {
                Some(engine) => engine.submit_single(request).await,
                None => {
                    warn!(%bus, "Single request for unconfigured bus");
                    let _ = request.reply.send(Err(PollSingleError::Unavailable));
                }
            },
            Command::Status(reply) => {
                let status = self.engines.values().map(PollerEngine::status).collect();
                let _ = reply.send(status);
            }
            Command::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn shutdown(&mut self) {
        for engine in self.engines.values_mut() {
            engine.shutdown().await;
        }
        info!("Poller stopped");
    }
}

/// Next timer tick, or never without a timer
async fn next_tick(timer: Option<&mut Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sleep until `deadline`, or forever without one
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable access to a running poller
#[derive(Clone)]
pub struct PollerHandle {
    commands: mpsc::Sender<Command>,
    single_timeout: Duration,
}

impl PollerHandle {
    async fn send(&self, command: Command) -> Result<(), PollerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| PollerError::NotRunning)
    }

    /// Feed a received frame into the poller
    pub async fn frame_received(&self, frame: CanFrame) -> Result<(), PollerError> {
        self.send(Command::Frame(frame)).await
    }

    /// [`frame_received`](Self::frame_received) for reader threads outside
    /// the async runtime
    pub fn blocking_frame_received(&self, frame: CanFrame) -> Result<(), PollerError> {
        self.commands
            .blocking_send(Command::Frame(frame))
            .map_err(|_| PollerError::NotRunning)
    }

    /// Report the transmit result of a frame (drivers with
    /// [`reports_tx_completion`](CanBus::reports_tx_completion) only)
    pub async fn tx_complete(&self, frame: CanFrame, success: bool) -> Result<(), PollerError> {
        self.send(Command::TxComplete { frame, success }).await
    }

    /// Drive a tick from outside (for runtimes configured without timer)
    pub async fn tick(&self, kind: TickKind) -> Result<(), PollerError> {
        self.send(Command::Tick(kind)).await
    }

    /// Install a poll list; entries with bus `0` poll on `default_bus`
    pub async fn set_pid_list(
        &self,
        list: impl Into<PollList>,
        default_bus: BusId,
    ) -> Result<(), PollerError> {
        self.send(Command::SetPidList {
            list: Some(list.into()),
            default_bus: Some(default_bus),
        })
        .await
    }

    /// Stop all periodic polling
    pub async fn clear_pid_list(&self) -> Result<(), PollerError> {
        self.send(Command::SetPidList {
            list: None,
            default_bus: None,
        })
        .await
    }

    /// Select the poll state on one bus, or all buses with `None`
    pub async fn set_state(&self, state: u8, bus: Option<BusId>) -> Result<(), PollerError> {
        self.send(Command::SetState { state, bus }).await
    }

    pub async fn pause(&self) -> Result<(), PollerError> {
        self.send(Command::Pause(true)).await
    }

    pub async fn resume(&self) -> Result<(), PollerError> {
        self.send(Command::Pause(false)).await
    }

    /// Polls sent in sequence per tick, `0` = unlimited
    pub async fn set_throttling(&self, sequence_max: u8) -> Result<(), PollerError> {
        self.send(Command::SetThrottling(sequence_max)).await
    }

    /// ISO-TP separation time requested in our flow control frames
    pub async fn set_response_separation_time(&self, septime: u8) -> Result<(), PollerError> {
        validate_septime(septime)?;
        self.send(Command::SetSeptime(septime)).await
    }

    /// VWTP channel inactivity timeout, `0` = keep open
    pub async fn set_channel_keepalive(&self, seconds: u16) -> Result<(), PollerError> {
        self.send(Command::SetKeepalive(seconds)).await
    }

    /// Delay in milliseconds between a successful response and the next
    /// chained poll, `0` = chain immediately
    pub async fn set_time_between_success(&self, ms: u16) -> Result<(), PollerError> {
        self.send(Command::SetTimeBetweenSuccess(ms)).await
    }

    /// Send one request and wait for the complete response
    ///
    /// The periodic list of `bus` is suspended while the request is active
    /// and resumes where it left off afterwards.
    ///
    /// # Arguments
    /// * `tx_id` / `rx_id` - Module ids, `rx_id = 0` for an OBD broadcast
    ///   (VWTP: channel base id / logical module id)
    /// * `request` - Service type, PID and data bytes
    /// * `timeout` - Defaults to the configured single request timeout
    ///
    /// # Returns
    /// The response payload without the envelope header.
    pub async fn poll_single_request(
        &self,
        bus: BusId,
        tx_id: u32,
        rx_id: u32,
        request: &[u8],
        timeout: Option<Duration>,
        protocol: Protocol,
    ) -> Result<Vec<u8>, PollSingleError> {
        let entry = single_entry(tx_id, rx_id, request, protocol)?;
        let deadline = Instant::now() + timeout.unwrap_or(self.single_timeout);
        let (reply, response) = oneshot::channel();

        let command = Command::Single {
            bus,
            request: SingleRequest {
                entry,
                deadline,
                reply,
            },
        };
        match tokio::time::timeout_at(deadline, self.commands.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(PollSingleError::Unavailable),
            Err(_) => return Err(PollSingleError::Timeout),
        }

        match tokio::time::timeout_at(deadline, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PollSingleError::Unavailable),
            Err(_) => Err(PollSingleError::Timeout),
        }
    }

    /// [`poll_single_request`](Self::poll_single_request) for a request
    /// without data bytes
    #[allow(clippy::too_many_arguments)]
    pub async fn poll_single_pid(
        &self,
        bus: BusId,
        tx_id: u32,
        rx_id: u32,
        service_type: u8,
        pid: u16,
        timeout: Option<Duration>,
        protocol: Protocol,
    ) -> Result<Vec<u8>, PollSingleError> {
        let request = encode_request(service_type, pid, &[]);
        self.poll_single_request(bus, tx_id, rx_id, &request, timeout, protocol)
            .await
    }

    /// Status of every bus engine
    pub async fn status(&self) -> Result<Vec<PollerStatus>, PollerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| PollerError::NotRunning)
    }

    /// Stop the poller task, failing pending single requests
    pub async fn shutdown(&self) -> Result<(), PollerError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx)).await?;
        rx.await.map_err(|_| PollerError::NotRunning)
    }
}

/// Build the one-shot entry for a single request
fn single_entry(
    tx_id: u32,
    rx_id: u32,
    request: &[u8],
    protocol: Protocol,
) -> Result<PollEntry, PollSingleError> {
    let Some(&service) = request.first() else {
        return Err(PollSingleError::InvalidRequest("empty request"));
    };
    if tx_id == 0 {
        return Err(PollSingleError::InvalidRequest("tx id must not be 0"));
    }
    let width = PidWidth::of(service);
    let header = 1 + width.len();
    if request.len() < header {
        return Err(PollSingleError::InvalidRequest("request too short for its PID"));
    }
    if request.len() > ISOTP_MAX_LEN {
        return Err(PollSingleError::InvalidRequest("request too long"));
    }
    let pid = request[1..header]
        .iter()
        .fold(0u16, |pid, &b| pid << 8 | u16::from(b));

    Ok(PollEntry::new(tx_id, rx_id, service, pid)
        .with_payload(PollPayload::from_slice(&request[header..]))
        .with_intervals([SINGLE_INTERVAL; POLL_STATES])
        .with_protocol(protocol))
}
