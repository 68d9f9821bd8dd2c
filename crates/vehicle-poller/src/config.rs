//! Poller configuration
//!
//! Timing, throttling and bus settings plus the serialized form of poll
//! list entries. Loaded from TOML by the daemon.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::poll::{PollEntry, PollPayload, Protocol, POLL_STATES};

/// Poller runtime configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Tick timer period in milliseconds, `0` disables the internal timer
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Every n-th tick is primary, the others secondary (`0`/`1` = all primary)
    #[serde(default)]
    pub secondary_ticks: u8,
    /// Polls sent in sequence per tick, `0` = unlimited
    #[serde(default = "default_sequence_max")]
    pub sequence_max: u8,
    /// ISO-TP flow control separation time requested from ECUs
    #[serde(default = "default_fc_septime")]
    pub fc_septime: u8,
    /// VWTP channel inactivity timeout in seconds, `0` = keep open
    #[serde(default = "default_keepalive")]
    pub channel_keepalive_secs: u16,
    /// Delay between a successful response and the next chained poll in
    /// milliseconds, `0` = chain immediately
    #[serde(default)]
    pub time_between_success_ms: u16,
    /// Default timeout for single requests
    #[serde(default = "default_single_timeout_ms")]
    pub single_timeout_ms: u64,
    /// Consecutive frame index check for ISO-TP responses
    #[serde(default)]
    pub isotp_sequence: SequencePolicy,
    /// Capacity of the poller command queue
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_sequence_max() -> u8 {
    1
}

fn default_fc_septime() -> u8 {
    25
}

fn default_keepalive() -> u16 {
    60
}

fn default_single_timeout_ms() -> u64 {
    3000
}

fn default_command_queue() -> usize {
    64
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            secondary_ticks: 0,
            sequence_max: default_sequence_max(),
            fc_septime: default_fc_septime(),
            channel_keepalive_secs: default_keepalive(),
            time_between_success_ms: 0,
            single_timeout_ms: default_single_timeout_ms(),
            isotp_sequence: SequencePolicy::default(),
            command_queue: default_command_queue(),
        }
    }
}

impl PollerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_septime(self.fc_septime)?;
        if self.command_queue == 0 {
            return Err(ConfigError::invalid("command_queue", "must be at least 1"));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Option<Duration> {
        (self.tick_ms > 0).then(|| Duration::from_millis(self.tick_ms))
    }

    pub fn single_timeout(&self) -> Duration {
        Duration::from_millis(self.single_timeout_ms)
    }

    pub fn time_between_success(&self) -> Duration {
        Duration::from_millis(u64::from(self.time_between_success_ms))
    }
}

/// Check an ISO-TP separation time: `0..=127` ms or `241..=249` (100..900 us)
pub fn validate_septime(septime: u8) -> Result<(), ConfigError> {
    if septime <= 127 || (241..=249).contains(&septime) {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            "fc_septime",
            format!("{} is not a valid separation time", septime),
        ))
    }
}

/// How strictly ISO-TP consecutive frame indices are checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequencePolicy {
    /// Accept an index at or below the expected one (devices counting the
    /// first consecutive frame from 0); abort only when a frame is skipped
    #[default]
    Lenient,
    /// Abort on any index other than the expected one
    Strict,
}

// =============================================================================
// Bus Configuration
// =============================================================================

/// One CAN bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus number 1..=4
    pub number: u8,
    #[serde(flatten)]
    pub kind: BusKind,
}

/// Bus driver selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BusKind {
    /// SocketCAN raw socket (Linux only)
    SocketCan(SocketCanConfig),
    /// Mock bus for testing
    Mock(MockBusConfig),
}

impl Default for BusKind {
    fn default() -> Self {
        Self::Mock(MockBusConfig::default())
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
}

/// Mock bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MockBusConfig {
    #[serde(default = "default_mock_name")]
    pub name: String,
}

fn default_mock_name() -> String {
    "mock".to_string()
}

impl Default for MockBusConfig {
    fn default() -> Self {
        Self {
            name: default_mock_name(),
        }
    }
}

// =============================================================================
// Poll List Configuration
// =============================================================================

/// Serialized poll list entry
///
/// ```toml
/// [[polls]]
/// tx_id = "0x7E0"
/// rx_id = "0x7E8"
/// service = "0x22"
/// pid = "0xF40C"
/// intervals = [0, 10, 2]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollEntryConfig {
    pub tx_id: String,
    /// `"0"` polls as OBD broadcast
    #[serde(default = "default_rx_id")]
    pub rx_id: String,
    pub service: String,
    #[serde(default = "default_rx_id")]
    pub pid: String,
    /// Extra request bytes as hex string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Interval in ticks per poll state (missing states are not polled)
    #[serde(default)]
    pub intervals: Vec<u16>,
    /// Bus number, `0` = default bus
    #[serde(default)]
    pub bus: u8,
    #[serde(default)]
    pub protocol: Protocol,
}

fn default_rx_id() -> String {
    "0".to_string()
}

impl TryFrom<&PollEntryConfig> for PollEntry {
    type Error = ConfigError;

    fn try_from(config: &PollEntryConfig) -> Result<Self, Self::Error> {
        let tx_id = parse_can_id(&config.tx_id)?;
        if tx_id == 0 {
            return Err(ConfigError::invalid("tx_id", "must not be 0"));
        }
        let rx_id = parse_can_id(&config.rx_id)?;
        let service = u8::try_from(parse_can_id(&config.service)?)
            .map_err(|_| ConfigError::invalid("service", config.service.clone()))?;
        let pid = u16::try_from(parse_can_id(&config.pid)?)
            .map_err(|_| ConfigError::invalid("pid", config.pid.clone()))?;

        if config.intervals.len() > POLL_STATES {
            return Err(ConfigError::invalid(
                "intervals",
                format!("at most {} poll states", POLL_STATES),
            ));
        }
        let mut intervals = [0u16; POLL_STATES];
        intervals[..config.intervals.len()].copy_from_slice(&config.intervals);

        let payload = match &config.data {
            Some(data) => PollPayload::from_slice(&parse_hex_data(data)?),
            None => PollPayload::empty(),
        };
        if config.bus > crate::bus::BusId::MAX {
            return Err(ConfigError::invalid("bus", config.bus.to_string()));
        }

        Ok(PollEntry::new(tx_id, rx_id, service, pid)
            .with_intervals(intervals)
            .with_payload(payload)
            .with_protocol(config.protocol)
            .on_bus(config.bus))
    }
}

/// Parse a CAN id / numeric field from a hex string (with or without "0x")
pub fn parse_can_id(s: &str) -> Result<u32, ConfigError> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16)
        .map_err(|e| ConfigError::invalid("id", format!("'{}': {}", s, e)))
}

/// Parse hex bytes, ignoring whitespace ("22 F1 90" or "22f190")
pub fn parse_hex_data(s: &str) -> Result<Vec<u8>, ConfigError> {
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.strip_prefix("0x").unwrap_or(&compact);
    hex::decode(compact).map_err(|e| ConfigError::invalid("data", format!("'{}': {}", s, e)))
}
