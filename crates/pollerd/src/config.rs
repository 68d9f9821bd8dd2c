//! pollerd configuration file
//!
//! ```toml
//! default_bus = 1
//! state = 1
//!
//! [poller]
//! tick_ms = 1000
//! sequence_max = 1
//! time_between_success_ms = 0
//!
//! [[buses]]
//! number = 1
//! type = "socketcan"
//! interface = "can0"
//!
//! [[polls]]
//! tx_id = "0x7E0"
//! rx_id = "0x7E8"
//! service = "0x22"
//! pid = "0xF40C"
//! intervals = [0, 10, 2]
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use vehicle_poller::config::{BusConfig, BusKind, PollEntryConfig};
use vehicle_poller::{BusId, ConfigError, PollEntry, PollerConfig};

/// Complete daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Poller timing and throttling
    #[serde(default)]
    pub poller: PollerConfig,

    /// CAN buses; a single mock bus if empty
    #[serde(default)]
    pub buses: Vec<BusConfig>,

    /// Bus for poll entries without an explicit bus
    #[serde(default = "default_bus")]
    pub default_bus: u8,

    /// Initial poll state
    #[serde(default)]
    pub state: u8,

    #[serde(default)]
    pub polls: Vec<PollEntryConfig>,
}

fn default_bus() -> u8 {
    1
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poller: PollerConfig::default(),
            buses: Vec::new(),
            default_bus: default_bus(),
            state: 0,
            polls: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.poller.validate()?;

        let mut numbers = BTreeSet::new();
        for bus in &self.buses {
            if BusId::new(bus.number).is_none() {
                return Err(invalid("buses.number", format!("{} is out of range", bus.number)));
            }
            if !numbers.insert(bus.number) {
                return Err(invalid("buses.number", format!("bus {} configured twice", bus.number)));
            }
        }

        let default_bus = self.default_bus_id()?;
        if !self.bus_configs().iter().any(|b| b.number == default_bus.number()) {
            return Err(invalid(
                "default_bus",
                format!("bus {} is not configured", self.default_bus),
            ));
        }

        self.poll_list().map(|_| ())
    }

    pub fn default_bus_id(&self) -> Result<BusId, ConfigError> {
        BusId::new(self.default_bus)
            .ok_or_else(|| invalid("default_bus", format!("{} is out of range", self.default_bus)))
    }

    /// Configured buses, or one mock bus on the default bus number
    pub fn bus_configs(&self) -> Vec<BusConfig> {
        if self.buses.is_empty() {
            vec![BusConfig {
                number: self.default_bus,
                kind: BusKind::default(),
            }]
        } else {
            self.buses.clone()
        }
    }

    pub fn poll_list(&self) -> Result<Vec<PollEntry>, ConfigError> {
        self.polls.iter().map(PollEntry::try_from).collect()
    }
}

fn invalid(field: &'static str, message: String) -> ConfigError {
    ConfigError::Invalid { field, message }
}
