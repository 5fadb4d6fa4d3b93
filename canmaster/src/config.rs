//! Network and node configuration, loaded from TOML
//!
//! Example:
//!
//! ```toml
//! sdo_timeout_ms = 500
//! sync_period_ms = 10
//! sync_counter_overflow = 16
//! sync_window_us = 5000
//!
//! [nodes.5]
//! heartbeat_ms = 100
//!
//! [nodes.5.tpdo.1]
//! enabled = true
//! transmission_type = 1
//! inhibit_time = 50
//! mappings = [
//!     { index = 0x6041, sub = 0, size = 16 },
//!     { index = 0x6064, sub = 0, size = 32 },
//! ]
//! ```

use std::{collections::HashMap, fmt::Display, hash::Hash, path::Path, str::FromStr, time::Duration};

use canmaster_common::pdo::{PdoMapping, TransmissionType};
use serde::{de::Error as _, Deserialize, Deserializer};
use snafu::{ResultExt, Snafu};

use crate::{heartbeat::Supervision, sync::SyncSettings};

/// Errors loading a configuration
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The file could not be read
    #[snafu(display("IO error reading {path}: {source}"))]
    Io {
        /// The file which failed
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
    /// The TOML did not parse, or did not match the expected layout
    #[snafu(display("Failed to parse config: {source}"))]
    Parse {
        /// The TOML error
        source: toml::de::Error,
    },
    /// The values are inconsistent
    #[snafu(display("Invalid config: {message}"))]
    Invalid {
        /// What is wrong
        message: String,
    },
}

type Result<T> = std::result::Result<T, ConfigError>;

/// TOML table keys are strings; parse them as numbers
fn numeric_keys<'de, D, K, V>(deserializer: D) -> std::result::Result<HashMap<K, V>, D::Error>
where
    D: Deserializer<'de>,
    K: FromStr + Eq + Hash,
    K::Err: Display,
    V: Deserialize<'de>,
{
    HashMap::<String, V>::deserialize(deserializer)?
        .into_iter()
        .map(|(key, value)| {
            key.parse()
                .map(|k| (k, value))
                .map_err(|e| D::Error::custom(format!("invalid key \"{key}\": {e}")))
        })
        .collect()
}

/// Network wide settings
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Time to wait for each SDO server response
    pub sdo_timeout_ms: u64,
    /// Attempts at handing a frame to the transport before reporting a send failure
    pub sdo_send_retries: usize,
    /// SYNC period; SYNC production starts on connect when set
    pub sync_period_ms: Option<u64>,
    /// SYNC counter overflow value (0x1019), 2 to 240; 0 sends SYNC without a counter
    pub sync_counter_overflow: u8,
    /// Synchronous window length (0x1007) in microseconds, 0 for none
    ///
    /// Synchronous RPDOs are only sent inside the window following a SYNC.
    pub sync_window_us: u32,
    /// A node missing heartbeats for `period * heartbeat_grace_factor` is flagged
    pub heartbeat_grace_factor: f64,
    /// Unanswered guarding requests before a node is flagged, when its life time factor is 0
    pub guard_miss_limit: u8,
    /// Period of the liveness supervision tick
    pub supervision_tick_ms: u64,
    /// Use block transfers for variable length values in [`SdoClient::read`] and
    /// [`SdoClient::write`](crate::SdoClient::write)
    ///
    /// [`SdoClient::read`]: crate::SdoClient::read
    pub block_transfer: bool,
    /// Values longer than this many bytes use block downloads when `block_transfer` is set
    pub block_threshold: usize,
    /// Per node settings, keyed by node ID
    #[serde(deserialize_with = "numeric_keys")]
    pub nodes: HashMap<u8, NodeConfig>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sdo_timeout_ms: 1000,
            sdo_send_retries: 3,
            sync_period_ms: None,
            sync_counter_overflow: 0,
            sync_window_us: 0,
            heartbeat_grace_factor: 2.0,
            guard_miss_limit: 3,
            supervision_tick_ms: 10,
            block_transfer: false,
            block_threshold: 64,
            nodes: HashMap::new(),
        }
    }
}

impl NetworkConfig {
    /// Parse a configuration from a TOML string
    pub fn load_from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path).context(IoSnafu {
            path: path.display().to_string(),
        })?;
        Self::load_from_str(&s)
    }

    fn validate(&self) -> Result<()> {
        if !(self.heartbeat_grace_factor >= 1.0) {
            return InvalidSnafu {
                message: "heartbeat_grace_factor must be at least 1.0",
            }
            .fail();
        }
        if self.sync_counter_overflow == 1 || self.sync_counter_overflow > 240 {
            return InvalidSnafu {
                message: "sync_counter_overflow must be 0 or between 2 and 240",
            }
            .fail();
        }
        if self.supervision_tick_ms == 0 {
            return InvalidSnafu {
                message: "supervision_tick_ms must be non-zero",
            }
            .fail();
        }
        for (id, node) in &self.nodes {
            if !(1..=127).contains(id) {
                return InvalidSnafu {
                    message: format!("node ID {id} out of range"),
                }
                .fail();
            }
            node.validate()
                .map_err(|message| ConfigError::Invalid {
                    message: format!("node {id}: {message}"),
                })?;
        }
        Ok(())
    }

    /// The SDO response timeout
    pub fn sdo_timeout(&self) -> Duration {
        Duration::from_millis(self.sdo_timeout_ms)
    }

    /// The SYNC period, if SYNC production is configured
    pub fn sync_period(&self) -> Option<Duration> {
        self.sync_period_ms.map(Duration::from_millis)
    }

    /// SYNC counter and window settings
    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            counter_overflow: self.sync_counter_overflow,
            window: (self.sync_window_us > 0)
                .then(|| Duration::from_micros(self.sync_window_us as u64)),
        }
    }

    /// The supervision tick
    pub fn supervision_tick(&self) -> Duration {
        Duration::from_millis(self.supervision_tick_ms)
    }
}

/// Node guarding parameters
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GuardingConfig {
    /// Poll interval
    pub guard_time_ms: u64,
    /// Unanswered polls before the node is flagged; 0 uses the network's `guard_miss_limit`
    #[serde(default)]
    pub life_time_factor: u8,
}

/// Configuration of one PDO
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PdoTableConfig {
    /// Frame identifier; the predefined connection set default is kept when absent
    pub cob_id: Option<u32>,
    /// Whether the PDO is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Transmission type
    #[serde(default = "default_transmission_type")]
    pub transmission_type: u8,
    /// Event timer in ms, 0 for none
    #[serde(default)]
    pub event_timer: u16,
    /// Minimum spacing of event driven transmissions in units of 100 µs, 0 for none
    #[serde(default)]
    pub inhibit_time: u16,
    /// Mapped objects, in order
    #[serde(default)]
    pub mappings: Vec<PdoMapping>,
}

fn default_transmission_type() -> u8 {
    255
}

/// Per node settings
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    /// Expected heartbeat producer period of the node
    pub heartbeat_ms: Option<u64>,
    /// Node guarding, as an alternative to heartbeat consumption
    pub guarding: Option<GuardingConfig>,
    /// TPDOs, keyed by PDO number starting at 1
    #[serde(deserialize_with = "numeric_keys")]
    pub tpdo: HashMap<usize, PdoTableConfig>,
    /// RPDOs, keyed by PDO number starting at 1
    #[serde(deserialize_with = "numeric_keys")]
    pub rpdo: HashMap<usize, PdoTableConfig>,
}

impl NodeConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.heartbeat_ms.is_some() && self.guarding.is_some() {
            return Err("heartbeat_ms and guarding are mutually exclusive".into());
        }
        for (kind, table) in [("tpdo", &self.tpdo), ("rpdo", &self.rpdo)] {
            for (n, pdo) in table {
                if !(1..=crate::pdo::PDO_COUNT).contains(n) {
                    return Err(format!("{kind} {n} does not exist"));
                }
                if let Err(e) = TransmissionType::try_from(pdo.transmission_type) {
                    return Err(format!("{kind} {n}: {e}"));
                }
                let bits: u32 = pdo.mappings.iter().map(|m| m.size as u32).sum();
                if bits > 64 {
                    return Err(format!("{kind} {n}: mapping needs {bits} bits"));
                }
            }
        }
        Ok(())
    }

    /// The liveness supervision these settings select
    pub fn supervision(&self) -> Supervision {
        match (self.heartbeat_ms, self.guarding) {
            (Some(ms), _) => Supervision::Heartbeat {
                period: Duration::from_millis(ms),
            },
            (None, Some(g)) => Supervision::Guarding {
                guard_time: Duration::from_millis(g.guard_time_ms),
                life_time_factor: g.life_time_factor,
            },
            (None, None) => Supervision::Off,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let cfg = NetworkConfig::load_from_str("").unwrap();
        assert_eq!(NetworkConfig::default(), cfg);
        assert_eq!(Duration::from_secs(1), cfg.sdo_timeout());
        assert_eq!(None, cfg.sync_period());
        assert_eq!(2.0, cfg.heartbeat_grace_factor);
    }

    #[test]
    fn node_tables_load() {
        const CFG: &str = r#"
            sdo_timeout_ms = 250
            sync_period_ms = 10

            [nodes.5]
            heartbeat_ms = 100

            [nodes.5.tpdo.1]
            enabled = true
            transmission_type = 1
            inhibit_time = 50
            mappings = [
                { index = 0x6041, sub = 0, size = 16 },
                { index = 0x6064, sub = 0, size = 32 },
            ]

            [nodes.6.guarding]
            guard_time_ms = 50
        "#;
        let cfg = NetworkConfig::load_from_str(CFG).unwrap();
        assert_eq!(Some(Duration::from_millis(10)), cfg.sync_period());
        let node = &cfg.nodes[&5];
        assert_eq!(
            Supervision::Heartbeat {
                period: Duration::from_millis(100)
            },
            node.supervision()
        );
        let tpdo = &node.tpdo[&1];
        assert!(tpdo.enabled);
        assert_eq!(None, tpdo.cob_id);
        assert_eq!(50, tpdo.inhibit_time);
        assert_eq!(0, tpdo.event_timer);
        assert_eq!(2, tpdo.mappings.len());
        assert_eq!(
            PdoMapping {
                index: 0x6064,
                sub: 0,
                size: 32
            },
            tpdo.mappings[1]
        );
        assert_eq!(
            Supervision::Guarding {
                guard_time: Duration::from_millis(50),
                life_time_factor: 0
            },
            cfg.nodes[&6].supervision()
        );
    }

    #[test]
    fn heartbeat_and_guarding_conflict() {
        const CFG: &str = r#"
            [nodes.2]
            heartbeat_ms = 100
            guarding = { guard_time_ms = 100, life_time_factor = 3 }
        "#;
        assert!(matches!(
            NetworkConfig::load_from_str(CFG),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn sync_counter_and_window() {
        const CFG: &str = r#"
            sync_period_ms = 10
            sync_counter_overflow = 16
            sync_window_us = 2500
        "#;
        let cfg = NetworkConfig::load_from_str(CFG).unwrap();
        assert_eq!(
            SyncSettings {
                counter_overflow: 16,
                window: Some(Duration::from_micros(2500)),
            },
            cfg.sync_settings()
        );
        assert_eq!(SyncSettings::default(), NetworkConfig::default().sync_settings());
        assert!(matches!(
            NetworkConfig::load_from_str("sync_counter_overflow = 1"),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            NetworkConfig::load_from_str("sync_counter_overflow = 241"),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(matches!(
            NetworkConfig::load_from_str("sdo_timeout = 5"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn reserved_transmission_type_rejected() {
        const CFG: &str = r#"
            [nodes.2.rpdo.1]
            transmission_type = 245
        "#;
        assert!(matches!(
            NetworkConfig::load_from_str(CFG),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
