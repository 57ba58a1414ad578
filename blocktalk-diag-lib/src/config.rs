use std::path::Path;

use log::{debug, info, warn, LevelFilter};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Configurable log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    #[must_use]
    pub const fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Off => LevelFilter::Off,
            Self::Error => LevelFilter::Error,
            Self::Warn => LevelFilter::Warn,
            Self::Info => LevelFilter::Info,
            Self::Debug => LevelFilter::Debug,
            Self::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

/// Serial line parameters. A `port` of the form `tcp://host:port` connects to
/// a Wi-Fi adapter (or the mock server) instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerialSettings {
    #[serde(default = "default_port")]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: Parity,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: FlowControl,
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

const fn default_baud_rate() -> u32 {
    38400
}

const fn default_data_bits() -> u8 {
    8
}

const fn default_stop_bits() -> u8 {
    1
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: Parity::default(),
            stop_bits: default_stop_bits(),
            flow_control: FlowControl::default(),
        }
    }
}

/// Adapter receive timeouts (`AT ST`) used for the three request classes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Timeouts {
    /// Session setup, identification and misc requests
    #[serde(default = "default_slow_ms")]
    pub slow_ms: u16,
    /// Channel setup
    #[serde(default = "default_norm_ms")]
    pub norm_ms: u16,
    /// Measuring block reads
    #[serde(default = "default_fast_ms")]
    pub fast_ms: u16,
}

const fn default_slow_ms() -> u16 {
    40
}

const fn default_norm_ms() -> u16 {
    24
}

const fn default_fast_ms() -> u16 {
    16
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            slow_ms: default_slow_ms(),
            norm_ms: default_norm_ms(),
            fast_ms: default_fast_ms(),
        }
    }
}

/// Largest receive timeout `AT ST` can express (0xFF * 4 ms).
pub const MAX_RECV_TIMEOUT_MS: u16 = 1020;

/// Keep-alive intervals shorter than this would starve block polling.
pub const MIN_KEEP_ALIVE_MS: u64 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default)]
    pub serial: SerialSettings,
    #[serde(default)]
    pub timeouts: Timeouts,
    /// Interval between `A3` channel tests
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    /// How long to wait for each adapter line
    #[serde(default = "default_line_timeout_ms")]
    pub line_timeout_ms: u64,
    /// Re-request measuring blocks if no answer arrived within this time
    #[serde(default = "default_block_watchdog_ms")]
    pub block_watchdog_ms: u64,
}

const fn default_keep_alive_ms() -> u64 {
    500
}

const fn default_line_timeout_ms() -> u64 {
    1100
}

const fn default_block_watchdog_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            serial: SerialSettings::default(),
            timeouts: Timeouts::default(),
            keep_alive_ms: default_keep_alive_ms(),
            line_timeout_ms: default_line_timeout_ms(),
            block_watchdog_ms: default_block_watchdog_ms(),
        }
    }
}

impl Timeouts {
    /// Clamp every timeout to what `AT ST` can express.
    pub fn validate(&mut self) {
        for (name, value) in [
            ("slow_ms", &mut self.slow_ms),
            ("norm_ms", &mut self.norm_ms),
            ("fast_ms", &mut self.fast_ms),
        ] {
            if *value > MAX_RECV_TIMEOUT_MS {
                warn!("Clamping {name} from {value} to {MAX_RECV_TIMEOUT_MS}");
                *value = MAX_RECV_TIMEOUT_MS;
            }
        }
    }
}

impl Config {
    /// Clamp values to valid ranges (e.g., timeout limits)
    pub fn validate(&mut self) {
        self.timeouts.validate();
        if self.keep_alive_ms < MIN_KEEP_ALIVE_MS {
            warn!("Raising keep_alive_ms from {} to {}", self.keep_alive_ms, MIN_KEEP_ALIVE_MS);
            self.keep_alive_ms = MIN_KEEP_ALIVE_MS;
        }
        if !(5..=8).contains(&self.serial.data_bits) {
            warn!("Invalid data_bits {}, using 8", self.serial.data_bits);
            self.serial.data_bits = 8;
        }
        if !(1..=2).contains(&self.serial.stop_bits) {
            warn!("Invalid stop_bits {}, using 1", self.serial.stop_bits);
            self.serial.stop_bits = 1;
        }
    }

    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(mut config) => {
                info!("Loaded config from {}", path.display());
                config.validate();
                config
            }
            Err(e) => {
                warn!("Failed to load config from {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let buf = std::fs::read(path)?;
        debug!("Config size: {} bytes", buf.len());
        let config: Config = serde_json::from_slice(&buf)?;
        debug!(
            "Config parsed: port={:?}, log_level={:?}",
            config.serial.port, config.log_level
        );
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        debug!("Saving config to {}", path.display());
        let json = serde_json::to_vec_pretty(self)?;
        debug!("Config JSON size: {} bytes", json.len());
        std::fs::write(path, &json)?;
        info!("Config saved to {}", path.display());
        Ok(())
    }
}
