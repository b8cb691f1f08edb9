//! Settings file for the binaries, stored as [ron].
//!
//! Every field has a default, so a file only needs to mention what it
//! changes:
//!
//! ```text
//! (
//!     port: Some("/dev/ttyUSB0"),
//!     transmit: (min_interval_ms: Some(250)),
//! )
//! ```

use crate::args::ConnectionArgs;
use crate::emitter::RatePolicy;
use crate::error::ValidationError;
use crate::frame_codec::CanFrame;
use crate::session::{SessionOptions, DEFAULT_BAUD_RATE};
use crate::signal::SignalMode;
use crate::tp2::{self, AngleMagnitude, GroupId};
use crate::transmitter::{SyntheticPlan, DEFAULT_TICK};

use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};

use std::{
    borrow::Cow,
    fmt, fs, io,
    path::Path,
    time::Duration,
};

/// Read from the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "canmon.ron";

/// Things that can go wrong loading or saving a [Config].
#[derive(Debug)]
pub enum ConfigError {
    /// Returned when the file cannot be read or written
    IoError(io::Error),
    /// Returned when serializing fails
    RonError(ron::Error),
    /// Returned when the file is not valid ron, with the position of the problem
    RonSpannedError(ron::de::SpannedError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ConfigError as CE;
        let msg = match self {
            CE::IoError(error) => Cow::from(format!("io error: {}", error)),
            CE::RonError(error) => Cow::from(format!("ron error: {}", error)),
            CE::RonSpannedError(error) => Cow::from(format!("config syntax error: {}", error)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

/// Rate policy and timing of the synthetic transmitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    /// Delay between round-robin ticks
    pub tick_ms: u64,
    /// Minimum change, in degrees, that triggers a send
    pub change_threshold: u32,
    /// Age of the last send that triggers a refresh
    pub max_staleness_ms: u64,
    /// Per-channel floor between two sends. When unset a single group
    /// gets 250 ms and anything larger 500 ms.
    pub min_interval_ms: Option<u64>,
    /// Global cap across all channels, `None` for no cap
    pub max_sends_per_second: Option<u32>,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        let policy = RatePolicy::multi_channel();
        Self {
            tick_ms: DEFAULT_TICK.as_millis() as u64,
            change_threshold: policy.change_threshold,
            max_staleness_ms: policy.max_staleness.as_millis() as u64,
            min_interval_ms: None,
            max_sends_per_second: policy.max_sends_per_second,
        }
    }
}

impl TransmitConfig {
    /// Delay between two round-robin ticks.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// The configured policy for a transmission driving `groups` groups.
    pub fn policy(&self, groups: usize) -> RatePolicy {
        let min_interval = match self.min_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None if groups == 1 => RatePolicy::SINGLE_CHANNEL_MIN_INTERVAL,
            None => RatePolicy::MULTI_CHANNEL_MIN_INTERVAL,
        };
        RatePolicy {
            change_threshold: self.change_threshold,
            max_staleness: Duration::from_millis(self.max_staleness_ms),
            min_interval,
            max_sends_per_second: self.max_sends_per_second,
        }
    }

    /// A synthetic plan using this policy and tick.
    pub fn plan(&self, mode: SignalMode, selection: Vec<(GroupId, Vec<AngleMagnitude>)>) -> SyntheticPlan {
        SyntheticPlan {
            policy: self.policy(selection.len()),
            tick: self.tick(),
            ..SyntheticPlan::new(mode, selection)
        }
    }
}

/// A named angle that can be sent with one command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    /// What the operator types, matched without regard to case
    pub name: String,
    /// Target group
    pub group: GroupId,
    /// Which angle
    pub magnitude: AngleMagnitude,
    /// Degrees, `-179..=180`
    pub value: i32,
}

impl Preset {
    /// The TP2 frame for this preset, range-checked.
    pub fn frame(&self) -> Result<CanFrame, ValidationError> {
        tp2::angle_frame(self.group, self.magnitude, self.value)
    }
}

/// Everything the binaries read from the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Serial device, asked for interactively when unset
    pub port: Option<String>,
    /// Serial speed of the bridge
    pub baud_rate: u32,
    /// Read timeout of the serial port, which is also the reader's poll period
    pub read_timeout_ms: u64,
    /// Age after which an angle is shown as stale
    pub stale_after_ms: u64,
    /// Synthetic transmitter settings
    pub transmit: TransmitConfig,
    /// Named angles for the `preset` command
    pub presets: Vec<Preset>,
}

impl Default for Config {
    fn default() -> Self {
        let preset = |name: &str, magnitude, value| Preset {
            name: name.to_owned(),
            group: GroupId::default(),
            magnitude,
            value,
        };
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 50,
            stale_after_ms: crate::angle_store::DEFAULT_STALE_AFTER.as_millis() as u64,
            transmit: TransmitConfig::default(),
            presets: vec![
                preset("level", AngleMagnitude::Roll, 0),
                preset("flat", AngleMagnitude::Pitch, 0),
                preset("north", AngleMagnitude::Orientation, 0),
            ],
        }
    }
}

impl Config {
    /// Reads a config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::IoError)?;
        Self::from_ron(&text)
    }

    /// The file named by `--config` (or [DEFAULT_CONFIG_FILE] if present),
    /// with `--port` and `--baud` applied on top.
    pub fn from_args(args: &ConnectionArgs) -> Result<Self, ConfigError> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(DEFAULT_CONFIG_FILE)?,
        };
        Ok(config.with_overrides(args))
    }

    /// Replaces the port and baud rate with those given on the command line.
    pub fn with_overrides(mut self, args: &ConnectionArgs) -> Self {
        if let Some(port) = &args.port {
            self.port = Some(port.clone());
        }
        if let Some(baud) = args.baud {
            self.baud_rate = baud;
        }
        self
    }

    /// Like [Config::load], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_ron(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::IoError(e)),
        }
    }

    /// Parses a config from ron text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        ron::de::from_str(text).map_err(ConfigError::RonSpannedError)
    }

    /// Writes the config as pretty-printed ron.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let text = ron::ser::to_string_pretty(self, PrettyConfig::default())
            .map_err(ConfigError::RonError)?;
        fs::write(path, text).map_err(ConfigError::IoError)
    }

    /// Read timeout of the serial port.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Session settings derived from this config.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            stale_after: Duration::from_millis(self.stale_after_ms),
            ..SessionOptions::default()
        }
    }

    /// Looks a preset up by name, ignoring case.
    pub fn preset(&self, name: &str) -> Option<&Preset> {
        self.presets
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}
