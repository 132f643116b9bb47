//! Configuration for the telemetry server.
//!
//! Every field has a default, so an empty file (or no file at all) is a working configuration.
//!
//! # Examples
//!
//! Configs are usually specified in TOML files:
//!
//! ```
//! use server::Config;
//! let config = Config::from_path("fixtures/config.toml").unwrap();
//! assert_eq!(2048, config.max_datagram_size);
//! ```

use failure::Error;
use std::cmp;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use telemetry::reading::Limits;
use toml;

const DEFAULT_ADDRESS: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 56790;
const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1024;
const DEFAULT_RECORDS: &str = "sensor_data.jsonl";
const DEFAULT_OUTPUT_DIRECTORY: &str = "output";
const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 600;
const DEFAULT_MAX_DEVICES: usize = 1024;
const DEFAULT_MAX_FRAGMENTS: usize = 256;

/// The longest idle timeout that can be configured, one hundred years.
pub const MAX_IDLE_TIMEOUT_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Configure the telemetry server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// The address to bind the socket to.
    pub address: String,

    /// The port to bind the socket to.
    pub port: u16,

    /// The largest datagram that will be read in full.
    ///
    /// Longer datagrams are truncated by the socket.
    pub max_datagram_size: usize,

    /// The path to the JSON-lines record store.
    pub records: PathBuf,

    /// The directory that holds the daily CSV tables.
    pub output_directory: PathBuf,

    /// Drop fragments that claim a pending device id from a different sender address.
    pub verify_sender: bool,

    /// Bounds on the reassembly buffer.
    pub reassembly: Reassembly,
}

/// Reassembly buffer configuration.
///
/// A zero disables the corresponding bound.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Reassembly {
    /// Drop pending transmissions that have been idle for this many seconds.
    ///
    /// Must not exceed `MAX_IDLE_TIMEOUT_SECONDS`.
    pub idle_timeout_seconds: u64,

    /// The maximum number of devices with a pending transmission.
    pub max_devices: usize,

    /// The maximum number of fragments in one pending transmission.
    pub max_fragments: usize,
}

impl Config {
    /// Reads configuration from a toml file.
    ///
    /// # Examples
    ///
    /// ```
    /// let config = server::Config::from_path("fixtures/config.toml").unwrap();
    /// assert_eq!("127.0.0.1", config.address);
    /// ```
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, Error> {
        use std::fs::File;
        use std::io::Read;

        let mut file = File::open(path)?;
        let mut string = String::new();
        file.read_to_string(&mut string)?;
        string.parse::<Config>()
    }

    /// Returns the `address:port` string the socket binds to.
    ///
    /// # Examples
    ///
    /// ```
    /// let config = server::Config::default();
    /// assert_eq!("0.0.0.0:56790", config.socket_address());
    /// ```
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            records: PathBuf::from(DEFAULT_RECORDS),
            output_directory: PathBuf::from(DEFAULT_OUTPUT_DIRECTORY),
            verify_sender: false,
            reassembly: Reassembly::default(),
        }
    }
}

impl FromStr for Config {
    type Err = Error;
    fn from_str(s: &str) -> Result<Config, Error> {
        let config: Config = toml::from_str(s)?;
        if config.reassembly.idle_timeout_seconds > MAX_IDLE_TIMEOUT_SECONDS {
            return Err(format_err!(
                "idle_timeout_seconds must be at most {}, got {}",
                MAX_IDLE_TIMEOUT_SECONDS,
                config.reassembly.idle_timeout_seconds
            ));
        }
        Ok(config)
    }
}

impl Reassembly {
    /// Returns the reassembler limits for this configuration.
    ///
    /// An idle timeout longer than `MAX_IDLE_TIMEOUT_SECONDS` is clamped to it.
    ///
    /// # Examples
    ///
    /// ```
    /// let config = server::Config::from_path("fixtures/config.toml").unwrap();
    /// let limits = config.reassembly.limits();
    /// assert_eq!(Some(64), limits.max_devices);
    /// assert_eq!(None, limits.max_fragments);
    /// ```
    pub fn limits(&self) -> Limits {
        use chrono::Duration;

        Limits {
            idle_timeout: nonzero(self.idle_timeout_seconds).map(|seconds| {
                Duration::seconds(cmp::min(seconds, MAX_IDLE_TIMEOUT_SECONDS) as i64)
            }),
            max_devices: nonzero(self.max_devices as u64).map(|n| n as usize),
            max_fragments: nonzero(self.max_fragments as u64).map(|n| n as usize),
        }
    }
}

impl Default for Reassembly {
    fn default() -> Reassembly {
        Reassembly {
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECONDS,
            max_devices: DEFAULT_MAX_DEVICES,
            max_fragments: DEFAULT_MAX_FRAGMENTS,
        }
    }
}

fn nonzero(n: u64) -> Option<u64> {
    if n == 0 {
        None
    } else {
        Some(n)
    }
}
