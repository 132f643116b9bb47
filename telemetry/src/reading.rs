//! Readings, which are reassembled from one or more fragments.
//!
//! # Examples
//!
//! Use a `Reassembler` to collect fragments until their device sends a terminator:
//!
//! ```
//! use telemetry::{reading::Reassembler, Fragment};
//! let first = Fragment::new(b"DEV1<sendVal 0=23.5;1=NaN>CHK").unwrap();
//! let other = Fragment::new(b"DEV2<sendVal 0=1.0>CHK").unwrap();
//! let second = Fragment::new(b"DEV1<sendVal 2=19.1>CHK").unwrap();
//! let terminator = Fragment::new(b"DEV1<sendVal >CHK").unwrap();
//! let mut reassembler = Reassembler::new();
//!
//! assert_eq!(None, reassembler.add(first));
//! assert_eq!(None, reassembler.add(other));
//! assert_eq!(None, reassembler.add(second));
//!
//! let reading = reassembler.add(terminator).unwrap();
//! assert_eq!("DEV1", reading.device_id);
//! assert_eq!(3, reading.channels.len());
//! assert_eq!(2, reading.raw_fragments.len());
//! assert!(reassembler.is_pending("DEV2"));
//! ```
//!
//! If you already hold every fragment of a transmission, build the reading directly:
//!
//! ```
//! # extern crate chrono;
//! # extern crate telemetry;
//! # fn main() {
//! use chrono::Utc;
//! use telemetry::{Fragment, Reading};
//! let fragments = vec![
//!     Fragment::new(b"DEV1<sendVal 0=1>").unwrap(),
//!     Fragment::new(b"DEV1<sendVal 0=2>").unwrap(),
//! ];
//! let reading = Reading::new(fragments, Utc::now()).unwrap();
//! assert_eq!(Some(&Some(2.0)), reading.channels.get("0"));
//! # }
//! ```

use chrono::{DateTime, Duration, Utc};
use fragment::Channels;
use std::collections::HashMap;
use Fragment;

const DEFAULT_IDLE_TIMEOUT_MINUTES: i64 = 10;
const DEFAULT_MAX_DEVICES: usize = 1024;
const DEFAULT_MAX_FRAGMENTS: usize = 256;

/// A completed transmission from one device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reading {
    /// The device that sent the transmission.
    pub device_id: String,

    /// The date and time the transmission was completed.
    pub datetime: DateTime<Utc>,

    /// The merged channel values.
    ///
    /// When more than one fragment carries the same channel, the one that arrived last wins.
    pub channels: Channels,

    /// The raw text of every data fragment, in arrival order.
    pub raw_fragments: Vec<String>,
}

/// Errors associated with creating readings.
#[derive(Debug, Fail, PartialEq)]
pub enum Error {
    /// There are no data fragments from which to create the reading.
    #[fail(display = "there are no fragments from which to create the reading")]
    NoFragments,

    /// The fragments were sent by more than one device.
    #[fail(
        display = "a fragment from {} cannot be part of a reading from {}",
        found,
        expected
    )]
    MixedDevices {
        /// The device id of the first fragment.
        expected: String,

        /// The device id of the offending fragment.
        found: String,
    },
}

/// Bounds on the state a `Reassembler` will hold.
///
/// `None` disables a bound.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Limits {
    /// Pending transmissions that have not received a fragment for longer than this are dropped.
    pub idle_timeout: Option<Duration>,

    /// The maximum number of devices with a pending transmission.
    ///
    /// When a new device would exceed this, the least recently updated transmission is dropped.
    pub max_devices: Option<usize>,

    /// The maximum number of fragments in one pending transmission.
    ///
    /// A transmission that would exceed this is dropped and started over.
    pub max_fragments: Option<usize>,
}

/// Reassembles fragments into readings, one pending transmission per device.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: HashMap<String, Pending>,
    limits: Limits,
    evicted: usize,
}

#[derive(Debug)]
struct Pending {
    fragments: Vec<Fragment>,
    last_seen: DateTime<Utc>,
}

impl Reading {
    /// Creates a new reading from the fragments of one transmission, in arrival order.
    ///
    /// Terminators in the list are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// # extern crate chrono;
    /// # extern crate telemetry;
    /// # fn main() {
    /// use chrono::Utc;
    /// use telemetry::{Fragment, Reading};
    /// let fragment = Fragment::new(b"DEV1<sendVal 0=1>").unwrap();
    /// let reading = Reading::new(vec![fragment], Utc::now()).unwrap();
    /// assert!(Reading::new(Vec::new(), Utc::now()).is_err());
    /// # }
    /// ```
    pub fn new(fragments: Vec<Fragment>, datetime: DateTime<Utc>) -> Result<Reading, Error> {
        let device_id = match fragments.iter().find(|f| !f.is_terminator()) {
            Some(fragment) => fragment.device_id().to_string(),
            None => return Err(Error::NoFragments),
        };
        let mut channels = Channels::new();
        let mut raw_fragments = Vec::with_capacity(fragments.len());
        for fragment in fragments {
            if fragment.device_id() != device_id {
                return Err(Error::MixedDevices {
                    expected: device_id,
                    found: fragment.device_id().to_string(),
                });
            }
            if fragment.is_terminator() {
                continue;
            }
            channels.extend(fragment.channels().clone());
            raw_fragments.push(fragment.raw_text().to_string());
        }
        Ok(Reading {
            device_id: device_id,
            datetime: datetime,
            channels: channels,
            raw_fragments: raw_fragments,
        })
    }
}

impl Limits {
    /// Returns limits that bound nothing.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry::reading::Limits;
    /// let limits = Limits::unbounded();
    /// assert_eq!(None, limits.max_devices);
    /// ```
    pub fn unbounded() -> Limits {
        Limits {
            idle_timeout: None,
            max_devices: None,
            max_fragments: None,
        }
    }
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            idle_timeout: Some(Duration::minutes(DEFAULT_IDLE_TIMEOUT_MINUTES)),
            max_devices: Some(DEFAULT_MAX_DEVICES),
            max_fragments: Some(DEFAULT_MAX_FRAGMENTS),
        }
    }
}

impl Reassembler {
    /// Creates a new reassembler with the default limits.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry::reading::Reassembler;
    /// let reassembler = Reassembler::new();
    /// ```
    pub fn new() -> Reassembler {
        Reassembler::default()
    }

    /// Creates a new reassembler with the provided limits.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry::reading::{Limits, Reassembler};
    /// let reassembler = Reassembler::with_limits(Limits::unbounded());
    /// ```
    pub fn with_limits(limits: Limits) -> Reassembler {
        Reassembler {
            limits: limits,
            ..Default::default()
        }
    }

    /// Adds a fragment and returns a reading if the fragment completed one.
    ///
    /// # Examples
    ///
    /// ```
    /// use telemetry::{reading::Reassembler, Fragment};
    /// let mut reassembler = Reassembler::new();
    /// assert_eq!(None, reassembler.add(Fragment::new(b"DEV1<sendVal 0=1>").unwrap()));
    /// assert!(reassembler.add(Fragment::new(b"DEV1<sendVal >").unwrap()).is_some());
    /// ```
    pub fn add(&mut self, fragment: Fragment) -> Option<Reading> {
        self.add_at(fragment, Utc::now())
    }

    /// Adds a fragment that arrived at the provided time.
    ///
    /// Idle transmissions are evicted first. A terminator for a device with nothing pending is
    /// dropped.
    pub fn add_at(&mut self, fragment: Fragment, now: DateTime<Utc>) -> Option<Reading> {
        self.evict_idle(now);
        if fragment.is_terminator() {
            return self.complete(fragment.device_id(), now);
        }
        if !self.pending.contains_key(fragment.device_id()) {
            self.make_room();
        }
        let max_fragments = self.limits.max_fragments;
        let pending = self
            .pending
            .entry(fragment.device_id().to_string())
            .or_insert_with(|| Pending {
                fragments: Vec::new(),
                last_seen: now,
            });
        if max_fragments.map_or(false, |max| pending.fragments.len() >= max) {
            warn!(
                "transmission from {} reached {} fragments, starting over",
                fragment.device_id(),
                pending.fragments.len()
            );
            pending.fragments.clear();
            self.evicted += 1;
        }
        pending.fragments.push(fragment);
        pending.last_seen = now;
        None
    }

    /// Drops every pending transmission that has been idle longer than the idle timeout.
    ///
    /// Returns the device ids of the dropped transmissions, sorted.
    ///
    /// # Examples
    ///
    /// ```
    /// # extern crate chrono;
    /// # extern crate telemetry;
    /// # fn main() {
    /// use chrono::{Duration, Utc};
    /// use telemetry::{reading::Reassembler, Fragment};
    /// let mut reassembler = Reassembler::new();
    /// let now = Utc::now();
    /// reassembler.add_at(Fragment::new(b"DEV1<sendVal 0=1>").unwrap(), now);
    /// assert!(reassembler.evict_idle(now).is_empty());
    /// assert_eq!(vec!["DEV1".to_string()], reassembler.evict_idle(now + Duration::hours(1)));
    /// # }
    /// ```
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = match self.limits.idle_timeout {
            Some(timeout) => timeout,
            None => return Vec::new(),
        };
        let mut expired: Vec<String> = self
            .pending
            .iter()
            .filter(|&(_, pending)| now.signed_duration_since(pending.last_seen) > timeout)
            .map(|(device_id, _)| device_id.clone())
            .collect();
        expired.sort();
        for device_id in &expired {
            if let Some(pending) = self.pending.remove(device_id) {
                warn!(
                    "dropping idle transmission from {} with {} fragments",
                    device_id,
                    pending.fragments.len()
                );
            }
        }
        self.evicted += expired.len();
        expired
    }

    /// Returns the number of devices with a pending transmission.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if the device has a pending transmission.
    pub fn is_pending(&self, device_id: &str) -> bool {
        self.pending.contains_key(device_id)
    }

    /// Returns the number of transmissions dropped because of this reassembler's limits.
    pub fn evicted(&self) -> usize {
        self.evicted
    }

    /// Returns this reassembler's limits.
    pub fn limits(&self) -> Limits {
        self.limits
    }

    fn complete(&mut self, device_id: &str, now: DateTime<Utc>) -> Option<Reading> {
        let pending = match self.pending.remove(device_id) {
            Some(pending) => pending,
            None => {
                debug!("terminator from {} with nothing pending", device_id);
                return None;
            }
        };
        match Reading::new(pending.fragments, now) {
            Ok(reading) => Some(reading),
            Err(err) => {
                warn!("could not complete transmission from {}: {}", device_id, err);
                None
            }
        }
    }

    fn make_room(&mut self) {
        let max_devices = match self.limits.max_devices {
            Some(max_devices) => max_devices,
            None => return,
        };
        while self.pending.len() >= max_devices {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|&(_, pending)| pending.last_seen)
                .map(|(device_id, _)| device_id.clone());
            match oldest {
                Some(device_id) => {
                    warn!(
                        "{} devices pending, dropping the transmission from {}",
                        self.pending.len(),
                        device_id
                    );
                    self.pending.remove(&device_id);
                    self.evicted += 1;
                }
                None => break,
            }
        }
    }
}
