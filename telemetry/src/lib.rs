//! Decode and reassemble telemetry from field sensor units.
//!
//! # Background
//!
//! Sensor units report over UDP. A single reading is usually too large for one datagram, so a
//! unit sends its channel values spread over several datagrams and then one empty datagram to
//! mark the end of the transmission. The protocol carries no sequence numbers; fragments are
//! merged in the order they arrive.

#![deny(missing_docs, missing_debug_implementations, unsafe_code)]

extern crate chrono;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod fragment;
pub mod reading;

pub use fragment::Fragment;
pub use reading::Reading;

/// Decodes one datagram.
///
/// # Examples
///
/// ```
/// let fragment = telemetry::decode(b"DEV1<sendVal 0=23.5>CHK").unwrap();
/// assert_eq!("DEV1", fragment.device_id());
/// ```
pub fn decode(bytes: &[u8]) -> Result<Fragment, fragment::Error> {
    Fragment::new(bytes)
}

/// Reassembles readings from raw datagrams.
///
/// This is the simplest way to do this. Datagrams that cannot be decoded are discarded silently,
/// pending transmissions are never evicted, and only completed readings are returned. For
/// finer-grained control, use `reading::Reassembler`.
///
/// # Examples
///
/// ```
/// let datagrams = vec![
///     "DEV1<sendVal 0=23.5;1=NaN>CHK",
///     "garbage",
///     "DEV1<sendVal 2=19.1>CHK",
///     "DEV1<sendVal >CHK",
/// ];
/// let readings = telemetry::reassemble(datagrams);
/// assert_eq!(1, readings.len());
/// assert_eq!(3, readings[0].channels.len());
/// ```
pub fn reassemble<I, B>(iter: I) -> Vec<Reading>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    use reading::{Limits, Reassembler};
    let mut reassembler = Reassembler::with_limits(Limits::unbounded());
    iter.into_iter()
        .filter_map(|bytes| {
            Fragment::new(bytes.as_ref())
                .ok()
                .and_then(|fragment| reassembler.add(fragment))
        }).collect()
}
