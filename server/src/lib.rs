//! A UDP server that collects sensor telemetry and stores completed readings.
//!
//! The server owns one socket and one reassembler. Completed readings go to a JSON-lines record
//! store and to daily CSV tables, as configured.

#![deny(missing_docs, missing_debug_implementations, unsafe_code)]

extern crate chrono;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate sink;
extern crate telemetry;
extern crate toml;

pub mod config;
pub mod dispatcher;

pub use config::Config;
pub use dispatcher::{Dispatcher, Stats};

use failure::Error;
use sink::{DailyTable, Fanout, RecordStore};

/// Creates the record store and daily tables named by the configuration.
///
/// # Examples
///
/// ```no_run
/// let config = server::Config::default();
/// let fanout = server::fanout(&config).unwrap();
/// assert_eq!(2, fanout.len());
/// ```
pub fn fanout(config: &Config) -> Result<Fanout, Error> {
    let mut fanout = Fanout::new();
    fanout.push(RecordStore::open(&config.records)?);
    fanout.push(DailyTable::new(&config.output_directory)?);
    Ok(fanout)
}
