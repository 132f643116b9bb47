//! Durable storage for completed readings.
//!
//! Every destination implements `Sink`. Storage is best-effort: a failed store is reported to
//! the caller once and never retried, and the reading is not kept for a later attempt.
//!
//! # Examples
//!
//! Send each reading to several sinks with a `Fanout`:
//!
//! ```no_run
//! use sink::{DailyTable, Fanout, RecordStore};
//! let mut fanout = Fanout::new();
//! fanout.push(RecordStore::open("sensor_data.jsonl").unwrap());
//! fanout.push(DailyTable::new("output").unwrap());
//! ```

#![deny(missing_docs, missing_debug_implementations, unsafe_code)]

extern crate chrono;
#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate telemetry;
#[cfg(test)]
extern crate tempfile;

pub mod records;
pub mod table;

pub use records::RecordStore;
pub use table::DailyTable;

use failure::Error;
use std::fmt;
use telemetry::Reading;

/// A destination for completed readings.
pub trait Sink {
    /// Stores one reading.
    fn store(&mut self, reading: &Reading) -> Result<(), Error>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn store(&mut self, reading: &Reading) -> Result<(), Error> {
        (**self).store(reading)
    }
}

/// Stores each reading to every one of its sinks, in order.
///
/// A failing sink is logged and does not stop the remaining sinks from receiving the reading.
#[derive(Default)]
pub struct Fanout {
    sinks: Vec<Box<dyn Sink + Send>>,
}

/// Returned by a `Fanout` when one or more of its sinks failed.
#[derive(Debug, Fail, PartialEq)]
#[fail(display = "{} of {} sinks failed to store the reading", failed, total)]
pub struct FanoutError {
    /// The number of sinks that failed.
    pub failed: usize,

    /// The number of sinks that were tried.
    pub total: usize,
}

impl Fanout {
    /// Creates a fanout with no sinks.
    ///
    /// # Examples
    ///
    /// ```
    /// use sink::Fanout;
    /// let fanout = Fanout::new();
    /// assert!(fanout.is_empty());
    /// ```
    pub fn new() -> Fanout {
        Fanout::default()
    }

    /// Adds a sink.
    pub fn push<S: Sink + Send + 'static>(&mut self, sink: S) {
        self.sinks.push(Box::new(sink));
    }

    /// Returns the number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Sink for Fanout {
    fn store(&mut self, reading: &Reading) -> Result<(), Error> {
        let mut failed = 0;
        for sink in &mut self.sinks {
            if let Err(err) = sink.store(reading) {
                error!("could not store reading from {}: {}", reading.device_id, err);
                failed += 1;
            }
        }
        if failed == 0 {
            Ok(())
        } else {
            Err(FanoutError {
                failed: failed,
                total: self.sinks.len(),
            }.into())
        }
    }
}

impl fmt::Debug for Fanout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fanout")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};
    use telemetry::Fragment;

    struct Failing;

    impl Sink for Failing {
        fn store(&mut self, _: &Reading) -> Result<(), Error> {
            Err(format_err!("disk full"))
        }
    }

    #[derive(Clone, Default)]
    struct Collect(Arc<Mutex<Vec<Reading>>>);

    impl Sink for Collect {
        fn store(&mut self, reading: &Reading) -> Result<(), Error> {
            self.0.lock().unwrap().push(reading.clone());
            Ok(())
        }
    }

    fn reading() -> Reading {
        let fragment = Fragment::new(b"DEV1<sendVal 0=1>").unwrap();
        Reading::new(vec![fragment], Utc::now()).unwrap()
    }

    #[test]
    fn empty() {
        assert!(Fanout::new().store(&reading()).is_ok());
    }

    #[test]
    fn failure_does_not_stop_later_sinks() {
        let collect = Collect::default();
        let mut fanout = Fanout::new();
        fanout.push(Failing);
        fanout.push(collect.clone());
        let err = fanout.store(&reading()).unwrap_err();
        assert_eq!(
            FanoutError {
                failed: 1,
                total: 2,
            },
            err.downcast().unwrap()
        );
        assert_eq!(1, collect.0.lock().unwrap().len());
    }

    #[test]
    fn boxed() {
        let collect = Collect::default();
        let mut sink: Box<dyn Sink> = Box::new(collect.clone());
        sink.store(&reading()).unwrap();
        assert_eq!(1, collect.0.lock().unwrap().len());
    }
}
