//! Daily CSV tables, one file per device per day.
//!
//! Files are named `sensor_data_<device>_<YYYYMMDD>.csv`. The header row is written when a file
//! is created and is never rewritten, so a device that changes its channel layout partway through
//! a day produces rows that no longer line up with the header.
//!
//! # Examples
//!
//! ```no_run
//! use sink::{DailyTable, Sink};
//! let table = DailyTable::new("output").unwrap();
//! ```

use chrono::{DateTime, Utc};
use failure::Error;
use std::fmt::Write as FmtWrite;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use telemetry::Reading;
use Sink;

const FILE_DATE_FORMAT: &str = "%Y%m%d";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const NOT_A_NUMBER: &str = "NaN";

/// A directory of daily CSV tables.
#[derive(Debug)]
pub struct DailyTable {
    directory: PathBuf,
}

impl DailyTable {
    /// Creates a table writer in the provided directory, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<DailyTable, Error> {
        fs::create_dir_all(directory.as_ref())?;
        Ok(DailyTable {
            directory: directory.as_ref().to_path_buf(),
        })
    }

    /// Returns the directory that holds the tables.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns the path of the table for a device on the day of the provided datetime.
    ///
    /// Characters in the device id that don't belong in a file name are replaced with `_`.
    ///
    /// # Examples
    ///
    /// ```
    /// # extern crate chrono;
    /// # extern crate sink;
    /// # fn main() {
    /// use chrono::{TimeZone, Utc};
    /// use sink::DailyTable;
    /// let table = DailyTable::new(std::env::temp_dir()).unwrap();
    /// let path = table.path("DEV1", Utc.ymd(2024, 3, 1).and_hms(12, 0, 0));
    /// assert!(path.ends_with("sensor_data_DEV1_20240301.csv"));
    /// let path = table.path("../DEV1", Utc.ymd(2024, 3, 1).and_hms(12, 0, 0));
    /// assert!(path.ends_with("sensor_data____DEV1_20240301.csv"));
    /// # }
    /// ```
    pub fn path(&self, device_id: &str, datetime: DateTime<Utc>) -> PathBuf {
        self.directory.join(format!(
            "sensor_data_{}_{}.csv",
            sanitize(device_id),
            datetime.format(FILE_DATE_FORMAT)
        ))
    }
}

impl Sink for DailyTable {
    fn store(&mut self, reading: &Reading) -> Result<(), Error> {
        let path = self.path(&reading.device_id, reading.datetime);
        let channels = numeric_channels(reading);
        let mut text = String::new();
        if !path.exists() {
            text.push_str("Timestamp");
            for &(index, _) in &channels {
                write!(text, ",Channel_{}", index)?;
            }
            text.push('\n');
        }
        text.push_str(&reading.datetime.format(TIMESTAMP_FORMAT).to_string());
        for &(_, value) in &channels {
            match value {
                Some(value) => write!(text, ",{}", value)?,
                None => write!(text, ",{}", NOT_A_NUMBER)?,
            }
        }
        text.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(text.as_bytes())?;
        info!("appended reading from {} to {}", reading.device_id, path.display());
        Ok(())
    }
}

fn numeric_channels(reading: &Reading) -> Vec<(i64, Option<f64>)> {
    let mut channels = Vec::with_capacity(reading.channels.len());
    for (index, &value) in &reading.channels {
        match index.parse::<i64>() {
            Ok(n) => channels.push((n, value)),
            Err(_) => warn!(
                "skipping non-numeric channel {} from {} in the table",
                index, reading.device_id
            ),
        }
    }
    channels.sort_by_key(|&(n, _)| n);
    channels
}

fn sanitize(device_id: &str) -> String {
    let name: String = device_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        }).collect();
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;
    use telemetry::Fragment;

    fn noon() -> DateTime<Utc> {
        Utc.ymd(2024, 3, 1).and_hms_milli(12, 0, 0, 250)
    }

    fn reading(payload: &str, datetime: DateTime<Utc>) -> Reading {
        Reading::new(vec![Fragment::new(payload.as_bytes()).unwrap()], datetime).unwrap()
    }

    #[test]
    fn header_once_per_file() {
        let dir = TempDir::new().unwrap();
        let mut table = DailyTable::new(dir.path()).unwrap();
        table
            .store(&reading("DEV1<sendVal 10=1.5;2=NaN;0=23.5>", noon()))
            .unwrap();
        table
            .store(&reading(
                "DEV1<sendVal 10=2;2=3.25;0=24>",
                noon() + Duration::hours(1),
            )).unwrap();
        let text = fs::read_to_string(table.path("DEV1", noon())).unwrap();
        assert_eq!(
            "Timestamp,Channel_0,Channel_2,Channel_10\n\
             2024-03-01 12:00:00.250,23.5,NaN,1.5\n\
             2024-03-01 13:00:00.250,24,3.25,2\n",
            text
        );
    }

    #[test]
    fn new_file_each_day() {
        let dir = TempDir::new().unwrap();
        let mut table = DailyTable::new(dir.path()).unwrap();
        let tomorrow = noon() + Duration::days(1);
        table.store(&reading("DEV1<sendVal 0=1>", noon())).unwrap();
        table.store(&reading("DEV1<sendVal 0=2>", tomorrow)).unwrap();
        table.store(&reading("DEV2<sendVal 0=3>", noon())).unwrap();
        assert!(dir.path().join("sensor_data_DEV1_20240301.csv").exists());
        assert!(dir.path().join("sensor_data_DEV1_20240302.csv").exists());
        assert!(dir.path().join("sensor_data_DEV2_20240301.csv").exists());
        let text = fs::read_to_string(table.path("DEV1", tomorrow)).unwrap();
        assert_eq!(2, text.lines().count());
    }

    #[test]
    fn non_numeric_channels_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut table = DailyTable::new(dir.path()).unwrap();
        table
            .store(&reading("DEV1<sendVal temp=1;1=2>", noon()))
            .unwrap();
        let text = fs::read_to_string(table.path("DEV1", noon())).unwrap();
        assert_eq!(
            "Timestamp,Channel_1\n2024-03-01 12:00:00.250,2\n",
            text
        );
    }

    #[test]
    fn creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("output");
        let table = DailyTable::new(&path).unwrap();
        assert!(path.is_dir());
        assert_eq!(path.as_path(), table.directory());
    }

    #[test]
    fn sanitize() {
        assert_eq!("DEV-1_a", super::sanitize("DEV-1_a"));
        assert_eq!("__etc_passwd", super::sanitize("/.etc/passwd"));
        assert_eq!("unknown", super::sanitize(""));
    }
}
