//! An append-only store of readings, one JSON record per line.
//!
//! Each record is keyed by an auto-incrementing id, and carries the device id, the time the
//! reading was completed, the merged channel values, and the raw fragments.
//!
//! # Examples
//!
//! ```no_run
//! use sink::{RecordStore, Sink};
//! let store = RecordStore::open("sensor_data.jsonl").unwrap();
//! for record in store.records().unwrap() {
//!     println!("{} {}", record.id, record.device_id);
//! }
//! ```

use chrono::{DateTime, Utc};
use failure::Error;
use serde_json;
use std::fs::{self, File, OpenOptions};
use std::cmp;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use telemetry::fragment::Channels;
use telemetry::Reading;
use Sink;

/// One stored reading.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Record {
    /// The record id, starting at one.
    pub id: u64,

    /// The date and time the reading was completed.
    pub timestamp: DateTime<Utc>,

    /// The device that sent the reading.
    pub device_id: String,

    /// The merged channel values.
    pub channels: Channels,

    /// The raw fragments that made up the reading, in arrival order.
    pub raw_fragments: Vec<String>,
}

#[derive(Deserialize)]
struct RecordId {
    id: u64,
}

/// A JSON-lines file of records.
#[derive(Debug)]
pub struct RecordStore {
    path: PathBuf,
    next_id: u64,
}

impl RecordStore {
    /// Opens a record store, creating the file and its parent directories if needed.
    ///
    /// Ids continue after the largest id already in the file. Lines that are not records, such
    /// as a final line cut short by a crash, are logged and skipped. If the file does not end
    /// with a newline one is appended, so the next record starts on its own line.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RecordStore, Error> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let next_id = if path.exists() {
            let (last_id, terminated) = scan(&path)?;
            if !terminated {
                warn!("{} does not end with a newline, appending one", path.display());
                OpenOptions::new().append(true).open(&path)?.write_all(b"\n")?;
            }
            last_id + 1
        } else {
            File::create(&path)?;
            1
        };
        info!("record store opened at {}", path.display());
        Ok(RecordStore {
            path: path,
            next_id: next_id,
        })
    }

    /// Returns the path to this store's file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record in the store, skipping lines that are not records.
    pub fn records(&self) -> Result<Vec<Record>, Error> {
        read_records(&self.path)
    }
}

impl Sink for RecordStore {
    fn store(&mut self, reading: &Reading) -> Result<(), Error> {
        let record = Record {
            id: self.next_id,
            timestamp: reading.datetime,
            device_id: reading.device_id.clone(),
            channels: reading.channels.clone(),
            raw_fragments: reading.raw_fragments.clone(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        self.next_id += 1;
        debug!("stored record {} from {}", record.id, record.device_id);
        Ok(())
    }
}

/// Returns the largest record id in the file, or zero, and whether the file ends with a newline.
fn scan(path: &Path) -> Result<(u64, bool), Error> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut line = Vec::new();
    let mut number = 0;
    let mut last_id = 0;
    let mut terminated = true;
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        number += 1;
        terminated = line.last() == Some(&b'\n');
        if is_blank(&line) {
            continue;
        }
        match serde_json::from_slice::<RecordId>(&line) {
            Ok(record) => last_id = cmp::max(last_id, record.id),
            Err(err) => warn!("skipping line {} of {}: {}", number, path.display(), err),
        }
    }
    Ok((last_id, terminated))
}

fn read_records(path: &Path) -> Result<Vec<Record>, Error> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if is_blank(line.as_bytes()) {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(record) => records.push(record),
            Err(err) => warn!("skipping line {} of {}: {}", n + 1, path.display(), err),
        }
    }
    Ok(records)
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use telemetry::Fragment;

    fn reading(device_id: &str) -> Reading {
        let fragments = vec![
            Fragment::new(format!("{}<sendVal 0=23.5;1=NaN>CHK", device_id).as_bytes()).unwrap(),
            Fragment::new(format!("{}<sendVal 2=19.1>CHK", device_id).as_bytes()).unwrap(),
        ];
        Reading::new(fragments, Utc.ymd(2024, 3, 1).and_hms(12, 30, 0)).unwrap()
    }

    #[test]
    fn store_and_read_back() {
        let dir = TempDir::new().unwrap();
        let mut store = RecordStore::open(dir.path().join("records.jsonl")).unwrap();
        assert!(store.records().unwrap().is_empty());
        store.store(&reading("DEV1")).unwrap();
        store.store(&reading("DEV2")).unwrap();

        let records = store.records().unwrap();
        assert_eq!(2, records.len());
        assert_eq!(1, records[0].id);
        assert_eq!("DEV1", records[0].device_id);
        assert_eq!(2, records[1].id);
        assert_eq!("DEV2", records[1].device_id);
        assert_eq!(Some(&None), records[0].channels.get("1"));
        assert_eq!(Some(&Some(19.1)), records[0].channels.get("2"));
        assert_eq!(
            vec![
                "DEV1<sendVal 0=23.5;1=NaN>CHK".to_string(),
                "DEV1<sendVal 2=19.1>CHK".to_string(),
            ],
            records[0].raw_fragments
        );
        assert_eq!(Utc.ymd(2024, 3, 1).and_hms(12, 30, 0), records[0].timestamp);
    }

    #[test]
    fn ids_continue_after_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        RecordStore::open(&path)
            .unwrap()
            .store(&reading("DEV1"))
            .unwrap();
        let mut store = RecordStore::open(&path).unwrap();
        store.store(&reading("DEV1")).unwrap();
        let ids: Vec<u64> = store.records().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(vec![1, 2], ids);
    }

    #[test]
    fn creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("records.jsonl");
        let store = RecordStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(path.as_path(), store.path());
    }

    #[test]
    fn truncated_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        RecordStore::open(&path)
            .unwrap()
            .store(&reading("DEV1"))
            .unwrap();
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"id\":2,\"timest")
            .unwrap();

        let mut store = RecordStore::open(&path).unwrap();
        store.store(&reading("DEV2")).unwrap();
        let records = store.records().unwrap();
        let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
        assert_eq!(vec![1, 2], ids);
        assert_eq!("DEV2", records[1].device_id);
    }

    #[test]
    fn ids_follow_the_largest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("records.jsonl");
        let mut store = RecordStore::open(&path).unwrap();
        store.store(&reading("DEV1")).unwrap();
        store.store(&reading("DEV1")).unwrap();
        let mut lines: Vec<String> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| line.to_string())
            .collect();
        lines.reverse();
        lines.push("not json".to_string());
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let mut store = RecordStore::open(&path).unwrap();
        store.store(&reading("DEV2")).unwrap();
        let ids: Vec<u64> = store.records().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(vec![2, 1, 3], ids);
    }
}
