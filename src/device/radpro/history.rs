//! Persistent download cursor per device.
//!
//! Datalog downloads resume from the last timestamp fetched for a given
//! device id. The store is a small text file, one `device_id,timestamp`
//! line per device, rewritten wholesale on every update.

use crate::error::AppResult;
use chrono::NaiveDateTime;
use log::warn;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug)]
pub struct DeviceHistoryStore {
    path: PathBuf,
    entries: BTreeMap<String, NaiveDateTime>,
}

impl DeviceHistoryStore {
    /// Load the store from `path`. A missing file is an empty store;
    /// unparseable lines are logged and dropped.
    pub fn load(path: &Path) -> AppResult<Self> {
        let mut entries = BTreeMap::new();
        if path.exists() {
            for line in fs::read_to_string(path)?.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_line(line) {
                    Some((device_id, timestamp)) => {
                        entries.insert(device_id, timestamp);
                    }
                    None => warn!("dropping malformed history line \"{}\"", line),
                }
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn last_fetch(&self, device_id: &str) -> Option<NaiveDateTime> {
        self.entries.get(device_id).copied()
    }

    /// Record a fetch time for a device and rewrite the file.
    pub fn record_fetch(&mut self, device_id: &str, timestamp: NaiveDateTime) -> AppResult<()> {
        self.entries.insert(device_id.to_string(), timestamp);
        self.save()
    }

    fn save(&self) -> AppResult<()> {
        let mut body = String::new();
        for (device_id, timestamp) in &self.entries {
            body.push_str(device_id);
            body.push(',');
            body.push_str(&timestamp.format(TIMESTAMP_FORMAT).to_string());
            body.push('\n');
        }
        fs::write(&self.path, body)?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<(String, NaiveDateTime)> {
    // Device ids contain semicolons but never commas; split on the last
    // comma so the timestamp field is unambiguous.
    let (device_id, timestamp) = line.rsplit_once(',')?;
    let timestamp = NaiveDateTime::parse_from_str(timestamp.trim(), TIMESTAMP_FORMAT).ok()?;
    Some((device_id.trim().to_string(), timestamp))
}
