//! Record output seam.
//!
//! The drivers emit sample maps and derived rate points; everything beyond
//! that (display, storage engines) is a collaborator behind the narrow
//! [`RecordSink`] trait. The bundled implementation writes long-format CSV
//! rows (`timestamp, variable, value`), which keeps the column set stable
//! regardless of which variables a device happens to emit.

use crate::device::radpro::rate::RatePoint;
use crate::error::AppResult;
use chrono::{DateTime, Local, TimeZone, Utc};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

pub trait RecordSink {
    /// Write one emitted sample set. An empty map means "no new data" and
    /// must not produce a record; callers are expected to skip it.
    fn write_samples(&mut self, timestamp: DateTime<Utc>, samples: &HashMap<String, f64>)
        -> AppResult<()>;

    /// Write one derived datalog rate point.
    fn write_rate_point(&mut self, point: &RatePoint) -> AppResult<()>;
}

/// CSV sink appending `timestamp, variable, value` rows.
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    pub fn create(path: &Path) -> AppResult<Self> {
        let file = File::options().create(true).append(true).open(path)?;
        let writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        Ok(Self { writer })
    }
}

impl RecordSink for CsvSink {
    fn write_samples(
        &mut self,
        timestamp: DateTime<Utc>,
        samples: &HashMap<String, f64>,
    ) -> AppResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let stamp = timestamp
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        // Stable row order for a given sample set.
        let mut names: Vec<&String> = samples.keys().collect();
        names.sort();
        for name in names {
            let value = samples[name].to_string();
            self.writer
                .write_record([stamp.as_str(), name.as_str(), value.as_str()])?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn write_rate_point(&mut self, point: &RatePoint) -> AppResult<()> {
        let stamp = match Local.timestamp_opt(point.epoch_seconds, 0).single() {
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => point.epoch_seconds.to_string(),
        };
        let value = point.cpm.to_string();
        self.writer
            .write_record([stamp.as_str(), "CPM", value.as_str()])?;
        self.writer.flush()?;
        Ok(())
    }
}
