//! Streaming CSV result file, one row per sample.
//!
//! Every row is flushed and synced to disk before [`RunLog::append`] returns, so a
//! crash loses at most the sample being taken. Missing values are written as
//! [`MISSING`], never as an empty field or zero.

use crate::acquisition::ChannelReading;
use crate::error::{RigError, RigResult};
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker for unavailable values.
pub const MISSING: &str = "N/A";

/// Role of a thermocouple channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelGroup {
    /// Heated side
    Evaporator,
    /// Cooled side
    Condenser,
    /// Anything else
    Auxiliary,
}

impl ChannelGroup {
    fn column_tag(self) -> &'static str {
        match self {
            ChannelGroup::Evaporator => "evap",
            ChannelGroup::Condenser => "cond",
            ChannelGroup::Auxiliary => "aux",
        }
    }
}

/// Column order of the result file.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnLayout {
    channels: Vec<(u8, ChannelGroup)>,
}

impl ColumnLayout {
    /// One temperature column per channel `0..channel_count`, tagged by group.
    pub fn new(channel_count: u8, evaporator: &[u8], condenser: &[u8]) -> Self {
        let channels = (0..channel_count)
            .map(|ch| {
                let group = if evaporator.contains(&ch) {
                    ChannelGroup::Evaporator
                } else if condenser.contains(&ch) {
                    ChannelGroup::Condenser
                } else {
                    ChannelGroup::Auxiliary
                };
                (ch, group)
            })
            .collect();
        Self { channels }
    }

    /// Channels in column order.
    pub fn channels(&self) -> impl Iterator<Item = (u8, ChannelGroup)> + '_ {
        self.channels.iter().copied()
    }

    /// Header row.
    pub fn header(&self) -> Vec<String> {
        let mut header: Vec<String> = ["timestamp", "elapsed_s", "power_level_w", "voltage_v", "current_a"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        header.extend(
            self.channels
                .iter()
                .map(|(ch, group)| format!("temp_{}_ch{}", group.column_tag(), ch)),
        );
        header.extend(["temp_evap_avg", "temp_cond_avg", "r_thermal"].iter().map(|s| s.to_string()));
        header
    }
}

/// One sample of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRow {
    /// Wall-clock time of the sample
    pub timestamp: DateTime<Local>,
    /// Seconds since the run's first level started
    pub elapsed_s: f64,
    /// Target power of the level (W)
    pub power_w: f64,
    /// Measured output voltage
    pub voltage_v: Option<f64>,
    /// Measured output current
    pub current_a: Option<f64>,
    /// Per-channel temperatures
    pub temperatures: ChannelReading,
    /// Evaporator group mean
    pub evap_avg: Option<f64>,
    /// Condenser group mean
    pub cond_avg: Option<f64>,
    /// Thermal resistance (°C/W)
    pub r_thermal: Option<f64>,
}

fn fixed(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.*}", decimals, v),
        _ => MISSING.to_string(),
    }
}

impl SampleRow {
    /// Render in `layout` column order.
    pub fn to_record(&self, layout: &ColumnLayout) -> Vec<String> {
        let mut record = vec![
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, false),
            fixed(Some(self.elapsed_s), 2),
            fixed(Some(self.power_w), 2),
            fixed(self.voltage_v, 2),
            fixed(self.current_a, 3),
        ];
        record.extend(layout.channels().map(|(ch, _)| fixed(self.temperatures.get(ch), 2)));
        record.push(fixed(self.evap_avg, 2));
        record.push(fixed(self.cond_avg, 2));
        record.push(fixed(self.r_thermal, 4));
        record
    }
}

/// Open result file of one run.
pub struct RunLog {
    path: PathBuf,
    writer: csv::Writer<File>,
    layout: ColumnLayout,
    rows: usize,
}

impl RunLog {
    /// Create the file (and its directory) and write the header.
    pub fn create(path: &Path, layout: ColumnLayout) -> RigResult<Self> {
        let storage = |source: std::io::Error| RigError::Storage {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(storage)?;
        }
        let file = File::create(path).map_err(storage)?;
        let mut log = Self {
            path: path.to_path_buf(),
            writer: csv::Writer::from_writer(file),
            layout,
            rows: 0,
        };
        let header = log.layout.header();
        log.writer.write_record(&header)?;
        log.sync()?;
        info!(path = %log.path.display(), "Result file created");
        Ok(log)
    }

    /// Append one row and make it durable.
    pub fn append(&mut self, row: &SampleRow) -> RigResult<()> {
        let record = row.to_record(&self.layout);
        self.writer.write_record(&record)?;
        self.sync()?;
        self.rows += 1;
        debug!(rows = self.rows, "Sample row written");
        Ok(())
    }

    fn sync(&mut self) -> RigResult<()> {
        let storage = |source: std::io::Error| RigError::Storage {
            path: self.path.clone(),
            source,
        };
        self.writer.flush().map_err(storage)?;
        self.writer.get_ref().sync_data().map_err(storage)
    }

    /// Rows written so far, excluding the header.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog")
            .field("path", &self.path)
            .field("rows", &self.rows)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ColumnLayout {
        ColumnLayout::new(8, &[0, 1, 2, 3], &[4, 5, 6, 7])
    }

    fn row(temps: ChannelReading) -> SampleRow {
        SampleRow {
            timestamp: Local::now(),
            elapsed_s: 12.3456,
            power_w: 2.0,
            voltage_v: Some(4.4721),
            current_a: Some(0.44721),
            evap_avg: temps.average(&[0, 1, 2, 3]),
            cond_avg: temps.average(&[4, 5, 6, 7]),
            r_thermal: Some(5.0),
            temperatures: temps,
        }
    }

    #[test]
    fn header_names_groups() {
        let header = layout().header();
        assert_eq!(header.len(), 16);
        assert_eq!(header[4], "current_a");
        assert_eq!(header[5], "temp_evap_ch0");
        assert_eq!(header[9], "temp_cond_ch4");
        assert_eq!(header[15], "r_thermal");

        let header = ColumnLayout::new(3, &[0], &[1]).header();
        assert_eq!(header[7], "temp_aux_ch2");
    }

    #[test]
    fn fixed_precision_and_missing_marker() {
        let temps: ChannelReading = (0..8).map(|ch| (ch, Some(30.0 + f64::from(ch)))).collect();
        let mut sample = row(temps);
        sample.current_a = None;
        sample.r_thermal = None;

        let record = sample.to_record(&layout());
        assert_eq!(record[1], "12.35");
        assert_eq!(record[2], "2.00");
        assert_eq!(record[3], "4.47");
        assert_eq!(record[4], MISSING);
        assert_eq!(record[5], "30.00");
        assert_eq!(record[15], MISSING);
    }

    #[test]
    fn zero_is_a_value_not_missing() {
        let temps: ChannelReading = (0..8).map(|ch| (ch, Some(0.0))).collect();
        let record = row(temps).to_record(&layout());
        assert_eq!(record[5], "0.00");
        assert_eq!(record[13], "0.00");
    }

    #[test]
    fn rows_are_on_disk_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.csv");
        let mut log = RunLog::create(&path, layout()).unwrap();

        let temps: ChannelReading = (0..8).map(|ch| (ch, if ch < 4 { None } else { Some(25.0) })).collect();
        log.append(&row(temps)).unwrap();
        assert_eq!(log.rows(), 1);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "timestamp");
        let records: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0][5], "N/A");
        assert_eq!(&records[0][13], "N/A");
        assert_eq!(&records[0][14], "25.00");
    }

    #[test]
    fn unwritable_location_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        let err = RunLog::create(&blocker.join("run.csv"), layout()).unwrap_err();
        assert!(matches!(err, RigError::Storage { .. }));
        assert!(!err.is_recoverable());
    }
}
