//! Crash-safe wide-format measurement log.
//!
//! Readings are appended to small segment files under `<log_root>/.tmp`,
//! each flushed and fsynced per row, so a power cut mid-run loses at most
//! the row in flight. A successful run merges its segments into one final
//! CSV at the log root; an aborted run leaves them in place. Orphaned
//! segments from a crashed run are merged on the next boot by
//! [`recover_orphaned`].
//!
//! Rows are tab-delimited: the rig's locales render decimal commas, so a
//! comma delimiter would be ambiguous.

use crate::core::{LiveReading, ReadingTimestamp};
use crate::engine::Phase;
use crate::error::{AppResult, RigError};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

const TMP_DIR: &str = ".tmp";
const SEGMENT_PREFIX: &str = "segment_";
const FIXED_COLUMNS: [&str; 4] = ["timestamp", "phase", "channel", "repeat"];

/// Width the phase column is padded to, for readable plain-text viewing.
const PHASE_PAD: usize = 10;

/// Segmented measurement logger for one run.
pub struct MeasurementLogger {
    run_id: String,
    tmp_dir: PathBuf,
    log_root: PathBuf,
    rotation: Duration,
    segment_index: u32,
    segment_opened: Instant,
    writer: Option<csv::Writer<File>>,
    /// Second handle to the open segment, for fsync after each row.
    segment_file: Option<File>,
    component_labels: Option<Vec<String>>,
    last_timestamp: Option<f64>,
}

impl MeasurementLogger {
    /// Open a fresh log for a new run.
    pub fn create(log_root: &Path, rotation: Duration) -> AppResult<Self> {
        let tmp_dir = log_root.join(TMP_DIR);
        fs::create_dir_all(&tmp_dir)?;

        let run_id = Uuid::new_v4().simple().to_string()[..6].to_uppercase();
        let mut logger = Self {
            run_id,
            tmp_dir,
            log_root: log_root.to_path_buf(),
            rotation,
            segment_index: 0,
            segment_opened: Instant::now(),
            writer: None,
            segment_file: None,
            component_labels: None,
            last_timestamp: None,
        };
        logger.open_segment()?;
        Ok(logger)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn segment_path(&self, index: u32) -> PathBuf {
        self.tmp_dir
            .join(format!("{SEGMENT_PREFIX}{}_{index:03}.tsv", self.run_id))
    }

    fn open_segment(&mut self) -> AppResult<()> {
        let path = self.segment_path(self.segment_index);
        let file = File::create(&path)?;
        self.segment_file = Some(file.try_clone()?);
        let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_writer(file);
        // A segment always starts with the header once it is known, so any
        // single segment is readable on its own after a crash.
        if let Some(labels) = &self.component_labels {
            write_header(&mut writer, labels).map_err(|e| RigError::Log(e.to_string()))?;
        }
        self.writer = Some(writer);
        self.segment_opened = Instant::now();
        debug!(path = %path.display(), "opened log segment");
        Ok(())
    }

    fn rotate(&mut self) -> AppResult<()> {
        self.writer = None;
        self.segment_file = None;
        self.segment_index += 1;
        self.open_segment()
    }

    /// Append one reading. Returns true when the row was newly accepted;
    /// duplicates and readings with an unusable timestamp return false.
    ///
    /// An I/O failure rotates to a fresh segment and reports the row as
    /// dropped; acquisition itself never halts on log errors.
    pub fn write_measurement(
        &mut self,
        reading: &LiveReading,
        phase: Phase,
        channel: usize,
        repeat: u32,
    ) -> bool {
        let Some(ts) = extract_timestamp(&reading.timestamp) else {
            warn!("reading rejected: unusable timestamp");
            return false;
        };
        if self.last_timestamp == Some(ts) {
            return false;
        }
        if reading.components.is_empty() {
            return false;
        }
        self.last_timestamp = Some(ts);

        if self.component_labels.is_none() {
            let labels: Vec<String> = reading.components.iter().map(|c| c.label.clone()).collect();
            if let Err(e) = self.write_header_now(&labels) {
                warn!(error = %e, "failed to write log header");
                return false;
            }
            self.component_labels = Some(labels);
        }

        if self.segment_opened.elapsed() >= self.rotation {
            if let Err(e) = self.rotate() {
                warn!(error = %e, "segment rotation failed");
                return false;
            }
        }

        match self.write_row(reading, phase, channel, repeat) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "log write failed; rotating segment");
                if let Err(e) = self.rotate() {
                    warn!(error = %e, "recovery rotation failed; row dropped");
                }
                false
            }
        }
    }

    fn write_header_now(&mut self, labels: &[String]) -> csv::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            write_header(writer, labels)?;
            writer.flush()?;
        }
        Ok(())
    }

    fn write_row(
        &mut self,
        reading: &LiveReading,
        phase: Phase,
        channel: usize,
        repeat: u32,
    ) -> std::io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no open segment",
            ));
        };
        let labels = self.component_labels.as_deref().unwrap_or_default();

        let mut row: Vec<String> = Vec::with_capacity(FIXED_COLUMNS.len() + labels.len());
        row.push(render_timestamp(&reading.timestamp));
        row.push(format!("{:<width$}", phase.to_string(), width = PHASE_PAD));
        row.push(channel.to_string());
        row.push(repeat.to_string());
        // Gas values in header order; a label the device stopped reporting
        // leaves its column blank rather than shifting the row.
        for label in labels {
            let value = reading
                .components
                .iter()
                .find(|c| &c.label == label)
                .map(|c| format!("{:.4}", c.ppm))
                .unwrap_or_default();
            row.push(value);
        }

        writer.write_record(&row)?;
        writer.flush()?;
        if let Some(file) = &self.segment_file {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Finish the log.
    ///
    /// On success the run's segments are merged into
    /// `run_<timestamp>_<RUNID>.csv` at the log root and deleted; the
    /// merged path is returned. On an unsuccessful run the segments are
    /// left in `.tmp` for later recovery and `None` is returned.
    pub fn close(mut self, success: bool) -> AppResult<Option<PathBuf>> {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                warn!(error = %e, "final segment flush failed");
            }
        }
        if !success {
            info!(run_id = %self.run_id, "log closed without merge; segments preserved");
            return Ok(None);
        }

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let target = self
            .log_root
            .join(format!("run_{stamp}_{}.csv", self.run_id));
        let segments = collect_segments(&self.tmp_dir, &self.run_id)?;
        merge_segments(&segments, &target)?;
        remove_segments(&segments);
        info!(path = %target.display(), "measurement log merged");
        Ok(Some(target))
    }
}

fn write_header<W: std::io::Write>(writer: &mut csv::Writer<W>, labels: &[String]) -> csv::Result<()> {
    let header: Vec<&str> = FIXED_COLUMNS
        .iter()
        .copied()
        .chain(labels.iter().map(String::as_str))
        .collect();
    writer.write_record(&header)
}

fn render_timestamp(ts: &ReadingTimestamp) -> String {
    match ts {
        ReadingTimestamp::Epoch(e) if e.fract() == 0.0 => format!("{e:.0}"),
        ReadingTimestamp::Epoch(e) => format!("{e}"),
        ReadingTimestamp::Text(s) => s.clone(),
    }
}

/// Parse a device timestamp into epoch seconds, the de-duplication key.
///
/// Current firmware reports epoch seconds directly; legacy firmware sends a
/// readable string in ISO 8601 or `YYYY-mm-dd HH:MM:SS` form. Anything else
/// is unusable and the reading is rejected.
fn extract_timestamp(ts: &ReadingTimestamp) -> Option<f64> {
    match ts {
        ReadingTimestamp::Epoch(e) if e.is_finite() => Some(*e),
        ReadingTimestamp::Epoch(_) => None,
        ReadingTimestamp::Text(s) => {
            let s = s.trim();
            let iso = s.replace(' ', "T");
            for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
                if let Ok(dt) = NaiveDateTime::parse_from_str(&iso, format) {
                    return Some(dt.and_utc().timestamp_millis() as f64 / 1000.0);
                }
            }
            warn!(timestamp = %s, "unrecognized timestamp format");
            None
        }
    }
}

/// Segment files for one run id, sorted by segment index.
fn collect_segments(tmp_dir: &Path, run_id: &str) -> AppResult<Vec<PathBuf>> {
    let prefix = format!("{SEGMENT_PREFIX}{run_id}_");
    let mut segments: Vec<PathBuf> = Vec::new();
    if !tmp_dir.exists() {
        return Ok(segments);
    }
    for entry in fs::read_dir(tmp_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && name.ends_with(".tsv") {
            segments.push(entry.path());
        }
    }
    segments.sort();
    Ok(segments)
}

/// Concatenate segments into `target`, keeping only the first header line.
fn merge_segments(segments: &[PathBuf], target: &Path) -> AppResult<()> {
    if segments.is_empty() {
        return Err(RigError::Log("no segments to merge".to_string()));
    }

    let mut out = File::create(target)?;
    let mut header_written = false;
    for path in segments {
        let reader = BufReader::new(File::open(path)?);
        for line in reader.lines() {
            let line = line?;
            let is_header = line.starts_with("timestamp\t");
            if is_header {
                if header_written {
                    continue;
                }
                header_written = true;
            }
            writeln!(out, "{line}")?;
        }
    }
    out.sync_data()?;
    Ok(())
}

fn remove_segments(segments: &[PathBuf]) {
    for path in segments {
        if let Err(e) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "failed to delete merged segment");
        }
    }
}

/// Merge segments orphaned by a crashed run into recovered CSV files.
///
/// Segments are grouped by run id; each group merges to
/// `run_<timestamp>_<RUNID>_RECOVERED.csv` at the log root. A group's
/// segments are deleted only after its merge succeeded, so a failed
/// recovery can be retried.
pub fn recover_orphaned(log_root: &Path) -> AppResult<Vec<PathBuf>> {
    let tmp_dir = log_root.join(TMP_DIR);
    if !tmp_dir.exists() {
        return Ok(Vec::new());
    }

    let mut run_ids: Vec<String> = Vec::new();
    for entry in fs::read_dir(&tmp_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix(SEGMENT_PREFIX) else {
            continue;
        };
        let Some((run_id, _)) = rest.split_once('_') else {
            continue;
        };
        if !run_ids.iter().any(|id| id == run_id) {
            run_ids.push(run_id.to_string());
        }
    }

    let mut recovered = Vec::new();
    for run_id in run_ids {
        let segments = collect_segments(&tmp_dir, &run_id)?;
        if segments.is_empty() {
            continue;
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let target = log_root.join(format!("run_{stamp}_{run_id}_RECOVERED.csv"));
        match merge_segments(&segments, &target) {
            Ok(()) => {
                remove_segments(&segments);
                info!(path = %target.display(), segments = segments.len(), "recovered orphaned run");
                recovered.push(target);
            }
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "recovery merge failed; segments kept");
            }
        }
    }
    Ok(recovered)
}

/// One entry in the log directory listing.
#[derive(Clone, Debug, Serialize)]
pub struct LogEntry {
    pub name: String,
    pub size: u64,
    pub mtime: i64,
    pub modified_readable: String,
}

/// Finished CSV logs at the log root, newest first.
pub fn log_entries(log_root: &Path) -> AppResult<Vec<LogEntry>> {
    let mut entries = Vec::new();
    if !log_root.exists() {
        return Ok(entries);
    }
    for entry in fs::read_dir(log_root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.to_lowercase().ends_with(".csv") {
            continue;
        }
        let meta = entry.metadata()?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let readable = chrono::DateTime::from_timestamp(mtime, 0)
            .map(|dt| {
                dt.with_timezone(&Local)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default();
        entries.push(LogEntry {
            name,
            size: meta.len(),
            mtime,
            modified_readable: readable,
        });
    }
    entries.sort_by(|a, b| b.mtime.cmp(&a.mtime));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::GasComponent;
    use tempfile::TempDir;

    fn reading(epoch: f64, values: &[(&str, f64)]) -> LiveReading {
        LiveReading {
            timestamp: ReadingTimestamp::Epoch(epoch),
            components: values
                .iter()
                .map(|(label, ppm)| GasComponent {
                    cas: "74-82-8".to_string(),
                    label: label.to_string(),
                    ppm: *ppm,
                })
                .collect(),
        }
    }

    fn open_logger(dir: &TempDir) -> MeasurementLogger {
        MeasurementLogger::create(dir.path(), Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn test_run_id_is_six_upper_hex() {
        let dir = TempDir::new().unwrap();
        let logger = open_logger(&dir);
        assert_eq!(logger.run_id().len(), 6);
        assert!(logger
            .run_id()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let dir = TempDir::new().unwrap();
        let mut logger = open_logger(&dir);
        assert!(logger.write_measurement(&reading(100.0, &[("CH4", 1.9)]), Phase::Measuring, 0, 0));
        assert!(!logger.write_measurement(&reading(100.0, &[("CH4", 2.0)]), Phase::Measuring, 0, 0));
        assert!(logger.write_measurement(&reading(101.0, &[("CH4", 2.1)]), Phase::Measuring, 0, 0));
    }

    #[test]
    fn test_unparsable_timestamp_rejected() {
        let dir = TempDir::new().unwrap();
        let mut logger = open_logger(&dir);
        let bad = LiveReading {
            timestamp: ReadingTimestamp::Text("not-a-time".to_string()),
            components: vec![GasComponent {
                cas: "74-82-8".to_string(),
                label: "CH4".to_string(),
                ppm: 1.0,
            }],
        };
        assert!(!logger.write_measurement(&bad, Phase::Measuring, 0, 0));
    }

    #[test]
    fn test_text_timestamps_parse_both_forms() {
        let iso = extract_timestamp(&ReadingTimestamp::Text(
            "2024-05-28T10:30:00".to_string(),
        ));
        let spaced = extract_timestamp(&ReadingTimestamp::Text(
            "2024-05-28 10:30:00".to_string(),
        ));
        assert_eq!(iso, spaced);
        assert!(iso.is_some());
    }

    #[test]
    fn test_header_from_first_reading_and_row_format() {
        let dir = TempDir::new().unwrap();
        let mut logger = open_logger(&dir);
        logger.write_measurement(
            &reading(100.0, &[("CH4", 1.90321), ("CO2", 412.0)]),
            Phase::Measuring,
            3,
            1,
        );
        let path = logger.close(true).unwrap().unwrap();
        let content = fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next().unwrap(), "timestamp\tphase\tchannel\trepeat\tCH4\tCO2");
        let row = lines.next().unwrap();
        assert!(row.starts_with("100\tMEASURING \t3\t1\t1.9032\t412.0000"));
    }

    #[test]
    fn test_close_success_merges_and_deletes_segments() {
        let dir = TempDir::new().unwrap();
        let mut logger = open_logger(&dir);
        logger.write_measurement(&reading(1.0, &[("CH4", 1.0)]), Phase::Measuring, 0, 0);
        let run_id = logger.run_id().to_string();
        let merged = logger.close(true).unwrap().unwrap();
        assert!(merged.exists());
        let leftovers = collect_segments(&dir.path().join(TMP_DIR), &run_id).unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_close_failure_preserves_segments() {
        let dir = TempDir::new().unwrap();
        let mut logger = open_logger(&dir);
        logger.write_measurement(&reading(1.0, &[("CH4", 1.0)]), Phase::Measuring, 0, 0);
        let run_id = logger.run_id().to_string();
        assert!(logger.close(false).unwrap().is_none());
        let segments = collect_segments(&dir.path().join(TMP_DIR), &run_id).unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn test_rotation_produces_multiple_segments() {
        let dir = TempDir::new().unwrap();
        let mut logger = MeasurementLogger::create(dir.path(), Duration::ZERO).unwrap();
        logger.write_measurement(&reading(1.0, &[("CH4", 1.0)]), Phase::Measuring, 0, 0);
        logger.write_measurement(&reading(2.0, &[("CH4", 1.1)]), Phase::Measuring, 1, 0);
        let run_id = logger.run_id().to_string();
        drop(logger.close(false).unwrap());
        let segments = collect_segments(&dir.path().join(TMP_DIR), &run_id).unwrap();
        assert!(segments.len() >= 2, "zero rotation must split segments");
    }

    #[test]
    fn test_recover_orphaned_three_segments() {
        let dir = TempDir::new().unwrap();
        let mut logger = MeasurementLogger::create(dir.path(), Duration::ZERO).unwrap();
        for i in 0..3 {
            logger.write_measurement(
                &reading(i as f64 + 1.0, &[("CH4", 1.0)]),
                Phase::Measuring,
                i,
                0,
            );
        }
        drop(logger.close(false).unwrap());

        let recovered = recover_orphaned(dir.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        let content = fs::read_to_string(&recovered[0]).unwrap();
        let headers = content
            .lines()
            .filter(|l| l.starts_with("timestamp\t"))
            .count();
        assert_eq!(headers, 1, "merged file keeps exactly one header");
        assert_eq!(content.lines().count(), 4);
        assert!(recovered[0].to_string_lossy().ends_with("_RECOVERED.csv"));

        // Segments were consumed by the merge.
        assert!(recover_orphaned(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_log_entries_newest_first_csv_only() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.csv"), "x").unwrap();
        fs::write(dir.path().join("ignored.txt"), "x").unwrap();
        fs::write(dir.path().join("b.csv"), "xy").unwrap();
        let entries = log_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.name.ends_with(".csv")));
    }
}
