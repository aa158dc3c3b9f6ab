//! Session reports: reconciliation of the gallery against the marked set,
//! and serialization to CSV / JSON files.

use crate::session::Mark;
use crate::timefmt;
use crate::types::{AttendanceEvent, AttendanceStatus};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Column headers of the CSV report.
pub const CSV_HEADER: [&str; 4] = ["Student Name", "Status", "Timestamp", "Confidence"];

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("report i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Report format selector from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Csv,
    Json,
    Both,
}

/// A single concrete output file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Json,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl ReportFormat {
    pub fn file_formats(&self) -> &'static [FileFormat] {
        match self {
            Self::Csv => &[FileFormat::Csv],
            Self::Json => &[FileFormat::Json],
            Self::Both => &[FileFormat::Csv, FileFormat::Json],
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Both => "both",
        })
    }
}

#[derive(Error, Debug)]
#[error("unknown report format {0:?} (expected csv, json or both)")]
pub struct ParseFormatError(String);

impl FromStr for ReportFormat {
    type Err = ParseFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "both" => Ok(Self::Both),
            _ => Err(ParseFormatError(s.to_string())),
        }
    }
}

/// Whether a report is an intermediate snapshot or the finalize result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    /// N-th snapshot of the session, starting at 1.
    Snapshot(u32),
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub identity: String,
    pub status: AttendanceStatus,
    #[serde(with = "crate::timefmt")]
    pub timestamp: NaiveDateTime,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionReport {
    pub session_id: String,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub total_count: usize,
    pub present_count: usize,
    pub kind: ReportKind,
    /// One entry per gallery identity, in gallery order.
    pub entries: Vec<ReportEntry>,
}

impl SessionReport {
    /// Reconcile the gallery identities against the marked set.
    ///
    /// Marked identities are `Present` with their marking time and
    /// confidence; all others are `Absent` as of `end_time`.
    pub(crate) fn reconcile<'a>(
        session_id: &str,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
        identities: impl IntoIterator<Item = &'a str>,
        marked: &HashMap<String, Mark>,
        kind: ReportKind,
    ) -> Self {
        let entries: Vec<ReportEntry> = identities
            .into_iter()
            .map(|identity| match marked.get(identity) {
                Some(mark) => ReportEntry {
                    identity: identity.to_string(),
                    status: AttendanceStatus::Present,
                    timestamp: mark.timestamp,
                    confidence: Some(mark.confidence),
                },
                None => ReportEntry {
                    identity: identity.to_string(),
                    status: AttendanceStatus::Absent,
                    timestamp: end_time,
                    confidence: None,
                },
            })
            .collect();

        Self::from_entries(session_id, start_time, end_time, entries, kind)
    }

    /// Rebuild a final report from the ledger's events for one session.
    ///
    /// `events` must be in ledger query order (newest first); the first event
    /// seen for an identity decides its status. Identities without any event
    /// are `Absent`. Returns `None` if the session has no events at all.
    pub fn from_ledger_events<'a>(
        session_id: &str,
        identities: impl IntoIterator<Item = &'a str>,
        events: &[AttendanceEvent],
    ) -> Option<Self> {
        let session_events: Vec<&AttendanceEvent> = events
            .iter()
            .filter(|e| e.session_id == session_id)
            .collect();
        let start_time = session_events.iter().map(|e| e.timestamp).min()?;
        let end_time = session_events.iter().map(|e| e.timestamp).max()?;

        let mut latest: HashMap<&str, &AttendanceEvent> = HashMap::new();
        for event in session_events.iter().copied() {
            latest.entry(event.identity.as_str()).or_insert(event);
        }

        let entries = identities
            .into_iter()
            .map(|identity| match latest.get(identity) {
                Some(event) => ReportEntry {
                    identity: identity.to_string(),
                    status: event.status,
                    timestamp: event.timestamp,
                    confidence: event.confidence,
                },
                None => ReportEntry {
                    identity: identity.to_string(),
                    status: AttendanceStatus::Absent,
                    timestamp: end_time,
                    confidence: None,
                },
            })
            .collect();

        Some(Self::from_entries(
            session_id,
            start_time,
            end_time,
            entries,
            ReportKind::Final,
        ))
    }

    fn from_entries(
        session_id: &str,
        start_time: NaiveDateTime,
        end_time: NaiveDateTime,
        entries: Vec<ReportEntry>,
        kind: ReportKind,
    ) -> Self {
        let present_count = entries
            .iter()
            .filter(|e| e.status == AttendanceStatus::Present)
            .count();
        Self {
            session_id: session_id.to_string(),
            start_time,
            end_time,
            total_count: entries.len(),
            present_count,
            kind,
            entries,
        }
    }

    pub fn is_final(&self) -> bool {
        self.kind == ReportKind::Final
    }

    pub fn absent_count(&self) -> usize {
        self.total_count - self.present_count
    }

    /// Present fraction in [0, 1]; 0 for an empty report.
    pub fn attendance_rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.present_count as f64 / self.total_count as f64
        }
    }

    pub fn status_of(&self, identity: &str) -> Option<AttendanceStatus> {
        self.entries
            .iter()
            .find(|e| e.identity == identity)
            .map(|e| e.status)
    }

    pub fn present_identities(&self) -> HashSet<&str> {
        self.entries
            .iter()
            .filter(|e| e.status == AttendanceStatus::Present)
            .map(|e| e.identity.as_str())
            .collect()
    }

    /// Base file name without extension.
    pub fn file_stem(&self) -> String {
        match self.kind {
            ReportKind::Final => format!("attendance_{}_final", self.session_id),
            ReportKind::Snapshot(n) => format!("attendance_{}_snapshot{n}", self.session_id),
        }
    }
}

/// JSON shape of a report.
#[derive(Serialize)]
struct ReportDocument<'a> {
    session_id: &'a str,
    start_time: String,
    end_time: String,
    #[serde(rename = "final")]
    is_final: bool,
    total_students: usize,
    present_count: usize,
    attendance_rate: f64,
    students: BTreeMap<&'a str, StudentRecord>,
}

#[derive(Serialize)]
struct StudentRecord {
    status: AttendanceStatus,
    timestamp: String,
    confidence: Option<f32>,
}

impl<'a> From<&'a SessionReport> for ReportDocument<'a> {
    fn from(report: &'a SessionReport) -> Self {
        Self {
            session_id: &report.session_id,
            start_time: timefmt::format(&report.start_time),
            end_time: timefmt::format(&report.end_time),
            is_final: report.is_final(),
            total_students: report.total_count,
            present_count: report.present_count,
            attendance_rate: report.attendance_rate(),
            students: report
                .entries
                .iter()
                .map(|e| {
                    (
                        e.identity.as_str(),
                        StudentRecord {
                            status: e.status,
                            timestamp: timefmt::format(&e.timestamp),
                            confidence: e.confidence,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Persists session reports in one or more file formats.
pub trait ReportSerializer {
    fn write_format(
        &mut self,
        report: &SessionReport,
        format: FileFormat,
    ) -> Result<PathBuf, ReportError>;

    /// Write every format in the selector. Failures are logged and skipped;
    /// the result lists the artifacts that were produced (possibly none).
    fn write(&mut self, report: &SessionReport, selector: ReportFormat) -> Vec<PathBuf> {
        let mut written = Vec::new();
        for &format in selector.file_formats() {
            match self.write_format(report, format) {
                Ok(path) => {
                    tracing::info!(
                        session = %report.session_id,
                        path = %path.display(),
                        "report saved"
                    );
                    written.push(path);
                }
                Err(e) => tracing::error!(
                    session = %report.session_id,
                    format = format.extension(),
                    error = %e,
                    "failed to save report"
                ),
            }
        }
        written
    }
}

/// Writes reports as files under a directory.
#[derive(Debug, Clone)]
pub struct FileReportWriter {
    dir: PathBuf,
}

impl FileReportWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_csv(path: &Path, report: &SessionReport) -> Result<(), ReportError> {
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(CSV_HEADER)?;
        for entry in &report.entries {
            let confidence = entry
                .confidence
                .map(|c| format!("{c:.4}"))
                .unwrap_or_default();
            let timestamp = timefmt::format(&entry.timestamp);
            wtr.write_record([
                entry.identity.as_str(),
                entry.status.as_str(),
                timestamp.as_str(),
                confidence.as_str(),
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }

    fn write_json(path: &Path, report: &SessionReport) -> Result<(), ReportError> {
        let doc = ReportDocument::from(report);
        std::fs::write(path, serde_json::to_string_pretty(&doc)?)?;
        Ok(())
    }
}

impl ReportSerializer for FileReportWriter {
    fn write_format(
        &mut self,
        report: &SessionReport,
        format: FileFormat,
    ) -> Result<PathBuf, ReportError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{}.{}", report.file_stem(), format.extension()));
        match format {
            FileFormat::Csv => Self::write_csv(&path, report)?,
            FileFormat::Json => Self::write_json(&path, report)?,
        }
        Ok(path)
    }
}

impl<S: ReportSerializer + ?Sized> ReportSerializer for &mut S {
    fn write_format(
        &mut self,
        report: &SessionReport,
        format: FileFormat,
    ) -> Result<PathBuf, ReportError> {
        (**self).write_format(report, format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 16)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn sample_report(kind: ReportKind) -> SessionReport {
        let mut marked = HashMap::new();
        marked.insert(
            "alice".to_string(),
            Mark {
                timestamp: at(9, 1),
                confidence: 0.8586,
            },
        );
        SessionReport::reconcile(
            "20261016_090000",
            at(9, 0),
            at(9, 30),
            ["alice", "bob", "carol"],
            &marked,
            kind,
        )
    }

    #[test]
    fn test_reconcile_partitions_gallery() {
        let report = sample_report(ReportKind::Final);
        assert_eq!(report.total_count, 3);
        assert_eq!(report.present_count, 1);
        assert_eq!(report.absent_count(), 2);
        assert!((report.attendance_rate() - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.status_of("alice"), Some(AttendanceStatus::Present));
        assert_eq!(report.status_of("bob"), Some(AttendanceStatus::Absent));
        assert_eq!(report.entries[1].timestamp, at(9, 30));
        assert_eq!(report.entries[1].confidence, None);
    }

    #[test]
    fn test_empty_report_rate_is_zero() {
        let report = SessionReport::reconcile(
            "s",
            at(9, 0),
            at(9, 0),
            std::iter::empty(),
            &HashMap::new(),
            ReportKind::Final,
        );
        assert_eq!(report.attendance_rate(), 0.0);
    }

    #[test]
    fn test_from_ledger_events_uses_latest_event() {
        let ev = |identity: &str, status, m| AttendanceEvent {
            identity: identity.into(),
            status,
            session_id: "s1".into(),
            timestamp: at(9, m),
            confidence: None,
        };
        // Newest first, as returned by a ledger query.
        let events = vec![
            ev("alice", AttendanceStatus::Absent, 30),
            ev("bob", AttendanceStatus::Absent, 30),
            ev("alice", AttendanceStatus::Present, 5),
            AttendanceEvent {
                session_id: "other".into(),
                ..ev("carol", AttendanceStatus::Present, 6)
            },
        ];

        let report =
            SessionReport::from_ledger_events("s1", ["alice", "bob", "carol"], &events).unwrap();
        assert_eq!(report.present_count, 0);
        assert_eq!(report.status_of("alice"), Some(AttendanceStatus::Absent));
        assert_eq!(report.status_of("carol"), Some(AttendanceStatus::Absent));
        assert_eq!(report.start_time, at(9, 5));
        assert_eq!(report.end_time, at(9, 30));

        assert!(SessionReport::from_ledger_events("none", ["alice"], &events).is_none());
    }

    #[test]
    fn test_write_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FileReportWriter::new(dir.path().join("reports"));
        let report = sample_report(ReportKind::Final);

        let written = writer.write(&report, ReportFormat::Csv);
        assert_eq!(written.len(), 1);
        assert!(written[0].ends_with("attendance_20261016_090000_final.csv"));

        let mut rdr = csv::Reader::from_path(&written[0]).unwrap();
        let headers: Vec<String> = rdr.headers().unwrap().iter().map(String::from).collect();
        assert_eq!(headers, CSV_HEADER);
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], "alice");
        assert_eq!(&rows[0][1], "Present");
        assert_eq!(&rows[0][2], "2026-10-16 09:01:00");
        assert_eq!(&rows[0][3], "0.8586");
        assert_eq!(&rows[2][1], "Absent");
        assert_eq!(&rows[2][3], "");
    }

    #[test]
    fn test_write_both_formats() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = FileReportWriter::new(dir.path());
        let report = sample_report(ReportKind::Snapshot(2));

        let written = writer.write(&report, ReportFormat::Both);
        assert_eq!(written.len(), 2);
        assert!(written[1].ends_with("attendance_20261016_090000_snapshot2.json"));

        let doc: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&written[1]).unwrap()).unwrap();
        assert_eq!(doc["session_id"], "20261016_090000");
        assert_eq!(doc["final"], false);
        assert_eq!(doc["total_students"], 3);
        assert_eq!(doc["present_count"], 1);
        assert_eq!(doc["students"]["alice"]["status"], "Present");
        assert_eq!(doc["students"]["carol"]["status"], "Absent");
        assert_eq!(doc["start_time"], "2026-10-16 09:00:00");
    }

    #[test]
    fn test_failed_format_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the report directory should be.
        let blocked = dir.path().join("reports");
        std::fs::write(&blocked, b"").unwrap();
        let mut writer = FileReportWriter::new(&blocked);

        let written = writer.write(&sample_report(ReportKind::Final), ReportFormat::Both);
        assert!(written.is_empty());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!("CSV".parse::<ReportFormat>().unwrap(), ReportFormat::Csv);
        assert_eq!("both".parse::<ReportFormat>().unwrap(), ReportFormat::Both);
        assert!("xml".parse::<ReportFormat>().is_err());
    }
}
