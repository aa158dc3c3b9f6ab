//! roster-store: SQLite-backed attendance ledger.
//!
//! Implements the core [`Ledger`] trait over an `attendance` table and adds
//! the read-side views used by the CLI: per-day attendance, statistics,
//! session summaries and retention cleanup.

use chrono::{Days, NaiveDate, NaiveDateTime};
use roster_core::report::SessionReport;
use roster_core::timefmt;
use roster_core::{AttendanceEvent, AttendanceStatus, EventFilter, Ledger, LedgerError};
use rusqlite::types::{Type, Value};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

mod recorder;

pub use recorder::SessionRecorder;

const DATE_FORMAT: &str = "%Y-%m-%d";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS attendance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    student_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL,
    session_id TEXT,
    confidence REAL
);
CREATE INDEX IF NOT EXISTS attendance_session ON attendance(session_id);
CREATE INDEX IF NOT EXISTS attendance_student ON attendance(student_name);
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    start_time TEXT NOT NULL,
    end_time TEXT,
    total_students INTEGER,
    present_count INTEGER,
    status TEXT NOT NULL DEFAULT 'active'
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("retention of {0} days reaches before the supported calendar range")]
    RetentionOutOfRange(u32),
}

/// Aggregate counts over the whole ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerStats {
    pub total_records: u64,
    pub unique_identities: u64,
    pub present_records: u64,
    pub latest: Option<NaiveDateTime>,
}

impl LedgerStats {
    /// Share of records that are `Present`, in [0, 1].
    pub fn present_rate(&self) -> f64 {
        if self.total_records == 0 {
            0.0
        } else {
            self.present_records as f64 / self.total_records as f64
        }
    }
}

/// Summary row of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRow {
    pub id: String,
    pub start_time: NaiveDateTime,
    pub end_time: Option<NaiveDateTime>,
    pub total_students: u64,
    pub present_count: u64,
    pub closed: bool,
}

/// Earliest date kept when retaining `days` days before `today`.
///
/// Uses calendar subtraction, so month and year boundaries (and leap days)
/// are handled. `None` if the result would fall outside chrono's range.
pub fn retention_cutoff(today: NaiveDate, days: u32) -> Option<NaiveDate> {
    today.checked_sub_days(Days::new(u64::from(days)))
}

pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                std::fs::create_dir_all(dir).map_err(|source| StoreError::Directory {
                    path: dir.to_path_buf(),
                    source,
                })?;
                tracing::info!(path = %dir.display(), "created data directory");
            }
        }

        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.init()?;
        tracing::debug!(path = %path.display(), "attendance database ready");
        Ok(ledger)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let ledger = Self {
            conn: Connection::open_in_memory()?,
        };
        ledger.init()?;
        Ok(ledger)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn append_event(&self, event: &AttendanceEvent) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO attendance (student_name, timestamp, status, session_id, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.identity,
                timefmt::format(&event.timestamp),
                event.status.as_str(),
                event.session_id,
                event.confidence.map(f64::from),
            ],
        )?;
        tracing::debug!(
            identity = %event.identity,
            status = %event.status,
            session = %event.session_id,
            "attendance recorded"
        );
        Ok(())
    }

    /// Events matching `filter`, newest first (append order breaks ties).
    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, StoreError> {
        let mut sql = String::from(
            "SELECT student_name, status, session_id, timestamp, confidence
             FROM attendance WHERE 1 = 1",
        );
        let mut args: Vec<Value> = Vec::new();

        if let Some(identity) = &filter.identity {
            sql.push_str(" AND student_name = ?");
            args.push(Value::Text(identity.clone()));
        }
        if let Some(session_id) = &filter.session_id {
            sql.push_str(" AND session_id = ?");
            args.push(Value::Text(session_id.clone()));
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND DATE(timestamp) >= ?");
            args.push(Value::Text(from.format(DATE_FORMAT).to_string()));
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND DATE(timestamp) <= ?");
            args.push(Value::Text(to.format(DATE_FORMAT).to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), |row| {
            let status: String = row.get(1)?;
            let timestamp: String = row.get(3)?;
            let confidence: Option<f64> = row.get(4)?;
            Ok(AttendanceEvent {
                identity: row.get(0)?,
                status: status.parse::<AttendanceStatus>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                })?,
                session_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                timestamp: timefmt::parse(&timestamp).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
                })?,
                confidence: confidence.map(|c| c as f32),
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Events of one calendar day grouped by identity, oldest first within each.
    pub fn daily_attendance(
        &self,
        date: NaiveDate,
    ) -> Result<BTreeMap<String, Vec<AttendanceEvent>>, StoreError> {
        let mut by_identity: BTreeMap<String, Vec<AttendanceEvent>> = BTreeMap::new();
        for event in self.query_events(&EventFilter::on(date))?.into_iter().rev() {
            by_identity
                .entry(event.identity.clone())
                .or_default()
                .push(event);
        }
        Ok(by_identity)
    }

    pub fn statistics(&self) -> Result<LedgerStats, StoreError> {
        let (total, unique, present, latest): (i64, i64, i64, Option<String>) =
            self.conn.query_row(
                "SELECT COUNT(*),
                        COUNT(DISTINCT student_name),
                        COALESCE(SUM(status = 'Present'), 0),
                        MAX(timestamp)
                 FROM attendance",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        Ok(LedgerStats {
            total_records: total as u64,
            unique_identities: unique as u64,
            present_records: present as u64,
            latest: latest.and_then(|s| timefmt::parse(&s).ok()),
        })
    }

    /// Insert or update the summary row for a session.
    pub fn record_session(&self, report: &SessionReport) -> Result<(), StoreError> {
        let status = if report.is_final() { "closed" } else { "active" };
        self.conn.execute(
            "INSERT INTO sessions (id, start_time, end_time, total_students, present_count, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 end_time = excluded.end_time,
                 total_students = excluded.total_students,
                 present_count = excluded.present_count,
                 status = excluded.status",
            params![
                report.session_id,
                timefmt::format(&report.start_time),
                timefmt::format(&report.end_time),
                report.total_count as i64,
                report.present_count as i64,
                status,
            ],
        )?;
        Ok(())
    }

    pub fn session(&self, id: &str) -> Result<Option<SessionRow>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, start_time, end_time, total_students, present_count, status
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    let start: String = row.get(1)?;
                    let end: Option<String> = row.get(2)?;
                    let status: String = row.get(5)?;
                    Ok(SessionRow {
                        id: row.get(0)?,
                        start_time: timefmt::parse(&start).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e))
                        })?,
                        end_time: end.and_then(|s| timefmt::parse(&s).ok()),
                        total_students: row.get::<_, Option<i64>>(3)?.unwrap_or(0) as u64,
                        present_count: row.get::<_, Option<i64>>(4)?.unwrap_or(0) as u64,
                        closed: status == "closed",
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Delete attendance rows dated before the retention cutoff.
    /// Returns the number of rows removed.
    pub fn cleanup(&self, retention_days: u32, today: NaiveDate) -> Result<usize, StoreError> {
        let cutoff = retention_cutoff(today, retention_days)
            .ok_or(StoreError::RetentionOutOfRange(retention_days))?;
        let deleted = self.conn.execute(
            "DELETE FROM attendance WHERE DATE(timestamp) < ?1",
            params![cutoff.format(DATE_FORMAT).to_string()],
        )?;
        tracing::info!(deleted, cutoff = %cutoff, "cleaned up old attendance records");
        Ok(deleted)
    }
}

impl Ledger for SqliteLedger {
    fn append(&mut self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        self.append_event(event)
            .map_err(|e| LedgerError::Unavailable(e.to_string()))
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError> {
        self.query_events(filter)
            .map_err(|e| LedgerError::Query(e.to_string()))
    }
}
