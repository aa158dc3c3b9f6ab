//! The append-only store of attendance events.

use crate::types::AttendanceEvent;
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger write rejected: {0}")]
    Rejected(String),
    #[error("ledger query failed: {0}")]
    Query(String),
}

/// Filters for [`Ledger::query`]. Unset fields match everything; date bounds
/// are inclusive calendar dates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub identity: Option<String>,
    pub session_id: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl EventFilter {
    pub fn identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            ..Self::default()
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    pub fn on(date: NaiveDate) -> Self {
        Self {
            from: Some(date),
            to: Some(date),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &AttendanceEvent) -> bool {
        let date = event.timestamp.date();
        self.identity.as_deref().map_or(true, |id| id == event.identity)
            && self
                .session_id
                .as_deref()
                .map_or(true, |s| s == event.session_id)
            && self.from.map_or(true, |from| date >= from)
            && self.to.map_or(true, |to| date <= to)
    }
}

/// Append-only attendance store. Only single-row appends are assumed atomic.
pub trait Ledger {
    fn append(&mut self, event: &AttendanceEvent) -> Result<(), LedgerError>;

    /// Matching events, newest first.
    fn query(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError>;
}

impl<L: Ledger + ?Sized> Ledger for &mut L {
    fn append(&mut self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        (**self).append(event)
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError> {
        (**self).query(filter)
    }
}

impl<L: Ledger + ?Sized> Ledger for Box<L> {
    fn append(&mut self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        (**self).append(event)
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError> {
        (**self).query(filter)
    }
}

/// In-process ledger, for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedger {
    events: Vec<AttendanceEvent>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in append order.
    pub fn events(&self) -> &[AttendanceEvent] {
        &self.events
    }
}

impl Ledger for MemoryLedger {
    fn append(&mut self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let mut out: Vec<AttendanceEvent> = self
            .events
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        // Stable sort keeps reverse-append order among equal timestamps.
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }
}
