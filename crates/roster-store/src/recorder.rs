use crate::SqliteLedger;
use roster_core::report::{FileFormat, ReportError};
use roster_core::{ReportFormat, ReportSerializer, SessionReport};
use std::path::PathBuf;

/// Report serializer that also upserts the `sessions` row for every report
/// it writes, so a live session shows as `active` from its first snapshot
/// and as `closed` once the final report is out.
pub struct SessionRecorder<S> {
    inner: S,
    store: SqliteLedger,
}

impl<S: ReportSerializer> SessionRecorder<S> {
    /// `store` is usually a second connection to the engine's database.
    pub fn new(inner: S, store: SqliteLedger) -> Self {
        Self { inner, store }
    }

    pub fn store(&self) -> &SqliteLedger {
        &self.store
    }
}

impl<S: ReportSerializer> ReportSerializer for SessionRecorder<S> {
    fn write_format(
        &mut self,
        report: &SessionReport,
        format: FileFormat,
    ) -> Result<PathBuf, ReportError> {
        self.inner.write_format(report, format)
    }

    fn write(&mut self, report: &SessionReport, selector: ReportFormat) -> Vec<PathBuf> {
        if let Err(e) = self.store.record_session(report) {
            tracing::error!(
                session = %report.session_id,
                error = %e,
                "failed to record session summary"
            );
        }
        self.inner.write(report, selector)
    }
}
