//! Attendance session state machine.
//!
//! ```text
//! Idle ──start──▶ Active ──stop──▶ Finalizing ──▶ Closed
//!                  │  ▲
//!                  └──┘ process_frame / reset / save
//! ```
//!
//! One engine runs at most one session at a time. A closed session may be
//! followed by a new `start`, which allocates a fresh session id.

use crate::matcher::{EuclideanMatcher, Matcher};
use crate::report::{ReportFormat, ReportKind, ReportSerializer, SessionReport};
use crate::ledger::Ledger;
use crate::types::{AttendanceEvent, AttendanceStatus, BoundingBox, Detection, Gallery};
use chrono::NaiveDateTime;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Session ids are the start time in this format, suffixed on collision.
const SESSION_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Source of wall-clock time for session bookkeeping.
pub trait Clock: Send {
    fn now(&self) -> NaiveDateTime;
}

/// Local wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Engine settings consumed by the core. Built by the caller from its
/// configuration source.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum Euclidean distance accepted as a match (inclusive).
    pub threshold: f32,
    pub report_format: ReportFormat,
    /// Embedding extraction model name, recorded in logs.
    pub model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            report_format: ReportFormat::Csv,
            model: "hog".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Finalizing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Finalizing => "finalizing",
            Self::Closed => "closed",
        })
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SessionError {
    #[error("no enrolled identities")]
    NoEnrolledIdentities,
    #[error("cannot {op} while session is {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
}

impl SessionError {
    /// Operation invoked in the wrong state, as opposed to a data condition.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }
}

/// When and how confidently an identity was marked present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mark {
    pub timestamp: NaiveDateTime,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    start_time: NaiveDateTime,
    end_time: Option<NaiveDateTime>,
    identities: Vec<String>,
    marked: HashMap<String, Mark>,
    state: SessionState,
    snapshots: u32,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn start_time(&self) -> NaiveDateTime {
        self.start_time
    }

    pub fn end_time(&self) -> Option<NaiveDateTime> {
        self.end_time
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Gallery identities captured at start, in gallery order.
    pub fn identities(&self) -> &[String] {
        &self.identities
    }

    pub fn is_marked(&self, identity: &str) -> bool {
        self.marked.contains_key(identity)
    }

    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    fn report(&self, end_time: NaiveDateTime, kind: ReportKind) -> SessionReport {
        SessionReport::reconcile(
            &self.id,
            self.start_time,
            end_time,
            self.identities.iter().map(String::as_str),
            &self.marked,
            kind,
        )
    }
}

/// What happened to one detected face in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Newly marked present; a ledger event was written.
    Marked,
    /// Already in the marked set; nothing written.
    AlreadyMarked,
    /// Matched, but the ledger append failed; not marked.
    LedgerFailed,
    /// No gallery entry within threshold.
    Unknown,
    /// Probe dimensionality differs from the gallery's.
    DimensionMismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub location: BoundingBox,
    pub identity: Option<String>,
    pub confidence: f32,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    pub recognitions: Vec<Recognition>,
}

impl FrameOutcome {
    pub fn newly_marked(&self) -> impl Iterator<Item = &str> {
        self.recognitions
            .iter()
            .filter(|r| r.disposition == Disposition::Marked)
            .filter_map(|r| r.identity.as_deref())
    }

    pub fn unknown_count(&self) -> usize {
        self.recognitions
            .iter()
            .filter(|r| r.disposition == Disposition::Unknown)
            .count()
    }
}

/// Result of `save`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub report: SessionReport,
    pub artifacts: Vec<PathBuf>,
}

/// Result of `stop`.
#[derive(Debug, Clone)]
pub struct Finalized {
    pub report: SessionReport,
    /// Report files produced; empty if every format failed.
    pub artifacts: Vec<PathBuf>,
    /// Identities whose terminal ledger write failed.
    pub ledger_failures: Vec<String>,
}

/// Frame-driven attendance engine.
pub struct AttendanceEngine<L, S, M = EuclideanMatcher> {
    config: EngineConfig,
    matcher: M,
    ledger: L,
    serializer: S,
    clock: Box<dyn Clock>,
    gallery: Arc<Gallery>,
    session: Option<Session>,
    issued_ids: HashSet<String>,
}

impl<L: Ledger, S: ReportSerializer> AttendanceEngine<L, S, EuclideanMatcher> {
    pub fn new(config: EngineConfig, ledger: L, serializer: S) -> Self {
        Self {
            config,
            matcher: EuclideanMatcher,
            ledger,
            serializer,
            clock: Box::new(SystemClock),
            gallery: Arc::new(Gallery::new()),
            session: None,
            issued_ids: HashSet::new(),
        }
    }
}

impl<L: Ledger, S: ReportSerializer, M: Matcher> AttendanceEngine<L, S, M> {
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Begin a session over `gallery`. The gallery is not modified while
    /// the session is active.
    pub fn start(&mut self, gallery: Arc<Gallery>) -> Result<&Session, SessionError> {
        match self.state() {
            SessionState::Idle | SessionState::Closed => {}
            state => return Err(SessionError::InvalidState { op: "start", state }),
        }
        if gallery.is_empty() {
            return Err(SessionError::NoEnrolledIdentities);
        }

        let now = self.clock.now();
        let id = self.allocate_id(now);
        let identities: Vec<String> = gallery.identities().map(str::to_string).collect();

        tracing::info!(
            session = %id,
            identities = identities.len(),
            threshold = self.config.threshold,
            model = %self.config.model,
            "attendance session started"
        );

        self.gallery = gallery;
        Ok(&*self.session.insert(Session {
            id,
            start_time: now,
            end_time: None,
            identities,
            marked: HashMap::new(),
            state: SessionState::Active,
            snapshots: 0,
        }))
    }

    /// Match every detection in one frame and mark newly recognised identities.
    pub fn process_frame(&mut self, detections: &[Detection]) -> Result<FrameOutcome, SessionError> {
        let session = active(&mut self.session, "process frame")?;
        let gallery = &self.gallery;
        let mut outcome = FrameOutcome::default();

        for detection in detections {
            let probe = &detection.embedding;
            if gallery.dimension() != Some(probe.dimension()) {
                tracing::warn!(
                    session = %session.id,
                    expected = ?gallery.dimension(),
                    actual = probe.dimension(),
                    "probe dimensionality does not match gallery; ignoring"
                );
                outcome.recognitions.push(Recognition {
                    location: detection.location,
                    identity: None,
                    confidence: 0.0,
                    disposition: Disposition::DimensionMismatch,
                });
                continue;
            }

            let result = self.matcher.compare(probe, gallery, self.config.threshold);
            let Some(identity) = result.identity else {
                tracing::debug!(
                    session = %session.id,
                    confidence = result.confidence,
                    "unknown face"
                );
                outcome.recognitions.push(Recognition {
                    location: detection.location,
                    identity: None,
                    confidence: result.confidence,
                    disposition: Disposition::Unknown,
                });
                continue;
            };

            let disposition = if session.marked.contains_key(&identity) {
                Disposition::AlreadyMarked
            } else {
                let now = self.clock.now();
                let event = AttendanceEvent {
                    identity: identity.clone(),
                    status: AttendanceStatus::Present,
                    session_id: session.id.clone(),
                    timestamp: now,
                    confidence: Some(result.confidence),
                };
                match self.ledger.append(&event) {
                    Ok(()) => {
                        session.marked.insert(
                            identity.clone(),
                            Mark {
                                timestamp: now,
                                confidence: result.confidence,
                            },
                        );
                        tracing::info!(
                            session = %session.id,
                            identity = %identity,
                            confidence = result.confidence,
                            "marked present"
                        );
                        Disposition::Marked
                    }
                    Err(e) => {
                        tracing::error!(
                            session = %session.id,
                            identity = %identity,
                            error = %e,
                            "ledger append failed; will retry on next sighting"
                        );
                        Disposition::LedgerFailed
                    }
                }
            };

            outcome.recognitions.push(Recognition {
                location: detection.location,
                identity: Some(identity),
                confidence: result.confidence,
                disposition,
            });
        }

        Ok(outcome)
    }

    /// Clear the marked set. Previously written ledger events stay as they
    /// are, so an identity seen again after a reset gets a second `Present`
    /// event in the same session.
    pub fn reset(&mut self) -> Result<usize, SessionError> {
        let session = active(&mut self.session, "reset")?;
        let cleared = session.marked.len();
        session.marked.clear();
        tracing::info!(session = %session.id, cleared, "marked set reset");
        Ok(cleared)
    }

    /// Write a non-final report of the current attendance. Leaves the
    /// session state and marked set untouched.
    pub fn save(&mut self) -> Result<Snapshot, SessionError> {
        let session = active(&mut self.session, "save")?;
        session.snapshots += 1;
        let report = session.report(self.clock.now(), ReportKind::Snapshot(session.snapshots));
        let artifacts = self.serializer.write(&report, self.config.report_format);
        if artifacts.is_empty() {
            tracing::error!(session = %session.id, "snapshot not saved in any format");
        }
        Ok(Snapshot { report, artifacts })
    }

    /// Finalize the session: write an `Absent` event for every identity not
    /// in the marked set, produce the final report, and close the session.
    ///
    /// Each terminal write is independent; failures are logged, collected in
    /// [`Finalized::ledger_failures`], and do not stop the remaining writes.
    pub fn stop(&mut self) -> Result<Finalized, SessionError> {
        let session = active(&mut self.session, "stop")?;
        session.state = SessionState::Finalizing;

        let now = self.clock.now();
        session.end_time = Some(now);

        let mut ledger_failures = Vec::new();
        for identity in &session.identities {
            if session.marked.contains_key(identity) {
                continue;
            }
            let event = AttendanceEvent {
                identity: identity.clone(),
                status: AttendanceStatus::Absent,
                session_id: session.id.clone(),
                timestamp: now,
                confidence: None,
            };
            if let Err(e) = self.ledger.append(&event) {
                tracing::error!(
                    session = %session.id,
                    identity = %identity,
                    error = %e,
                    "failed to record terminal status"
                );
                ledger_failures.push(identity.clone());
            }
        }

        let report = session.report(now, ReportKind::Final);
        let artifacts = self.serializer.write(&report, self.config.report_format);
        if artifacts.is_empty() {
            tracing::error!(session = %session.id, "final report not saved in any format");
        }

        session.state = SessionState::Closed;
        tracing::info!(
            session = %session.id,
            present = report.present_count,
            total = report.total_count,
            duration_secs = (now - session.start_time).num_seconds(),
            "attendance session ended"
        );

        Ok(Finalized {
            report,
            artifacts,
            ledger_failures,
        })
    }

    fn allocate_id(&mut self, now: NaiveDateTime) -> String {
        let base = now.format(SESSION_ID_FORMAT).to_string();
        let mut id = base.clone();
        let mut n = 2;
        while self.issued_ids.contains(&id) {
            id = format!("{base}_{n}");
            n += 1;
        }
        self.issued_ids.insert(id.clone());
        id
    }
}

fn active<'a>(
    session: &'a mut Option<Session>,
    op: &'static str,
) -> Result<&'a mut Session, SessionError> {
    let state = session.as_ref().map_or(SessionState::Idle, |s| s.state);
    match session.as_mut() {
        Some(s) if state == SessionState::Active => Ok(s),
        _ => Err(SessionError::InvalidState { op, state }),
    }
}
