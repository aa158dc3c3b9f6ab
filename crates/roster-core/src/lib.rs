//! roster-core: Attendance recognition and session engine.
//!
//! Matches face embeddings supplied by an external extractor against an
//! enrolled gallery, deduplicates sightings within a session, and
//! reconciles the gallery into a present/absent report on finalize.

pub mod cache;
pub mod driver;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod report;
pub mod session;
pub mod timefmt;
pub mod types;

pub use driver::{run_session, Command, DriverOptions, FrameSource, SourceError, SourceEvent};
pub use gallery::{EmbeddingExtractor, GalleryLoader, ReferenceImage};
pub use ledger::{EventFilter, Ledger, LedgerError, MemoryLedger};
pub use matcher::{EuclideanMatcher, Matcher};
pub use report::{FileReportWriter, ReportFormat, ReportSerializer, SessionReport};
pub use session::{
    AttendanceEngine, Clock, EngineConfig, FrameOutcome, SessionError, SessionState, SystemClock,
};
pub use types::{
    AttendanceEvent, AttendanceStatus, BoundingBox, Detection, Embedding, Gallery, GalleryEntry,
    MatchResult,
};
