//! Frame-driven session loop.
//!
//! Pulls frames and decoded user intents from a [`FrameSource`] and feeds
//! them to an [`AttendanceEngine`]. The source is acquired before the session
//! becomes active and dropped before finalize on every exit path: explicit
//! stop, end of stream, read failure or interrupt. All of those finish with
//! the same `stop()` so partial attendance still produces a report.

use crate::ledger::Ledger;
use crate::matcher::Matcher;
use crate::report::ReportSerializer;
use crate::session::{AttendanceEngine, Finalized, SessionError};
use crate::types::{Detection, Gallery};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// A user intent, already decoded from whatever input device the caller uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Start,
    Stop,
    Reset,
    Save,
}

#[derive(Error, Debug)]
#[error("unknown command {0:?}")]
pub struct ParseCommandError(String);

impl FromStr for Command {
    type Err = ParseCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" | "q" => Ok(Self::Stop),
            "reset" | "r" => Ok(Self::Reset),
            "save" | "s" => Ok(Self::Save),
            _ => Err(ParseCommandError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Faces extracted from one captured frame (possibly none).
    Frame(Vec<Detection>),
    Command(Command),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source unavailable: {0}")]
    Unavailable(String),
    #[error("frame read failed: {0}")]
    Read(String),
}

/// Blocking producer of frames and commands. `Ok(None)` ends the stream.
pub trait FrameSource {
    fn next_event(&mut self) -> Result<Option<SourceEvent>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Only every N-th frame is matched; 1 processes all frames.
    pub frame_stride: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self { frame_stride: 2 }
    }
}

/// Why the active phase ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEnd {
    Stopped,
    EndOfStream,
    Interrupted,
    SourceFailed(String),
}

#[derive(Debug)]
pub struct DriverOutcome {
    pub finalized: Finalized,
    pub end: SessionEnd,
    pub frames_seen: u64,
    pub frames_processed: u64,
}

#[derive(Error, Debug)]
pub enum DriverError {
    /// The source could not be acquired; no session was started.
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The interrupt was raised before the session started; nothing was written.
    #[error("interrupted before the session started")]
    Interrupted,
}

/// Run one attendance session to completion.
pub fn run_session<L, S, M, F, O>(
    engine: &mut AttendanceEngine<L, S, M>,
    gallery: Arc<Gallery>,
    open_source: O,
    interrupt: &AtomicBool,
    options: &DriverOptions,
) -> Result<DriverOutcome, DriverError>
where
    L: Ledger,
    S: ReportSerializer,
    M: Matcher,
    F: FrameSource,
    O: FnOnce() -> Result<F, SourceError>,
{
    if gallery.is_empty() {
        return Err(SessionError::NoEnrolledIdentities.into());
    }

    if interrupt.load(Ordering::SeqCst) {
        return Err(DriverError::Interrupted);
    }
    let mut source = open_source()?;
    if interrupt.load(Ordering::SeqCst) {
        tracing::info!("interrupted while acquiring source; no session started");
        return Err(DriverError::Interrupted);
    }
    engine.start(gallery.clone())?;

    let stride = options.frame_stride.max(1) as u64;
    let mut frames_seen = 0u64;
    let mut frames_processed = 0u64;

    let end = loop {
        if interrupt.load(Ordering::SeqCst) {
            tracing::info!("interrupted; finalizing session");
            break SessionEnd::Interrupted;
        }

        let event = match source.next_event() {
            Ok(Some(event)) => event,
            Ok(None) => break SessionEnd::EndOfStream,
            Err(e) => {
                tracing::error!(error = %e, "video source failed; finalizing session");
                break SessionEnd::SourceFailed(e.to_string());
            }
        };

        match event {
            SourceEvent::Frame(detections) => {
                frames_seen += 1;
                if frames_seen % stride != 0 {
                    continue;
                }
                frames_processed += 1;
                engine.process_frame(&detections)?;
            }
            SourceEvent::Command(Command::Stop) => break SessionEnd::Stopped,
            SourceEvent::Command(Command::Reset) => {
                engine.reset()?;
            }
            SourceEvent::Command(Command::Save) => {
                engine.save()?;
            }
            SourceEvent::Command(Command::Start) => {
                if let Err(e) = engine.start(gallery.clone()) {
                    tracing::warn!(error = %e, "start ignored");
                }
            }
        }
    };

    drop(source);
    tracing::debug!(frames_seen, frames_processed, "video source released");

    let finalized = engine.stop()?;
    Ok(DriverOutcome {
        finalized,
        end,
        frames_seen,
        frames_processed,
    })
}
