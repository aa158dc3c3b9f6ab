use anyhow::{bail, Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use roster_core::driver::DriverError;
use roster_core::gallery::{GalleryOrigin, LoadedGallery};
use roster_core::report::ReportEntry;
use roster_core::{
    run_session, timefmt, AttendanceEngine, AttendanceEvent, DriverOptions, EventFilter,
    FileReportWriter, GalleryLoader, ReportSerializer, SessionReport,
};
use roster_store::{SessionRecorder, SqliteLedger};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod sidecar;

use config::Config;
use sidecar::{JsonlSource, SidecarExtractor};

#[derive(Parser)]
#[command(name = "roster", about = "Face-recognition attendance sessions and ledger")]
struct Cli {
    /// Config file (default: ./roster.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an attendance session over a JSON-lines frame stream
    Take {
        /// Frames and commands, one JSON object per line
        #[arg(long)]
        frames: PathBuf,
        /// Ignore the gallery cache and rescan reference images
        #[arg(long)]
        refresh: bool,
    },
    /// Load the gallery and list enrolled students
    Gallery {
        #[arg(long)]
        refresh: bool,
    },
    /// Show one day's attendance
    Report {
        /// YYYY-MM-DD (default: today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Show the attendance history of one student
    History {
        identity: String,
        #[arg(long)]
        from: Option<NaiveDate>,
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Rebuild a session's final report from the ledger
    Session {
        id: String,
        /// Also write the rebuilt report files
        #[arg(long)]
        write: bool,
    },
    /// Show ledger statistics
    Stats,
    /// Delete attendance records older than the retention period
    Cleanup {
        /// Days to keep (default: retention_days from config)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Print the effective configuration
    Settings,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Take { frames, refresh } => take(config, frames, refresh).await,
        Commands::Gallery { refresh } => gallery(&config, refresh),
        Commands::Report { date } => report(&config, date.unwrap_or_else(today)),
        Commands::History { identity, from, to } => history(&config, identity, from, to),
        Commands::Session { id, write } => session(&config, &id, write),
        Commands::Stats => stats(&config),
        Commands::Cleanup { days } => cleanup(&config, days.unwrap_or(config.retention_days)),
        Commands::Settings => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn open_ledger(config: &Config) -> Result<SqliteLedger> {
    SqliteLedger::open(&config.database_path)
        .with_context(|| format!("opening ledger {}", config.database_path.display()))
}

fn load_gallery(config: &Config, refresh: bool) -> Result<LoadedGallery> {
    let loader = GalleryLoader::new(&config.gallery_dir, config.model.as_str())
        .with_cache(config.cache_path())
        .refresh(refresh);
    let mut extractor = SidecarExtractor::new(config.model.as_str());
    loader
        .load(&mut extractor)
        .with_context(|| format!("loading gallery from {}", config.gallery_dir.display()))
}

async fn take(config: Config, frames: PathBuf, refresh: bool) -> Result<()> {
    let interrupt = Arc::new(AtomicBool::new(false));

    let flag = interrupt.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            flag.store(true, Ordering::SeqCst);
        }
    });

    // The engine and its collaborators are blocking; keep them off the runtime.
    tokio::task::spawn_blocking(move || take_blocking(&config, &frames, refresh, &interrupt))
        .await
        .context("session task failed")?
}

fn take_blocking(
    config: &Config,
    frames: &Path,
    refresh: bool,
    interrupt: &AtomicBool,
) -> Result<()> {
    let loaded = load_gallery(config, refresh)?;
    if loaded.gallery.is_empty() {
        bail!(
            "no enrolled students: add images named after each student to {}",
            config.gallery_dir.display()
        );
    }
    let gallery = Arc::new(loaded.gallery);

    // Snapshots and the final report also keep the session's summary row current.
    let recorder = SessionRecorder::new(
        FileReportWriter::new(&config.report_dir),
        open_ledger(config)?,
    );
    let mut engine = AttendanceEngine::new(config.engine_config(), open_ledger(config)?, recorder);
    let options = DriverOptions {
        frame_stride: config.frame_stride,
    };

    let model = config.model.clone();
    let outcome = match run_session(
        &mut engine,
        gallery,
        || JsonlSource::open(frames, model),
        interrupt,
        &options,
    ) {
        Ok(outcome) => outcome,
        Err(DriverError::Interrupted) => {
            println!("Interrupted before the session started; nothing recorded");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let finalized = &outcome.finalized;
    let report = &finalized.report;
    println!("Session {} ended ({:?})", report.session_id, outcome.end);
    println!(
        "  duration:  {}s",
        (report.end_time - report.start_time).num_seconds()
    );
    println!(
        "  frames:    {} seen, {} matched",
        outcome.frames_seen, outcome.frames_processed
    );
    println!("  total:     {}", report.total_count);
    println!("  present:   {}", report.present_count);
    println!("  absent:    {}", report.absent_count());
    println!("  rate:      {:.1}%", report.attendance_rate() * 100.0);
    for path in &finalized.artifacts {
        println!("  report:    {}", path.display());
    }
    if finalized.artifacts.is_empty() {
        println!("  report:    none written (see log)");
    }
    if !finalized.ledger_failures.is_empty() {
        println!(
            "  warning:   ledger writes failed for {}",
            finalized.ledger_failures.join(", ")
        );
    }
    Ok(())
}

fn gallery(config: &Config, refresh: bool) -> Result<()> {
    let loaded = load_gallery(config, refresh)?;
    let origin = match loaded.origin {
        GalleryOrigin::Cache => "cache",
        GalleryOrigin::Scan => "scan",
    };
    println!(
        "{} enrolled students (from {origin}, model {})",
        loaded.gallery.len(),
        config.model
    );
    for identity in loaded.gallery.identities() {
        println!("  {identity}");
    }
    for skipped in &loaded.skipped {
        println!("  skipped {}: {}", skipped.path.display(), skipped.reason);
    }
    Ok(())
}

fn report(config: &Config, date: NaiveDate) -> Result<()> {
    let ledger = open_ledger(config)?;
    let by_identity = ledger.daily_attendance(date)?;
    if by_identity.is_empty() {
        println!("No attendance records for {date}");
        return Ok(());
    }

    println!("Attendance for {date}");
    for (identity, events) in &by_identity {
        // Events are oldest first; the last one stands.
        if let Some(event) = events.last() {
            println!("  {}", event_line(identity, event));
        }
    }
    Ok(())
}

fn history(
    config: &Config,
    identity: String,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> Result<()> {
    let ledger = open_ledger(config)?;
    let filter = EventFilter {
        identity: Some(identity.clone()),
        from,
        to,
        ..EventFilter::default()
    };
    let events = ledger.query_events(&filter)?;
    if events.is_empty() {
        println!("No attendance records for {identity}");
        return Ok(());
    }

    println!("{} records for {identity}", events.len());
    for event in &events {
        println!("  {} {}", event.session_id, event_line(&event.identity, event));
    }
    Ok(())
}

fn session(config: &Config, id: &str, write: bool) -> Result<()> {
    let ledger = open_ledger(config)?;
    let events = ledger.query_events(&EventFilter::session(id))?;
    let identities: BTreeSet<&str> = events.iter().map(|e| e.identity.as_str()).collect();

    let Some(report) = SessionReport::from_ledger_events(id, identities, &events) else {
        bail!("no attendance records for session {id}");
    };

    if let Some(row) = ledger.session(id)? {
        println!(
            "Session {} ({})",
            row.id,
            if row.closed { "closed" } else { "active" }
        );
    } else {
        println!("Session {id}");
    }
    println!(
        "  {} - {}",
        timefmt::format(&report.start_time),
        timefmt::format(&report.end_time)
    );
    println!(
        "  {}/{} present ({:.1}%)",
        report.present_count,
        report.total_count,
        report.attendance_rate() * 100.0
    );
    for entry in &report.entries {
        println!("  {}", entry_line(entry));
    }

    if write {
        let mut writer = FileReportWriter::new(&config.report_dir);
        for path in writer.write(&report, config.report_format) {
            println!("  report: {}", path.display());
        }
    }
    Ok(())
}

fn stats(config: &Config) -> Result<()> {
    let ledger = open_ledger(config)?;
    let stats = ledger.statistics()?;
    println!("Total records:     {}", stats.total_records);
    println!("Unique students:   {}", stats.unique_identities);
    println!("Present records:   {}", stats.present_records);
    println!("Present rate:      {:.1}%", stats.present_rate() * 100.0);
    match stats.latest {
        Some(latest) => println!("Latest record:     {}", timefmt::format(&latest)),
        None => println!("Latest record:     -"),
    }
    Ok(())
}

fn cleanup(config: &Config, days: u32) -> Result<()> {
    let ledger = open_ledger(config)?;
    let deleted = ledger.cleanup(days, today())?;
    println!("Removed {deleted} records older than {days} days");
    Ok(())
}

fn event_line(identity: &str, event: &AttendanceEvent) -> String {
    format!(
        "{identity:<24} {:<8} {} {}",
        event.status,
        timefmt::format(&event.timestamp),
        confidence_text(event.confidence)
    )
}

fn entry_line(entry: &ReportEntry) -> String {
    format!(
        "{:<24} {:<8} {} {}",
        entry.identity,
        entry.status,
        timefmt::format(&entry.timestamp),
        confidence_text(entry.confidence)
    )
}

fn confidence_text(confidence: Option<f32>) -> String {
    confidence.map_or_else(String::new, |c| format!("{c:.4}"))
}
