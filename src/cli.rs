//! # CLI Execution Functions
//!
//! One function per subcommand. Each resolves settings (file, then flags),
//! builds the shared [`Context`] and drives jobs until done or interrupted.

use anyhow::{Context as _, Result};
use ecmpool::args::{EngineRequest, ResumeOptions};
use ecmpool::cancel::{install_signal_handlers, CancelToken};
use ecmpool::config::{Overrides, Settings};
use ecmpool::curve_job::CurveJob;
use ecmpool::input::read_numbers;
use ecmpool::job::{JobRecord, JobStore};
use ecmpool::logscan::{ProgressSnapshot, WatchedFile};
use ecmpool::pool::preflight;
use ecmpool::report::hostname;
use ecmpool::resume_job::ResumeJob;
use ecmpool::worklog::DurableLog;
use ecmpool::{drive, Context, Error, Outcome};
use serde::Serialize;
use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// How a successful invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Done,
    Interrupted,
}

impl RunStatus {
    pub fn code(self) -> u8 {
        match self {
            RunStatus::Done => 0,
            RunStatus::Interrupted => 130,
        }
    }
}

/// Process exit code for a failed invocation.
pub fn error_code(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map(|e| e.exit_code() as u8)
        .unwrap_or(1)
}

// ── Context ─────────────────────────────────────────────────────

fn build_context(config: Option<&Path>, overrides: Overrides) -> Result<Context> {
    let mut settings = Settings::resolve(config, overrides)?;
    if settings.check_engine {
        settings.engine = preflight(&settings.engine)?;
    }
    std::fs::create_dir_all(&settings.work_dir)
        .map_err(|e| Error::io(&settings.work_dir, e))?;

    let log = match &settings.log_file {
        Some(path) => DurableLog::new(path),
        None => DurableLog::disabled(),
    };
    let cancel = CancelToken::new();
    install_signal_handlers(&cancel);

    info!(
        engine = %settings.engine.display(),
        threads = settings.threads,
        poll_secs = settings.poll_secs,
        work_dir = %settings.work_dir.display(),
        "ecmpool starting"
    );
    Ok(Context {
        settings,
        log,
        cancel,
        host: hostname(),
    })
}

// ── Curves ──────────────────────────────────────────────────────

/// Run curves on every input number, or continue one job record.
pub fn run_curves(
    config: Option<&Path>,
    overrides: Overrides,
    input: Option<&Path>,
    job: Option<&Path>,
    fresh: bool,
    engine_args: &[String],
) -> Result<RunStatus> {
    // Parse before reading stdin so a bad command line fails fast.
    let request = match job {
        Some(_) => None,
        None => Some(EngineRequest::parse(engine_args)?),
    };
    let ctx = build_context(config, overrides)?;
    let store = JobStore::new(&ctx.settings.work_dir);

    if let Some(path) = job {
        let path = locate_record(path, store.dir());
        let mut job = CurveJob::from_record(store, &path)?;
        let outcome = drive(&mut job, &ctx)?;
        return Ok(status_of(&outcome));
    }
    let Some(request) = request else {
        return Ok(RunStatus::Done);
    };

    let text = match input {
        Some(path) => std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("cannot read numbers from stdin")?;
            buf
        }
    };
    let mut queue: VecDeque<(String, EngineRequest)> = read_numbers(&text)
        .into_iter()
        .map(|n| (n, request.clone()))
        .collect();
    if queue.is_empty() {
        return Err(Error::Config("no valid numbers in input".to_string()).into());
    }

    let autoresume = ctx.settings.autoresume && !fresh;
    while let Some((number, request)) = queue.pop_front() {
        if ctx.cancel.is_cancelled() {
            return Ok(RunStatus::Interrupted);
        }
        let mut job = CurveJob::open(store.clone(), &number, request.clone(), autoresume)?;
        match drive(&mut job, &ctx)? {
            Outcome::FactorFound {
                composites,
                remaining,
                ..
            } => {
                if ctx.settings.stop_after_first_factor || remaining == Some(0) {
                    continue;
                }
                for c in composites {
                    info!(number = %c, "queueing composite cofactor");
                    ctx.note(&format!("-> Queued composite cofactor {}", c));
                    queue.push_back((c, request.with_curves(remaining.unwrap_or(0))));
                }
            }
            Outcome::Exhausted => {}
            Outcome::Cancelled => return Ok(RunStatus::Interrupted),
            Outcome::Fatal { worker, code } => {
                return Err(Error::WorkerRuntime { worker, code }.into())
            }
        }
    }
    Ok(RunStatus::Done)
}

/// A bare record name is looked up in the work directory.
fn locate_record(path: &Path, dir: &Path) -> PathBuf {
    if path.exists() || path.components().count() > 1 {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}

fn status_of(outcome: &Outcome) -> RunStatus {
    match outcome {
        Outcome::Cancelled => RunStatus::Interrupted,
        _ => RunStatus::Done,
    }
}

// ── Resume ──────────────────────────────────────────────────────

/// Run stage 2 on every unfinished line of a resume file.
pub fn run_resume(
    config: Option<&Path>,
    overrides: Overrides,
    file: &Path,
    engine_args: &[String],
) -> Result<RunStatus> {
    let options = ResumeOptions::parse(engine_args)?;
    if !file.is_file() {
        return Err(Error::Config(format!("resume file {} not found", file.display())).into());
    }
    let ctx = build_context(config, overrides)?;
    let mut job = ResumeJob::open(&ctx.settings.work_dir, file, options)?;
    let outcome = drive(&mut job, &ctx)?;
    info!(
        file = %file.display(),
        finished = job.ledger().len(),
        "resume run complete"
    );
    Ok(status_of(&outcome))
}

// ── Inspect ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JobSummary {
    #[serde(flatten)]
    record: JobRecord,
    requested: u64,
    remaining: Option<u64>,
    leftovers: Vec<ProgressSnapshot>,
}

/// List job records in the work directory.
pub fn run_inspect(config: Option<&Path>, overrides: Overrides, json: bool) -> Result<RunStatus> {
    let settings = Settings::resolve(config, overrides)?;
    let store = JobStore::new(&settings.work_dir);

    let mut summaries = Vec::new();
    for record in store.list()? {
        let requested = match record.request() {
            Ok(r) => r.curves,
            Err(e) => {
                warn!(job = %record.path.display(), error = %e, "unreadable command line");
                continue;
            }
        };
        let leftovers = store
            .leftover_outputs(&record)?
            .into_iter()
            .map(|p| *WatchedFile::scan(p).snapshot())
            .collect();
        summaries.push(JobSummary {
            remaining: record.counters.remaining(requested),
            requested,
            leftovers,
            record,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(RunStatus::Done);
    }
    if summaries.is_empty() {
        println!("no job records in {}", settings.work_dir.display());
        return Ok(RunStatus::Done);
    }
    for s in &summaries {
        let name = s
            .record
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let total = match s.requested {
            0 => "unbounded".to_string(),
            n => n.to_string(),
        };
        println!(
            "{}  {}  [{}]  {}/{} curves  stage1 {:.3}s  stage2 {:.3}s{}",
            name,
            s.record.number,
            s.record.command,
            s.record.counters.curves_done,
            total,
            s.record.counters.stage1_secs,
            s.record.counters.stage2_secs,
            match s.leftovers.len() {
                0 => String::new(),
                n => format!("  ({} unfolded output file{})", n, if n == 1 { "" } else { "s" }),
            }
        );
    }
    Ok(RunStatus::Done)
}
