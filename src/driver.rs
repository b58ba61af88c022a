//! # Driver — The Control Loop
//!
//! Both job kinds (curves on a number, resume lines from a file) implement
//! [`JobDriver`]; [`drive`] runs either one through the same loop:
//!
//! 1. `recover` folds anything an interrupted earlier run left behind.
//! 2. `plan` produces the worker commands. No commands means nothing to do.
//! 3. Every tick: poll grown output files, reap exited workers, classify their
//!    exit codes, check for cancellation, emit the status line, then sleep.
//! 4. On any stop reason the pool is terminated, every output file is read
//!    one last time, and `finish` settles durable state and reports.
//!
//! Work a worker managed to write before it was reaped is credited, even
//! after another worker already found a factor.

use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exit::{ExitClass, StopReason, TerminationController};
use crate::job::JobCounters;
use crate::logscan::WatchedFile;
use crate::pool::{WorkerPool, WorkerSpec};
use crate::progress::{progress_line, Aggregate, Cadence, EtaEstimator};
use crate::report::{append_to_merge, Report};
use crate::worklog::DurableLog;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Shared, read-only state for one invocation.
#[derive(Debug)]
pub struct Context {
    pub settings: Settings,
    pub log: DurableLog,
    pub cancel: CancelToken,
    pub host: String,
}

impl Context {
    /// Durable log write; failures are logged, never fatal.
    pub fn note(&self, text: &str) {
        if let Err(e) = self.log.write(text) {
            warn!(error = %e, "cannot write job log");
        }
    }

    /// Print the report and copy it, plus `outputs`, to the log and merge file.
    pub fn publish(&self, report: &Report, outputs: &[PathBuf]) -> Result<()> {
        let text = report.render();
        println!("{}", text);
        self.note(&text);
        if let Some(merge) = &self.settings.out {
            append_to_merge(merge, &text, outputs)?;
        }
        Ok(())
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    FactorFound {
        payload: String,
        composites: Vec<String>,
        /// Curves that were still outstanding; `None` when unbounded.
        remaining: Option<u64>,
    },
    Exhausted,
    Cancelled,
    Fatal {
        worker: usize,
        code: i32,
    },
}

/// Everything `finish` needs to know about the pool run.
#[derive(Debug)]
pub struct PoolRun {
    pub reason: StopReason,
    pub specs: Vec<WorkerSpec>,
    pub files: Vec<WatchedFile>,
    pub elapsed: Duration,
}

impl PoolRun {
    pub fn empty() -> Self {
        PoolRun {
            reason: StopReason::Exhausted,
            specs: Vec::new(),
            files: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn banner(&self) -> Option<String> {
        self.files.iter().find_map(|f| f.banner().map(str::to_string))
    }

    pub fn curve_params(&self) -> Option<String> {
        self.files
            .iter()
            .find_map(|f| f.curve_params().map(str::to_string))
    }

    /// The file that carries the factor: the reporting worker's, else the
    /// first one that shows a factor.
    pub fn factor_file(&self) -> Option<&WatchedFile> {
        if let StopReason::FactorFound { worker } = self.reason {
            if let Some(f) = self.files.get(worker).filter(|f| f.factor_found()) {
                return Some(f);
            }
        }
        self.files.iter().find(|f| f.factor_found())
    }

    pub fn outputs(&self) -> Vec<PathBuf> {
        self.specs.iter().map(|s| s.output.clone()).collect()
    }
}

pub trait JobDriver {
    /// Name used in logs: the number or the resume file.
    fn label(&self) -> String;

    /// Units requested overall, 0 when unbounded.
    fn units_total(&self) -> u64;

    /// Progress credited before this pool run.
    fn prior(&self) -> JobCounters;

    /// Fold leftovers of an interrupted run. `Some` ends the job right here.
    fn recover(&mut self, ctx: &Context) -> Result<Option<Outcome>>;

    /// Worker commands for this run. Empty when nothing is left to do.
    fn plan(&mut self, ctx: &Context) -> Result<Vec<WorkerSpec>>;

    /// A worker exited without a factor.
    fn worker_done(&mut self, _index: usize, _file: &WatchedFile) -> Result<()> {
        Ok(())
    }

    /// Settle durable state and report once the pool has stopped.
    fn finish(&mut self, ctx: &Context, run: PoolRun) -> Result<Outcome>;
}

/// Run one job to completion.
pub fn drive(job: &mut dyn JobDriver, ctx: &Context) -> Result<Outcome> {
    if let Some(outcome) = job.recover(ctx)? {
        return Ok(outcome);
    }
    let specs = job.plan(ctx)?;
    if specs.is_empty() {
        info!(job = %job.label(), "nothing left to run");
        return job.finish(ctx, PoolRun::empty());
    }

    let settings = &ctx.settings;
    let mut files: Vec<WatchedFile> = specs.iter().map(|s| WatchedFile::new(&s.output)).collect();
    let mut pool = WorkerPool::new(&settings.engine, settings.grace());
    let started = Instant::now();

    ctx.note(&format!(
        "-> Starting {} instance{} of GMP-ECM for {}",
        specs.len(),
        if specs.len() == 1 { "" } else { "s" },
        job.label()
    ));
    for spec in &specs {
        ctx.note(&format!("-> {} {}", settings.engine.display(), spec.args.join(" ")));
        if let Err(e) = pool.spawn(spec.clone()) {
            error!(worker = spec.index, error = %e, "cannot start worker");
            pool.terminate_all();
            for f in &mut files {
                f.drain();
            }
            let run = PoolRun {
                reason: StopReason::Fatal {
                    worker: spec.index,
                    code: -1,
                },
                specs: specs.clone(),
                files,
                elapsed: started.elapsed(),
            };
            if let Err(settle) = job.finish(ctx, run) {
                warn!(error = %settle, "cannot save state after launch failure");
            }
            return Err(e);
        }
    }

    let mut control = TerminationController::new();
    let mut eta = EtaEstimator::new(specs.len(), settings.eta_refresh());
    let mut cadence = Cadence::new(settings.log_interval());
    let prior = job.prior();
    let total = job.units_total();
    let mut banner_logged = false;

    loop {
        // Checked before reaping so an interrupt wins over the exits it caused.
        if ctx.cancel.is_cancelled() {
            control.cancel();
        }
        for (i, f) in files.iter_mut().enumerate() {
            if f.poll() && f.factor_found() {
                control.factor_seen(i);
            }
        }
        if !banner_logged {
            if let Some(banner) = files.iter().find_map(|f| f.banner()) {
                ctx.note(banner);
                banner_logged = true;
            }
        }

        for (index, code) in pool.poll_exits() {
            let Some(file) = files.get_mut(index) else {
                continue;
            };
            file.drain();
            match control.observe(index, code) {
                ExitClass::NoFactor if file.factor_found() => control.factor_seen(index),
                ExitClass::NoFactor => job.worker_done(index, file)?,
                ExitClass::Factor(kind) => {
                    info!(worker = index, code, kind = kind.describe(), "factor found")
                }
                ExitClass::Fatal(code) | ExitClass::Unknown(code) => {
                    error!(worker = index, code, "worker failed, stopping pool")
                }
            }
        }

        let agg = Aggregate::combine(&prior, files.iter().map(WatchedFile::snapshot), total, started.elapsed());
        let left = eta.update(&agg);
        let line = progress_line(&agg, settings.runtime_style, settings.eta_style, left);
        info!(
            done = agg.units_done,
            total = agg.units_total,
            running = pool.running(),
            "{}",
            line
        );
        if cadence.due(started.elapsed()) {
            ctx.note(&line);
        }

        if control.should_stop() {
            break;
        }
        if pool.running() == 0 {
            control.exhausted();
            break;
        }
        ctx.cancel.sleep(settings.poll_interval());
    }

    pool.terminate_all();
    for f in &mut files {
        f.drain();
    }

    let reason = control.stop_reason().unwrap_or(StopReason::Exhausted);
    info!(job = %job.label(), reason = ?reason, "pool stopped");
    let run = PoolRun {
        reason,
        specs,
        files,
        elapsed: started.elapsed(),
    };
    let outcome = job.finish(ctx, run)?;
    if let Outcome::Fatal { worker, code } = outcome {
        return Err(Error::WorkerRuntime { worker, code });
    }
    Ok(outcome)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::args::EngineRequest;
    use crate::curve_job::CurveJob;
    use crate::job::JobStore;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn engine(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("ecm");
        std::fs::write(&path, format!("#!/bin/sh\ncat > /dev/null\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn ctx(dir: &Path, engine: PathBuf) -> Context {
        Context {
            settings: Settings {
                engine,
                work_dir: dir.to_path_buf(),
                threads: 2,
                poll_secs: 1,
                log_file: None,
                ..Settings::default()
            },
            log: DurableLog::disabled(),
            cancel: CancelToken::new(),
            host: "testhost".to_string(),
        }
    }

    fn curves(store: &JobStore, line: &str) -> CurveJob {
        let args: Vec<&str> = line.split_whitespace().collect();
        let request = EngineRequest::parse(&args).unwrap();
        CurveJob::open(store.clone(), "91", request, true).unwrap()
    }

    #[test]
    fn quiet_workers_exhaust_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let ecm = engine(
            dir.path(),
            "echo 'GMP-ECM 7.0.5 [configured with GMP 6.2.1] [ECM]'\n\
             echo 'Using B1=11000, B2=1873422, polynomial x^1, sigma=1:5'\n\
             echo 'Step 1 took 3ms'\necho 'Step 2 took 4ms'\nexit 0",
        );
        let store = JobStore::new(dir.path());
        let mut job = curves(&store, "-c 2 11000");
        let record = job.record().path.clone();

        let outcome = drive(&mut job, &ctx(dir.path(), ecm)).unwrap();
        assert_eq!(outcome, Outcome::Exhausted);
        assert!(!record.exists(), "terminal job removes its record");
        assert!(store.leftover_outputs(job.record()).unwrap().is_empty());
    }

    #[test]
    fn fatal_exit_stops_pool_and_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let ecm = engine(dir.path(), "echo 'Step 2 took 4ms'\nexit 1");
        let store = JobStore::new(dir.path());
        let mut job = curves(&store, "-c 10 11000");
        let record = job.record().path.clone();

        let err = drive(&mut job, &ctx(dir.path(), ecm)).unwrap_err();
        assert!(matches!(err, Error::WorkerRuntime { code: 1, .. }));
        let saved = store.load(&record).unwrap();
        assert!(saved.counters.curves_done >= 1, "work written before exit is kept");
    }

    #[test]
    fn cancelled_token_stops_long_runs() {
        let dir = tempfile::tempdir().unwrap();
        let ecm = engine(dir.path(), "sleep 30\nexit 0");
        let store = JobStore::new(dir.path());
        let mut job = curves(&store, "-c 4 11000");
        let ctx = ctx(dir.path(), ecm);
        ctx.cancel.cancel();

        let started = Instant::now();
        assert_eq!(drive(&mut job, &ctx).unwrap(), Outcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(job.record().path.exists());
    }

    #[test]
    fn cancel_wins_over_worker_killed_by_signal() {
        let dir = tempfile::tempdir().unwrap();
        let ecm = engine(dir.path(), "echo 'Step 1 took 3ms'\nkill -KILL $$");
        let store = JobStore::new(dir.path());
        let mut job = curves(&store, "-c 4 11000");
        let ctx = ctx(dir.path(), ecm);
        ctx.cancel.cancel();

        let outcome = drive(&mut job, &ctx).unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(job.record().path.exists(), "interrupted job keeps its record");
    }
}
