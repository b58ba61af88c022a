//! # Resume Job — Continuing Saved Stage 1 Residues
//!
//! Splits a resume file across workers, one shard file each, and runs every
//! worker as `ecm <opts> -resume <shard> <B1>`. A worker's stage 2 count
//! says how many of its shard lines (in shard order) are finished; those go
//! to the ledger when it exits, and again when the pool stops. The ledger
//! ignores lines it already has, so crediting twice is harmless.
//!
//! Shards left over from an interrupted run are credited the same way before
//! anything new is planned.

use crate::args::ResumeOptions;
use crate::driver::{Context, JobDriver, Outcome, PoolRun};
use crate::error::Result;
use crate::exit::StopReason;
use crate::job::{remove_if_present, JobCounters};
use crate::ledger::FinishedLedger;
use crate::logscan::{composites_in, WatchedFile};
use crate::pool::WorkerSpec;
use crate::progress::Aggregate;
use crate::report::{append_to_merge, Body, Report, Subject};
use crate::resume::{read_shard, shard_bound, write_shard, ResumePaths, ResumeSet};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug)]
pub struct ResumeJob {
    file: PathBuf,
    paths: ResumePaths,
    options: ResumeOptions,
    ledger: FinishedLedger,
    /// Unique work lines in the resume file.
    total: u64,
    /// Lines finished before this pool run.
    finished_before: u64,
    /// Raw lines handed to each worker, by worker index.
    shards: Vec<Vec<String>>,
    banner: Option<String>,
}

impl ResumeJob {
    pub fn open(work_dir: &Path, file: &Path, options: ResumeOptions) -> Result<Self> {
        let paths = ResumePaths::new(work_dir, file);
        let ledger = FinishedLedger::load(paths.ledger())?;
        Ok(ResumeJob {
            file: file.to_path_buf(),
            paths,
            options,
            ledger,
            total: 0,
            finished_before: 0,
            shards: Vec::new(),
            banner: None,
        })
    }

    pub fn ledger(&self) -> &FinishedLedger {
        &self.ledger
    }

    /// Credit the first `done` lines of `lines` to the ledger.
    fn credit(&mut self, lines: &[String], done: u64) -> Result<usize> {
        let n = (done as usize).min(lines.len());
        self.ledger.merge(lines[..n].iter().map(String::as_str))
    }

    fn report(&self, ctx: &Context, body: Body) -> Report {
        Report {
            host: ctx.host.clone(),
            time: Utc::now(),
            banner: self.banner.clone(),
            subject: Subject::ResumeFile(self.file.clone()),
            body,
        }
    }

    fn publish_factor(&self, ctx: &Context, payload: String, outputs: &[PathBuf]) -> Result<Outcome> {
        let report = self.report(
            ctx,
            Body::Factor {
                done: self.ledger.len() as u64,
                total: self.total.max(self.ledger.len() as u64),
                payload: payload.clone(),
            },
        );
        ctx.publish(&report, outputs)?;
        Ok(Outcome::FactorFound {
            composites: composites_in(&payload),
            payload,
            remaining: None,
        })
    }

    fn discard_shard(&self, index: usize) -> Result<()> {
        remove_if_present(&self.paths.input_shard(index))?;
        remove_if_present(&self.paths.output(index))
    }
}

impl JobDriver for ResumeJob {
    fn label(&self) -> String {
        self.file.display().to_string()
    }

    fn units_total(&self) -> u64 {
        self.total
    }

    fn prior(&self) -> JobCounters {
        JobCounters {
            curves_done: self.finished_before,
            ..Default::default()
        }
    }

    fn recover(&mut self, ctx: &Context) -> Result<Option<Outcome>> {
        let stale = self.paths.stale_shards()?;
        if stale.is_empty() {
            return Ok(None);
        }
        info!(file = %self.file.display(), shards = stale.len(), "recovering shards of an interrupted run");

        let mut factor = None;
        let mut outputs = Vec::new();
        for index in stale {
            let lines = read_shard(&self.paths.input_shard(index))?;
            let output = self.paths.output(index);
            let watched = WatchedFile::scan(&output);
            let added = self.credit(&lines, watched.snapshot().curves_done())?;
            info!(worker = index, credited = added, of = lines.len(), "stale shard credited");
            if self.banner.is_none() {
                self.banner = watched.banner().map(str::to_string);
            }
            if factor.is_none() {
                factor = watched.factor_payload();
            }
            outputs.push(output);
        }

        let outcome = match factor {
            Some(payload) => Some(self.publish_factor(ctx, payload, &outputs)?),
            None => {
                if let Some(merge) = &ctx.settings.out {
                    append_to_merge(merge, "", &outputs)?;
                }
                None
            }
        };
        for index in self.paths.stale_shards()? {
            self.discard_shard(index)?;
        }
        Ok(outcome)
    }

    fn plan(&mut self, ctx: &Context) -> Result<Vec<WorkerSpec>> {
        let mut set = ResumeSet::read(&self.file)?;
        if set.duplicates > 0 {
            warn!(file = %self.file.display(), duplicates = set.duplicates, "dropped duplicate resume lines");
            ctx.note(&format!("-> Dropped {} duplicate resume lines", set.duplicates));
        }
        set.subtract(&self.ledger);
        self.total = (set.lines.len() + set.already_finished) as u64;
        self.finished_before = set.already_finished as u64;
        info!(
            file = %self.file.display(),
            lines = self.total,
            finished = self.finished_before,
            informational = set.informational,
            "resume file loaded"
        );

        let shards = set.shards(ctx.settings.threads);
        let shared = self.options.shared_args(shards.len())?;
        let mut specs = Vec::with_capacity(shards.len());
        self.shards.clear();
        for (index, shard) in shards.iter().enumerate() {
            let b1 = shard_bound(shard, self.options.default_b1.as_deref())?;
            let input = self.paths.input_shard(index);
            write_shard(&input, shard)?;
            let mut args = shared.clone();
            args.push("-resume".to_string());
            args.push(input.to_string_lossy().into_owned());
            args.push(b1);
            specs.push(WorkerSpec {
                index,
                args,
                stdin: None,
                output: self.paths.output(index),
                assigned: shard.len() as u64,
            });
            self.shards.push(shard.iter().map(|l| l.raw.clone()).collect());
        }
        ctx.note(&format!(
            "-> Resuming {} of {} lines from {}",
            set.lines.len(),
            self.total,
            self.file.display()
        ));
        Ok(specs)
    }

    fn worker_done(&mut self, index: usize, file: &WatchedFile) -> Result<()> {
        let lines = self.shards.get(index).cloned().unwrap_or_default();
        let added = self.credit(&lines, file.snapshot().curves_done())?;
        info!(worker = index, credited = added, "worker finished its shard");
        Ok(())
    }

    fn finish(&mut self, ctx: &Context, run: PoolRun) -> Result<Outcome> {
        for (index, f) in run.files.iter().enumerate() {
            let lines = self.shards.get(index).cloned().unwrap_or_default();
            self.credit(&lines, f.snapshot().curves_done())?;
        }
        if self.banner.is_none() {
            self.banner = run.banner();
        }
        let outputs = run.outputs();

        let outcome = match run.reason {
            StopReason::FactorFound { .. } => {
                let payload = run
                    .factor_file()
                    .and_then(WatchedFile::factor_payload)
                    .unwrap_or_default();
                self.publish_factor(ctx, payload, &outputs)?
            }
            StopReason::Exhausted => {
                let agg = Aggregate::combine(
                    &self.prior(),
                    run.files.iter().map(WatchedFile::snapshot),
                    self.total,
                    run.elapsed,
                );
                let report = self.report(
                    ctx,
                    Body::NoFactor {
                        curve_params: run.curve_params(),
                        workers: run.specs.len().max(1),
                        aggregate: agg,
                    },
                );
                ctx.publish(&report, &outputs)?;
                Outcome::Exhausted
            }
            StopReason::Cancelled | StopReason::Fatal { .. } => {
                if let Some(merge) = &ctx.settings.out {
                    append_to_merge(merge, "", &outputs)?;
                }
                match run.reason {
                    StopReason::Fatal { worker, code } => Outcome::Fatal { worker, code },
                    _ => Outcome::Cancelled,
                }
            }
        };

        for spec in &run.specs {
            self.discard_shard(spec.index)?;
        }
        ctx.note(&format!(
            "-> {} of {} resume lines finished",
            self.ledger.len(),
            self.total
        ));
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::config::Settings;
    use crate::worklog::DurableLog;

    const LINES: [&str; 3] = [
        "METHOD=ECM; B1=11000; N=1000000016000000063; X=0x11; CHECKSUM=1;",
        "METHOD=ECM; B1=11000; N=1000000016000000063; X=0x22; CHECKSUM=2;",
        "METHOD=ECM; B1=11000; N=1000000016000000063; X=0x33; CHECKSUM=3;",
    ];

    fn ctx(dir: &Path) -> Context {
        Context {
            settings: Settings {
                work_dir: dir.to_path_buf(),
                threads: 2,
                log_file: None,
                ..Settings::default()
            },
            log: DurableLog::disabled(),
            cancel: CancelToken::new(),
            host: "testhost".to_string(),
        }
    }

    fn no_options() -> ResumeOptions {
        ResumeOptions::parse::<&str>(&[]).unwrap()
    }

    #[test]
    fn stale_shard_credits_leading_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("save.txt");
        std::fs::write(&file, LINES.join("\n") + "\n").unwrap();
        let paths = ResumePaths::new(dir.path(), &file);
        std::fs::write(paths.input_shard(0), format!("{}\n{}\n", LINES[0], LINES[1])).unwrap();
        std::fs::write(paths.output(0), "Step 1 took 4ms\nStep 2 took 6ms\nStep 1 took 4ms\n")
            .unwrap();

        let ctx = ctx(dir.path());
        let mut job = ResumeJob::open(dir.path(), &file, no_options()).unwrap();
        assert!(job.recover(&ctx).unwrap().is_none());
        assert_eq!(job.ledger().len(), 1);
        assert!(job.ledger().contains(LINES[0]));
        assert!(paths.stale_shards().unwrap().is_empty());
        assert!(!paths.output(0).exists());

        let specs = job.plan(&ctx).unwrap();
        assert_eq!(job.units_total(), 3);
        assert_eq!(job.prior().curves_done, 1);
        assert_eq!(specs.len(), 2);
        let shard = paths.input_shard(0);
        assert_eq!(
            specs[0].args,
            vec![
                "-resume".to_string(),
                shard.to_string_lossy().into_owned(),
                "11000".to_string()
            ]
        );
        assert_eq!(read_shard(&shard).unwrap(), vec![LINES[1].to_string()]);
    }

    #[test]
    fn worker_exit_credits_its_shard() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("save.txt");
        std::fs::write(&file, LINES.join("\n") + "\n").unwrap();
        let ctx = ctx(dir.path());
        let mut job = ResumeJob::open(dir.path(), &file, no_options()).unwrap();
        let specs = job.plan(&ctx).unwrap();
        assert_eq!(specs.iter().map(|s| s.assigned).collect::<Vec<_>>(), vec![2, 1]);

        std::fs::write(&specs[0].output, "Step 2 took 6ms\n").unwrap();
        job.worker_done(0, &WatchedFile::scan(&specs[0].output)).unwrap();
        assert_eq!(job.ledger().len(), 1);
        assert!(job.ledger().contains(LINES[0]));

        let reloaded = FinishedLedger::load(job.ledger().path()).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn fully_finished_file_plans_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("save.txt");
        std::fs::write(&file, LINES.join("\n") + "\n").unwrap();
        let paths = ResumePaths::new(dir.path(), &file);
        let mut ledger = FinishedLedger::load(paths.ledger()).unwrap();
        ledger.merge(LINES).unwrap();

        let mut job = ResumeJob::open(dir.path(), &file, no_options()).unwrap();
        let outcome = crate::driver::drive(&mut job, &ctx(dir.path())).unwrap();
        assert_eq!(outcome, Outcome::Exhausted);
        assert_eq!(job.units_total(), 3);
    }
}
