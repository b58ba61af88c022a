//! # Curve Job — Curves on One Number
//!
//! Runs the curves of one request against one number, resuming from a
//! compatible job record when there is one.
//!
//! ## Lifecycle
//!
//! - The record is created (or found) before any worker starts.
//! - Output left by a crashed run is folded into the record's counters,
//!   copied to the merge file and deleted before new workers launch.
//! - After the pool stops, this run's counts are folded the same way. The
//!   record is deleted when the job is terminal (factor found, curves
//!   exhausted) and saved otherwise so the next run picks up the remainder.
//!
//! Output files are deleted before the record is saved. A crash between the
//! two loses the fold and reruns those curves rather than skipping curves
//! that were never run.

use crate::args::{CurveCount, EngineRequest};
use crate::driver::{Context, JobDriver, Outcome, PoolRun};
use crate::error::Result;
use crate::exit::StopReason;
use crate::job::{remove_if_present, JobCounters, JobRecord, JobStore};
use crate::logscan::{composites_in, WatchedFile};
use crate::pool::WorkerSpec;
use crate::progress::Aggregate;
use crate::report::{append_to_merge, Body, Report, Subject};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug)]
pub struct CurveJob {
    store: JobStore,
    record: JobRecord,
    request: EngineRequest,
    banner: Option<String>,
}

fn merge_outputs(ctx: &Context, outputs: &[PathBuf]) -> Result<()> {
    match &ctx.settings.out {
        Some(merge) => append_to_merge(merge, "", outputs),
        None => Ok(()),
    }
}

impl CurveJob {
    /// Resume a compatible record for `number` if allowed, else start fresh.
    pub fn open(store: JobStore, number: &str, request: EngineRequest, autoresume: bool) -> Result<Self> {
        let found = if autoresume {
            store.find(number, &request)?
        } else {
            None
        };
        let record = match found {
            Some(r) => {
                info!(
                    job = %r.path.display(),
                    curves_done = r.counters.curves_done,
                    "resuming job record"
                );
                r
            }
            None => store.create(number, &request)?,
        };
        Ok(CurveJob {
            store,
            record,
            request,
            banner: None,
        })
    }

    /// Continue the record at `path` with the request it was created with.
    pub fn from_record(store: JobStore, path: &Path) -> Result<Self> {
        let record = store.load(path)?;
        let request = record.request()?;
        Ok(CurveJob {
            store,
            record,
            request,
            banner: None,
        })
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn request(&self) -> &EngineRequest {
        &self.request
    }

    fn fold(&mut self, files: &[WatchedFile]) {
        for f in files {
            self.record.counters.absorb(f.snapshot());
            if self.banner.is_none() {
                self.banner = f.banner().map(str::to_string);
            }
        }
    }

    fn report(&self, ctx: &Context, body: Body) -> Report {
        Report {
            host: ctx.host.clone(),
            time: Utc::now(),
            banner: self.banner.clone(),
            subject: Subject::Number(self.record.number.clone()),
            body,
        }
    }

    fn publish_factor(&self, ctx: &Context, payload: String, outputs: &[PathBuf]) -> Result<Outcome> {
        let report = self.report(ctx, Body::Factor {
            done: self.record.counters.curves_done,
            total: self.request.curves,
            payload: payload.clone(),
        });
        ctx.publish(&report, outputs)?;
        Ok(Outcome::FactorFound {
            composites: composites_in(&payload),
            payload,
            remaining: self.record.counters.remaining(self.request.curves),
        })
    }

    fn publish_no_factor(&self, ctx: &Context, run: &PoolRun, outputs: &[PathBuf]) -> Result<()> {
        let c = &self.record.counters;
        let report = self.report(ctx, Body::NoFactor {
            curve_params: run.curve_params(),
            workers: run.specs.len().max(1),
            aggregate: Aggregate {
                stage1_count: c.curves_done,
                stage1_secs: c.stage1_secs,
                stage2_count: c.curves_done,
                stage2_secs: c.stage2_secs,
                units_done: c.curves_done,
                units_total: self.request.curves,
                elapsed_secs: run.elapsed.as_secs_f64(),
            },
        });
        ctx.publish(&report, outputs)
    }
}

impl JobDriver for CurveJob {
    fn label(&self) -> String {
        self.record.number.clone()
    }

    fn units_total(&self) -> u64 {
        self.request.curves
    }

    fn prior(&self) -> JobCounters {
        self.record.counters
    }

    fn recover(&mut self, ctx: &Context) -> Result<Option<Outcome>> {
        let leftovers: Vec<WatchedFile> = self
            .store
            .leftover_outputs(&self.record)?
            .into_iter()
            .map(WatchedFile::scan)
            .collect();
        if leftovers.is_empty() {
            return Ok(None);
        }
        info!(
            job = %self.record.path.display(),
            files = leftovers.len(),
            "folding output of an interrupted run"
        );
        self.fold(&leftovers);
        let paths: Vec<PathBuf> = leftovers.iter().map(|f| f.path().to_path_buf()).collect();

        if let Some(payload) = leftovers.iter().find_map(WatchedFile::factor_payload) {
            let outcome = self.publish_factor(ctx, payload, &paths)?;
            self.store.remove(&self.record)?;
            return Ok(Some(outcome));
        }

        merge_outputs(ctx, &paths)?;
        for p in &paths {
            remove_if_present(p)?;
        }
        self.store.save(&self.record)?;
        Ok(None)
    }

    fn plan(&mut self, ctx: &Context) -> Result<Vec<WorkerSpec>> {
        let curves = match self.record.counters.remaining(self.request.curves) {
            Some(0) => return Ok(Vec::new()),
            Some(n) => n,
            None => 0,
        };
        let run = self.request.with_curves(curves);
        info!(
            number = %self.record.number,
            job = %self.record.path.display(),
            curves_done = self.record.counters.curves_done,
            requested = self.request.curves,
            command = %run.command_line(),
            "planning curves"
        );
        ctx.note(&format!("-> Number: {}", self.record.number));
        ctx.note(&format!("-> Command: {}", run.command_line()));

        Ok(run
            .worker_commands(ctx.settings.threads)?
            .into_iter()
            .map(|cmd| WorkerSpec {
                index: cmd.index,
                output: self.record.worker_output(cmd.index),
                stdin: Some(self.record.path.clone()),
                assigned: match cmd.curves {
                    CurveCount::Exactly(n) => n,
                    CurveCount::Unbounded => 0,
                },
                args: cmd.args,
            })
            .collect())
    }

    fn finish(&mut self, ctx: &Context, run: PoolRun) -> Result<Outcome> {
        self.fold(&run.files);
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
                self.publish_no_factor(ctx, &run, &outputs)?;
                Outcome::Exhausted
            }
            StopReason::Cancelled => {
                merge_outputs(ctx, &outputs)?;
                ctx.note(&format!(
                    "-> Interrupted after {} curves",
                    self.record.counters.curves_done
                ));
                Outcome::Cancelled
            }
            StopReason::Fatal { worker, code } => {
                merge_outputs(ctx, &outputs)?;
                ctx.note(&format!(
                    "-> *** Error: worker {} exited with code {}",
                    worker, code
                ));
                Outcome::Fatal { worker, code }
            }
        };

        for p in &outputs {
            remove_if_present(p)?;
        }
        let terminal = match outcome {
            Outcome::FactorFound { .. } => true,
            Outcome::Exhausted => self.request.curves != 0,
            Outcome::Cancelled | Outcome::Fatal { .. } => false,
        };
        if terminal {
            self.store.remove(&self.record)?;
        } else {
            self.store.save(&self.record)?;
        }
        Ok(outcome)
    }
}
