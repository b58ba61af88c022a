//! # Job — Durable Job Records
//!
//! A job record is a three-line text file in the work directory:
//!
//! ```text
//! 1522605027922533360535618378132637429718068114961380688657908494580122963258952897654000350692006139
//! # -c 100 -maxmem 4000 11e6
//! # 37 1712.450 2210.118
//! ```
//!
//! Line 1 is the number (the engine reads it from stdin, ignoring the `#`
//! lines). Line 2 echoes the request so a later run can tell whether the
//! record is compatible. Line 3 holds curves completed and the stage 1/2
//! time totals in seconds.
//!
//! Records are named `jobNNNN.txt` with a random four-digit suffix. Worker
//! output files of a record are `jobNNNN_tXX.txt`.
//!
//! Saves are atomic: the record is written to a `.tmp` sibling and renamed.

use crate::args::EngineRequest;
use crate::error::{Error, Result};
use crate::logscan::ProgressSnapshot;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const NAME_ATTEMPTS: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct JobCounters {
    pub curves_done: u64,
    pub stage1_secs: f64,
    pub stage2_secs: f64,
}

impl JobCounters {
    pub fn absorb(&mut self, snapshot: &ProgressSnapshot) {
        self.curves_done += snapshot.curves_done();
        self.stage1_secs += snapshot.stage1_secs();
        self.stage2_secs += snapshot.stage2_secs();
    }

    /// Curves still to run out of `requested`. `None` means unbounded.
    pub fn remaining(&self, requested: u64) -> Option<u64> {
        if requested == 0 {
            None
        } else {
            Some(requested.saturating_sub(self.curves_done))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub path: PathBuf,
    pub number: String,
    pub command: String,
    pub counters: JobCounters,
}

impl JobRecord {
    pub fn request(&self) -> Result<EngineRequest> {
        let args: Vec<&str> = self.command.split_whitespace().collect();
        EngineRequest::parse(&args).map_err(|e| Error::parse(&self.path, 2, e.to_string()))
    }

    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn worker_output(&self, index: usize) -> PathBuf {
        self.path
            .with_file_name(format!("{}_t{:02}.txt", self.stem(), index))
    }

    fn render(&self) -> String {
        format!(
            "{}\n# {}\n# {} {:.3} {:.3}\n",
            self.number,
            self.command,
            self.counters.curves_done,
            self.counters.stage1_secs,
            self.counters.stage2_secs
        )
    }
}

fn is_record_name(name: &str) -> bool {
    name.strip_prefix("job")
        .and_then(|rest| rest.strip_suffix(".txt"))
        .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
}

fn random_suffix() -> u32 {
    (uuid::Uuid::new_v4().as_u128() % 10_000) as u32
}

fn parse_counters(path: &Path, line: &str) -> Result<JobCounters> {
    let body = line.trim().trim_start_matches('#');
    let fields: Vec<&str> = body.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(Error::parse(
            path,
            3,
            format!("expected 3 counter fields, found {}", fields.len()),
        ));
    }
    let curves_done = fields[0]
        .parse::<u64>()
        .map_err(|_| Error::parse(path, 3, format!("invalid curve count '{}'", fields[0])))?;
    let secs = |s: &str| {
        s.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or_else(|| Error::parse(path, 3, format!("invalid time '{}'", s)))
    };
    Ok(JobCounters {
        curves_done,
        stage1_secs: secs(fields[1])?,
        stage2_secs: secs(fields[2])?,
    })
}

/// Job records in one directory.
#[derive(Debug, Clone)]
pub struct JobStore {
    dir: PathBuf,
}

impl JobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JobStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a fresh `jobNNNN.txt` and write the initial record.
    pub fn create(&self, number: &str, request: &EngineRequest) -> Result<JobRecord> {
        for _ in 0..NAME_ATTEMPTS {
            let path = self.dir.join(format!("job{:04}.txt", random_suffix()));
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(Error::io(&path, e)),
            };
            let record = JobRecord {
                path: path.clone(),
                number: number.to_string(),
                command: request.command_line(),
                counters: JobCounters::default(),
            };
            file.write_all(record.render().as_bytes())
                .map_err(|e| Error::io(&path, e))?;
            debug!(path = %path.display(), "created job record");
            return Ok(record);
        }
        Err(Error::Config(format!(
            "no free job file name in {}",
            self.dir.display()
        )))
    }

    pub fn load(&self, path: &Path) -> Result<JobRecord> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() < 3 {
            return Err(Error::parse(
                path,
                lines.len() + 1,
                format!("expected 3 lines, found {}", lines.len()),
            ));
        }
        let number = lines[0].trim();
        if number.is_empty() {
            return Err(Error::parse(path, 1, "missing number"));
        }
        let command = lines[1]
            .trim()
            .strip_prefix('#')
            .ok_or_else(|| Error::parse(path, 2, "command line must start with '#'"))?
            .trim();
        Ok(JobRecord {
            path: path.to_path_buf(),
            number: number.to_string(),
            command: command.to_string(),
            counters: parse_counters(path, lines[2])?,
        })
    }

    /// All record files in the directory, sorted by name.
    pub fn record_paths(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(is_record_name)
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Every readable record. Unparsable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<JobRecord>> {
        let mut out = Vec::new();
        for path in self.record_paths()? {
            match self.load(&path) {
                Ok(r) => out.push(r),
                Err(e) => warn!(error = %e, "skipping unreadable job record"),
            }
        }
        Ok(out)
    }

    /// First record for `number` whose request is compatible with `request`.
    /// Records for the same number with another request are passed over.
    pub fn find(&self, number: &str, request: &EngineRequest) -> Result<Option<JobRecord>> {
        for path in self.record_paths()? {
            let Ok(text) = fs::read_to_string(&path) else {
                continue;
            };
            if text.lines().next().map(str::trim) != Some(number) {
                continue;
            }
            let record = self.load(&path)?;
            if record.request()?.is_compatible(request) {
                return Ok(Some(record));
            }
            debug!(path = %path.display(), "same number, incompatible request");
        }
        Ok(None)
    }

    pub fn save(&self, record: &JobRecord) -> Result<()> {
        let tmp = record.path.with_extension("tmp");
        fs::write(&tmp, record.render()).map_err(|e| Error::io(&tmp, e))?;
        fs::rename(&tmp, &record.path).map_err(|e| Error::io(&record.path, e))?;
        Ok(())
    }

    /// Worker output files left behind by an earlier run of `record`.
    pub fn leftover_outputs(&self, record: &JobRecord) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_t", record.stem());
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name().and_then(|n| n.to_str()).is_some_and(|n| {
                    n.strip_prefix(&prefix)
                        .and_then(|rest| rest.strip_suffix(".txt"))
                        .is_some_and(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
                })
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Delete the record and every worker output that belongs to it.
    pub fn remove(&self, record: &JobRecord) -> Result<()> {
        for path in self.leftover_outputs(record)? {
            remove_if_present(&path)?;
        }
        remove_if_present(&record.path.with_extension("tmp"))?;
        remove_if_present(&record.path)
    }
}

pub fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(line: &str) -> EngineRequest {
        let args: Vec<&str> = line.split_whitespace().collect();
        EngineRequest::parse(&args).unwrap()
    }

    #[test]
    fn remaining_curves_after_partial_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job0042.txt");
        fs::write(&path, "1000000016000000063\n# -c 8 11e6\n# 5 12.0 34.0\n").unwrap();
        let store = JobStore::new(dir.path());
        let record = store.load(&path).unwrap();
        assert_eq!(record.counters.curves_done, 5);
        assert_eq!(record.counters.stage1_secs, 12.0);
        assert_eq!(record.counters.stage2_secs, 34.0);
        assert_eq!(record.counters.remaining(8), Some(3));
        assert_eq!(record.counters.remaining(4), Some(0));
        assert_eq!(record.counters.remaining(0), None);
    }

    #[test]
    fn create_then_find_then_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let req = request("-c 100 11e6");

        let mut rec = store.create("91", &req).unwrap();
        assert!(is_record_name(rec.path.file_name().unwrap().to_str().unwrap()));
        assert_eq!(rec.command, "-c 100 11e6");

        rec.counters.curves_done = 7;
        rec.counters.stage1_secs = 1.25;
        store.save(&rec).unwrap();
        assert!(!rec.path.with_extension("tmp").exists());

        let found = store.find("91", &request("-c 100 -maxmem 10 11e6")).unwrap().unwrap();
        assert_eq!(found.path, rec.path);
        assert_eq!(found.counters.curves_done, 7);
        assert_eq!(found.counters.stage1_secs, 1.25);

        assert!(store.find("93", &req).unwrap().is_none());
        assert!(store.find("91", &request("-c 50 11e6")).unwrap().is_none());
    }

    #[test]
    fn find_skips_incompatible_record_for_same_number() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("job0001.txt"), "91\n# -c 10 -pm1 1e6\n# 0 0 0\n").unwrap();
        fs::write(dir.path().join("job0002.txt"), "91\n# -c 10 1e6\n# 4 1.0 2.0\n").unwrap();
        let store = JobStore::new(dir.path());
        let found = store.find("91", &request("-c 10 1e6")).unwrap().unwrap();
        assert!(found.path.ends_with("job0002.txt"));
    }

    #[test]
    fn malformed_counters_are_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let cases = [
            "91\n# -c 1 1e6\n# 5 12.0\n",
            "91\n# -c 1 1e6\n# five 12.0 34.0\n",
            "91\n# -c 1 1e6\n# 5 12.0 nan\n",
            "91\n# -c 1 1e6\n",
            "91\n-c 1 1e6\n# 5 1 1\n",
        ];
        for (i, text) in cases.iter().enumerate() {
            let path = dir.path().join(format!("job{:04}.txt", i));
            fs::write(&path, text).unwrap();
            assert!(
                matches!(store.load(&path), Err(Error::ResumeParse { .. })),
                "case {i}"
            );
        }
    }

    #[test]
    fn worker_outputs_are_numbered_and_removed_with_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::new(dir.path());
        let rec = store.create("91", &request("-c 4 11e6")).unwrap();
        let out0 = rec.worker_output(0);
        let out11 = rec.worker_output(11);
        assert!(out0.to_str().unwrap().ends_with(&format!("{}_t00.txt", rec.stem())));
        fs::write(&out0, "x").unwrap();
        fs::write(&out11, "y").unwrap();
        fs::write(dir.path().join("unrelated_t00.txt"), "z").unwrap();

        assert_eq!(store.leftover_outputs(&rec).unwrap(), vec![out0.clone(), out11.clone()]);
        store.remove(&rec).unwrap();
        assert!(!rec.path.exists());
        assert!(!out0.exists());
        assert!(!out11.exists());
        assert!(dir.path().join("unrelated_t00.txt").exists());
    }

    #[test]
    fn list_skips_worker_outputs_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("job0007.txt"), "91\n# -c 1 1e6\n# 0 0 0\n").unwrap();
        fs::write(dir.path().join("job0007_t00.txt"), "Step 1 took 1ms\n").unwrap();
        fs::write(dir.path().join("job0008.txt"), "garbage").unwrap();
        let store = JobStore::new(dir.path());
        let all = store.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].number, "91");
    }

    #[test]
    fn counters_absorb_snapshot() {
        let mut c = JobCounters::default();
        let snap = ProgressSnapshot {
            stage1_count: 3,
            stage1_ms: 4500,
            stage2_count: 2,
            stage2_ms: 3000,
            factor_credit: 1,
            last_size: 100,
        };
        c.absorb(&snap);
        assert_eq!(c.curves_done, 3);
        assert_eq!(c.stage1_secs, 4.5);
        assert_eq!(c.stage2_secs, 3.0);
    }
}
