//! # Resume — Resume-Line Files and Worker Shards
//!
//! A resume file holds one self-contained work item per line, as written by
//! `ecm -save` or by Prime95:
//!
//! ```text
//! METHOD=ECM; PARAM=0; SIGMA=3880067716; B1=11000000; N=0x5b...; X=0x1e...; CHECKSUM=2831541683; PROGRAM=GMP-ECM 7.0.5;
//! N=0x5b...; QX=0x1e...; SIGMA=8135347305131185;
//! ```
//!
//! Prime95 lines carry no `B1`; those shards fall back to the bound given on
//! the command line.
//!
//! Loading deduplicates by exact text and drops informational lines (anything
//! containing `[` or `We4:`). Splitting hands out contiguous runs of lines
//! with the same remainder-first rule as curve division, so concatenating the
//! shards in worker order gives back the input.

use crate::args::split_evenly;
use crate::error::{Error, Result};
use crate::ledger::FinishedLedger;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeLine {
    pub raw: String,
    pub method: Option<String>,
    pub modulus: Option<String>,
    pub b1: Option<String>,
    pub residue: Option<String>,
    pub sigma: Option<String>,
    pub param: Option<String>,
    pub checksum: Option<String>,
    pub extra: Vec<(String, String)>,
}

impl ResumeLine {
    pub fn parse(raw: &str, path: &Path, line_no: usize) -> Result<Self> {
        let raw = raw.trim_end();
        let mut line = ResumeLine {
            raw: raw.to_string(),
            method: None,
            modulus: None,
            b1: None,
            residue: None,
            sigma: None,
            param: None,
            checksum: None,
            extra: Vec::new(),
        };
        for field in raw.split(';').map(str::trim).filter(|f| !f.is_empty()) {
            let (key, value) = field.split_once('=').ok_or_else(|| {
                Error::parse(path, line_no, format!("field '{}' has no '='", field))
            })?;
            let value = value.trim().to_string();
            match key.trim() {
                "METHOD" => line.method = Some(value),
                "N" => line.modulus = Some(value),
                "B1" => line.b1 = Some(value),
                "X" | "QX" => line.residue = Some(value),
                "SIGMA" => line.sigma = Some(value),
                "PARAM" => line.param = Some(value),
                "CHECKSUM" => line.checksum = Some(value),
                other => line.extra.push((other.to_string(), value)),
            }
        }
        Ok(line)
    }
}

/// Lines Prime95 interleaves with work items.
pub fn is_informational(line: &str) -> bool {
    line.contains('[') || line.contains("We4:")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeSet {
    pub lines: Vec<ResumeLine>,
    pub duplicates: usize,
    pub informational: usize,
    pub already_finished: usize,
}

impl ResumeSet {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let mut set = ResumeSet::default();
        let mut seen = HashSet::new();
        for (i, raw) in text.lines().enumerate() {
            let raw = raw.trim_end();
            if raw.trim().is_empty() {
                continue;
            }
            if is_informational(raw) {
                set.informational += 1;
                continue;
            }
            if !seen.insert(raw.to_string()) {
                set.duplicates += 1;
                continue;
            }
            set.lines.push(ResumeLine::parse(raw, path, i + 1)?);
        }
        Ok(set)
    }

    /// Drop lines the ledger already records as finished.
    pub fn subtract(&mut self, ledger: &FinishedLedger) {
        let before = self.lines.len();
        self.lines.retain(|l| !ledger.contains(&l.raw));
        self.already_finished += before - self.lines.len();
    }

    /// Contiguous, remainder-first shards. Empty shards are not produced.
    pub fn shards(&self, workers: usize) -> Vec<Vec<ResumeLine>> {
        let mut out = Vec::new();
        let mut start = 0;
        for size in split_evenly(self.lines.len() as u64, workers) {
            let end = start + size as usize;
            out.push(self.lines[start..end].to_vec());
            start = end;
        }
        out
    }
}

/// B1 for a shard: the first line's own bound, else `default`.
pub fn shard_bound(shard: &[ResumeLine], default: Option<&str>) -> Result<String> {
    shard
        .first()
        .and_then(|l| l.b1.clone())
        .or_else(|| default.map(str::to_string))
        .ok_or_else(|| {
            Error::Config(
                "resume lines carry no B1 and no default bound was given".to_string(),
            )
        })
}

/// File names derived from one resume file.
#[derive(Debug, Clone)]
pub struct ResumePaths {
    dir: PathBuf,
    name: String,
}

impl ResumePaths {
    pub fn new(dir: impl Into<PathBuf>, resume_file: &Path) -> Self {
        let name = resume_file
            .file_name()
            .map(|n| n.to_string_lossy().replace('.', "-"))
            .unwrap_or_else(|| "resume".to_string());
        ResumePaths {
            dir: dir.into(),
            name,
        }
    }

    pub fn ledger(&self) -> PathBuf {
        self.dir
            .join(format!("resume_job_{}_finished.txt", self.name))
    }

    pub fn input_shard(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("resume_job_{}_inp_t{:02}.txt", self.name, index))
    }

    pub fn output(&self, index: usize) -> PathBuf {
        self.dir
            .join(format!("resume_job_{}_out_t{:02}.txt", self.name, index))
    }

    /// Worker indices that still have an input shard on disk, ascending.
    pub fn stale_shards(&self) -> Result<Vec<usize>> {
        let prefix = format!("resume_job_{}_inp_t", self.name);
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };
        let mut out: Vec<usize> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.strip_prefix(&prefix)?
                    .strip_suffix(".txt")?
                    .parse()
                    .ok()
            })
            .collect();
        out.sort_unstable();
        Ok(out)
    }
}

pub fn write_shard(path: &Path, shard: &[ResumeLine]) -> Result<()> {
    let mut buf = String::new();
    for line in shard {
        buf.push_str(&line.raw);
        buf.push('\n');
    }
    fs::write(path, buf).map_err(|e| Error::io(path, e))
}

/// Lines of a shard file in their original order.
pub fn read_shard(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    Ok(text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(i: usize) -> String {
        format!("METHOD=ECM; SIGMA={i}; B1=11000000; N=0x5b; X=0x{i:x}; CHECKSUM={}", i * 7)
    }

    #[test]
    fn parses_gmp_ecm_line() {
        let l = ResumeLine::parse(
            "METHOD=ECM; PARAM=0; SIGMA=3880067716; B1=11000000; N=0x5b; X=0x1e; CHECKSUM=2831541683; PROGRAM=GMP-ECM 7.0.5;",
            Path::new("r.txt"),
            1,
        )
        .unwrap();
        assert_eq!(l.method.as_deref(), Some("ECM"));
        assert_eq!(l.b1.as_deref(), Some("11000000"));
        assert_eq!(l.modulus.as_deref(), Some("0x5b"));
        assert_eq!(l.residue.as_deref(), Some("0x1e"));
        assert_eq!(l.sigma.as_deref(), Some("3880067716"));
        assert_eq!(l.param.as_deref(), Some("0"));
        assert_eq!(l.checksum.as_deref(), Some("2831541683"));
        assert_eq!(l.extra, vec![("PROGRAM".to_string(), "GMP-ECM 7.0.5".to_string())]);
    }

    #[test]
    fn prime95_line_has_no_bound() {
        let l = ResumeLine::parse("N=0x5b; QX=0x1e; SIGMA=81", Path::new("r"), 1).unwrap();
        assert_eq!(l.b1, None);
        assert_eq!(l.residue.as_deref(), Some("0x1e"));
        assert_eq!(shard_bound(&[l.clone()], Some("43e6")).unwrap(), "43e6");
        assert!(matches!(shard_bound(&[l], None), Err(Error::Config(_))));
    }

    #[test]
    fn field_without_equals_is_parse_error() {
        let err = ResumeLine::parse("METHOD=ECM; garbage; N=5", Path::new("r.txt"), 4).unwrap_err();
        assert!(matches!(err, Error::ResumeParse { line: 4, .. }));
    }

    #[test]
    fn five_unique_two_duplicates_over_two_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.save");
        let text = [line(1), line(2), line(1), line(3), line(4), line(2), line(5)].join("\n");
        fs::write(&path, text + "\n\n").unwrap();

        let set = ResumeSet::read(&path).unwrap();
        assert_eq!(set.lines.len(), 5);
        assert_eq!(set.duplicates, 2);
        let shards = set.shards(2);
        assert_eq!(shards.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(shards[0][0].raw, line(1));
        assert_eq!(shards[1][1].raw, line(5));
    }

    #[test]
    fn informational_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.txt");
        fs::write(&path, format!("[Mon Jan 1 00:00:00 2024]\nWe4: 1234\n{}\n", line(1))).unwrap();
        let set = ResumeSet::read(&path).unwrap();
        assert_eq!(set.lines.len(), 1);
        assert_eq!(set.informational, 2);
    }

    #[test]
    fn ledger_lines_are_subtracted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.txt");
        fs::write(&path, [line(1), line(2), line(3)].join("\n")).unwrap();
        let mut ledger = FinishedLedger::load(dir.path().join("done.txt")).unwrap();
        ledger.merge([line(2).as_str()]).unwrap();

        let mut set = ResumeSet::read(&path).unwrap();
        set.subtract(&ledger);
        assert_eq!(set.already_finished, 1);
        assert_eq!(
            set.lines.iter().map(|l| l.raw.clone()).collect::<Vec<_>>(),
            vec![line(1), line(3)]
        );
    }

    #[test]
    fn more_workers_than_lines() {
        let set = ResumeSet {
            lines: (0..2)
                .map(|i| ResumeLine::parse(&line(i), Path::new("r"), 1).unwrap())
                .collect(),
            ..Default::default()
        };
        assert_eq!(set.shards(8).len(), 2);
        assert!(ResumeSet::default().shards(4).is_empty());
    }

    #[test]
    fn paths_follow_resume_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let p = ResumePaths::new(dir.path(), Path::new("/data/c120.save.txt"));
        assert!(p.ledger().ends_with("resume_job_c120-save-txt_finished.txt"));
        assert!(p.input_shard(3).ends_with("resume_job_c120-save-txt_inp_t03.txt"));
        assert!(p.output(12).ends_with("resume_job_c120-save-txt_out_t12.txt"));

        write_shard(&p.input_shard(1), &[]).unwrap();
        write_shard(&p.input_shard(0), &[]).unwrap();
        fs::write(p.output(0), "").unwrap();
        assert_eq!(p.stale_shards().unwrap(), vec![0, 1]);
    }

    #[test]
    fn shard_files_round_trip_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.txt");
        let lines: Vec<ResumeLine> = (0..3)
            .map(|i| ResumeLine::parse(&line(i), Path::new("r"), 1).unwrap())
            .collect();
        write_shard(&path, &lines).unwrap();
        assert_eq!(read_shard(&path).unwrap(), vec![line(0), line(1), line(2)]);
    }
}
