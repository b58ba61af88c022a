//! # Report — Final Job Summary
//!
//! The text printed when a job ends, written to stdout, the durable log and,
//! when configured, the merge file. A factor report:
//!
//! ```text
//! Computer: node7
//! Report Time: 2024/03/01 18:22:09 UTC
//!
//! GMP-ECM 7.0.5 [configured with GMP 6.2.1, --enable-asm-redc] [ECM]
//! Input number is 1000000016000000063 (19 digits)
//! Run 17 out of 100:
//! Using B1=50000, B2=12746592, polynomial x^2, sigma=1:2204943107
//! Step 1 took 37ms
//! Step 2 took 31ms
//! ********** Factor found in step 2: 1000000007
//! Found prime factor of 10 digits: 1000000007
//! Prime cofactor 1000000009 has 10 digits
//! ```
//!
//! The no-factor report replaces the payload with the curve parameters,
//! curve count, average stage times, total runtime and `No factor was found.`

use crate::error::{Error, Result};
use crate::progress::Aggregate;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Host name via the `hostname` command, `localhost` if that fails.
pub fn hostname() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subject {
    Number(String),
    ResumeFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Factor {
        done: u64,
        total: u64,
        payload: String,
    },
    NoFactor {
        curve_params: Option<String>,
        workers: usize,
        aggregate: Aggregate,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub host: String,
    pub time: DateTime<Utc>,
    pub banner: Option<String>,
    pub subject: Subject,
    pub body: Body,
}

/// `  0d 00h 05m 00s`
pub fn long_runtime(secs: f64) -> String {
    let whole = secs.max(0.0).floor() as u64;
    format!(
        "{:>3}d {:02}h {:02}m {:02}s",
        whole / 86400,
        (whole % 86400) / 3600,
        (whole % 3600) / 60,
        whole % 60
    )
}

/// `Using B1=..., B2=..., polynomial ..., 4 threads`: the first three
/// comma-separated fields of the curve line plus the worker count.
fn bounds_summary(curve_params: &str, workers: usize) -> String {
    let head: Vec<&str> = curve_params.split(',').take(3).collect();
    format!(
        "{}, {} thread{}",
        head.join(","),
        workers,
        if workers == 1 { "" } else { "s" }
    )
}

impl Report {
    pub fn render(&self) -> String {
        let mut lines = vec![
            format!("Computer: {}", self.host),
            format!("Report Time: {}", self.time.format("%Y/%m/%d %H:%M:%S UTC")),
            String::new(),
        ];
        let banner_in_payload = match (&self.banner, &self.body) {
            (Some(banner), Body::Factor { payload, .. }) => {
                payload.lines().next() == Some(banner.as_str())
            }
            _ => false,
        };
        if let Some(banner) = self.banner.as_ref().filter(|_| !banner_in_payload) {
            lines.push(banner.clone());
        }
        let resume = matches!(self.subject, Subject::ResumeFile(_));
        match &self.subject {
            Subject::Number(n) if n.bytes().all(|b| b.is_ascii_digit()) => {
                lines.push(format!("Input number is {} ({} digits)", n, n.len()))
            }
            Subject::Number(n) => lines.push(format!("Input number is {}", n)),
            Subject::ResumeFile(p) => lines.push(format!("Resume file is {}", p.display())),
        }

        let unit = if resume { "resume lines" } else { "curves" };
        match &self.body {
            Body::Factor {
                done,
                total,
                payload,
            } => {
                let label = if resume { "Resume line" } else { "Run" };
                lines.push(format!("{} {} out of {}:", label, done, total));
                lines.extend(payload.lines().map(str::to_string));
            }
            Body::NoFactor {
                curve_params,
                workers,
                aggregate,
            } => {
                if let Some(params) = curve_params {
                    lines.push(bounds_summary(params, *workers));
                }
                if aggregate.units_total == 0 {
                    lines.push(format!("Finished {} {}", aggregate.units_done, unit));
                } else {
                    lines.push(format!(
                        "Finished {} of {} {}",
                        aggregate.units_done, aggregate.units_total, unit
                    ));
                }
                lines.push(format!(
                    "Average time per curve, Stage 1: {:.3}s, Stage 2: {:.3}s",
                    aggregate.avg_stage1(),
                    aggregate.avg_stage2()
                ));
                lines.push(format!(
                    "Total runtime = {}",
                    long_runtime(aggregate.elapsed_secs)
                ));
                lines.push("No factor was found.".to_string());
            }
        }
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// Append `text` and then every existing file in `outputs` to `merge`.
pub fn append_to_merge(merge: &Path, text: &str, outputs: &[PathBuf]) -> Result<()> {
    let mut out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(merge)
        .map_err(|e| Error::io(merge, e))?;
    if !text.is_empty() {
        out.write_all(text.as_bytes())
            .map_err(|e| Error::io(merge, e))?;
    }
    for path in outputs {
        let mut src = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io(path, e)),
        };
        io::copy(&mut src, &mut out).map_err(|e| Error::io(merge, e))?;
    }
    Ok(())
}
