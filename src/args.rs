//! # Args — Engine Command Translation
//!
//! Turns one global GMP-ECM request (total curves, memory bound, engine
//! options, trailing B1 [B2]) into one command line per worker.
//!
//! ## Curve Division
//!
//! `-c 0` asks the engine for an unbounded run, so every worker gets `-c 0`.
//! Otherwise curves are split remainder-first: with C curves over N workers,
//! the first `C % N` workers run `C / N + 1` curves and the rest run `C / N`.
//! When C < N only C workers are launched, one curve each.
//!
//! ## Bound Detection
//!
//! B1 and B2 are the bare numbers at the end of the argument list. A bare
//! number directly after a flag that takes a numeric value (`-k 3`,
//! `-power 2`) belongs to that flag and is never a bound.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Engine flags that consume the following token as their value.
pub const NUMERIC_FLAGS: [&str; 20] = [
    "-x0",
    "-y0",
    "-param",
    "-sigma",
    "-A",
    "-torsion",
    "-k",
    "-power",
    "-dickson",
    "-c",
    "-base2",
    "-maxmem",
    "-stage1time",
    "-i",
    "-I",
    "-ve",
    "-B2scale",
    "-go",
    "-threads",
    "-pollfiles",
];

pub fn is_numeric_flag(token: &str) -> bool {
    NUMERIC_FLAGS.contains(&token)
}

/// A bound is a non-negative finite number (`11e6`, `250000`) or a range
/// of two such numbers (`43e6-43e6`).
pub fn is_bound_token(token: &str) -> bool {
    fn number(s: &str) -> bool {
        s.parse::<f64>().is_ok_and(|v| v.is_finite() && v >= 0.0)
    }
    if number(token) {
        return true;
    }
    match token.split_once('-') {
        Some((lo, hi)) => !lo.is_empty() && number(lo) && number(hi),
        None => false,
    }
}

/// Search family. Records of different families never resume each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    Ecm,
    Pm1,
    Pp1,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub b1: String,
    pub b2: Option<String>,
}

impl Bounds {
    pub fn tokens(&self) -> Vec<String> {
        let mut out = vec![self.b1.clone()];
        if let Some(b2) = &self.b2 {
            out.push(b2.clone());
        }
        out
    }
}

/// Curves assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CurveCount {
    Unbounded,
    Exactly(u64),
}

impl CurveCount {
    pub fn as_arg(&self) -> String {
        match self {
            CurveCount::Unbounded => "0".to_string(),
            CurveCount::Exactly(n) => n.to_string(),
        }
    }
}

/// Command line for a single worker, minus the engine binary itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub index: usize,
    pub curves: CurveCount,
    pub args: Vec<String>,
}

/// Split `total` units across `workers` slots, remainder first. Slots that
/// would receive nothing are dropped, so the result has `min(total, workers)`
/// entries.
pub fn split_evenly(total: u64, workers: usize) -> Vec<u64> {
    if workers == 0 {
        return Vec::new();
    }
    let n = workers as u64;
    let base = total / n;
    let rem = total % n;
    (0..n)
        .map(|i| base + u64::from(i < rem))
        .filter(|&c| c > 0)
        .collect()
}

/// Engine options shared by curve mode and resume mode.
#[derive(Debug, Clone, Default, PartialEq)]
struct Options {
    curves: Option<u64>,
    maxmem: u64,
    k: Option<u64>,
    method: Option<Method>,
    passthrough: Vec<String>,
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| Error::Config(format!("missing value for {}", flag)))
}

fn non_negative(flag: &str, value: &str) -> Result<u64> {
    let parsed: i64 = value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {}", flag, value)))?;
    u64::try_from(parsed)
        .map_err(|_| Error::Config(format!("{} must not be negative (got {})", flag, parsed)))
}

fn parse_options(args: &[String]) -> Result<Options> {
    let mut opts = Options::default();
    let mut i = 0;
    while i < args.len() {
        let token = args[i].as_str();
        match token {
            "-c" => {
                opts.curves = Some(non_negative("-c", flag_value(args, i, token)?)?);
                i += 1;
            }
            "-maxmem" => {
                opts.maxmem = non_negative("-maxmem", flag_value(args, i, token)?)?;
                i += 1;
            }
            "-k" => {
                opts.k = Some(non_negative("-k", flag_value(args, i, token)?)?);
                i += 1;
            }
            "-threads" | "-pollfiles" => {
                return Err(Error::Config(format!(
                    "{} is a driver option, use --{} instead",
                    token,
                    if token == "-threads" { "threads" } else { "poll-secs" }
                )));
            }
            "-resume" => {
                return Err(Error::Config(
                    "-resume is handled by the `resume` subcommand".to_string(),
                ));
            }
            "-pm1" | "-pp1" => {
                opts.method = Some(if token == "-pm1" {
                    Method::Pm1
                } else {
                    Method::Pp1
                });
                opts.passthrough.push(token.to_string());
            }
            flag if is_numeric_flag(flag) => {
                let value = flag_value(args, i, flag)?;
                opts.passthrough.push(flag.to_string());
                opts.passthrough.push(value.to_string());
                i += 1;
            }
            bare if is_bound_token(bare) => {
                warn!(token = bare, "ignoring bare number before the B1/B2 bounds");
            }
            other => opts.passthrough.push(other.to_string()),
        }
        i += 1;
    }
    Ok(opts)
}

/// Find B1 [B2] at the end of `args`. Returns the bounds and how many
/// trailing tokens they occupy.
fn detect_bounds(args: &[String]) -> Option<(Bounds, usize)> {
    let n = args.len();
    let last = args.last()?;
    if !is_bound_token(last) || (n >= 2 && is_numeric_flag(&args[n - 2])) {
        return None;
    }
    if n >= 2 && is_bound_token(&args[n - 2]) && !(n >= 3 && is_numeric_flag(&args[n - 3])) {
        return Some((
            Bounds {
                b1: args[n - 2].clone(),
                b2: Some(last.clone()),
            },
            2,
        ));
    }
    Some((
        Bounds {
            b1: last.clone(),
            b2: None,
        },
        1,
    ))
}

/// One global curve-mode request, as typed after `ecmpool run`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineRequest {
    /// Total curves; 0 means unbounded.
    pub curves: u64,
    /// Stage 2 memory bound in MB for the whole pool; 0 means none.
    pub maxmem: u64,
    pub method: Method,
    /// Options forwarded to every worker unchanged.
    pub options: Vec<String>,
    pub bounds: Bounds,
}

impl EngineRequest {
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let args: Vec<String> = args.iter().map(|s| s.as_ref().to_string()).collect();
        let (bounds, consumed) = detect_bounds(&args).ok_or_else(|| {
            Error::Config(format!(
                "unable to find a valid B1 bound at the end of `{}`",
                args.join(" ")
            ))
        })?;
        let opts = parse_options(&args[..args.len() - consumed])?;
        let mut options = opts.passthrough;
        if let Some(k) = opts.k {
            options.push("-k".to_string());
            options.push(k.to_string());
        }
        Ok(EngineRequest {
            curves: opts.curves.unwrap_or(1),
            maxmem: opts.maxmem,
            method: opts.method.unwrap_or(Method::Ecm),
            options,
            bounds,
        })
    }

    /// Canonical command line echoed into the job record.
    pub fn command_line(&self) -> String {
        let mut parts = vec!["-c".to_string(), self.curves.to_string()];
        if self.maxmem > 0 {
            parts.push("-maxmem".to_string());
            parts.push(self.maxmem.to_string());
        }
        parts.extend(self.options.iter().cloned());
        parts.extend(self.bounds.tokens());
        parts.join(" ")
    }

    /// Two requests may share a job record when they search with the same
    /// family, ask for the same total and use the same bounds.
    pub fn is_compatible(&self, other: &EngineRequest) -> bool {
        self.method == other.method && self.curves == other.curves && self.bounds == other.bounds
    }

    pub fn with_curves(&self, curves: u64) -> Self {
        EngineRequest {
            curves,
            ..self.clone()
        }
    }

    pub fn worker_commands(&self, workers: usize) -> Result<Vec<WorkerCommand>> {
        if workers == 0 {
            return Err(Error::Config("at least one worker is required".to_string()));
        }
        let per_worker_mem = divide_maxmem(self.maxmem, workers)?;

        let counts: Vec<CurveCount> = if self.curves == 0 {
            vec![CurveCount::Unbounded; workers]
        } else {
            split_evenly(self.curves, workers)
                .into_iter()
                .map(CurveCount::Exactly)
                .collect()
        };

        Ok(counts
            .into_iter()
            .enumerate()
            .map(|(index, curves)| {
                let mut args = self.options.clone();
                args.push("-c".to_string());
                args.push(curves.as_arg());
                if per_worker_mem > 0 {
                    args.push("-maxmem".to_string());
                    args.push(per_worker_mem.to_string());
                }
                args.extend(self.bounds.tokens());
                WorkerCommand {
                    index,
                    curves,
                    args,
                }
            })
            .collect())
    }
}

/// Each worker's share of `-maxmem`. A nonzero limit whose share rounds
/// down to zero is a config error.
fn divide_maxmem(maxmem: u64, workers: usize) -> Result<u64> {
    let share = maxmem / workers.max(1) as u64;
    if maxmem > 0 && share == 0 {
        return Err(Error::Config(format!(
            "-maxmem {} is too small to divide across {} workers",
            maxmem, workers
        )));
    }
    Ok(share)
}

/// Engine options for resume-line mode: only `-k` and `-maxmem` carry over,
/// every worker adds `-resume <shard> <B1>` itself.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeOptions {
    pub k: Option<u64>,
    pub maxmem: u64,
    /// Bound used for lines that do not record their own B1.
    pub default_b1: Option<String>,
}

impl ResumeOptions {
    pub fn parse<S: AsRef<str>>(args: &[S]) -> Result<Self> {
        let args: Vec<String> = args.iter().map(|s| s.as_ref().to_string()).collect();
        let (default_b1, consumed) = match detect_bounds(&args) {
            Some((bounds, consumed)) => (Some(bounds.b1), consumed),
            None => (None, 0),
        };
        let opts = parse_options(&args[..args.len() - consumed])?;
        Ok(ResumeOptions {
            k: opts.k,
            maxmem: opts.maxmem,
            default_b1,
        })
    }

    pub fn shared_args(&self, workers: usize) -> Result<Vec<String>> {
        let mut out = Vec::new();
        if let Some(k) = self.k {
            out.push("-k".to_string());
            out.push(k.to_string());
        }
        let per_worker_mem = divide_maxmem(self.maxmem, workers)?;
        if per_worker_mem > 0 {
            out.push("-maxmem".to_string());
            out.push(per_worker_mem.to_string());
        }
        Ok(out)
    }
}
