//! # Logscan — Incremental GMP-ECM Output Parsing
//!
//! Each worker appends to its own output file. A [`WatchedFile`] remembers the
//! byte size it saw on the previous tick and how far it has consumed; a tick
//! where the size did not change costs one `metadata` call and nothing else.
//!
//! ## Recognised Lines
//!
//! | Line                                  | Event          |
//! |---------------------------------------|----------------|
//! | `GMP-ECM 7.0.5 [configured with ...]` | `Banner`       |
//! | `Using B1=11000000, B2=...`           | `CurveParams`  |
//! | `Step 1 took 1500ms`                  | `Stage1Done`   |
//! | `Step 2 took 2300ms`                  | `Stage2Done`   |
//! | `********** Factor found in step 2:`  | `FactorFound`  |
//! | `Run 3 out of 10:`                    | `RunHeader`    |
//!
//! Everything else is `Unknown`. Stage times below zero or above a year are
//! counted but left out of the sums.
//!
//! ## Factor Payload
//!
//! The payload is the block of the curve that found the factor, up to but not
//! including the next `Run` line. A block opens at the banner and a `Using`
//! line starts a new one, so GMP-ECM output (banner, input number, `Using`)
//! yields a payload that starts at `Using`. The banner is written once per
//! file, not once per curve, and the report prints it in its header directly
//! above the payload. Output with no `Using` line keeps the banner as the
//! payload's first line.
//!
//! ## Partial Writes
//!
//! Only complete lines are consumed. A trailing line without `\n` is left for
//! the next tick; [`WatchedFile::drain`] consumes it once the writer is gone.

use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Stage1Done { ms: i64 },
    Stage2Done { ms: i64 },
    Banner(String),
    CurveParams(String),
    FactorFound(String),
    RunHeader,
    Unknown,
}

/// One year in milliseconds. Longer stage times are not summed.
const MAX_STEP_MS: i64 = 365 * 24 * 3600 * 1000;

fn step_ms(rest: &str) -> Option<i64> {
    let value = rest.split_whitespace().next()?;
    value.strip_suffix("ms")?.parse().ok()
}

/// Classify one line of engine output. Trailing whitespace is ignored.
pub fn classify(line: &str) -> LogEvent {
    let line = line.trim_end();
    if let Some(rest) = line.strip_prefix("Step 1 took ") {
        return step_ms(rest).map_or(LogEvent::Unknown, |ms| LogEvent::Stage1Done { ms });
    }
    if let Some(rest) = line.strip_prefix("Step 2 took ") {
        return step_ms(rest).map_or(LogEvent::Unknown, |ms| LogEvent::Stage2Done { ms });
    }
    if line.starts_with("GMP-ECM") {
        return LogEvent::Banner(line.to_string());
    }
    if line.starts_with("Using") {
        return LogEvent::CurveParams(line.to_string());
    }
    if line.contains("Factor found") {
        return LogEvent::FactorFound(line.to_string());
    }
    if line.starts_with("Run") {
        return LogEvent::RunHeader;
    }
    LogEvent::Unknown
}

/// Counters for one output file. Times are summed in milliseconds so that an
/// unchanged file always yields an identical snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub stage1_count: u64,
    pub stage1_ms: u64,
    pub stage2_count: u64,
    pub stage2_ms: u64,
    /// 1 when a factor turned up before its curve logged a stage 2 time.
    pub factor_credit: u64,
    pub last_size: u64,
}

impl ProgressSnapshot {
    pub fn curves_done(&self) -> u64 {
        self.stage2_count + self.factor_credit
    }

    pub fn stage1_secs(&self) -> f64 {
        self.stage1_ms as f64 / 1000.0
    }

    pub fn stage2_secs(&self) -> f64 {
        self.stage2_ms as f64 / 1000.0
    }
}

/// One worker output file and everything parsed out of it so far.
#[derive(Debug, Clone)]
pub struct WatchedFile {
    path: PathBuf,
    consumed: u64,
    snapshot: ProgressSnapshot,
    banner: Option<String>,
    curve_params: Option<String>,
    current_curve: Vec<String>,
    factor: Option<Vec<String>>,
    capturing: bool,
}

impl WatchedFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WatchedFile {
            path: path.into(),
            consumed: 0,
            snapshot: ProgressSnapshot::default(),
            banner: None,
            curve_params: None,
            current_curve: Vec::new(),
            factor: None,
            capturing: false,
        }
    }

    /// Parse a finished file in one go.
    pub fn scan(path: impl Into<PathBuf>) -> Self {
        let mut watched = WatchedFile::new(path);
        watched.drain();
        watched
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    pub fn curve_params(&self) -> Option<&str> {
        self.curve_params.as_deref()
    }

    pub fn factor_found(&self) -> bool {
        self.factor.is_some()
    }

    pub fn factor_payload(&self) -> Option<String> {
        self.factor.as_ref().map(|lines| lines.join("\n"))
    }

    /// Consume new complete lines. Returns true when the file grew.
    pub fn poll(&mut self) -> bool {
        self.read_new(false)
    }

    /// Like [`poll`](Self::poll) but also consumes a trailing line that has
    /// no newline yet. Use once the writing process has exited.
    pub fn drain(&mut self) -> bool {
        self.read_new(true)
    }

    fn read_new(&mut self, include_partial: bool) -> bool {
        let size = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "output not readable yet");
                return false;
            }
        };

        if size == self.snapshot.last_size && !(include_partial && self.consumed < size) {
            return false;
        }

        if size < self.snapshot.last_size {
            if self.factor.is_some() {
                debug!(path = %self.path.display(), "output shrank after a factor; keeping result");
                return false;
            }
            debug!(path = %self.path.display(), size, "output truncated; rescanning");
            *self = WatchedFile::new(self.path.clone());
        }

        let mut buf = Vec::new();
        let read = File::open(&self.path).and_then(|mut f| {
            f.seek(SeekFrom::Start(self.consumed))?;
            f.read_to_end(&mut buf)
        });
        if let Err(e) = read {
            debug!(path = %self.path.display(), error = %e, "transient read failure");
            return false;
        }

        let usable = if include_partial {
            buf.len()
        } else {
            buf.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1)
        };
        let text = String::from_utf8_lossy(&buf[..usable]).into_owned();
        for line in text.lines() {
            self.absorb(line);
        }
        self.consumed += usable as u64;
        self.snapshot.last_size = size.max(self.consumed);
        true
    }

    fn absorb(&mut self, line: &str) {
        let event = classify(line);
        if self.capturing {
            if event == LogEvent::RunHeader {
                self.capturing = false;
            } else if let Some(lines) = self.factor.as_mut() {
                lines.push(line.trim_end().to_string());
            }
        }

        match event {
            LogEvent::Stage1Done { ms } => {
                self.snapshot.stage1_count += 1;
                if let Some(ms) = plausible(ms) {
                    self.snapshot.stage1_ms = self.snapshot.stage1_ms.saturating_add(ms);
                }
                self.track(line);
            }
            LogEvent::Stage2Done { ms } => {
                self.snapshot.stage2_count += 1;
                if let Some(ms) = plausible(ms) {
                    self.snapshot.stage2_ms = self.snapshot.stage2_ms.saturating_add(ms);
                }
                self.track(line);
            }
            LogEvent::Banner(text) => {
                if self.factor.is_none() && self.current_curve.is_empty() {
                    self.current_curve = vec![text.clone()];
                }
                if self.banner.is_none() {
                    self.banner = Some(text);
                }
            }
            LogEvent::CurveParams(text) => {
                if self.factor.is_none() {
                    self.current_curve = vec![text.clone()];
                    self.curve_params = Some(text);
                }
            }
            LogEvent::FactorFound(text) => {
                if self.factor.is_none() {
                    if self.snapshot.stage1_count != self.snapshot.stage2_count {
                        self.snapshot.factor_credit = 1;
                    }
                    let mut lines = std::mem::take(&mut self.current_curve);
                    lines.push(text);
                    self.factor = Some(lines);
                    self.capturing = true;
                }
            }
            LogEvent::RunHeader | LogEvent::Unknown => self.track(line),
        }
    }

    fn track(&mut self, line: &str) {
        if self.factor.is_none() && !self.current_curve.is_empty() {
            self.current_curve.push(line.trim_end().to_string());
        }
    }
}

fn plausible(ms: i64) -> Option<u64> {
    (0..=MAX_STEP_MS).contains(&ms).then_some(ms as u64)
}

/// Composite numbers reported inside a factor payload, in order.
pub fn composites_in(payload: &str) -> Vec<String> {
    let mut out = Vec::new();
    for line in payload.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if line.to_lowercase().contains("composite factor") {
            if let Some(last) = tokens.last() {
                out.push(last.to_string());
            }
        } else if line.starts_with("Composite cofactor") {
            if let Some(n) = tokens.get(2) {
                out.push(n.to_string());
            }
        }
    }
    out
}
