//! # Error — Failure Taxonomy for the Pool Driver
//!
//! Every fatal condition the driver can hit maps to one variant here. The
//! binary turns each variant into a distinct process exit code (see
//! `Error::exit_code`), so wrapper scripts can tell a typo on the command
//! line from an engine crash.
//!
//! Transient read failures on a worker's output file never become an
//! `Error`: the poller treats them as "no new progress this tick".

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid curve count, memory bound, worker count or B1/B2 bounds.
    #[error("configuration error: {0}")]
    Config(String),

    /// A job record, finished ledger or resume-line file could not be parsed.
    #[error("cannot parse {path} (line {line}): {reason}")]
    ResumeParse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// The engine binary is missing or could not be started.
    #[error("cannot launch engine {path}: {reason}")]
    WorkerLaunch { path: PathBuf, reason: String },

    /// A worker exited with a code outside the known taxonomy, or a fatal one.
    #[error("worker {worker} failed with exit code {code}")]
    WorkerRuntime { worker: usize, code: i32 },

    /// Non-transient filesystem failure on a file the driver owns.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn parse(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Error::ResumeParse {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    /// Process exit code the binary reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::ResumeParse { .. } => 2,
            Error::WorkerLaunch { .. } => 3,
            Error::WorkerRuntime { .. } => 4,
            Error::Io { .. } => 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let config = Error::Config("bad".into());
        let parse = Error::parse("job0001.txt", 3, "expected 3 fields");
        let launch = Error::WorkerLaunch {
            path: "./ecm".into(),
            reason: "not found".into(),
        };
        let runtime = Error::WorkerRuntime { worker: 1, code: 1 };
        let io = Error::io(
            "x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(config.exit_code(), 2);
        assert_eq!(parse.exit_code(), 2);
        assert_eq!(launch.exit_code(), 3);
        assert_eq!(runtime.exit_code(), 4);
        assert_eq!(io.exit_code(), 5);
    }

    #[test]
    fn parse_error_names_file_and_line() {
        let err = Error::parse("job0042.txt", 3, "non-numeric value 'abc'");
        let msg = err.to_string();
        assert!(msg.contains("job0042.txt"));
        assert!(msg.contains("line 3"));
        assert!(msg.contains("abc"));
    }
}
