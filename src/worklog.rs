//! Durable job log: every line is prefixed with a UTC timestamp such as
//! `Thu 2014/05/29 09:05:25 UTC `.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn stamp(now: DateTime<Utc>) -> String {
    now.format("%a %Y/%m/%d %H:%M:%S UTC ").to_string()
}

#[derive(Debug, Clone)]
pub struct DurableLog {
    path: Option<PathBuf>,
}

impl DurableLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DurableLog {
            path: Some(path.into()),
        }
    }

    pub fn disabled() -> Self {
        DurableLog { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn write(&self, text: &str) -> Result<()> {
        self.write_at(text, Utc::now())
    }

    pub fn write_at(&self, text: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let prefix = stamp(now);
        let mut buf = String::new();
        for line in text.lines() {
            buf.push_str(&prefix);
            buf.push_str(line.trim_end());
            buf.push('\n');
        }
        if buf.is_empty() {
            return Ok(());
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(buf.as_bytes()))
            .map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn every_line_gets_the_stamp() {
        let dir = tempfile::tempdir().unwrap();
        let log = DurableLog::new(dir.path().join("ecmpool.log"));
        let when = Utc.with_ymd_and_hms(2014, 5, 29, 9, 5, 25).unwrap();
        log.write_at("first\nsecond\r\n", when).unwrap();
        log.write_at("third", when).unwrap();

        let text = std::fs::read_to_string(log.path().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "Thu 2014/05/29 09:05:25 UTC first",
                "Thu 2014/05/29 09:05:25 UTC second",
                "Thu 2014/05/29 09:05:25 UTC third",
            ]
        );
    }

    #[test]
    fn disabled_log_writes_nothing() {
        assert!(DurableLog::disabled().write("anything").is_ok());
    }
}
