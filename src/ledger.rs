//! # Ledger — Finished Resume Lines
//!
//! Append-only file with one completed resume line per line. Entries are
//! never rewritten or removed, and a line already present is never appended
//! again, so merging the same result twice is a no-op.

use crate::error::{Error, Result};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FinishedLedger {
    path: PathBuf,
    entries: HashSet<String>,
}

impl FinishedLedger {
    /// Open the ledger at `path`. A missing file is an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::io(&path, e)),
        };
        let entries = text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        Ok(FinishedLedger { path, entries })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, line: &str) -> bool {
        self.entries.contains(line.trim_end())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append every line not already recorded. Returns how many were added.
    pub fn merge<'a, I>(&mut self, lines: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut fresh = Vec::new();
        for line in lines {
            let line = line.trim_end();
            if !line.is_empty() && self.entries.insert(line.to_string()) {
                fresh.push(line);
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut buf = String::new();
        for line in &fresh {
            buf.push_str(line);
            buf.push('\n');
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::io(&self.path, e))?;
        file.write_all(buf.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| Error::io(&self.path, e))?;
        Ok(fresh.len())
    }
}
