//! # Config — Driver Settings
//!
//! Three layers, highest first: command-line flags, an optional TOML file
//! (`--config ecmpool.toml`), built-in defaults.
//!
//! ```toml
//! engine = "/usr/local/bin/ecm"
//! threads = 8
//! poll_secs = 15
//! log_interval_secs = 86400
//! eta_style = "mixed"
//! stop_after_first_factor = false
//! ```

use crate::error::{Error, Result};
use crate::progress::TimeStyle;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub engine: PathBuf,
    pub threads: usize,
    pub poll_secs: u64,
    /// Durable job log; `None` disables it.
    pub log_file: Option<PathBuf>,
    pub work_dir: PathBuf,
    /// Merge file that collects reports and worker output.
    pub out: Option<PathBuf>,
    pub log_interval_secs: u64,
    pub eta_refresh_secs: u64,
    pub grace_millis: u64,
    pub runtime_style: TimeStyle,
    pub eta_style: TimeStyle,
    pub check_engine: bool,
    pub autoresume: bool,
    pub stop_after_first_factor: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            engine: PathBuf::from("./ecm"),
            threads: default_threads(),
            poll_secs: 15,
            log_file: Some(PathBuf::from("ecmpool.log")),
            work_dir: PathBuf::from("."),
            out: None,
            log_interval_secs: 86400,
            eta_refresh_secs: 60,
            grace_millis: 100,
            runtime_style: TimeStyle::Dhms,
            eta_style: TimeStyle::Dhms,
            check_engine: true,
            autoresume: true,
            stop_after_first_factor: true,
        }
    }
}

/// Values given on the command line. `None` leaves the lower layer alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub engine: Option<PathBuf>,
    pub threads: Option<usize>,
    pub poll_secs: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub no_log: bool,
    pub work_dir: Option<PathBuf>,
    pub out: Option<PathBuf>,
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid settings: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        toml::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid settings in {}: {}", path.display(), e)))
    }

    /// Resolve all layers and validate the result.
    pub fn resolve(file: Option<&Path>, overrides: Overrides) -> Result<Self> {
        let mut settings = match file {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply(overrides);
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply(&mut self, o: Overrides) {
        if let Some(v) = o.engine {
            self.engine = v;
        }
        if let Some(v) = o.threads {
            self.threads = v;
        }
        if let Some(v) = o.poll_secs {
            self.poll_secs = v;
        }
        if let Some(v) = o.log_file {
            self.log_file = Some(v);
        }
        if o.no_log {
            self.log_file = None;
        }
        if let Some(v) = o.work_dir {
            self.work_dir = v;
        }
        if let Some(v) = o.out {
            self.out = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::Config("threads must be at least 1".to_string()));
        }
        if self.poll_secs == 0 {
            return Err(Error::Config("poll interval must be at least 1 second".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_millis)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_secs)
    }

    pub fn eta_refresh(&self) -> Duration {
        Duration::from_secs(self.eta_refresh_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.poll_secs, 15);
        assert_eq!(s.log_interval_secs, 86400);
        assert_eq!(s.eta_refresh_secs, 60);
        assert!(s.threads >= 1);
        assert!(s.autoresume && s.stop_after_first_factor && s.check_engine);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let s = Settings::from_toml("threads = 6\neta_style = \"mixed\"\n").unwrap();
        assert_eq!(s.threads, 6);
        assert_eq!(s.eta_style, TimeStyle::Mixed);
        assert_eq!(s.runtime_style, TimeStyle::Dhms);
        assert_eq!(s.poll_secs, 15);
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(matches!(
            Settings::from_toml("thread = 6"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecmpool.toml");
        std::fs::write(&path, "threads = 6\npoll_secs = 30\nengine = \"/opt/ecm\"\n").unwrap();
        let s = Settings::resolve(
            Some(&path),
            Overrides {
                threads: Some(2),
                no_log: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(s.threads, 2);
        assert_eq!(s.poll_secs, 30);
        assert_eq!(s.engine, PathBuf::from("/opt/ecm"));
        assert_eq!(s.log_file, None);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = Settings::resolve(
            None,
            Overrides {
                poll_secs: Some(0),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn toml_round_trip() {
        let s = Settings {
            out: Some(PathBuf::from("results.txt")),
            eta_style: TimeStyle::Seconds,
            ..Default::default()
        };
        let text = toml::to_string_pretty(&s).unwrap();
        assert_eq!(Settings::from_toml(&text).unwrap(), s);
    }
}
