//! # Pool — Engine Worker Processes
//!
//! One slot per launched engine process. Each slot owns a private input file
//! (fed on stdin) and a private output file (stdout and stderr appended).
//!
//! The pool is driven by the single control loop: it never blocks on a child
//! except while reaping inside [`WorkerPool::terminate_all`]. Shutdown sends
//! SIGTERM to everything still running, waits the grace period, then kills
//! and reaps stragglers. `terminate_all` is idempotent and also runs from
//! `Drop`, so no engine process outlives the driver.
//!
//! On unix every engine is the leader of its own process group, so a Ctrl-C
//! at the terminal interrupts the driver and never the workers directly.

use crate::error::{Error, Result};
use crate::exit::code_of;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Check that `engine` names something we can execute, either a path or a
/// bare name found on `PATH`.
pub fn preflight(engine: &Path) -> Result<PathBuf> {
    let launch_err = |reason: &str| Error::WorkerLaunch {
        path: engine.to_path_buf(),
        reason: reason.to_string(),
    };

    let bare = engine.components().count() == 1 && !engine.exists();
    let resolved = if bare {
        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(engine))
                    .find(|candidate| candidate.is_file())
            })
            .ok_or_else(|| launch_err("not found on PATH"))?
    } else {
        engine.to_path_buf()
    };

    let meta = std::fs::metadata(&resolved).map_err(|e| launch_err(&e.to_string()))?;
    if !meta.is_file() {
        return Err(launch_err("not a regular file"));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(launch_err("not executable"));
        }
    }
    Ok(resolved)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub index: usize,
    pub args: Vec<String>,
    pub stdin: Option<PathBuf>,
    pub output: PathBuf,
    /// Curves or resume lines handed to this worker; 0 when unbounded.
    pub assigned: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotStatus {
    Running,
    Exited(i32),
    Stopped,
}

#[derive(Debug)]
struct Slot {
    spec: WorkerSpec,
    child: Option<Child>,
    status: SlotStatus,
}

fn send_term_signal(child: &Child) {
    #[cfg(unix)]
    {
        let _ = Command::new("kill")
            .arg("-TERM")
            .arg(child.id().to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    #[cfg(not(unix))]
    {
        let _ = child;
    }
}

#[derive(Debug)]
pub struct WorkerPool {
    engine: PathBuf,
    grace: Duration,
    slots: Vec<Slot>,
}

impl WorkerPool {
    pub fn new(engine: impl Into<PathBuf>, grace: Duration) -> Self {
        WorkerPool {
            engine: engine.into(),
            grace,
            slots: Vec::new(),
        }
    }

    pub fn spawn(&mut self, spec: WorkerSpec) -> Result<()> {
        let launch_err = |reason: String| Error::WorkerLaunch {
            path: self.engine.clone(),
            reason,
        };

        let stdin = match &spec.stdin {
            Some(path) => Stdio::from(File::open(path).map_err(|e| Error::io(path, e))?),
            None => Stdio::null(),
        };
        let out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.output)
            .map_err(|e| Error::io(&spec.output, e))?;
        let err = out.try_clone().map_err(|e| Error::io(&spec.output, e))?;

        let mut cmd = Command::new(&self.engine);
        cmd.args(&spec.args)
            .stdin(stdin)
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err));
        // Terminal signals go to the driver only; workers stop via terminate_all.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(|e| launch_err(e.to_string()))?;

        info!(
            worker = spec.index,
            pid = child.id(),
            args = %spec.args.join(" "),
            output = %spec.output.display(),
            "worker started"
        );
        self.slots.push(Slot {
            spec,
            child: Some(child),
            status: SlotStatus::Running,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.status == SlotStatus::Running)
            .count()
    }

    pub fn specs(&self) -> impl Iterator<Item = &WorkerSpec> {
        self.slots.iter().map(|s| &s.spec)
    }

    pub fn status(&self, index: usize) -> Option<SlotStatus> {
        self.slots
            .iter()
            .find(|s| s.spec.index == index)
            .map(|s| s.status)
    }

    /// Reap workers that exited since the last call. Returns
    /// `(worker index, exit code)` pairs.
    pub fn poll_exits(&mut self) -> Vec<(usize, i32)> {
        let mut exited = Vec::new();
        for slot in &mut self.slots {
            let Some(child) = slot.child.as_mut() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = code_of(&status);
                    debug!(worker = slot.spec.index, code, "worker exited");
                    slot.status = SlotStatus::Exited(code);
                    slot.child = None;
                    exited.push((slot.spec.index, code));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(worker = slot.spec.index, error = %e, "cannot query worker status");
                }
            }
        }
        exited
    }

    /// Stop every running worker. Safe to call repeatedly.
    pub fn terminate_all(&mut self) {
        let mut signalled = false;
        for slot in &mut self.slots {
            if let Some(child) = slot.child.as_ref() {
                send_term_signal(child);
                signalled = true;
            }
        }
        if !signalled {
            return;
        }
        std::thread::sleep(self.grace);

        for slot in &mut self.slots {
            let Some(mut child) = slot.child.take() else {
                continue;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(worker = slot.spec.index, code = code_of(&status), "worker stopped");
                }
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    debug!(worker = slot.spec.index, "worker killed after grace period");
                }
            }
            slot.status = SlotStatus::Stopped;
        }
        info!(workers = self.slots.len(), "all workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate_all();
    }
}
