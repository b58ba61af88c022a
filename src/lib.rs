pub mod args;
pub mod cancel;
pub mod config;
pub mod curve_job;
pub mod driver;
pub mod error;
pub mod exit;
pub mod input;
pub mod job;
pub mod ledger;
pub mod logscan;
pub mod pool;
pub mod progress;
pub mod report;
pub mod resume;
pub mod resume_job;
pub mod worklog;

pub use driver::{drive, Context, JobDriver, Outcome};
pub use error::{Error, Result};
