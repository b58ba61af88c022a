//! # Exit — Engine Exit Codes and the Stop Decision
//!
//! GMP-ECM reports its result through the process exit code. Bit 1 means a
//! factor was found, bit 2 that the factor is a probable prime, bit 3 that
//! the cofactor is. Only the five combinations below occur; anything else,
//! including death by signal, is fatal for the whole pool.
//!
//! | Code        | Class                                   |
//! |-------------|-----------------------------------------|
//! | 0           | finished, no factor                     |
//! | 1, < 0      | fatal                                   |
//! | 2           | composite factor, composite cofactor    |
//! | 6           | prime factor, composite cofactor        |
//! | 8           | input number found                      |
//! | 10          | composite factor, prime cofactor        |
//! | 14          | prime factor, prime cofactor            |
//! | other       | fatal, unknown code                     |
//!
//! [`TerminationController`] latches the first stop reason it sees. Later
//! exits never change a decision once made.

use serde::Serialize;
use std::process::ExitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FactorKind {
    CompositeFactorCompositeCofactor,
    PrimeFactorCompositeCofactor,
    InputNumber,
    CompositeFactorPrimeCofactor,
    PrimeFactorPrimeCofactor,
}

impl FactorKind {
    pub fn describe(&self) -> &'static str {
        match self {
            FactorKind::CompositeFactorCompositeCofactor => {
                "composite factor found, cofactor is composite"
            }
            FactorKind::PrimeFactorCompositeCofactor => {
                "probable prime factor found, cofactor is composite"
            }
            FactorKind::InputNumber => "input number found",
            FactorKind::CompositeFactorPrimeCofactor => {
                "composite factor found, cofactor is a probable prime"
            }
            FactorKind::PrimeFactorPrimeCofactor => {
                "probable prime factor found, cofactor is a probable prime"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitClass {
    NoFactor,
    Factor(FactorKind),
    Fatal(i32),
    Unknown(i32),
}

impl ExitClass {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExitClass::Fatal(_) | ExitClass::Unknown(_))
    }

    pub fn is_factor(&self) -> bool {
        matches!(self, ExitClass::Factor(_))
    }
}

pub fn classify(code: i32) -> ExitClass {
    match code {
        0 => ExitClass::NoFactor,
        1 => ExitClass::Fatal(1),
        c if c < 0 => ExitClass::Fatal(c),
        2 => ExitClass::Factor(FactorKind::CompositeFactorCompositeCofactor),
        6 => ExitClass::Factor(FactorKind::PrimeFactorCompositeCofactor),
        8 => ExitClass::Factor(FactorKind::InputNumber),
        10 => ExitClass::Factor(FactorKind::CompositeFactorPrimeCofactor),
        14 => ExitClass::Factor(FactorKind::PrimeFactorPrimeCofactor),
        other => ExitClass::Unknown(other),
    }
}

/// Exit code of a reaped process. Death by signal maps to the negated
/// signal number.
pub fn code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return -sig;
        }
    }
    -1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    FactorFound { worker: usize },
    Fatal { worker: usize, code: i32 },
    Cancelled,
    Exhausted,
}

/// Decides when the pool stops. Owned by the control loop.
#[derive(Debug, Default)]
pub struct TerminationController {
    reason: Option<StopReason>,
}

impl TerminationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a worker's exit code and return its class.
    pub fn observe(&mut self, worker: usize, code: i32) -> ExitClass {
        let class = classify(code);
        match class {
            ExitClass::Factor(_) => self.latch(StopReason::FactorFound { worker }),
            ExitClass::Fatal(code) | ExitClass::Unknown(code) => {
                self.latch(StopReason::Fatal { worker, code })
            }
            ExitClass::NoFactor => {}
        }
        class
    }

    /// A factor seen in a worker's output before the worker exited.
    pub fn factor_seen(&mut self, worker: usize) {
        self.latch(StopReason::FactorFound { worker });
    }

    pub fn cancel(&mut self) {
        self.latch(StopReason::Cancelled);
    }

    pub fn exhausted(&mut self) {
        self.latch(StopReason::Exhausted);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.reason
    }

    pub fn should_stop(&self) -> bool {
        self.reason.is_some()
    }

    fn latch(&mut self, reason: StopReason) {
        if self.reason.is_none() {
            self.reason = Some(reason);
        }
    }
}
