use crate::executor::ProcessOutput;
use crate::model::{AttackPoint, Bug, BugId};
use crate::stacktrace::StackChecker;
use std::path::Path;
use thiserror::Error;

/// Exit codes that count as memory-corruption evidence: raw `SIGABRT` and
/// `SIGSEGV` deaths, and the `128 + signal` codes a wrapping shell reports.
pub const CRASH_EXIT_CODES: [i32; 4] = [-6, -11, 134, 139];

pub fn is_memory_corruption(exit_code: i32) -> bool {
    CRASH_EXIT_CODES.contains(&exit_code)
}

/// Final classification of one injected bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// The bug manifested as intended.
    Confirmed,
    /// The bug did not manifest.
    Rejected,
    /// The run crashed but the cross-check could not be carried out.
    Indeterminate,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Confirmed => "confirmed",
            Verdict::Rejected => "rejected",
            Verdict::Indeterminate => "indeterminate",
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OracleError {
    /// A control bug changed the program's behavior. The build or the
    /// catalog is inconsistent, so no verdict can be trusted.
    #[error("Control bug {bug} exited with {exit_code}, expected 0")]
    ControlCrashed { bug: BugId, exit_code: i32 },
}

/// Everything the oracle looks at for one fuzzed run.
pub struct Observation<'a> {
    pub bug: &'a Bug,
    pub atp: &'a AttackPoint,
    /// Inherited from the trigger DUA.
    pub fake: bool,
    pub run: &'a ProcessOutput,
    /// The run of the same program on the unfuzzed input.
    pub baseline: &'a ProcessOutput,
    pub fuzzed_input: &'a Path,
}

/// Decides whether an injected bug is real from the outcome of its fuzzed run.
#[derive(Default)]
pub struct BugOracle {
    stack_checker: Option<StackChecker>,
}

impl BugOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crash evidence is additionally required to match the predicted stack.
    pub fn with_stack_checker(stack_checker: StackChecker) -> Self {
        Self {
            stack_checker: Some(stack_checker),
        }
    }

    pub fn checks_stacktrace(&self) -> bool {
        self.stack_checker.is_some()
    }

    /// Classifies one observation.
    ///
    /// A control bug is never confirmed: a clean exit rejects it and anything
    /// else is an [`OracleError`]. Leak bugs are judged on output alone,
    /// crash bugs on exit code and, when configured, on the stack.
    pub fn classify(&self, observation: &Observation<'_>) -> Result<Verdict, OracleError> {
        let Observation {
            bug,
            atp,
            fake,
            run,
            baseline,
            fuzzed_input,
        } = observation;

        if *fake {
            return if run.exit_code() == 0 {
                Ok(Verdict::Rejected)
            } else {
                Err(OracleError::ControlCrashed {
                    bug: bug.id,
                    exit_code: run.exit_code(),
                })
            };
        }

        if bug.kind.is_leak() {
            let leaked = run.stdout != baseline.stdout || run.stderr != baseline.stderr;
            return Ok(if leaked {
                Verdict::Confirmed
            } else {
                Verdict::Rejected
            });
        }

        if !is_memory_corruption(run.exit_code()) {
            return Ok(Verdict::Rejected);
        }

        match &self.stack_checker {
            None => Ok(Verdict::Confirmed),
            Some(checker) => match checker.confirms(bug, atp, fuzzed_input) {
                Ok(true) => Ok(Verdict::Confirmed),
                Ok(false) => Ok(Verdict::Rejected),
                Err(e) => {
                    tracing::warn!(bug = bug.id, error = %e, "Stack check could not be carried out");
                    Ok(Verdict::Indeterminate)
                }
            },
        }
    }
}
