use crate::executor::{ExecutorError, TargetLauncher, run_with_timeout};
use crate::model::{AttackPoint, AttackPointKind, Bug, BugKind, DuaBytesId};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StackTraceError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("Debugger timed out on {0:?}")]
    Timeout(PathBuf),
    #[error("Failed to read instrumented source {path:?}: {source}")]
    Source {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("No lava_get({trigger}) marker in {path:?}")]
    NoMarker { path: PathBuf, trigger: DuaBytesId },
}

/// Line of the `lava_get(<trigger>)` occurrence in `source` closest to
/// `original_line`. Ties go to the earlier line.
pub fn trigger_line(source: &str, trigger: DuaBytesId, original_line: u32) -> Option<u32> {
    let marker = format!("lava_get({trigger})");
    source
        .lines()
        .enumerate()
        .filter(|(_, line)| line.contains(&marker))
        .map(|(idx, _)| idx as u32 + 1)
        .min_by_key(|&line| (line.abs_diff(original_line), line))
}

/// Frame suffix a debugger prints for the predicted crash site.
pub fn prediction(atp_filename: &str, line: u32) -> String {
    let basename = Path::new(atp_filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| atp_filename.to_string());
    format!(" at {basename}:{line}")
}

/// Whether a backtrace agrees with the predicted crash site.
///
/// Return-buffer bugs land in garbage code, so they match on an unknown
/// innermost frame. Other crash kinds must end in the prediction on frame
/// `#0`, or on any frame when the attack point is a function call.
pub fn frames_match(
    backtrace: &str,
    bug_kind: BugKind,
    atp_kind: AttackPointKind,
    prediction: &str,
) -> bool {
    match bug_kind {
        BugKind::ReturnBuffer => backtrace
            .lines()
            .any(|line| line.starts_with("#0") && line.ends_with(" in ?? ()")),
        BugKind::PrintfLeak => true,
        BugKind::PointerAdd | BugKind::RelativeWrite => backtrace.lines().any(|line| {
            (line.starts_with("#0") || atp_kind == AttackPointKind::FunctionCall)
                && line.ends_with(prediction)
        }),
    }
}

/// Produces a textual backtrace of the target crashing on one input.
pub trait StackTracer: Send + Sync {
    fn backtrace(&self, input: &Path) -> Result<String, StackTraceError>;
}

/// Runs the target under gdb in batch mode with the backtrace script.
pub struct GdbStackTracer {
    gdb: PathBuf,
    script: PathBuf,
    launcher: TargetLauncher,
    timeout: Duration,
}

impl GdbStackTracer {
    pub fn new(gdb: &Path, script: &Path, launcher: TargetLauncher, timeout: Duration) -> Self {
        Self {
            gdb: gdb.to_path_buf(),
            script: script.to_path_buf(),
            launcher,
            timeout,
        }
    }

    pub fn shell_command(&self, input: &Path) -> String {
        format!(
            "{} --batch --silent -x {} --args {}",
            self.gdb.display(),
            self.script.display(),
            self.launcher.program_command(input)
        )
    }
}

impl StackTracer for GdbStackTracer {
    fn backtrace(&self, input: &Path) -> Result<String, StackTraceError> {
        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(self.shell_command(input))
            .current_dir(self.launcher.install_dir())
            .env("LD_LIBRARY_PATH", self.launcher.library_path());
        let output = run_with_timeout(&mut cmd, Some(self.timeout))?;
        if output.timed_out() {
            return Err(StackTraceError::Timeout(input.to_path_buf()));
        }
        Ok(output.stdout)
    }
}

/// Cross-checks a crash against the instrumented source tree.
pub struct StackChecker {
    tracer: Box<dyn StackTracer>,
    bugs_build: PathBuf,
}

impl StackChecker {
    pub fn new(tracer: Box<dyn StackTracer>, bugs_build: &Path) -> Self {
        Self {
            tracer,
            bugs_build: bugs_build.to_path_buf(),
        }
    }

    /// Predicts the crash site from the instrumented attack-point file and
    /// compares it with the backtrace of the fuzzed run.
    pub fn confirms(
        &self,
        bug: &Bug,
        atp: &AttackPoint,
        fuzzed_input: &Path,
    ) -> Result<bool, StackTraceError> {
        let source_path = self.bugs_build.join(&atp.loc.filename);
        let source =
            std::fs::read_to_string(&source_path).map_err(|source| StackTraceError::Source {
                path: source_path.clone(),
                source,
            })?;
        let line = trigger_line(&source, bug.trigger, atp.loc.begin.line).ok_or(
            StackTraceError::NoMarker {
                path: source_path,
                trigger: bug.trigger,
            },
        )?;
        let prediction = prediction(&atp.loc.filename, line);
        tracing::debug!(bug = bug.id, %prediction, "Stack prediction");

        let backtrace = self.tracer.backtrace(fuzzed_input)?;
        Ok(frames_match(&backtrace, bug.kind, atp.kind, &prediction))
    }
}
