use crate::config::{ProjectConfig, expand_template};
use std::io::{self, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Exit code reported for a process killed on timeout.
pub const TIMEOUT_EXIT_CODE: i32 = -9;

const SIGABRT: i32 = 6;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("`{program}` failed with code ({code}), stdout ({stdout}), stderr ({stderr})")]
    Check {
        program: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("I/O error while running `{program}`: {source}")]
    Io { program: String, source: io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Exited(i32),
    Signaled(i32),
    Timeout,
}

impl ExecutionStatus {
    /// Signals map to `-signal` and a timeout to [`TIMEOUT_EXIT_CODE`].
    pub fn exit_code(self) -> i32 {
        match self {
            ExecutionStatus::Exited(code) => code,
            ExecutionStatus::Signaled(signal) => -signal,
            ExecutionStatus::Timeout => TIMEOUT_EXIT_CODE,
        }
    }

    pub fn success(self) -> bool {
        self == ExecutionStatus::Exited(0)
    }

    fn from_exit_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExecutionStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExecutionStatus::Signaled(signal);
            }
        }
        ExecutionStatus::Exited(-1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn timed_out(&self) -> bool {
        self.status == ExecutionStatus::Timeout
    }

    /// Both streams joined by `separator`, the form in which run and build
    /// output is recorded.
    pub fn combined(&self, separator: &str) -> String {
        format!("{}{}{}", self.stdout, separator, self.stderr)
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn spawn_reader<R: Read + Send + 'static>(stream: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        buf
    })
}

fn wait_with_timeout(
    child: &mut Child,
    program: &str,
    timeout: Option<Duration>,
) -> Result<ExecutionStatus, ExecutorError> {
    let start_time = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(ExecutionStatus::from_exit_status(status)),
            Ok(None) => {
                if timeout.is_some_and(|limit| start_time.elapsed() > limit) {
                    tracing::warn!(program, "Target timed out, killing");
                    child.kill().map_err(|source| ExecutorError::Io {
                        program: program.to_string(),
                        source,
                    })?;
                    let _ = child.wait();
                    return Ok(ExecutionStatus::Timeout);
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(source) => {
                return Err(ExecutorError::Io {
                    program: program.to_string(),
                    source,
                });
            }
        }
    }
}

/// Runs `cmd` to completion, capturing both streams. A process still running
/// after `timeout` is killed and reported as [`ExecutionStatus::Timeout`]
/// rather than as an error. Only failing to start or to wait on the process
/// is an error.
pub fn run_with_timeout(
    cmd: &mut Command,
    timeout: Option<Duration>,
) -> Result<ProcessOutput, ExecutorError> {
    let program = program_name(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
        program: program.clone(),
        source,
    })?;
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let status = wait_with_timeout(&mut child, &program, timeout)?;
    if status == ExecutionStatus::Timeout {
        // Grandchildren may still hold the pipes open; leave the readers behind.
        return Ok(ProcessOutput {
            status,
            stdout: String::new(),
            stderr: "timeout expired".to_string(),
        });
    }

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    Ok(ProcessOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Extension trait for [`Command`] returning an error carrying the captured
/// streams when the process does not exit successfully.
pub trait CommandExtCheck {
    type Error;

    fn check(&mut self) -> Result<Output, Self::Error>;
}

impl CommandExtCheck for Command {
    type Error = ExecutorError;

    fn check(&mut self) -> Result<Output, Self::Error> {
        let program = program_name(self);
        let output = self.output().map_err(|source| ExecutorError::Spawn {
            program: program.clone(),
            source,
        })?;
        if output.status.success() {
            return Ok(output);
        }
        Err(ExecutorError::Check {
            program,
            code: ExecutionStatus::from_exit_status(output.status).exit_code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs the injected program on one input file.
pub trait ProgramRunner: Send + Sync {
    fn run(&self, input: &Path) -> Result<ProcessOutput, ExecutorError>;
}

/// Launches the installed target through the project's command template.
#[derive(Debug, Clone)]
pub struct TargetLauncher {
    command_template: String,
    library_path_template: String,
    install_dir: PathBuf,
    timeout: Duration,
    disable_aslr: bool,
}

impl TargetLauncher {
    pub fn new(project: &ProjectConfig, install_dir: &Path, disable_aslr: bool) -> Self {
        Self {
            command_template: project.command.clone(),
            library_path_template: project.library_path.clone(),
            install_dir: install_dir.to_path_buf(),
            timeout: Duration::from_secs(project.timeout),
            disable_aslr,
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// The expanded program invocation, without any ASLR wrapper.
    pub fn program_command(&self, input: &Path) -> String {
        expand_template(&self.command_template, &self.install_dir, Some(input))
    }

    /// The shell line handed to `bash -c`.
    pub fn shell_command(&self, input: &Path) -> String {
        let cmd = self.program_command(input);
        if self.disable_aslr {
            format!("setarch {} -R {}", std::env::consts::ARCH, cmd)
        } else {
            cmd
        }
    }

    /// `LD_LIBRARY_PATH` for the target; relative templates resolve against
    /// the install dir.
    pub fn library_path(&self) -> PathBuf {
        let expanded = expand_template(&self.library_path_template, &self.install_dir, None);
        self.install_dir.join(expanded)
    }
}

impl ProgramRunner for TargetLauncher {
    fn run(&self, input: &Path) -> Result<ProcessOutput, ExecutorError> {
        let shell_command = self.shell_command(input);
        tracing::debug!(command = %shell_command, "Running target");
        let mut cmd = Command::new("/bin/bash");
        cmd.arg("-c")
            .arg(&shell_command)
            .current_dir(&self.install_dir)
            .env("LD_LIBRARY_PATH", self.library_path());
        run_with_timeout(&mut cmd, Some(self.timeout))
    }
}

/// Runs a harness function on the input's bytes instead of a process. A panic
/// in the harness is reported as death by `SIGABRT`.
pub struct InProcessRunner<F>
where
    F: Fn(&[u8]) -> ProcessOutput,
{
    harness_fn: F,
}

impl<F> InProcessRunner<F>
where
    F: Fn(&[u8]) -> ProcessOutput,
{
    pub fn new(harness_fn: F) -> Self {
        Self { harness_fn }
    }
}

impl<F> ProgramRunner for InProcessRunner<F>
where
    F: Fn(&[u8]) -> ProcessOutput + Send + Sync,
{
    fn run(&self, input: &Path) -> Result<ProcessOutput, ExecutorError> {
        let data = std::fs::read(input).map_err(|source| ExecutorError::Io {
            program: input.display().to_string(),
            source,
        })?;
        let result = catch_unwind(AssertUnwindSafe(|| (self.harness_fn)(&data)));
        Ok(result.unwrap_or_else(|panic_payload| {
            let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic type".to_string()
            };
            ProcessOutput {
                status: ExecutionStatus::Signaled(SIGABRT),
                stdout: String::new(),
                stderr: msg,
            }
        }))
    }
}
