use crate::catalog::{Catalog, CatalogError};
use crate::executor::{ExecutorError, ProcessOutput, ProgramRunner};
use crate::model::{Bug, BugId, BugKind, BuildId, RunId};
use crate::mutator::{MutationError, TriggerMutator, trigger_groups};
use crate::oracle::{BugOracle, Observation, OracleError, Verdict};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

const RUN_OUTPUT_SEPARATOR: &str = "\n";
const BASELINE_OUTPUT_SEPARATOR: &str = " ; ";

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Mutation(#[from] MutationError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error("Baseline run on {input:?} exited with {exit_code}: {output}")]
    BaselineFailed {
        input: PathBuf,
        exit_code: i32,
        output: String,
    },
    #[error("Failed to read fuzzed input {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Where a bug is in its validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BugState {
    Pending,
    Fuzzed,
    Executed,
    Confirmed,
    Rejected,
    Indeterminate,
}

impl BugState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BugState::Confirmed | BugState::Rejected | BugState::Indeterminate
        )
    }
}

impl From<Verdict> for BugState {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Confirmed => BugState::Confirmed,
            Verdict::Rejected => BugState::Rejected,
            Verdict::Indeterminate => BugState::Indeterminate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BugOutcome {
    pub bug: BugId,
    pub kind: BugKind,
    pub fake: bool,
    pub state: BugState,
    pub exit_code: i32,
    pub run: RunId,
    pub fuzzed_input: PathBuf,
    /// md5 of the fuzzed input, hex encoded.
    pub input_digest: String,
}

impl BugOutcome {
    pub fn verdict(&self) -> Option<Verdict> {
        match self.state {
            BugState::Confirmed => Some(Verdict::Confirmed),
            BugState::Rejected => Some(Verdict::Rejected),
            BugState::Indeterminate => Some(Verdict::Indeterminate),
            _ => None,
        }
    }
}

/// Running tally of verdicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct YieldReport {
    pub attempted: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub indeterminate: usize,
}

impl YieldReport {
    pub fn record(&mut self, verdict: Verdict) {
        self.attempted += 1;
        match verdict {
            Verdict::Confirmed => self.confirmed += 1,
            Verdict::Rejected => self.rejected += 1,
            Verdict::Indeterminate => self.indeterminate += 1,
        }
    }

    /// Confirmed over attempted, 0 when nothing was attempted.
    pub fn fraction(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        self.confirmed as f64 / self.attempted as f64
    }

    /// Half-width of the 95% normal-approximation confidence interval.
    pub fn ci95(&self) -> f64 {
        if self.attempted == 0 {
            return 0.0;
        }
        let f = self.fraction();
        1.96 * (f * (1.0 - f) / self.attempted as f64).sqrt()
    }
}

impl std::fmt::Display for YieldReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} confirmed ({:.2} +/- {:.2}), {} rejected, {} indeterminate",
            self.confirmed,
            self.attempted,
            self.fraction(),
            self.ci95(),
            self.rejected,
            self.indeterminate
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub outcomes: Vec<BugOutcome>,
    pub summary: YieldReport,
}

/// Runs one build against unfuzzed and fuzzed inputs and records every run.
pub struct Validator<'a> {
    catalog: &'a mut dyn Catalog,
    runner: &'a dyn ProgramRunner,
    oracle: &'a BugOracle,
    mutator: TriggerMutator,
    inputs_dir: PathBuf,
    build: BuildId,
    baselines: HashMap<PathBuf, ProcessOutput>,
}

impl<'a> Validator<'a> {
    pub fn new(
        catalog: &'a mut dyn Catalog,
        runner: &'a dyn ProgramRunner,
        oracle: &'a BugOracle,
        mutator: TriggerMutator,
        inputs_dir: &Path,
        build: BuildId,
    ) -> Self {
        Self {
            catalog,
            runner,
            oracle,
            mutator,
            inputs_dir: inputs_dir.to_path_buf(),
            build,
            baselines: HashMap::new(),
        }
    }

    /// `<inputs>/<basename>` for an input file named in the catalog.
    pub fn input_path(&self, input_file: &str) -> PathBuf {
        let basename = Path::new(input_file)
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(input_file));
        self.inputs_dir.join(basename)
    }

    /// The pristine copy of the input a bug's trigger DUA was observed on.
    pub fn unfuzzed_input(&self, bug: &Bug) -> Result<PathBuf, CatalogError> {
        let dua = self.catalog.trigger_dua(bug)?;
        Ok(self.input_path(&dua.input_file))
    }

    /// Output of the unfuzzed run on `input`, running and recording it the
    /// first time the input is seen.
    fn baseline(&mut self, input: &Path) -> Result<ProcessOutput, ValidationError> {
        if let Some(output) = self.baselines.get(input) {
            return Ok(output.clone());
        }
        let output = self.runner.run(input)?;
        let combined = output.combined(BASELINE_OUTPUT_SEPARATOR);
        self.catalog
            .record_run(self.build, None, output.exit_code(), &combined, true)?;
        if !output.status.success() {
            return Err(ValidationError::BaselineFailed {
                input: input.to_path_buf(),
                exit_code: output.exit_code(),
                output: combined,
            });
        }
        tracing::info!(input = %input.display(), "Baseline run ok");
        self.baselines.insert(input.to_path_buf(), output.clone());
        Ok(output)
    }

    /// Runs the program once on every input file of the injection. Any
    /// non-zero exit means the build is unusable.
    pub fn check_baseline(
        &mut self,
        input_files: &BTreeSet<String>,
    ) -> Result<(), ValidationError> {
        for input_file in input_files {
            let input = self.input_path(input_file);
            self.baseline(&input)?;
        }
        Ok(())
    }

    /// Fuzzes the bug's input, runs the program on it, records the run and
    /// classifies the bug.
    pub fn validate_bug(&mut self, bug: &Bug) -> Result<BugOutcome, ValidationError> {
        let mut state = BugState::Pending;
        let fake = self.catalog.trigger_dua(bug)?.fake;
        let atp = self.catalog.attack_point(bug.atp)?;
        let unfuzzed = self.unfuzzed_input(bug)?;
        let baseline = self.baseline(&unfuzzed)?;

        let groups = trigger_groups(&*self.catalog, bug)?;
        let fuzzed = self.mutator.mutate_file(&unfuzzed, &groups, bug.id)?;
        let fuzzed_bytes = std::fs::read(&fuzzed).map_err(|source| ValidationError::Io {
            path: fuzzed.clone(),
            source,
        })?;
        let input_digest = format!("{:x}", md5::compute(&fuzzed_bytes));
        state = transition(bug.id, state, BugState::Fuzzed);

        let output = self.runner.run(&fuzzed)?;
        let run = self.catalog.record_run(
            self.build,
            Some(bug.id),
            output.exit_code(),
            &output.combined(RUN_OUTPUT_SEPARATOR),
            true,
        )?;
        state = transition(bug.id, state, BugState::Executed);

        let verdict = self.oracle.classify(&Observation {
            bug,
            atp: &atp,
            fake,
            run: &output,
            baseline: &baseline,
            fuzzed_input: &fuzzed,
        })?;
        state = transition(bug.id, state, verdict.into());

        Ok(BugOutcome {
            bug: bug.id,
            kind: bug.kind,
            fake,
            state,
            exit_code: output.exit_code(),
            run: run.id,
            fuzzed_input: fuzzed,
            input_digest,
        })
    }

    /// Baselines every input file, then validates every bug in order. Fatal conditions stop
    /// the whole batch.
    pub fn validate_all(
        &mut self,
        bugs: &[Bug],
        input_files: &BTreeSet<String>,
    ) -> Result<ValidationReport, ValidationError> {
        self.check_baseline(input_files)?;

        let mut report = ValidationReport::default();
        for bug in bugs {
            let outcome = self.validate_bug(bug)?;
            if let Some(verdict) = outcome.verdict() {
                report.summary.record(verdict);
                tracing::info!(
                    bug = bug.id,
                    kind = bug.kind.as_str(),
                    fake = outcome.fake,
                    exit_code = outcome.exit_code,
                    verdict = verdict.as_str(),
                    digest = %outcome.input_digest,
                    running_yield = %report.summary,
                    "Validated bug"
                );
            }
            report.outcomes.push(outcome);
        }
        Ok(report)
    }
}

fn transition(bug: BugId, from: BugState, to: BugState) -> BugState {
    tracing::trace!(bug, ?from, ?to, "Bug state");
    to
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::catalog::test_utils::{INPUT_FILE, sample_catalog, sample_snapshot};
    use crate::config::ProjectConfig;
    use crate::executor::test_utils::{crash_on_trigger, write_script};
    use crate::executor::{ExecutionStatus, InProcessRunner, TargetLauncher};
    use crate::trigger::{TriggerMode, encode_knob, encode_plain};
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn inputs_dir() -> TempDir {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(INPUT_FILE), [0u8; 16]).unwrap();
        dir
    }

    fn inputs() -> BTreeSet<String> {
        BTreeSet::from([INPUT_FILE.to_string()])
    }

    fn exited(code: i32, stdout: String) -> ProcessOutput {
        ProcessOutput {
            status: ExecutionStatus::Exited(code),
            stdout,
            stderr: String::new(),
        }
    }

    /// Segfaults when bytes 4..8 hold `trigger`, otherwise prints bytes 8..12.
    fn crash_on(trigger: [u8; 4]) -> impl Fn(&[u8]) -> ProcessOutput + Send + Sync {
        move |data: &[u8]| {
            if data[4..8] == trigger {
                return exited(139, String::new());
            }
            exited(0, format!("{:?}", &data[8..12]))
        }
    }

    #[test]
    fn confirms_a_real_bug_in_plain_mode() {
        let dir = inputs_dir();
        let mut catalog = sample_catalog();
        let bug = catalog.bug(42).unwrap();
        let runner = InProcessRunner::new(crash_on(encode_plain(42)));
        let oracle = BugOracle::new();

        let report = Validator::new(
            &mut catalog,
            &runner,
            &oracle,
            TriggerMutator::new(TriggerMode::Plain),
            dir.path(),
            1,
        )
        .validate_all(&[bug], &inputs())
        .unwrap();

        assert_eq!(report.outcomes.len(), 1);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.state, BugState::Confirmed);
        assert_eq!(outcome.exit_code, 139);
        assert_eq!(outcome.fuzzed_input, dir.path().join("testsmall-fuzzed-42.bin"));

        let mut expected = [0u8; 16];
        expected[4..8].copy_from_slice(&encode_plain(42));
        assert_eq!(fs::read(&outcome.fuzzed_input).unwrap(), expected);
        assert_eq!(outcome.input_digest, format!("{:x}", md5::compute(expected)));

        assert_eq!(report.summary.attempted, 1);
        assert_eq!(report.summary.confirmed, 1);
        assert_eq!(report.summary.fraction(), 1.0);

        let runs = catalog.runs().unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!((runs[0].fuzzed, runs[0].exit_code), (None, 0));
        assert_eq!((runs[1].fuzzed, runs[1].exit_code), (Some(42), 139));
        assert!(runs.iter().all(|run| run.build == 1 && run.success));
        assert_eq!(runs[1].id, outcome.run);
    }

    #[test]
    fn stub_binary_crashes_on_the_real_trigger_only() {
        let dir = inputs_dir();
        let install = tempdir().unwrap();
        write_script(
            &install.path().join("toy"),
            &crash_on_trigger(encode_plain(42)),
        );
        let project: ProjectConfig = serde_json::from_value(serde_json::json!({
            "name": "toy",
            "directory": "/unused",
            "tarfile": "/unused/toy.tar",
            "configure": "./configure",
            "make": "make",
            "install": "make install",
            "command": "{install_dir}/toy {input_file}"
        }))
        .unwrap();
        let launcher = TargetLauncher::new(&project, install.path(), false);

        let mut catalog = sample_catalog();
        let bugs = catalog.bugs(&[42, 43]).unwrap();
        let oracle = BugOracle::new();
        let report = Validator::new(
            &mut catalog,
            &launcher,
            &oracle,
            TriggerMutator::default(),
            dir.path(),
            1,
        )
        .validate_all(&bugs, &inputs())
        .unwrap();

        let states: Vec<BugState> = report.outcomes.iter().map(|o| o.state).collect();
        assert_eq!(states, vec![BugState::Confirmed, BugState::Rejected]);
        assert_eq!(report.outcomes[0].exit_code, 139);
        assert_eq!(report.outcomes[1].exit_code, 0);

        let runs = catalog.runs().unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].fuzzed, None);
        assert!(runs[0].output.starts_with("parsed\n"));
    }

    #[test]
    fn rejects_a_control_bug_without_aborting() {
        let dir = inputs_dir();
        let mut catalog = sample_catalog();
        let bug = catalog.bug(43).unwrap();
        // Only bug 42's trigger would crash; the control's value is harmless.
        let runner = InProcessRunner::new(crash_on(encode_plain(42)));
        let oracle = BugOracle::new();

        let report = Validator::new(
            &mut catalog,
            &runner,
            &oracle,
            TriggerMutator::default(),
            dir.path(),
            1,
        )
        .validate_all(&[bug], &inputs())
        .unwrap();

        assert_eq!(report.outcomes[0].state, BugState::Rejected);
        assert!(report.outcomes[0].fake);
        assert_eq!(report.summary.confirmed, 0);
        assert_eq!(catalog.runs().unwrap().len(), 2);
    }

    #[test]
    fn crashing_control_is_fatal() {
        let dir = inputs_dir();
        let mut catalog = sample_catalog();
        let bug = catalog.bug(43).unwrap();
        let runner = InProcessRunner::new(crash_on(encode_plain(43)));
        let oracle = BugOracle::new();

        let err = Validator::new(
            &mut catalog,
            &runner,
            &oracle,
            TriggerMutator::default(),
            dir.path(),
            1,
        )
        .validate_all(&[bug], &inputs())
        .unwrap_err();

        assert!(matches!(
            err,
            ValidationError::Oracle(OracleError::ControlCrashed { bug: 43, .. })
        ));
        // The run is still on record.
        assert_eq!(catalog.runs().unwrap().len(), 2);
    }

    #[test]
    fn knob_mode_writes_the_packed_trigger() {
        let dir = inputs_dir();
        let mut snapshot = sample_snapshot();
        snapshot.bugs[0].id = 7;
        let mut catalog = InMemoryCatalog::from_snapshot(snapshot);
        let bug = catalog.bug(7).unwrap();
        let trigger = encode_knob(7, 3).unwrap();
        let runner = InProcessRunner::new(crash_on(trigger));
        let oracle = BugOracle::new();

        let mut validator = Validator::new(
            &mut catalog,
            &runner,
            &oracle,
            TriggerMutator::new(TriggerMode::Knob(3)),
            dir.path(),
            2,
        );
        let outcome = validator.validate_bug(&bug).unwrap();

        assert_eq!(outcome.state, BugState::Confirmed);
        let written = fs::read(&outcome.fuzzed_input).unwrap();
        assert_eq!(&written[4..8], &trigger);
        assert_eq!(u32::from_le_bytes(trigger) >> 16, 3);
    }

    #[test]
    fn leak_bug_mutates_extra_duas_and_compares_output() {
        let dir = inputs_dir();
        let mut catalog = sample_catalog();
        let bug = catalog.bug(44).unwrap();
        let runner = InProcessRunner::new(crash_on([0xEE; 4]));
        let oracle = BugOracle::new();

        let outcome = Validator::new(
            &mut catalog,
            &runner,
            &oracle,
            TriggerMutator::default(),
            dir.path(),
            1,
        )
        .validate_bug(&bug)
        .unwrap();

        let written = fs::read(&outcome.fuzzed_input).unwrap();
        assert_eq!(&written[4..8], &encode_plain(44));
        assert_eq!(&written[8..12], &encode_plain(44));
        assert_eq!(outcome.state, BugState::Confirmed);
    }

    #[test]
    fn failing_baseline_is_fatal() {
        let dir = inputs_dir();
        let mut catalog = sample_catalog();
        let bugs = catalog.bugs(&[42, 44]).unwrap();
        let runner = InProcessRunner::new(|_: &[u8]| exited(1, "usage".to_string()));
        let oracle = BugOracle::new();

        let err = Validator::new(
            &mut catalog,
            &runner,
            &oracle,
            TriggerMutator::default(),
            dir.path(),
            1,
        )
        .validate_all(&bugs, &inputs())
        .unwrap_err();

        match err {
            ValidationError::BaselineFailed {
                input, exit_code, ..
            } => {
                assert_eq!(input, dir.path().join(INPUT_FILE));
                assert_eq!(exit_code, 1);
            }
            other => panic!("Expected BaselineFailed, got {other:?}"),
        }
        let runs = catalog.runs().unwrap();
        assert_eq!(runs.len(), 1, "only the baseline ran");
        assert_eq!(runs[0].fuzzed, None);
    }

    #[test]
    fn shared_input_is_baselined_once() {
        let dir = inputs_dir();
        let mut catalog = sample_catalog();
        let bugs = catalog.bugs(&[42, 44]).unwrap();
        let runner = InProcessRunner::new(crash_on(encode_plain(42)));
        let oracle = BugOracle::new();

        let report = Validator::new(
            &mut catalog,
            &runner,
            &oracle,
            TriggerMutator::default(),
            dir.path(),
            1,
        )
        .validate_all(&bugs, &inputs())
        .unwrap();

        assert_eq!(report.summary.attempted, 2);
        assert_eq!(report.summary.confirmed, 2);
        let baselines = catalog
            .runs()
            .unwrap()
            .iter()
            .filter(|run| run.fuzzed.is_none())
            .count();
        assert_eq!(baselines, 1);
    }

    #[test]
    fn yield_statistics() {
        let mut report = YieldReport::default();
        assert_eq!(report.fraction(), 0.0);
        assert_eq!(report.ci95(), 0.0);

        for verdict in [
            Verdict::Confirmed,
            Verdict::Confirmed,
            Verdict::Confirmed,
            Verdict::Rejected,
        ] {
            report.record(verdict);
        }
        report.record(Verdict::Indeterminate);
        assert_eq!(report.attempted, 5);
        assert_eq!(report.fraction(), 0.6);
        let expected = 1.96 * (0.6f64 * 0.4 / 5.0).sqrt();
        assert!((report.ci95() - expected).abs() < 1e-12);
        assert!(report.to_string().starts_with("3/5 confirmed"));
    }

    #[test]
    fn states_are_terminal_only_after_classification() {
        assert!(!BugState::Pending.is_terminal());
        assert!(!BugState::Executed.is_terminal());
        assert!(BugState::from(Verdict::Indeterminate).is_terminal());
    }
}
