use crate::builder::{BuildError, Injector, WorkspacePaths};
use crate::catalog::{Catalog, CatalogError};
use crate::config::{LavaConfig, ProjectConfig};
use crate::executor::{ProgramRunner, TargetLauncher};
use crate::model::{Bug, Build, BuildId};
use crate::mutator::TriggerMutator;
use crate::oracle::BugOracle;
use crate::stacktrace::{GdbStackTracer, StackChecker};
use crate::validator::{ValidationError, ValidationReport, Validator};
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("No {kind} bugs left to inject")]
    NothingToInject { kind: &'static str },
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub build: Build,
    /// `None` when the build did not compile.
    pub validation: Option<ValidationReport>,
}

/// One select, inject and validate cycle over a project.
pub struct Session<'a> {
    config: &'a LavaConfig,
    project: &'a ProjectConfig,
    project_file: PathBuf,
    paths: WorkspacePaths,
}

impl<'a> Session<'a> {
    pub fn new(
        config: &'a LavaConfig,
        project: &'a ProjectConfig,
        project_file: &Path,
        paths: WorkspacePaths,
    ) -> Self {
        Self {
            config,
            project,
            project_file: project_file.to_path_buf(),
            paths,
        }
    }

    /// The configured bug ids, or up to `many` uninjected bugs in the order
    /// drawn by `rng`.
    pub fn select_bugs(
        &self,
        catalog: &dyn Catalog,
        rng: &mut dyn RngCore,
    ) -> Result<Vec<Bug>, SessionError> {
        let settings = &self.config.injection;
        if !settings.bug_ids.is_empty() {
            return Ok(catalog.bugs(&settings.bug_ids)?);
        }
        let mut bugs = catalog.select_uninjected(settings.fake, rng)?;
        bugs.truncate(settings.many);
        if bugs.is_empty() {
            return Err(SessionError::NothingToInject {
                kind: if settings.fake { "fake" } else { "real" },
            });
        }
        Ok(bugs)
    }

    fn oracle(&self) -> BugOracle {
        if !self.config.injection.check_stacktrace {
            return BugOracle::new();
        }
        let toolchain = &self.config.toolchain;
        let tracer = GdbStackTracer::new(
            &toolchain.gdb,
            &toolchain.gdb_script(),
            self.launcher(),
            Duration::from_secs(toolchain.stacktrace_timeout_secs),
        );
        BugOracle::with_stack_checker(StackChecker::new(Box::new(tracer), &self.paths.bugs_build))
    }

    fn launcher(&self) -> TargetLauncher {
        TargetLauncher::new(
            self.project,
            &self.paths.bugs_install,
            self.config.injection.disable_aslr,
        )
    }

    /// Validates `bugs` against build `build` using `runner`.
    pub fn validate_build(
        &self,
        catalog: &mut dyn Catalog,
        build: BuildId,
        bugs: &[Bug],
        input_files: &BTreeSet<String>,
        runner: &dyn ProgramRunner,
    ) -> Result<ValidationReport, SessionError> {
        let oracle = self.oracle();
        let mutator = TriggerMutator::new(self.config.injection.trigger_mode());
        let mut validator = Validator::new(
            catalog,
            runner,
            &oracle,
            mutator,
            &self.paths.inputs_dir,
            build,
        );
        Ok(validator.validate_all(bugs, input_files)?)
    }

    pub fn run(&self, catalog: &mut dyn Catalog) -> Result<SessionReport, SessionError> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.injection.seed);
        let bugs = self.select_bugs(&*catalog, &mut rng)?;
        tracing::info!(count = bugs.len(), "Selected bugs");

        let injector = Injector::new(
            self.project,
            &self.project_file,
            &self.paths,
            &self.config.toolchain,
            &self.config.injection,
        );
        let injected = injector.inject(catalog, &bugs)?;
        if !injected.build.compile {
            tracing::warn!(build = injected.build.id, "Injected build failed to compile, skipping validation");
            return Ok(SessionReport {
                build: injected.build,
                validation: None,
            });
        }

        let launcher = self.launcher();
        let validation = self.validate_build(
            catalog,
            injected.build.id,
            &bugs,
            &injected.plan.input_files,
            &launcher,
        )?;
        tracing::info!(build = injected.build.id, summary = %validation.summary, "Session finished");
        Ok(SessionReport {
            build: injected.build,
            validation: Some(validation),
        })
    }
}
