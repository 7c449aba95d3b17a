use crate::catalog::{Catalog, CatalogError};
use crate::config::{InjectionSettings, ProjectConfig, ToolchainSettings};
use crate::executor::{CommandExtCheck, ExecutorError, run_with_timeout};
use crate::model::{Bug, BugId, Build};
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use thiserror::Error;

const BUILD_OUTPUT_SEPARATOR: &str = ";";
const DEFAULT_BUGS_PARENT: &str = "lava-local";

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("Failed to instrument {file}: {source}")]
    Instrument {
        file: String,
        source: ExecutorError,
    },
    #[error("Build I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Cannot determine source root of {tarfile:?}")]
    SourceRoot { tarfile: PathBuf },
    #[error("Toolchain error: {0}")]
    Toolchain(String),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(String),
}

/// First path component of the first entry of a `tar tf` listing.
pub fn first_path_component(listing: &str) -> Option<String> {
    let first = listing.lines().next()?;
    first
        .trim_start_matches("./")
        .split('/')
        .next()
        .filter(|component| !component.is_empty())
        .map(str::to_string)
}

/// The project's declared source root, or the top directory of its tarball.
pub fn resolve_source_root(project: &ProjectConfig) -> Result<String, BuildError> {
    if let Some(root) = &project.source_root {
        return Ok(root.clone());
    }
    let output = Command::new("tar").arg("tf").arg(&project.tarfile).check()?;
    first_path_component(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        BuildError::SourceRoot {
            tarfile: project.tarfile.clone(),
        }
    })
}

/// Directory layout of one target under `<directory>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    pub top_dir: PathBuf,
    pub lavadb: PathBuf,
    pub inputs_dir: PathBuf,
    pub source_root: String,
    pub queries_build: PathBuf,
    pub bugs_top_dir: PathBuf,
    pub bugs_parent: PathBuf,
    pub bugs_build: PathBuf,
    pub bugs_install: PathBuf,
}

impl WorkspacePaths {
    pub fn new(project: &ProjectConfig, source_root: &str) -> Self {
        let top_dir = project.directory.join(&project.name);
        let bugs_top_dir = top_dir.join("bugs");
        let bugs_parent = bugs_top_dir.join(DEFAULT_BUGS_PARENT);
        let bugs_build = bugs_parent.join(source_root);
        Self {
            lavadb: top_dir.join("lavadb"),
            inputs_dir: top_dir.join("inputs"),
            source_root: source_root.to_string(),
            queries_build: top_dir.join(source_root),
            bugs_install: bugs_build.join("lava-install"),
            bugs_build,
            bugs_parent,
            bugs_top_dir,
            top_dir,
        }
    }

    pub fn resolve(project: &ProjectConfig) -> Result<Self, BuildError> {
        Ok(Self::new(project, &resolve_source_root(project)?))
    }

    /// Moves the injection tree to `<bugs>/<name>`.
    pub fn with_bugs_parent(mut self, name: &str) -> Self {
        self.bugs_parent = self.bugs_top_dir.join(name);
        self.bugs_build = self.bugs_parent.join(&self.source_root);
        self.bugs_install = self.bugs_build.join("lava-install");
        self
    }
}

/// Files touched by one injection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionPlan {
    pub bug_ids: Vec<BugId>,
    /// Files holding a trigger lvalue or an attack point.
    pub src_files: BTreeSet<String>,
    /// `src_files` plus the project's main files.
    pub all_files: BTreeSet<String>,
    pub input_files: BTreeSet<String>,
}

impl InjectionPlan {
    /// Distinct parent directories of every instrumented file.
    pub fn directories(&self) -> BTreeSet<String> {
        self.all_files
            .iter()
            .map(|file| {
                Path::new(file)
                    .parent()
                    .map(|dir| dir.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub compiled: bool,
    pub output: String,
}

#[derive(Debug, Clone)]
pub struct InjectionResult {
    pub build: Build,
    pub plan: InjectionPlan,
}

/// Runs `f` on every item on a pool of `jobs` workers and stops at the first
/// error.
pub fn run_parallel<T, F>(jobs: usize, items: &[T], f: F) -> Result<(), BuildError>
where
    T: Sync,
    F: Fn(&T) -> Result<(), BuildError> + Sync + Send,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .map_err(|e| BuildError::ThreadPool(e.to_string()))?;
    pool.install(|| items.par_iter().try_for_each(|item| f(item)))
}

/// Drives the instrumentor and the project's build for one bug set.
pub struct Injector<'a> {
    project: &'a ProjectConfig,
    project_file: PathBuf,
    paths: &'a WorkspacePaths,
    toolchain: &'a ToolchainSettings,
    settings: &'a InjectionSettings,
}

impl<'a> Injector<'a> {
    pub fn new(
        project: &'a ProjectConfig,
        project_file: &Path,
        paths: &'a WorkspacePaths,
        toolchain: &'a ToolchainSettings,
        settings: &'a InjectionSettings,
    ) -> Self {
        Self {
            project,
            project_file: project_file.to_path_buf(),
            paths,
            toolchain,
            settings,
        }
    }

    fn jobs(&self) -> usize {
        self.settings.jobs.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn in_build(&self, program: impl AsRef<std::ffi::OsStr>) -> Command {
        let mut cmd = Command::new(program);
        cmd.current_dir(&self.paths.bugs_build);
        cmd
    }

    fn shell(&self, line: &str) -> Command {
        let mut cmd = self.in_build("/bin/bash");
        cmd.arg("-c").arg(line);
        cmd
    }

    fn git(&self, args: &[&str]) -> Command {
        let mut cmd = self.in_build("git");
        cmd.args(args);
        cmd
    }

    fn add_c_sources(&self) -> Command {
        let mut cmd = self.in_build("find");
        cmd.args([".", "-name", "*.[ch]", "-exec", "git", "add", "{}", ";"]);
        cmd
    }

    fn step(&self, mut cmd: Command) -> Result<Output, BuildError> {
        tracing::debug!(command = ?cmd, "Build step");
        Ok(cmd.check()?)
    }

    /// Like [`Injector::step`] but a failure is only logged; committing an
    /// unchanged tree is expected to fail.
    fn tolerant_step(&self, mut cmd: Command) {
        if let Err(e) = cmd.check() {
            tracing::debug!(error = %e, "Tolerated build step failure");
        }
    }

    /// Brings the injection tree to a pristine, committed, buildable state
    /// with a compile database. Every stage is skipped when its marker
    /// already exists.
    pub fn prepare_workspace(&self) -> Result<(), BuildError> {
        let paths = self.paths;
        std::fs::create_dir_all(&paths.bugs_parent).map_err(|source| BuildError::Io {
            path: paths.bugs_parent.clone(),
            source,
        })?;

        if !paths.bugs_build.is_dir() {
            tracing::info!(tarfile = %self.project.tarfile.display(), "Untarring");
            let mut untar = Command::new("tar");
            untar
                .args(["--no-same-owner", "-xf"])
                .arg(&self.project.tarfile)
                .current_dir(&paths.bugs_parent);
            self.step(untar)?;
        }

        if !paths.bugs_build.join(".git").exists() {
            tracing::info!("Initializing git repo");
            self.step(self.git(&["init"]))?;
            self.step(self.git(&["config", "user.name", "LAVA"]))?;
            self.step(self.git(&["config", "user.email", "nobody@nowhere"]))?;
            self.step(self.git(&["add", "-A", "."]))?;
            self.step(self.git(&["commit", "-m", "Unmodified source."]))?;
        }

        if !paths.bugs_build.join("btrace.log").exists() {
            tracing::info!("Making with btrace");
            self.step(self.shell(&format!(
                "{} --prefix={}",
                self.project.configure,
                paths.bugs_install.display()
            )))?;
            self.step(self.shell(&format!(
                "{} {}",
                self.toolchain.sw_btrace().display(),
                self.project.make
            )))?;
        }

        if !paths.bugs_build.join("compile_commands.json").exists() {
            let include_dir = self
                .toolchain
                .clang_include_dir()
                .map_err(|e| BuildError::Toolchain(e.to_string()))?;
            tracing::info!(include_dir = %include_dir.display(), "Generating compile database");
            let mut compiledb = self.in_build(self.toolchain.sw_btrace_to_compiledb());
            compiledb.arg(&include_dir);
            self.step(compiledb)?;
            self.step(self.git(&["add", "compile_commands.json"]))?;
            self.step(self.git(&["commit", "-m", "Add compile_commands.json."]))?;
            self.step(self.shell(&self.project.make))?;
            self.tolerant_step(self.add_c_sources());
            self.tolerant_step(self.git(&["commit", "-m", "Adding source files"]));
            if !paths.bugs_install.exists() {
                self.step(self.shell(&self.project.install))?;
            }
            // Some sources, such as generated headers, only exist after make.
            self.step(self.shell(&self.project.make))?;
            self.step(self.add_c_sources())?;
            self.tolerant_step(self.git(&["commit", "-m", "Adding any make-generated source files"]));
        }
        Ok(())
    }

    /// Collects the files to instrument and the inputs to fuzz, and logs the
    /// selection.
    pub fn plan(&self, catalog: &dyn Catalog, bugs: &[Bug]) -> Result<InjectionPlan, BuildError> {
        let mut plan = InjectionPlan {
            bug_ids: bugs.iter().map(|bug| bug.id).collect(),
            ..InjectionPlan::default()
        };
        for (index, bug) in bugs.iter().enumerate() {
            let dua = catalog.trigger_dua(bug)?;
            let atp = catalog.attack_point(bug.atp)?;
            let lval = catalog.source_lval(bug.trigger_lval.unwrap_or(dua.lval))?;
            let tag = if dua.fake { "NON-BUG" } else { "BUG" };
            tracing::info!(
                index,
                bug = bug.id,
                tag,
                kind = bug.kind.as_str(),
                dua = dua.id,
                lval = %lval.ast_name,
                atp = atp.id,
                atp_kind = atp.kind.as_str(),
                max_tcn = dua.max_tcn,
                max_liveness = bug.max_liveness,
                "Selected"
            );
            plan.src_files.insert(lval.loc.filename);
            plan.src_files.insert(atp.loc.filename);
            plan.input_files.insert(dua.input_file);
        }
        plan.all_files = plan.src_files.clone();
        plan.all_files.extend(self.project.main_file.iter().cloned());
        Ok(plan)
    }

    pub fn lavatool_command(&self, bug_ids: &[BugId], file: &str) -> Command {
        let build = &self.paths.bugs_build;
        let bug_list = bug_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let main_files = self
            .project
            .main_file
            .iter()
            .map(|f| build.join(f).to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new(self.toolchain.lava_tool());
        cmd.arg("-action=inject")
            .arg(format!("-bug-list={bug_list}"))
            .arg(format!("-src-prefix={}", build.display()))
            .arg(format!("-project-file={}", self.project_file.display()))
            .arg(format!("-main-files={main_files}"))
            .arg(build.join(file));
        if self.settings.arg_dataflow {
            cmd.arg("-arg_dataflow");
        }
        if self.settings.knob_trigger.is_some() {
            cmd.arg("-kt");
        }
        cmd
    }

    pub fn apply_replacements_command(&self, dir: &str) -> Command {
        let mut cmd = Command::new(self.toolchain.clang_apply_replacements());
        cmd.args([".", "-remove-change-desc-files"])
            .current_dir(self.paths.bugs_build.join(dir));
        cmd
    }

    /// Resets the tree, then instruments every planned file and merges the
    /// resulting edits per directory, both in parallel.
    pub fn instrument(&self, plan: &InjectionPlan) -> Result<(), BuildError> {
        self.step(self.git(&["checkout", "-f"]))?;

        let jobs = self.jobs();
        let files: Vec<String> = plan.all_files.iter().cloned().collect();
        tracing::info!(files = files.len(), jobs, "Injecting bugs into source");
        run_parallel(jobs, &files, |file| {
            tracing::debug!(%file, "Running instrumentor");
            self.lavatool_command(&plan.bug_ids, file)
                .check()
                .map(|_| ())
                .map_err(|source| BuildError::Instrument {
                    file: file.clone(),
                    source,
                })
        })?;

        let dirs: Vec<String> = plan.directories().into_iter().collect();
        run_parallel(jobs, &dirs, |dir| {
            self.apply_replacements_command(dir)
                .check()
                .map(|_| ())
                .map_err(BuildError::from)
        })
    }

    /// Optional clean, then `make`. A failing make is a result, not an
    /// error; a failing install after a good make is an error.
    pub fn compile(&self) -> Result<CompileResult, BuildError> {
        if let Some(clean) = self.project.makeclean_command() {
            self.step(self.shell(clean))?;
        }

        tracing::info!(build_dir = %self.paths.bugs_build.display(), "Attempting build of injected bugs");
        let output = run_with_timeout(&mut self.shell(&self.project.make), None)?;
        let result = CompileResult {
            compiled: output.status.success(),
            output: output.combined(BUILD_OUTPUT_SEPARATOR),
        };
        if result.compiled {
            tracing::info!("Build succeeded");
            self.step(self.shell(&self.project.install))?;
        } else {
            tracing::warn!(exit_code = output.exit_code(), "Build failed");
        }
        Ok(result)
    }

    /// Full injection of `bugs`. The build is recorded whether or not it
    /// compiled.
    pub fn inject(
        &self,
        catalog: &mut dyn Catalog,
        bugs: &[Bug],
    ) -> Result<InjectionResult, BuildError> {
        self.prepare_workspace()?;
        let plan = self.plan(&*catalog, bugs)?;
        self.instrument(&plan)?;
        let compiled = self.compile()?;
        let build = catalog.record_build(&plan.bug_ids, compiled.compiled, &compiled.output)?;
        Ok(InjectionResult { build, plan })
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::{CLANG_INCLUDE, StubWorkspace};
    use super::*;
    use crate::catalog::test_utils::sample_catalog;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn git_subjects(dir: &Path) -> Vec<String> {
        let output = Command::new("git")
            .args(["log", "--format=%s"])
            .current_dir(dir)
            .check()
            .unwrap();
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn workspace_preparation_runs_once() {
        let stubs = StubWorkspace::new();
        let settings = InjectionSettings::default();
        let injector = Injector::new(
            &stubs.project,
            Path::new("toy.json"),
            &stubs.paths,
            &stubs.toolchain,
            &settings,
        );

        injector.prepare_workspace().unwrap();
        let build = &stubs.paths.bugs_build;
        assert!(build.join("main.c").is_file());
        assert!(build.join("btrace.log").is_file());
        assert!(build.join("compile_commands.json").is_file());
        assert!(stubs.paths.bugs_install.is_dir());
        assert_eq!(
            stubs.calls(),
            vec![
                format!("configure --prefix={}", stubs.paths.bugs_install.display()),
                "sw-btrace".to_string(),
                "make".to_string(),
                format!("compiledb {CLANG_INCLUDE}"),
                "make".to_string(),
                "install".to_string(),
                "make".to_string(),
            ]
        );
        let subjects = git_subjects(build);
        assert!(subjects.contains(&"Unmodified source.".to_string()));
        assert!(subjects.contains(&"Add compile_commands.json.".to_string()));

        let before = stubs.calls().len();
        let commits = subjects.len();
        injector.prepare_workspace().unwrap();
        assert_eq!(stubs.calls().len(), before, "second run invoked a tool");
        assert_eq!(git_subjects(build).len(), commits);
    }

    #[test]
    fn instrumentation_covers_every_file_and_directory() {
        let stubs = StubWorkspace::new();
        let settings = InjectionSettings {
            jobs: Some(2),
            ..InjectionSettings::default()
        };
        let injector = Injector::new(
            &stubs.project,
            Path::new("toy.json"),
            &stubs.paths,
            &stubs.toolchain,
            &settings,
        );
        injector.prepare_workspace().unwrap();

        let build = &stubs.paths.bugs_build;
        fs::write(build.join("src/file.c"), "leftover edit\n").unwrap();
        let plan = InjectionPlan {
            bug_ids: vec![42, 44],
            all_files: BTreeSet::from([
                "main.c".to_string(),
                "src/file.c".to_string(),
                "src/readelf.c".to_string(),
            ]),
            ..InjectionPlan::default()
        };
        injector.instrument(&plan).unwrap();

        assert_eq!(fs::read_to_string(build.join("src/file.c")).unwrap(), "int file;\n");

        let mut instrumented: Vec<String> = stubs
            .calls_to("lavaTool")
            .iter()
            .map(|call| {
                assert!(call.contains("-bug-list=42,44"), "{call}");
                call.rsplit(' ').next().unwrap_or_default().to_string()
            })
            .collect();
        instrumented.sort();
        let expected: Vec<String> = ["main.c", "src/file.c", "src/readelf.c"]
            .iter()
            .map(|file| build.join(file).display().to_string())
            .collect();
        assert_eq!(instrumented, expected);

        let merged: BTreeSet<PathBuf> = stubs
            .calls_to("merge")
            .iter()
            .map(|call| fs::canonicalize(&call["merge ".len()..]).unwrap())
            .collect();
        assert_eq!(stubs.calls_to("merge").len(), 2);
        assert_eq!(
            merged,
            BTreeSet::from([
                fs::canonicalize(build).unwrap(),
                fs::canonicalize(build.join("src")).unwrap(),
            ])
        );
    }

    #[test]
    fn failing_make_is_recorded_as_a_build() {
        let stubs = StubWorkspace::new();
        let settings = InjectionSettings::default();
        let injector = Injector::new(
            &stubs.project,
            Path::new("toy.json"),
            &stubs.paths,
            &stubs.toolchain,
            &settings,
        );
        injector.prepare_workspace().unwrap();
        stubs.break_make();

        let mut catalog = sample_catalog();
        let bugs = catalog.bugs(&[42, 44]).unwrap();
        let injected = injector.inject(&mut catalog, &bugs).unwrap();

        assert!(!injected.build.compile);
        assert!(injected.build.output.contains("error: injected"));
        assert_eq!(catalog.builds().unwrap(), vec![injected.build.clone()]);
        assert_eq!(catalog.builds().unwrap()[0].bugs, vec![42, 44]);
        // Instrumented main.c, src/file.c and src/readelf.c; install only ran during preparation.
        assert_eq!(stubs.calls_to("lavaTool").len(), 3);
        assert_eq!(stubs.calls_to("install").len(), 1);
    }

    fn project(directory: &Path, extra: serde_json::Value) -> ProjectConfig {
        let mut value = serde_json::json!({
            "name": "file",
            "directory": directory,
            "tarfile": directory.join("file-5.22.tar.gz"),
            "configure": "./configure",
            "make": "make",
            "install": "make install",
            "command": "{install_dir}/bin/file {input_file}",
            "main_file": ["src/file.c"]
        });
        if let (Some(base), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            base.extend(extra.clone());
        }
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn tar_listing_root() {
        assert_eq!(
            first_path_component("file-5.22/\nfile-5.22/src/file.c\n"),
            Some("file-5.22".to_string())
        );
        assert_eq!(
            first_path_component("./binutils/README\n"),
            Some("binutils".to_string())
        );
        assert_eq!(first_path_component(""), None);
    }

    #[test]
    fn source_root_from_project_or_tarball() {
        let dir = tempdir().unwrap();
        let declared = project(dir.path(), serde_json::json!({ "source_root": "file-5.22" }));
        assert_eq!(resolve_source_root(&declared).unwrap(), "file-5.22");

        let tree = dir.path().join("src");
        fs::create_dir_all(tree.join("toy-1.0")).unwrap();
        fs::write(tree.join("toy-1.0/main.c"), "int main(){}").unwrap();
        let tarfile = dir.path().join("toy.tar");
        Command::new("tar")
            .arg("cf")
            .arg(&tarfile)
            .arg("-C")
            .arg(&tree)
            .arg("toy-1.0")
            .check()
            .unwrap();
        let listed = project(dir.path(), serde_json::json!({ "tarfile": tarfile }));
        assert_eq!(resolve_source_root(&listed).unwrap(), "toy-1.0");
    }

    #[test]
    fn workspace_layout() {
        let project = project(Path::new("/work"), serde_json::json!({}));
        let paths = WorkspacePaths::new(&project, "file-5.22");
        assert_eq!(paths.top_dir, PathBuf::from("/work/file"));
        assert_eq!(paths.lavadb, PathBuf::from("/work/file/lavadb"));
        assert_eq!(paths.inputs_dir, PathBuf::from("/work/file/inputs"));
        assert_eq!(paths.queries_build, PathBuf::from("/work/file/file-5.22"));
        assert_eq!(
            paths.bugs_build,
            PathBuf::from("/work/file/bugs/lava-local/file-5.22")
        );
        assert_eq!(
            paths.bugs_install,
            PathBuf::from("/work/file/bugs/lava-local/file-5.22/lava-install")
        );

        let moved = paths.with_bugs_parent("build-7");
        assert_eq!(
            moved.bugs_install,
            PathBuf::from("/work/file/bugs/build-7/file-5.22/lava-install")
        );
    }

    #[test]
    fn plan_collects_files_and_inputs() {
        let project = project(Path::new("/work"), serde_json::json!({}));
        let paths = WorkspacePaths::new(&project, "file-5.22");
        let toolchain = ToolchainSettings::default();
        let settings = InjectionSettings::default();
        let injector = Injector::new(&project, Path::new("/work/file.json"), &paths, &toolchain, &settings);

        let catalog = sample_catalog();
        let bugs = catalog.bugs(&[42, 44]).unwrap();
        let plan = injector.plan(&catalog, &bugs).unwrap();

        assert_eq!(plan.bug_ids, vec![42, 44]);
        // Bug 44 has no trigger lval and falls back to its DUA's lval.
        assert_eq!(
            plan.src_files,
            BTreeSet::from(["src/file.c".to_string(), "src/readelf.c".to_string()])
        );
        assert_eq!(plan.all_files, plan.src_files);
        assert_eq!(plan.input_files, BTreeSet::from(["testsmall.bin".to_string()]));
        assert_eq!(plan.directories(), BTreeSet::from(["src".to_string()]));
    }

    #[test]
    fn lavatool_arguments() {
        let project = project(Path::new("/work"), serde_json::json!({}));
        let paths = WorkspacePaths::new(&project, "file-5.22");
        let toolchain = ToolchainSettings {
            lava_dir: PathBuf::from("/opt/lava"),
            ..ToolchainSettings::default()
        };
        let settings = InjectionSettings {
            arg_dataflow: true,
            knob_trigger: Some(3),
            ..InjectionSettings::default()
        };
        let injector = Injector::new(&project, Path::new("/work/file.json"), &paths, &toolchain, &settings);

        let cmd = injector.lavatool_command(&[42, 44], "src/readelf.c");
        assert_eq!(
            cmd.get_program(),
            Path::new("/opt/lava/src_clang/build/lavaTool").as_os_str()
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-action=inject".to_string(),
                "-bug-list=42,44".to_string(),
                "-src-prefix=/work/file/bugs/lava-local/file-5.22".to_string(),
                "-project-file=/work/file.json".to_string(),
                "-main-files=/work/file/bugs/lava-local/file-5.22/src/file.c".to_string(),
                "/work/file/bugs/lava-local/file-5.22/src/readelf.c".to_string(),
                "-arg_dataflow".to_string(),
                "-kt".to_string(),
            ]
        );

        let merge = injector.apply_replacements_command("src");
        assert_eq!(
            merge.get_current_dir(),
            Some(Path::new("/work/file/bugs/lava-local/file-5.22/src"))
        );
    }

    fn compile_fixture(dir: &Path, extra: serde_json::Value) -> (ProjectConfig, WorkspacePaths) {
        let project = project(dir, extra);
        let paths = WorkspacePaths::new(&project, "toy");
        fs::create_dir_all(&paths.bugs_build).unwrap();
        (project, paths)
    }

    #[test]
    fn successful_compile_installs() {
        let dir = tempdir().unwrap();
        let (project, paths) = compile_fixture(
            dir.path(),
            serde_json::json!({
                "make": "echo compiling; echo warning >&2",
                "install": "touch installed",
                "makeclean": "touch cleaned"
            }),
        );
        let toolchain = ToolchainSettings::default();
        let settings = InjectionSettings::default();
        let injector = Injector::new(&project, Path::new("p.json"), &paths, &toolchain, &settings);

        let result = injector.compile().unwrap();
        assert!(result.compiled);
        assert_eq!(result.output, "compiling\n;warning\n");
        assert!(paths.bugs_build.join("installed").exists());
        assert!(paths.bugs_build.join("cleaned").exists());
    }

    #[test]
    fn failed_compile_is_a_result_and_skips_install() {
        let dir = tempdir().unwrap();
        let (project, paths) = compile_fixture(
            dir.path(),
            serde_json::json!({
                "make": "echo 'error: expected ;' >&2; exit 2",
                "install": "touch installed"
            }),
        );
        let toolchain = ToolchainSettings::default();
        let settings = InjectionSettings::default();
        let injector = Injector::new(&project, Path::new("p.json"), &paths, &toolchain, &settings);

        let result = injector.compile().unwrap();
        assert!(!result.compiled);
        assert!(result.output.contains("error: expected ;"));
        assert!(!paths.bugs_build.join("installed").exists());
    }

    #[test]
    fn failing_install_is_an_error() {
        let dir = tempdir().unwrap();
        let (project, paths) = compile_fixture(
            dir.path(),
            serde_json::json!({ "make": "true", "install": "exit 3" }),
        );
        let toolchain = ToolchainSettings::default();
        let settings = InjectionSettings::default();
        let injector = Injector::new(&project, Path::new("p.json"), &paths, &toolchain, &settings);

        assert!(matches!(
            injector.compile(),
            Err(BuildError::Executor(ExecutorError::Check { code: 3, .. }))
        ));
    }

    #[test]
    fn parallel_runs_every_item_and_propagates_errors() {
        let count = AtomicUsize::new(0);
        let items: Vec<usize> = (0..32).collect();
        run_parallel(4, &items, |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 32);

        let result = run_parallel(4, &items, |&i| {
            if i == 17 {
                Err(BuildError::Toolchain(format!("item {i}")))
            } else {
                Ok(())
            }
        });
        assert!(matches!(result, Err(BuildError::Toolchain(msg)) if msg == "item 17"));
    }
}
