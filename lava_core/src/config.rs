use crate::trigger::{KNOB_LIMIT, TriggerMode};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InjectionSettings {
    /// Upper bound on randomly selected bugs per session.
    #[serde(default = "default_many")]
    pub many: usize,
    /// Select bugs whose trigger DUA is a control.
    #[serde(default)]
    pub fake: bool,
    /// Inject these bugs instead of selecting uninjected ones.
    #[serde(default)]
    pub bug_ids: Vec<u64>,
    #[serde(default)]
    pub knob_trigger: Option<u16>,
    #[serde(default)]
    pub arg_dataflow: bool,
    #[serde(default)]
    pub check_stacktrace: bool,
    #[serde(default)]
    pub seed: u64,
    /// Worker count for per-file instrumentation. Defaults to the machine's
    /// available parallelism.
    #[serde(default)]
    pub jobs: Option<usize>,
    #[serde(default = "default_disable_aslr")]
    pub disable_aslr: bool,
}

pub fn default_many() -> usize {
    1
}
fn default_disable_aslr() -> bool {
    true
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            many: default_many(),
            fake: false,
            bug_ids: Vec::new(),
            knob_trigger: None,
            arg_dataflow: false,
            check_stacktrace: false,
            seed: 0,
            jobs: None,
            disable_aslr: default_disable_aslr(),
        }
    }
}

impl InjectionSettings {
    pub fn trigger_mode(&self) -> TriggerMode {
        match self.knob_trigger {
            Some(knob) => TriggerMode::Knob(knob),
            None => TriggerMode::Plain,
        }
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if let Some(knob) = self.knob_trigger {
            if knob >= KNOB_LIMIT {
                anyhow::bail!("knob-trigger {knob:#x} must be below {KNOB_LIMIT:#x}");
            }
        }
        if self.jobs == Some(0) {
            anyhow::bail!("jobs must be at least 1");
        }
        Ok(())
    }
}

/// Locations of the external tools. Anything left unset is derived from
/// `lava-dir`, the root of the LAVA checkout.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ToolchainSettings {
    #[serde(default = "default_lava_dir")]
    pub lava_dir: PathBuf,
    pub lava_tool: Option<PathBuf>,
    pub clang_apply_replacements: Option<PathBuf>,
    pub sw_btrace: Option<PathBuf>,
    pub sw_btrace_to_compiledb: Option<PathBuf>,
    pub gdb_script: Option<PathBuf>,
    #[serde(default = "default_gdb")]
    pub gdb: PathBuf,
    /// Clang builtin headers handed to the compile database generator.
    pub clang_include_dir: Option<PathBuf>,
    #[serde(default = "default_stacktrace_timeout_secs")]
    pub stacktrace_timeout_secs: u64,
}

pub fn default_lava_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_gdb() -> PathBuf {
    PathBuf::from("gdb")
}
fn default_stacktrace_timeout_secs() -> u64 {
    10
}

impl Default for ToolchainSettings {
    fn default() -> Self {
        Self {
            lava_dir: default_lava_dir(),
            lava_tool: None,
            clang_apply_replacements: None,
            sw_btrace: None,
            sw_btrace_to_compiledb: None,
            gdb_script: None,
            gdb: default_gdb(),
            clang_include_dir: None,
            stacktrace_timeout_secs: default_stacktrace_timeout_secs(),
        }
    }
}

const CLANG_VERSION: &str = "3.6.2";

impl ToolchainSettings {
    pub fn lava_tool(&self) -> PathBuf {
        self.lava_tool
            .clone()
            .unwrap_or_else(|| self.lava_dir.join("src_clang/build/lavaTool"))
    }

    pub fn clang_apply_replacements(&self) -> PathBuf {
        self.clang_apply_replacements
            .clone()
            .unwrap_or_else(|| self.lava_dir.join("src_clang/build/clang-apply-replacements"))
    }

    pub fn sw_btrace(&self) -> PathBuf {
        self.sw_btrace
            .clone()
            .unwrap_or_else(|| self.lava_dir.join("btrace/sw-btrace"))
    }

    pub fn sw_btrace_to_compiledb(&self) -> PathBuf {
        self.sw_btrace_to_compiledb
            .clone()
            .unwrap_or_else(|| self.lava_dir.join("btrace/sw-btrace-to-compiledb"))
    }

    pub fn gdb_script(&self) -> PathBuf {
        self.gdb_script
            .clone()
            .unwrap_or_else(|| self.lava_dir.join("scripts/stacktrace_gdb.py"))
    }

    /// The configured include dir, or the one under the LLVM tree named by
    /// `LLVM_SRC_PATH` in `<lava-dir>/src_clang/config.mak`.
    pub fn clang_include_dir(&self) -> Result<PathBuf, anyhow::Error> {
        if let Some(dir) = &self.clang_include_dir {
            return Ok(dir.clone());
        }
        let config_mak = self.lava_dir.join("src_clang/config.mak");
        let content = std::fs::read_to_string(&config_mak)
            .map_err(|e| anyhow::anyhow!("Failed to read {:?}: {}", config_mak, e))?;
        let llvm_src = llvm_src_path(&content)
            .ok_or_else(|| anyhow::anyhow!("No LLVM_SRC_PATH in {:?}", config_mak))?;
        Ok(PathBuf::from(llvm_src)
            .join("Release/lib/clang")
            .join(CLANG_VERSION)
            .join("include"))
    }
}

fn llvm_src_path(config_mak: &str) -> Option<&str> {
    config_mak.lines().find_map(|line| {
        line.strip_prefix("LLVM_SRC_PATH")
            .map(str::trim_start)
            .and_then(|rest| rest.strip_prefix(":="))
            .map(str::trim)
            .filter(|path| !path.is_empty())
    })
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CatalogType {
    #[default]
    Sqlite,
    Snapshot,
}

impl CatalogType {
    pub fn as_str(&self) -> &str {
        match self {
            CatalogType::Sqlite => "sqlite",
            CatalogType::Snapshot => "snapshot",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CatalogConfig {
    #[serde(default)]
    pub catalog_type: CatalogType,
    /// Database or snapshot file. Defaults to `<top>/lava.db` resp.
    /// `<top>/catalog.json`.
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LavaConfig {
    #[serde(default)]
    pub injection: InjectionSettings,
    #[serde(default)]
    pub toolchain: ToolchainSettings,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

impl LavaConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: LavaConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;
        config.injection.validate()?;

        Ok(config)
    }
}

/// `makeclean` is either a flag selecting `make clean` or a shell command.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MakeClean {
    Enabled(bool),
    Command(String),
}

impl MakeClean {
    pub fn command(&self) -> Option<&str> {
        match self {
            MakeClean::Enabled(true) => Some("make clean"),
            MakeClean::Enabled(false) => None,
            MakeClean::Command(cmd) => Some(cmd.as_str()),
        }
    }
}

/// `main_file` may be given as one path or a list.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(file) => vec![file],
        OneOrMany::Many(files) => files,
    })
}

/// The per-target project file, shared with the instrumentor, so its keys
/// stay snake_case.
#[derive(Deserialize, Debug, Clone)]
pub struct ProjectConfig {
    pub name: String,
    pub directory: PathBuf,
    pub tarfile: PathBuf,
    #[serde(default)]
    pub source_root: Option<String>,
    pub configure: String,
    pub make: String,
    pub install: String,
    #[serde(default)]
    pub makeclean: Option<MakeClean>,
    /// Program invocation, with `{install_dir}` and `{input_file}` placeholders.
    pub command: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub main_file: Vec<String>,
    #[serde(default = "default_library_path")]
    pub library_path: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub db: Option<String>,
}

fn default_library_path() -> String {
    "{install_dir}/lib".to_string()
}
fn default_timeout_secs() -> u64 {
    5
}

impl ProjectConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read project file at {:?}: {}", path, e))?;

        let project: ProjectConfig = serde_json::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse JSON from project file {:?}: {}", path, e)
        })?;

        Ok(project)
    }

    pub fn makeclean_command(&self) -> Option<&str> {
        self.makeclean.as_ref().and_then(MakeClean::command)
    }
}

/// Substitutes `{install_dir}` and `{input_file}` in a project template.
pub fn expand_template(template: &str, install_dir: &Path, input_file: Option<&Path>) -> String {
    let expanded = template.replace("{install_dir}", &install_dir.to_string_lossy());
    match input_file {
        Some(input) => expanded.replace("{input_file}", &input.to_string_lossy()),
        None => expanded,
    }
}
