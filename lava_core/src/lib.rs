pub mod builder;
pub mod catalog;
pub mod config;
pub mod executor;
pub mod model;
pub mod mutator;
pub mod oracle;
pub mod session;
pub mod stacktrace;
pub mod trigger;
pub mod validator;

pub use builder::{BuildError, InjectionPlan, Injector, WorkspacePaths, resolve_source_root};
pub use catalog::{Catalog, CatalogError, CatalogSnapshot, InMemoryCatalog, SqliteCatalog};
pub use config::{LavaConfig, ProjectConfig};
pub use executor::{
    CommandExtCheck, ExecutionStatus, ExecutorError, InProcessRunner, ProcessOutput,
    ProgramRunner, TargetLauncher, run_with_timeout,
};
pub use model::{AttackPoint, AttackPointKind, Bug, BugKind, Build, Dua, DuaBytes, Run};
pub use mutator::{MutationError, TriggerMutator, fuzzed_input_path, trigger_groups};
pub use oracle::{BugOracle, OracleError, Verdict, is_memory_corruption};
pub use session::{Session, SessionError, SessionReport};
pub use stacktrace::{GdbStackTracer, StackChecker, StackTracer};
pub use trigger::{MAGIC, TriggerError, TriggerMode, encode_knob, encode_plain};
pub use validator::{BugOutcome, BugState, ValidationError, ValidationReport, Validator, YieldReport};
