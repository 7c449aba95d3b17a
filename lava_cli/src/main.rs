use lava_core::builder::WorkspacePaths;
use lava_core::catalog::{Catalog, CatalogSnapshot, InMemoryCatalog, SqliteCatalog};
use lava_core::config::{CatalogType, LavaConfig, ProjectConfig};
use lava_core::session::{Session, SessionReport};
use lava_core::validator::BugState;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Inject and validate LAVA bugs", long_about = None)]
struct Cli {
    /// Project JSON file describing the target.
    #[clap(value_parser)]
    project_file: PathBuf,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Inject these bugs instead of selecting uninjected ones.
    #[clap(short, long, value_delimiter = ',')]
    bug_ids: Vec<u64>,
    #[clap(short, long)]
    many: Option<usize>,
    /// Select control bugs built on fake DUAs.
    #[clap(long)]
    fake: bool,
    #[clap(short, long)]
    knob_trigger: Option<u16>,
    #[clap(long)]
    arg_dataflow: bool,
    #[clap(long)]
    check_stacktrace: bool,
    #[clap(short, long)]
    seed: Option<u64>,
    #[clap(short, long)]
    jobs: Option<usize>,
    #[clap(long, value_parser)]
    lava_dir: Option<PathBuf>,
    /// SQLite database or JSON snapshot, depending on the configured catalog type.
    #[clap(long, value_parser)]
    catalog: Option<PathBuf>,
    /// Load a JSON snapshot into the SQLite catalog before selecting bugs.
    #[clap(long, value_parser)]
    import_snapshot: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> Result<LavaConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            tracing::info!(path = ?config_path, "Loading configuration");
            LavaConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = PathBuf::from("lava.toml");
            if default_config_path.exists() {
                tracing::info!(path = ?default_config_path, "Loading default configuration");
                LavaConfig::load_from_file(&default_config_path)?
            } else {
                tracing::info!("No config file found, using built-in defaults");
                LavaConfig::default()
            }
        }
    };

    let injection = &mut config.injection;
    if !cli.bug_ids.is_empty() {
        injection.bug_ids = cli.bug_ids.clone();
    }
    if let Some(many) = cli.many {
        injection.many = many;
    }
    if let Some(knob) = cli.knob_trigger {
        injection.knob_trigger = Some(knob);
    }
    if let Some(seed) = cli.seed {
        injection.seed = seed;
    }
    if let Some(jobs) = cli.jobs {
        injection.jobs = Some(jobs);
    }
    injection.fake |= cli.fake;
    injection.arg_dataflow |= cli.arg_dataflow;
    injection.check_stacktrace |= cli.check_stacktrace;
    injection.validate()?;

    if let Some(lava_dir) = &cli.lava_dir {
        config.toolchain.lava_dir = lava_dir.clone();
    }
    if let Some(catalog) = &cli.catalog {
        config.catalog.path = Some(catalog.clone());
    }
    Ok(config)
}

fn print_report(report: &SessionReport) {
    println!("Build {}: bugs {:?}", report.build.id, report.build.bugs);
    let Some(validation) = &report.validation else {
        println!("Build did not compile, no bugs validated.");
        return;
    };
    for outcome in &validation.outcomes {
        let mark = match outcome.state {
            BugState::Confirmed => "REAL",
            BugState::Indeterminate => "????",
            _ => "----",
        };
        println!(
            "  [{mark}] bug {:>6} {:<16} exit {:>4}  {}",
            outcome.bug,
            outcome.kind.as_str(),
            outcome.exit_code,
            outcome.input_digest
        );
    }
    println!("Yield: {}", validation.summary);
}

fn run_with_catalog(
    session: &Session<'_>,
    catalog: &mut dyn Catalog,
) -> Result<SessionReport, anyhow::Error> {
    Ok(session.run(catalog)?)
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LAVA_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let project = ProjectConfig::load_from_file(&cli.project_file)?;
    let paths = WorkspacePaths::resolve(&project)?;
    tracing::debug!(?paths, "Workspace");

    let session = Session::new(&config, &project, &cli.project_file, paths.clone());
    let report = match config.catalog.catalog_type {
        CatalogType::Sqlite => {
            let path = config
                .catalog
                .path
                .clone()
                .unwrap_or_else(|| paths.top_dir.join("lava.db"));
            tracing::info!(path = ?path, "Opening SQLite catalog");
            let mut catalog = SqliteCatalog::open(&path)?;
            if let Some(snapshot) = &cli.import_snapshot {
                catalog.import_snapshot(&CatalogSnapshot::load(snapshot)?)?;
            }
            run_with_catalog(&session, &mut catalog)?
        }
        CatalogType::Snapshot => {
            let path = config
                .catalog
                .path
                .clone()
                .unwrap_or_else(|| paths.top_dir.join("catalog.json"));
            if cli.import_snapshot.is_some() {
                anyhow::bail!(
                    "--import-snapshot only applies to the sqlite catalog, not {}",
                    config.catalog.catalog_type.as_str()
                );
            }
            tracing::info!(path = ?path, "Loading catalog snapshot");
            let mut catalog = InMemoryCatalog::from_snapshot(CatalogSnapshot::load(&path)?);
            let result = run_with_catalog(&session, &mut catalog);
            save_snapshot(&catalog, &path)?;
            result?
        }
    };

    print_report(&report);
    Ok(())
}

/// Persists builds and runs appended during the session, even when it failed.
fn save_snapshot(catalog: &InMemoryCatalog, path: &Path) -> Result<(), anyhow::Error> {
    catalog.snapshot().save(path)?;
    tracing::info!(path = ?path, "Saved catalog snapshot");
    Ok(())
}
