use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use molid::app::{App, ConfigSetting, ConfigView, UpdateOverrides, update_config};
use molid::config::ConfigLoader;
use molid::convert::ObabelConverter;
use molid::domain::{IdentifierType, Query};
use molid::error::MolidError;
use molid::output::{JsonOutput, LogProgress};
use molid::pubchem::PubchemHttpClient;
use molid::remote::HttpDirectoryClient;
use molid::search::query_from_file;

#[derive(Parser)]
#[command(name = "molid")]
#[command(about = "Identify compounds against a local PubChem mirror, a query cache and PubChem")]
#[command(version, author)]
struct Cli {
    /// Path to molid.json (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log filter, overrides RUST_LOG (e.g. `info`, `molid=debug`)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Manage the bulk compound database")]
    Db(DbArgs),
    #[command(about = "Resolve one identifier to compound records")]
    Search(SearchArgs),
    #[command(about = "Show or edit configuration")]
    Config(ConfigArgs),
    #[command(about = "Maintain the query cache")]
    Cache(CacheArgs),
}

#[derive(Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbCommand,
}

#[derive(Subcommand)]
enum DbCommand {
    #[command(about = "Create the database schema")]
    Create(DbFileArgs),
    #[command(about = "Download and ingest new archives")]
    Update(UpdateArgs),
    #[command(about = "Check that a database opens and report its counts")]
    Use(DbFileArgs),
}

#[derive(Args)]
struct DbFileArgs {
    #[arg(long)]
    db_file: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct UpdateArgs {
    #[arg(long)]
    db_file: Option<Utf8PathBuf>,

    #[arg(long)]
    max_files: Option<usize>,

    #[arg(long)]
    download_folder: Option<Utf8PathBuf>,

    #[arg(long)]
    processed_folder: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct SearchArgs {
    /// Identifier value (omit when using --file)
    value: Option<String>,

    #[arg(long, default_value = "inchikey")]
    id_type: String,

    /// Strategy name or `auto`; defaults to the configured mode
    #[arg(long)]
    mode: Option<String>,

    /// Structure file (.xyz, .extxyz or .sdf)
    #[arg(long, conflicts_with = "value")]
    file: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    #[command(about = "Print the resolved configuration")]
    Show,
    #[command(about = "Set the bulk database path")]
    SetMaster { path: String },
    #[command(about = "Set the query cache path")]
    SetCache { path: String },
    #[command(about = "Set the default search mode")]
    SetMode { mode: String },
}

#[derive(Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheCommand,
}

#[derive(Subcommand)]
enum CacheCommand {
    #[command(about = "Fetch registry numbers for cached compounds")]
    EnrichCas {
        /// Also scan synonyms for checksum-valid registry numbers
        #[arg(long)]
        synonyms: bool,

        /// Compound ids to enrich (all cached compounds when omitted)
        cids: Vec<i64>,
    },
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<MolidError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &MolidError) -> u8 {
    match error {
        MolidError::NotFound { .. } => 2,
        error if error.is_transport() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let filter = match cli.log_level.as_deref() {
        Some(level) => EnvFilter::try_new(level).into_diagnostic()?,
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    let command = match cli.command {
        Commands::Config(args) => return run_config(args.command, config_path),
        command => command,
    };

    let resolved = ConfigLoader::resolve(config_path)?;
    let remote = PubchemHttpClient::new(resolved.http)?;
    let directory = HttpDirectoryClient::new(resolved.http)?;
    let app = App::new(resolved, remote, directory, ObabelConverter::new());
    run_command(&app, command, config_path)
}

fn run_command(
    app: &App<PubchemHttpClient, HttpDirectoryClient, ObabelConverter>,
    command: Commands,
    config_path: Option<&str>,
) -> miette::Result<()> {
    match command {
        Commands::Db(args) => match args.command {
            DbCommand::Create(args) => {
                let status = app.create_db(args.db_file.as_deref(), &LogProgress)?;
                JsonOutput::print_db(&status).into_diagnostic()?;
            }
            DbCommand::Use(args) => {
                let status = app.use_db(args.db_file.as_deref(), &LogProgress)?;
                JsonOutput::print_db(&status).into_diagnostic()?;
            }
            DbCommand::Update(args) => {
                let overrides = UpdateOverrides {
                    db_file: args.db_file,
                    max_files: args.max_files,
                    download_folder: args.download_folder,
                    processed_folder: args.processed_folder,
                };
                let report = app.update_db(overrides, &LogProgress)?;
                JsonOutput::print_sync(&report).into_diagnostic()?;
            }
        },
        Commands::Search(args) => {
            let query = match (args.file, args.value) {
                (Some(path), _) => query_from_file(path.as_std_path())?,
                (None, Some(value)) => Query::new(args.id_type.parse::<IdentifierType>()?, value),
                (None, None) => {
                    return Err(MolidError::InvalidQuery(
                        "an identifier value or --file is required".to_string(),
                    )
                    .into());
                }
            };
            let mode = args
                .mode
                .as_deref()
                .map(|value| app.config().parse_mode(value))
                .transpose()?;
            let outcome = app.search(&query, mode.as_ref(), &LogProgress)?;
            JsonOutput::print_search(&outcome).into_diagnostic()?;
        }
        Commands::Cache(args) => match args.command {
            CacheCommand::EnrichCas { synonyms, cids } => {
                let report = app.enrich_cas(&cids, synonyms, &LogProgress)?;
                JsonOutput::print_enrich(&report).into_diagnostic()?;
            }
        },
        Commands::Config(args) => run_config(args.command, config_path)?,
    }
    Ok(())
}

fn run_config(command: ConfigCommand, config_path: Option<&str>) -> miette::Result<()> {
    let setting = match command {
        ConfigCommand::Show => {
            let path = ConfigLoader::config_path(config_path)?;
            let resolved = ConfigLoader::resolve(config_path)?;
            JsonOutput::print_config(&ConfigView::new(&path, &resolved)).into_diagnostic()?;
            return Ok(());
        }
        ConfigCommand::SetMaster { path } => ConfigSetting::MasterDb(path),
        ConfigCommand::SetCache { path } => ConfigSetting::CacheDb(path),
        ConfigCommand::SetMode { mode } => ConfigSetting::Mode(mode),
    };
    let path = ConfigLoader::config_path(config_path)?;
    update_config(&path, setting)?;
    let resolved = ConfigLoader::resolve(Some(path.as_str()))?;
    JsonOutput::print_config(&ConfigView::new(&path, &resolved)).into_diagnostic()?;
    Ok(())
}
