use std::process::ExitCode;

use camino::Utf8PathBuf;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use tsetmc_ingest::calendar::Calendar;
use tsetmc_ingest::config::{ConfigLoader, ResolvedConfig, validate_workers};
use tsetmc_ingest::dataset::{DatasetStore, EntityStats};
use tsetmc_ingest::domain::{EntityId, FetchRequest, Schema};
use tsetmc_ingest::error::{ConfigError, Error, SchemaError};
use tsetmc_ingest::normalize::Normalizer;
use tsetmc_ingest::output::{JsonOutput, OutputMode};
use tsetmc_ingest::pipeline::{Pipeline, RunReport};
use tsetmc_ingest::retrieval::{
    BatchReport, CancellationToken, FetchPlan, HttpSource, RetrievalClient,
};
use tsetmc_ingest::staging::StagingStore;
use tsetmc_ingest::summary;

#[derive(Parser)]
#[command(name = "tsetmc")]
#[command(about = "Fetch, stage, normalize and store daily TSETMC market-watch data")]
#[command(version, author)]
struct Cli {
    /// Config file (defaults to ./tsetmc.json when present).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Suppress progress output on stderr.
    #[arg(long, global = true)]
    non_interactive: bool,

    #[arg(long, global = true)]
    staging_dir: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    dataset_dir: Option<Utf8PathBuf>,

    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Calendar for date arguments and for `{date}` in the source URL.
    #[arg(long, global = true, value_enum)]
    calendar: Option<Calendar>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download and stage payloads for a date range")]
    Fetch(RangeArgs),
    #[command(about = "Normalize staged payloads into the dataset")]
    Normalize,
    #[command(about = "Fetch, normalize and store a date range")]
    Run(RangeArgs),
    #[command(about = "Print stored records for one entity")]
    Query(QueryArgs),
    #[command(about = "Rank entities by activity and price change")]
    Summary(SummaryArgs),
    #[command(about = "Show staging and dataset state")]
    Status,
}

#[derive(Args, Clone)]
struct RangeArgs {
    #[arg(long)]
    start: String,

    /// Inclusive; defaults to today.
    #[arg(long)]
    end: Option<String>,

    /// Entity to fetch; repeatable. Replaces the configured list.
    #[arg(long = "entity")]
    entities: Vec<String>,

    /// Re-download payloads that are already staged.
    #[arg(long)]
    force: bool,

    /// Delete staged payloads once they are in the dataset.
    #[arg(long)]
    no_retain: bool,
}

#[derive(Args)]
struct QueryArgs {
    #[arg(long)]
    entity: String,

    #[arg(long)]
    start: String,

    #[arg(long)]
    end: Option<String>,
}

#[derive(Args)]
struct SummaryArgs {
    #[arg(long)]
    start: String,

    #[arg(long)]
    end: Option<String>,

    /// Entries per ranking.
    #[arg(long, default_value_t = 10)]
    top: usize,
}

#[derive(Serialize)]
struct FetchSummary {
    start: NaiveDate,
    end: NaiveDate,
    already_staged: Vec<FetchRequest>,
    #[serde(flatten)]
    report: BatchReport,
}

#[derive(Serialize)]
struct StatusReport {
    staging_dir: Utf8PathBuf,
    staged: usize,
    dataset_dir: Utf8PathBuf,
    schema_version: u32,
    entities: Vec<EntityStats>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<Error>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &Error) -> u8 {
    match error {
        Error::Config(_) => 2,
        Error::Store(_) => 3,
        Error::Schema(SchemaError::VersionMismatch { .. } | SchemaError::DefinitionMismatch { .. }) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };
    let mut config = ConfigLoader::resolve(cli.config.as_deref()).map_err(Error::from)?;
    apply_overrides(&mut config, &cli)?;

    match cli.command {
        Commands::Fetch(args) => run_fetch(&config, args),
        Commands::Normalize => run_normalize(&config, output_mode),
        Commands::Run(args) => run_pipeline(&config, args, output_mode),
        Commands::Query(args) => run_query(&config, args),
        Commands::Summary(args) => run_summary(&config, args),
        Commands::Status => run_status(&config),
    }
}

fn apply_overrides(config: &mut ResolvedConfig, cli: &Cli) -> miette::Result<()> {
    if let Some(dir) = &cli.staging_dir {
        config.staging_dir = dir.clone();
    }
    if let Some(dir) = &cli.dataset_dir {
        config.dataset_dir = dir.clone();
    }
    if let Some(workers) = cli.workers {
        config.workers = validate_workers(workers).map_err(Error::from)?;
    }
    if let Some(calendar) = cli.calendar {
        config.normalizer.calendar = calendar;
    }
    Ok(())
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn parse_range(
    config: &ResolvedConfig,
    start: &str,
    end: Option<&str>,
) -> Result<(NaiveDate, NaiveDate), Error> {
    let calendar = config.calendar();
    let start = calendar.parse_arg(start)?;
    let end = match end {
        Some(end) => calendar.parse_arg(end)?,
        None => today(),
    };
    Ok((start, end))
}

fn plan(config: &ResolvedConfig, args: &RangeArgs) -> Result<FetchPlan, Error> {
    let entities = if args.entities.is_empty() {
        config.entity_ids()
    } else {
        args.entities
            .iter()
            .map(|value| value.parse::<EntityId>())
            .collect::<Result<Vec<_>, _>>()?
    };
    let (start, end) = parse_range(config, &args.start, args.end.as_deref())?;
    Ok(FetchPlan::new(entities, start, end, today())?.skip_weekdays(&config.skip_weekdays))
}

fn retrieval_client(config: &ResolvedConfig) -> Result<RetrievalClient<HttpSource>, Error> {
    let source = HttpSource::new(&config.source, config.calendar())?
        .with_entity_templates(&config.entities);
    let staging = StagingStore::new(config.staging_dir.clone());
    Ok(RetrievalClient::new(
        source,
        staging,
        config.retry.clone(),
        config.workers,
    )?)
}

fn pipeline(config: &ResolvedConfig, force: bool) -> Result<Pipeline<HttpSource>, Error> {
    let schema = Schema::canonical();
    let dataset = DatasetStore::open(config.dataset_dir.clone(), &schema)?;
    let normalizer = Normalizer::new(schema, config.normalizer);
    Ok(Pipeline::new(retrieval_client(config)?, normalizer, dataset)
        .retain_staged(config.retain_staged)
        .force_refetch(force))
}

fn run_fetch(config: &ResolvedConfig, args: RangeArgs) -> miette::Result<ExitCode> {
    let plan = plan(config, &args)?;
    let client = retrieval_client(config)?;
    let (pending, already_staged) = plan.pending(client.staging(), args.force);
    tracing::info!(
        "fetching {} units for {plan} ({} already staged)",
        pending.len(),
        already_staged.len()
    );

    let report = client.fetch_batch(&pending, &CancellationToken::new());
    let failed = report.has_permanent_failures();
    JsonOutput::print(&FetchSummary {
        start: plan.start(),
        end: plan.end(),
        already_staged,
        report,
    })
    .into_diagnostic()?;
    Ok(exit_for(failed, false))
}

fn run_normalize(config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<ExitCode> {
    let pipeline = pipeline(config, false)?;
    let sink = output_mode.sink();
    let report = pipeline.ingest_staged(&CancellationToken::new(), sink.as_ref())?;
    print_run(&report)
}

fn run_pipeline(
    config: &ResolvedConfig,
    args: RangeArgs,
    output_mode: OutputMode,
) -> miette::Result<ExitCode> {
    let plan = plan(config, &args)?;
    let mut config = config.clone();
    if args.no_retain {
        config.retain_staged = false;
    }
    let pipeline = pipeline(&config, args.force)?;
    tracing::info!("running pipeline for {plan}");

    let sink = output_mode.sink();
    let report = pipeline.run(&plan.requests(), &CancellationToken::new(), sink.as_ref());
    print_run(&report)
}

fn print_run(report: &RunReport) -> miette::Result<ExitCode> {
    JsonOutput::print(report).into_diagnostic()?;
    Ok(exit_for(
        report.has_permanent_failures(),
        report.has_store_failures(),
    ))
}

fn exit_for(permanent_failures: bool, store_failures: bool) -> ExitCode {
    if store_failures {
        ExitCode::from(3)
    } else if permanent_failures {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    }
}

fn run_query(config: &ResolvedConfig, args: QueryArgs) -> miette::Result<ExitCode> {
    let entity: EntityId = args.entity.parse().map_err(Error::from)?;
    let (start, end) = parse_range(config, &args.start, args.end.as_deref())?;
    if start > end {
        return Err(Error::from(ConfigError::InvertedRange { start, end }).into());
    }
    let dataset = DatasetStore::open(config.dataset_dir.clone(), &Schema::canonical())?;
    let records = dataset.query(&entity, start..=end)?;
    JsonOutput::print(&records).into_diagnostic()?;
    Ok(ExitCode::SUCCESS)
}

fn run_summary(config: &ResolvedConfig, args: SummaryArgs) -> miette::Result<ExitCode> {
    let (start, end) = parse_range(config, &args.start, args.end.as_deref())?;
    let dataset = DatasetStore::open(config.dataset_dir.clone(), &Schema::canonical())?;
    let summary = summary::summarize(&dataset, start..=end, args.top)?;
    JsonOutput::print(&summary).into_diagnostic()?;
    Ok(ExitCode::SUCCESS)
}

fn run_status(config: &ResolvedConfig) -> miette::Result<ExitCode> {
    let staging = StagingStore::new(config.staging_dir.clone());
    let staged = staging.list().map_err(Error::from)?.len();
    let schema = Schema::canonical();
    let dataset = DatasetStore::open(config.dataset_dir.clone(), &schema)?;
    JsonOutput::print(&StatusReport {
        staging_dir: config.staging_dir.clone(),
        staged,
        dataset_dir: config.dataset_dir.clone(),
        schema_version: schema.version,
        entities: dataset.stats()?,
    })
    .into_diagnostic()?;
    Ok(ExitCode::SUCCESS)
}
