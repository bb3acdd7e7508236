use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info, warn};

use fieldmill::db::Database;
use fieldmill::{
    init_logging, load_config, Aggregator, Config, ExtractionService, Job, JobId, JobStatus,
    JobStore, LogFormat, RecordTable, ResultView,
};

type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// Fieldmill - extract fields from documents in resumable batch jobs
#[derive(Parser, Debug)]
#[command(name = "fieldmill")]
#[command(version)]
#[command(about = "Batch field extraction from documents", long_about = None)]
struct Cli {
    /// Configuration file (JSON). Built-in defaults are used when omitted
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log output format: compact or json
    #[arg(long = "log-format", default_value = "compact", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a job, wait for it and write the result
    Run {
        /// Instructions shared by every document
        #[arg(long = "context", conflicts_with = "context_file")]
        context: Option<String>,

        /// Read the shared instructions from a file
        #[arg(long = "context-file")]
        context_file: Option<PathBuf>,

        /// JSON file with a list of {"name", "description"} objects
        #[arg(short = 'f', long = "fields")]
        fields: PathBuf,

        /// Where to write the per-document result
        #[arg(short = 'o', long = "output")]
        output: PathBuf,

        /// Also write the per-entity aggregation here
        #[arg(long = "aggregate")]
        aggregate: Option<PathBuf>,

        /// Retry rounds for documents that failed
        #[arg(long = "retries", default_value_t = 0)]
        retries: u32,

        /// Documents to process
        #[arg(required = true)]
        documents: Vec<PathBuf>,
    },

    /// Retry the failed documents of a finished job
    Retry {
        job_id: JobId,

        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Continue every job a previous process left unfinished
    Recover,

    /// List known jobs
    Jobs,

    /// Aggregate a per-document result file into one row per entity
    Aggregate {
        input: PathBuf,

        /// Output file, stdout when omitted
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
}

fn read_config(path: Option<&Path>) -> CliResult<Config> {
    match path {
        Some(path) => Ok(load_config(path)?),
        None => Ok(Config::default()),
    }
}

fn write_output(path: Option<&Path>, text: &str) -> CliResult<()> {
    match path {
        Some(path) => {
            fs::write(path, text)?;
            info!("Wrote {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn describe(job: &Job) -> String {
    format!(
        "{}  {:<16} {}/{} processed, {} errors",
        job.id(),
        job.status(),
        job.files_processed(),
        job.total_files(),
        job.error_count()
    )
}

/// Retries failed documents until the job is clean or `rounds` runs out.
async fn retry_rounds(service: &ExtractionService, id: &JobId, rounds: u32) -> CliResult<Job> {
    let mut job = service.wait_for_terminal(id).await?;
    for round in 1..=rounds {
        if job.status() != JobStatus::DoneWithErrors {
            break;
        }
        info!(
            "Retry round {}/{}: {} documents failed",
            round,
            rounds,
            job.error_count()
        );
        service.retry_failed(id)?;
        job = service.wait_for_terminal(id).await?;
    }
    Ok(job)
}

fn write_results(
    service: &ExtractionService,
    job: &Job,
    output: &Path,
    aggregate: Option<&Path>,
) -> CliResult<()> {
    if job.status() == JobStatus::Failed {
        return Err(format!(
            "job {} failed: {}",
            job.id(),
            job.error_message().unwrap_or("unknown error")
        )
        .into());
    }
    write_output(Some(output), &service.result_csv(&job.id(), ResultView::Raw)?)?;
    if let Some(path) = aggregate {
        write_output(
            Some(path),
            &service.result_csv(&job.id(), ResultView::Aggregated)?,
        )?;
    }
    Ok(())
}

async fn run(cli: Cli, config: Config) -> CliResult<()> {
    match cli.command {
        Command::Run {
            context,
            context_file,
            fields,
            output,
            aggregate,
            retries,
            documents,
        } => {
            let context = match context_file {
                Some(path) => fs::read_to_string(path)?,
                None => context.unwrap_or_default(),
            };
            let fields_json = fs::read_to_string(&fields)?;

            let service = ExtractionService::from_config(&config)?;
            let id = service.submit_payload(documents, &context, &fields_json)?;
            info!("Submitted job {}", id);

            let job = retry_rounds(&service, &id, retries).await?;
            info!("{}", describe(&job));
            write_results(&service, &job, &output, aggregate.as_deref())?;
            service.shutdown().await?;
        }
        Command::Retry { job_id, output } => {
            let service = ExtractionService::from_config(&config)?;
            let ticket = service.retry_failed(&job_id)?;
            info!(
                "Removed {} errored rows from job {}, {} documents to reprocess",
                ticket.removed.len(),
                job_id,
                ticket.pending
            );
            let job = service.wait_for_terminal(&job_id).await?;
            info!("{}", describe(&job));
            if let Some(output) = output {
                write_results(&service, &job, &output, None)?;
            }
            service.shutdown().await?;
        }
        Command::Recover => {
            let service = ExtractionService::from_config(&config)?;
            let mut pending = Vec::new();
            for status in [JobStatus::Running, JobStatus::Pending] {
                pending.extend(service.list().into_iter().filter(|j| j.status() == status));
            }
            let queued = service.recover_interrupted()?;
            info!("Recovering {} interrupted jobs", queued);
            for job in pending {
                let job = service.wait_for_terminal(&job.id()).await?;
                info!("{}", describe(&job));
            }
            service.shutdown().await?;
        }
        Command::Jobs => {
            let Some(path) = config.database_path() else {
                warn!("No database configured; jobs are not kept between runs");
                return Ok(());
            };
            let db = Database::open(&path)?;
            info!("Listing jobs stored in {} (schema v{})", path.display(), db.schema_version());
            let store = JobStore::with_database(db);
            store.load_from_database()?;
            for job in store.get_all() {
                println!("{}", describe(&job));
            }
        }
        Command::Aggregate { input, output } => {
            let aggregator = Aggregator::from_config(&config.aggregation);
            let table = RecordTable::from_csv(&fs::read_to_string(&input)?)?;
            write_output(output.as_deref(), &aggregator.aggregate(&table)?.to_csv())?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match read_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.log_level, LogFormat::parse(&cli.log_format)) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
