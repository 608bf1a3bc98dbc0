use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use vulnharvest::config::{self, DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS, DbConfig};
use vulnharvest::http_client::{HttpClientOptions, create_shared_client};
use vulnharvest::jobs::bdu::{self, BDU_EXPORT_URL};
use vulnharvest::jobs::nvd::NVD_DETAIL_BASE;
use vulnharvest::jobs::opencve::OPENCVE_BASE;
use vulnharvest::jobs::threats::{self, THREAT_LIST_URL};
use vulnharvest::jobs::{ImportSummary, NvdJob, OpenCveJob};
use vulnharvest::logging;
use vulnharvest::pipeline::{BoundedFetcher, JobSummary, PipelineOptions, RetryPolicy, run_pipeline};
use vulnharvest::reports::{ReportFormat, render_stats, render_vulnerability, vulnerability_report};
use vulnharvest::store::postgres::PgStore;
use vulnharvest::store::sqlite::SqliteStore;
use vulnharvest::store::{Store, table_counts};

#[derive(Parser)]
#[command(name = "vulnharvest")]
#[command(about = "Harvest vulnerability data from FSTEC BDU, NVD and OpenCVE", long_about = None)]
#[command(version)]
struct Cli {
    /// Log file to append to (defaults to a per-job file)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Use a local SQLite database instead of PostgreSQL
    #[arg(long, global = true, value_name = "PATH")]
    sqlite: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DownloadArgs {
    /// PEM certificate trusted for the FSTEC download
    #[arg(long, default_value = "fstek.pem")]
    ca_cert: PathBuf,

    /// Attempts per download before giving up
    #[arg(long, env = "VULNHARVEST_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
}

#[derive(Args)]
struct PipelineArgs {
    /// Maximum number of pages fetched at once
    #[arg(short, long, env = "VULNHARVEST_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Attempts per page before giving up
    #[arg(long, env = "VULNHARVEST_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Import the BDU vulnerability export (vulxml.zip)
    Bdu {
        #[command(flatten)]
        download: DownloadArgs,

        /// Export archive URL
        #[arg(long, default_value = BDU_EXPORT_URL)]
        url: String,
    },
    /// Import the BDU threat list (thrlist.xlsx)
    Threats {
        #[command(flatten)]
        download: DownloadArgs,

        /// Threat list URL
        #[arg(long, default_value = THREAT_LIST_URL)]
        url: String,
    },
    /// Scrape NVD descriptions and references for stored CVE identifiers
    Nvd {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Prefix for CVE identifiers that are not already URLs
        #[arg(long, default_value = NVD_DETAIL_BASE)]
        detail_base: String,
    },
    /// Scrape OpenCVE CVSS v3 metrics for stored vulnerabilities
    Opencve {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// OpenCVE page prefix
        #[arg(long, default_value = OPENCVE_BASE)]
        cve_base: String,
    },
    /// Show one stored vulnerability with its NVD and OpenCVE data
    Show {
        /// BDU identifier, e.g. BDU:2024-00001
        identifier: String,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Summary)]
        output: ReportFormat,

        /// Prefix the `nvd` job used for bare CVE identifiers
        #[arg(long, default_value = NVD_DETAIL_BASE)]
        detail_base: String,
    },
    /// Print row counts for every table
    Stats {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = ReportFormat::Summary)]
        output: ReportFormat,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Bdu { .. } => "bdu",
            Commands::Threats { .. } => "threats",
            Commands::Nvd { .. } => "nvd",
            Commands::Opencve { .. } => "opencve",
            Commands::Show { .. } => "show",
            Commands::Stats { .. } => "stats",
        }
    }

    fn default_log_file(&self) -> &'static str {
        match self {
            Commands::Bdu { .. } => "output_parser.log",
            Commands::Threats { .. } => "output_parser_xlsx.log",
            Commands::Nvd { .. } => "output_parser_nvd.log",
            Commands::Opencve { .. } => "output_parser_opencve.log",
            Commands::Show { .. } | Commands::Stats { .. } => "output_stats.log",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Before parsing, so `.env` can provide the VULNHARVEST_* fallbacks
    let dotenv = config::load_dotenv();
    let cli = Cli::parse();

    let log_file = cli
        .log_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(cli.command.default_log_file()));
    if let Err(err) = logging::init(&log_file) {
        eprintln!("Error: {err:#}");
        return ExitCode::FAILURE;
    }

    match dotenv {
        Ok(Some(path)) => info!(path = %path.display(), "loaded environment file"),
        Ok(None) => {}
        Err(err) => {
            error!(error = %format!("{err:#}"), "setup failed");
            return ExitCode::FAILURE;
        }
    }

    let job = cli.command.name();
    let start = Instant::now();
    info!(job, version = env!("CARGO_PKG_VERSION"), "job started");

    match run(cli).await {
        Ok(()) => {
            info!(job, elapsed_ms = start.elapsed().as_millis() as u64, "job finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(job, error = %format!("{err:#}"), "job aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store = open_store(cli.sqlite.as_deref()).await?;

    match cli.command {
        Commands::Bdu { download, url } => {
            let fetcher = download_fetcher(&download)?;
            let summary = bdu::run(store.as_ref(), &fetcher, &url).await?;
            print_import_summary(&summary);
        }
        Commands::Threats { download, url } => {
            let fetcher = download_fetcher(&download)?;
            let summary = threats::run(store.as_ref(), &fetcher, &url).await?;
            print_import_summary(&summary);
        }
        Commands::Nvd {
            pipeline,
            detail_base,
        } => {
            let fetcher = scraping_fetcher(&pipeline)?;
            let job = NvdJob::new(Arc::clone(&store), fetcher)?.with_detail_base(detail_base);
            let options = PipelineOptions {
                concurrency: pipeline.concurrency,
                politeness_delay: None,
            };
            let summary = run_pipeline(Arc::new(job), &options).await?;
            print_job_summary(&summary);
        }
        Commands::Opencve { pipeline, cve_base } => {
            let fetcher = scraping_fetcher(&pipeline)?;
            let job = OpenCveJob::new(Arc::clone(&store), fetcher)?.with_cve_base(cve_base);
            let options = OpenCveJob::pipeline_options(pipeline.concurrency);
            let summary = run_pipeline(Arc::new(job), &options).await?;
            print_job_summary(&summary);
        }
        Commands::Show {
            identifier,
            output,
            detail_base,
        } => {
            let Some(report) = vulnerability_report(store.as_ref(), &identifier, &detail_base).await?
            else {
                anyhow::bail!("vulnerability {identifier} not found");
            };
            println!("{}", render_vulnerability(output, &report)?);
        }
        Commands::Stats { output } => {
            let counts = table_counts(store.as_ref()).await?;
            println!("{}", render_stats(output, store.backend(), &counts)?);
        }
    }

    Ok(())
}

async fn open_store(sqlite: Option<&Path>) -> anyhow::Result<Arc<dyn Store>> {
    if let Some(path) = sqlite {
        let store = SqliteStore::open(path)
            .with_context(|| format!("failed to open SQLite database {}", path.display()))?;
        info!(path = %path.display(), "using SQLite store");
        return Ok(Arc::new(store));
    }

    let config = DbConfig::from_env().context("invalid database configuration")?;
    Ok(Arc::new(PgStore::connect(&config).await?))
}

fn download_fetcher(args: &DownloadArgs) -> anyhow::Result<BoundedFetcher> {
    let client = create_shared_client(&HttpClientOptions::download(args.ca_cert.clone()))?;
    Ok(BoundedFetcher::new(
        client,
        RetryPolicy::download().with_max_attempts(args.max_attempts),
    ))
}

fn scraping_fetcher(args: &PipelineArgs) -> anyhow::Result<BoundedFetcher> {
    let client = create_shared_client(&HttpClientOptions::scraping())?;
    Ok(BoundedFetcher::new(
        client,
        RetryPolicy::scraping().with_max_attempts(args.max_attempts),
    ))
}

fn print_import_summary(summary: &ImportSummary) {
    println!(
        "{}: {} read, {} inserted, {} skipped, {} failed",
        summary.job, summary.read, summary.inserted, summary.skipped, summary.failed
    );
}

fn print_job_summary(summary: &JobSummary) {
    println!(
        "{}: {} enumerated, {} stored, {} skipped, {} failed",
        summary.job, summary.enumerated, summary.persisted, summary.skipped, summary.failed
    );
    for failure in &summary.failures {
        println!("  {} ({}): {}", failure.key, failure.stage, failure.error);
    }
}
