use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use fx_rates_ingest::api::{build_source_client, EcbClient, RequestThrottle, SinkClient, XRatesClient};
use fx_rates_ingest::data_collector::{IngestReport, PipelineOptions, RatePipeline};
use fx_rates_ingest::logging::init_logging;
use fx_rates_ingest::models::{Config, DateWindow, WorkItem};
use fx_rates_ingest::utils::{dates_between, load_currency_codes, parse_code_list, parse_date_arg};

/// Exchange-rate ingestion: fetch, normalize and deliver to the storage API
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Exit with status 2 when any unit failed
    #[arg(long, global = true)]
    strict: bool,

    /// Fetch and normalize only; nothing is sent to the sink
    #[arg(long, global = true)]
    dry_run: bool,

    /// Hide progress bars
    #[arg(long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backfill every (code, date) pair from the historical rate site
    Historical {
        /// Comma separated codes; defaults to the currency metadata file
        #[arg(long)]
        codes: Option<String>,

        /// First date (YYYY-MM-DD or YYYYMMDD); defaults to HISTORICAL_EPOCH
        #[arg(long, value_parser = parse_date_arg)]
        since: Option<NaiveDate>,

        /// Last date; defaults to today
        #[arg(long, value_parser = parse_date_arg)]
        until: Option<NaiveDate>,

        /// Fetch worker pool size; defaults to FETCH_WORKERS
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Ingest the central-bank feed for yesterday through today
    Latest {
        /// Override "today" for the download window
        #[arg(long, value_parser = parse_date_arg)]
        today: Option<NaiveDate>,
    },
    /// Ingest a bulk-format CSV already on disk
    IngestFile {
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::from_env().context("failed to load configuration")?;
    init_logging(&config.log_file)
        .with_context(|| format!("failed to open log file {}", config.log_file.display()))?;

    info!("🚀 Starting {:?}", cli.command);

    let sink = Arc::new(SinkClient::new(&config)?);
    let source_client = build_source_client(config.request_timeout)?;
    let mut options = PipelineOptions {
        fetch_workers: config.fetch_workers,
        delivery_concurrency: sink.max_connections(),
        dry_run: cli.dry_run,
        show_progress: !cli.quiet,
    };

    let report = match cli.command {
        Command::Historical {
            codes,
            since,
            until,
            workers,
        } => {
            let codes = match codes {
                Some(list) => parse_code_list(&list),
                None => load_currency_codes(&config.currencies_path).with_context(|| {
                    format!("failed to read currency metadata {}", config.currencies_path.display())
                })?,
            };
            let since = since.unwrap_or(config.historical_epoch);
            let until = until.unwrap_or_else(|| Local::now().date_naive());
            if let Some(workers) = workers {
                options.fetch_workers = workers;
            }

            let throttle = RequestThrottle::per_minute(config.fetch_rate_limit_per_minute);
            let source = Arc::new(XRatesClient::new(&config, source_client, throttle));
            let pipeline = RatePipeline::new(sink, options);
            pipeline.run_historical(source, codes, dates_between(since, until)).await
        }
        Command::Latest { today } => {
            let today = today.unwrap_or_else(|| Local::now().date_naive());
            let source = EcbClient::new(&config, source_client);
            let pipeline = RatePipeline::new(sink, options);
            pipeline
                .run_bulk(&source, vec![WorkItem::BulkWindow(DateWindow::ending_on(today))])
                .await
        }
        Command::IngestFile { path } => {
            let source = EcbClient::new(&config, source_client);
            let pipeline = RatePipeline::new(sink, options);
            pipeline.run_bulk(&source, vec![WorkItem::File(path)]).await
        }
    };

    print_summary(&report);

    if cli.strict && report.has_failures() {
        error!("Run finished with failures, exiting with status 2");
        std::process::exit(2);
    }
    Ok(())
}

fn print_summary(report: &IngestReport) {
    println!(
        "units: {}/{} ({} aborted, {} dates skipped)",
        report.units_completed, report.units_total, report.units_aborted, report.dates_skipped
    );
    println!(
        "observations: {} ({} malformed), delivered: {}, delivery failures: {}, fetch failures: {}",
        report.observations,
        report.malformed,
        report.delivered,
        report.failed_deliveries(),
        report.failed_fetches()
    );
}
