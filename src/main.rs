use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use time::macros::format_description;

use met_harvest::merge::{MergeReport, MissingReport};
use met_harvest::{
    consolidate, load_identifiers, run, HarvestConfig, HarvestOptions, Identifier, MetPageFetcher,
    MissingCategory, OutputLayout, RunReport, Throttle, WorkerSettings,
};

#[derive(Parser, Clone)]
#[command(name = "Met Harvest - Concurrent Catalog Metadata Fetcher")]
#[command(about = "Fetches per-object metadata from The Met collection pages and merges it into one CSV table.")]
#[command(version)]
struct Cli {
    #[arg(long, help = "Path to the JSON/JSONL object database (each entry carries an 'id'); may be gzipped", required_unless_present = "merge_only")]
    database: Option<PathBuf>,
    #[arg(short, long, help = "Path of the merged CSV table", required = true)]
    outfile: PathBuf,
    #[arg(long, help = "Resume after this identifier (it and everything before it are skipped)")]
    resume: Option<String>,
    #[arg(short = 'w', long, help = "Number of parallel workers (overrides the config file)")]
    max_workers: Option<usize>,
    #[arg(long, help = "Checkpoint every N items per worker (overrides the config file)")]
    flush_every: Option<usize>,
    #[arg(short, long, help = "Optional YAML configuration file")]
    config: Option<PathBuf>,
    #[arg(short, long, default_value = "INFO", help = "Logging level (DEBUG, INFO, WARN, ERROR)")]
    log_level: String,
    #[arg(long, help = "Only merge existing partition temporaries; fetch nothing")]
    merge_only: bool,
    #[arg(long, help = "Disable per-worker progress bars")]
    no_progress: bool,
}

fn format_elapsed(elapsed: Duration) -> String {
    let total_secs = elapsed.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = elapsed.subsec_millis();
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}.{:03}s", seconds, millis)
    }
}

fn load_config(cli: &Cli) -> Result<HarvestConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            HarvestConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?
        }
        None => HarvestConfig::default(),
    };
    if let Some(workers) = cli.max_workers {
        config.workers = workers;
    }
    if let Some(flush_every) = cli.flush_every {
        config.flush_every = flush_every;
    }
    config.validate().context("Invalid configuration after applying command-line overrides")?;
    Ok(config)
}

fn log_merge_summary(merge: &MergeReport, missing: &MissingReport, layout: &OutputLayout) {
    info!(
        "Final table {}: {} rows, {} columns from {} partition files",
        layout.outfile().display(),
        merge.rows,
        merge.columns.len(),
        merge.partitions_merged
    );
    for category in MissingCategory::ALL {
        info!(
            "  - {}: {} identifiers",
            layout.global_missing_file(category).display(),
            missing.count(category)
        );
    }
}

fn log_run_summary(report: &RunReport) {
    info!("Identifiers scheduled: {}", report.identifiers);
    info!("Items processed: {}", report.processed());
    info!("Items with failed fetches: {}", report.fetch_failures());
    info!(
        "Checkpoint flushes: {} ({} rows, {} failed)",
        report.writer.flushes, report.writer.rows_written, report.writer.failed_flushes
    );
    if !report.failed.is_empty() {
        warn!("Partitions with errors: {}", report.failed.len());
        for failure in &report.failed {
            warn!("  - partition {}: {}", failure.partition, failure.message);
        }
    }
}

fn main() -> Result<()> {
    let start_time = Instant::now();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_uppercase().as_str() {
        "DEBUG" => LevelFilter::Debug,
        "INFO" => LevelFilter::Info,
        "WARN" | "WARNING" => LevelFilter::Warn,
        "ERROR" => LevelFilter::Error,
        _ => { eprintln!("Invalid log level '{}', defaulting to INFO.", cli.log_level); LevelFilter::Info }
    };
    SimpleLogger::new()
        .with_level(log_level)
        .with_timestamp_format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .init()?;

    info!("Starting Met Harvest");
    let config = load_config(&cli)?;
    let layout = OutputLayout::new(&cli.outfile);
    info!("Output table: {}", layout.outfile().display());
    info!("Temporary directory: {}", layout.tmp_dir().display());

    if cli.merge_only {
        info!("Merge-only mode: consolidating existing partition files");
        let (merge, missing) = consolidate(&layout, &config.id_column)
            .with_context(|| format!("Failed to merge partition files into {}", layout.outfile().display()))?;
        info!("-------------------- FINAL SUMMARY --------------------");
        log_merge_summary(&merge, &missing, &layout);
        info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
        info!("-------------------------------------------------------");
        return Ok(());
    }

    let database = cli
        .database
        .as_ref()
        .context("--database is required unless --merge-only is given")?;
    info!("Loading identifiers from: {}", database.display());
    let ids = load_identifiers(database)
        .with_context(|| format!("Failed to load identifiers from {}", database.display()))?;
    let resume_after = cli.resume.as_deref().map(Identifier::from);

    info!(
        "Workers: {}, checkpoint every {} items, delay {}-{}s",
        config.workers, config.flush_every, config.delay.min_secs, config.delay.max_secs
    );
    let fetcher = MetPageFetcher::new(&config).context("Failed to set up the page fetcher")?;
    let options = HarvestOptions {
        layout: layout.clone(),
        workers: config.workers,
        resume_after,
        settings: WorkerSettings {
            flush_every: config.flush_every,
            throttle: Throttle::new(config.delay),
        },
        id_column: config.id_column.clone(),
        show_progress: !cli.no_progress,
    };

    let report = match run(&ids, &fetcher, &options) {
        Ok(report) => report,
        Err(e) => {
            error!("Harvest aborted: {}", e);
            return Err(e).context("Harvest run failed");
        }
    };

    info!("-------------------- FINAL SUMMARY --------------------");
    info!("Total execution time: {}", format_elapsed(start_time.elapsed()));
    log_run_summary(&report);
    log_merge_summary(&report.merge, &report.missing, &layout);
    info!("Harvest finished.");
    info!("-------------------------------------------------------");

    if !report.all_partitions_succeeded() {
        std::process::exit(1);
    }

    Ok(())
}
