//! Orchestration: partition, fetch in parallel with checkpointing, then merge.

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::checkpoint::{CheckpointStore, CheckpointWriter, OutputLayout, WriterStats};
use crate::error::{HarvestError, Result};
use crate::fetch::Fetcher;
use crate::identifier::Identifier;
use crate::merge::{aggregate_missing, merge_partitions, MergeReport, MissingReport};
use crate::partition::partition;
use crate::progress::ProgressReporter;
use crate::worker::{run_partition, PartitionOutcome, WorkerSettings};

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub layout: OutputLayout,
    pub workers: usize,
    pub resume_after: Option<Identifier>,
    pub settings: WorkerSettings,
    pub id_column: String,
    pub show_progress: bool,
}

/// A partition whose worker stopped early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFailure {
    pub partition: usize,
    pub message: String,
}

#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub identifiers: usize,
    pub completed: Vec<PartitionOutcome>,
    pub failed: Vec<PartitionFailure>,
    pub writer: WriterStats,
    pub merge: MergeReport,
    pub missing: MissingReport,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.completed.iter().map(|o| o.processed).sum()
    }

    pub fn fetch_failures(&self) -> usize {
        self.completed.iter().map(|o| o.fetch_failures).sum()
    }

    pub fn all_partitions_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs the whole fetch, checkpoint, and merge cycle over `ids`.
///
/// An unknown resume point or a failed merge is fatal. A partition that fails
/// mid-run is reported in [`RunReport::failed`] while the other partitions run
/// to completion and everything checkpointed so far is merged.
pub fn run(ids: &[Identifier], fetcher: &dyn Fetcher, options: &HarvestOptions) -> Result<RunReport> {
    let partitions = partition(ids, options.workers, options.resume_after.as_ref())?;
    let sizes: Vec<usize> = partitions.iter().map(|p| p.len()).collect();
    let remaining: usize = sizes.iter().sum();
    match &options.resume_after {
        Some(resume) => info!("Resuming after {}: {} of {} identifiers remain", resume, remaining, ids.len()),
        None => info!("Fetching {} identifiers", remaining),
    }
    info!("Partition sizes across {} workers: {:?}", options.workers, sizes);

    let store = CheckpointStore::new(options.layout.clone(), options.id_column.clone());
    let writer = CheckpointWriter::spawn(store, options.workers)?;
    let progress = if options.show_progress {
        ProgressReporter::new(&sizes)
    } else {
        ProgressReporter::hidden(&sizes)
    };

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers)
        .thread_name(|i| format!("harvest-worker-{}", i))
        .build()
        .map_err(|e| HarvestError::Configuration(format!("failed to build worker pool: {}", e)))?;

    let results: Vec<(usize, Result<PartitionOutcome>)> = pool.install(|| {
        partitions
            .par_iter()
            .with_max_len(1)
            .map(|part| {
                let worker_progress = progress.worker(part.index);
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_partition(part, fetcher, &writer, &options.settings, &worker_progress)
                }))
                .unwrap_or_else(|payload| {
                    Err(HarvestError::WorkerPanicked {
                        partition: part.index,
                        message: panic_message(payload),
                    })
                });
                match &result {
                    Ok(_) => worker_progress.complete(),
                    Err(_) => worker_progress.fail(),
                }
                (part.index, result)
            })
            .collect()
    });
    progress.finish();
    let writer_stats = writer.shutdown()?;

    let mut report = RunReport {
        identifiers: remaining,
        writer: writer_stats,
        ..RunReport::default()
    };
    for (index, result) in results {
        match result {
            Ok(outcome) => report.completed.push(outcome),
            Err(e) => {
                error!("Partition {} failed: {}", index, e);
                report.failed.push(PartitionFailure {
                    partition: index,
                    message: e.to_string(),
                });
            }
        }
    }
    if !report.failed.is_empty() {
        warn!(
            "{} of {} partitions failed; merging whatever was checkpointed",
            report.failed.len(),
            partitions.len()
        );
    }

    let (merge, missing) = consolidate(&options.layout, &options.id_column)?;
    report.merge = merge;
    report.missing = missing;
    Ok(report)
}

/// Merges existing partition temporaries into the final artifacts without fetching anything.
pub fn consolidate(layout: &OutputLayout, id_column: &str) -> Result<(MergeReport, MissingReport)> {
    let merge = merge_partitions(layout, id_column)?;
    let missing = aggregate_missing(layout)?;
    remove_tmp_dir(layout);
    Ok((merge, missing))
}

fn remove_tmp_dir(layout: &OutputLayout) {
    let tmp_dir = layout.tmp_dir();
    if !tmp_dir.exists() {
        return;
    }
    match fs::remove_dir(tmp_dir) {
        Ok(()) => debug!("Removed {}", tmp_dir.display()),
        Err(e) => warn!("Leaving {} in place: {}", tmp_dir.display(), e),
    }
}
