//! Consolidation of partition checkpoints into the final table and global missing-info files.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, WriterBuilder};
use log::{debug, info, warn};

use crate::checkpoint::{with_suffix, OutputLayout};
use crate::error::{HarvestError, Result};
use crate::record::MissingCategory;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub partitions_merged: usize,
    pub rows: usize,
    pub columns: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MissingReport {
    pub counts: Vec<(MissingCategory, usize)>,
}

impl MissingReport {
    pub fn count(&self, category: MissingCategory) -> usize {
        self.counts
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

fn existing_partition_files(layout: &OutputLayout) -> Result<Vec<(usize, PathBuf)>> {
    Ok(layout
        .discover_partitions()?
        .into_iter()
        .map(|i| (i, layout.partition_file(i)))
        .filter(|(_, path)| path.is_file())
        .collect())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn union_columns(files: &[(usize, PathBuf)], id_column: &str) -> Result<Vec<String>> {
    let mut others = BTreeSet::new();
    for (_, path) in files {
        let mut reader = ReaderBuilder::new().from_path(path)?;
        let headers = reader.headers()?;
        if !headers.iter().any(|h| h == id_column) {
            return Err(HarvestError::MissingIdColumn(path.display().to_string(), id_column.to_string()));
        }
        others.extend(headers.iter().filter(|h| *h != id_column).map(str::to_string));
    }
    Ok(std::iter::once(id_column.to_string()).chain(others).collect())
}

/// Partition files are removed only after the staging table is renamed over the output.
pub fn merge_partitions(layout: &OutputLayout, id_column: &str) -> Result<MergeReport> {
    let files = existing_partition_files(layout)?;
    let columns = union_columns(&files, id_column)?;
    info!(
        "Merging {} partition files into {} ({} columns)",
        files.len(),
        layout.outfile().display(),
        columns.len()
    );

    ensure_parent(layout.outfile())?;
    let staging = with_suffix(layout.outfile(), "tmp");
    let written = write_table(&staging, &files, &columns)
        .and_then(|rows| fs::rename(&staging, layout.outfile()).map(|_| rows).map_err(HarvestError::from));
    let rows = match written {
        Ok(rows) => rows,
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&staging) {
                debug!("No staging file to clean up at {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }
    };

    for (index, path) in &files {
        if let Err(e) = fs::remove_file(path) {
            warn!("Could not remove partition file {} ({}): {}", index, path.display(), e);
        }
    }

    info!("Wrote {} rows to {}", rows, layout.outfile().display());
    Ok(MergeReport {
        partitions_merged: files.len(),
        rows,
        columns,
    })
}

fn write_table(staging: &Path, files: &[(usize, PathBuf)], columns: &[String]) -> Result<usize> {
    let mut writer = WriterBuilder::new().from_path(staging)?;
    writer.write_record(columns)?;

    let mut owners: HashMap<String, usize> = HashMap::new();
    let mut rows = 0;
    for (index, path) in files {
        let mut reader = ReaderBuilder::new().flexible(true).from_path(path)?;
        let headers = reader.headers()?.clone();
        let positions: Vec<Option<usize>> = columns
            .iter()
            .map(|column| headers.iter().position(|h| h == column.as_str()))
            .collect();
        let id_position = positions[0].unwrap_or(0);

        let mut partition_rows = 0;
        for row in reader.records() {
            let row = row?;
            let id = row.get(id_position).unwrap_or("").to_string();
            if let Some(first) = owners.insert(id.clone(), *index) {
                return Err(HarvestError::DuplicateIdentifier {
                    id,
                    first,
                    second: *index,
                    file: path.clone(),
                });
            }
            let cells = positions
                .iter()
                .map(|position| position.and_then(|p| row.get(p)).unwrap_or(""));
            writer.write_record(cells)?;
            partition_rows += 1;
        }
        debug!("Partition {} contributed {} rows", index, partition_rows);
        rows += partition_rows;
    }

    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(rows)
}

/// Concatenates each category's partition files, in partition order, into `<outfile>.<category>`.
pub fn aggregate_missing(layout: &OutputLayout) -> Result<MissingReport> {
    let partitions = layout.discover_partitions()?;
    ensure_parent(layout.outfile())?;
    let mut report = MissingReport::default();

    for category in MissingCategory::ALL {
        let sources: Vec<PathBuf> = partitions
            .iter()
            .map(|&i| layout.partition_missing_file(i, category))
            .filter(|path| path.is_file())
            .collect();

        let target = layout.global_missing_file(category);
        let staging = with_suffix(&target, "tmp");
        let mut out = BufWriter::new(File::create(&staging)?);
        let mut lines = 0;
        for source in &sources {
            for line in BufReader::new(File::open(source)?).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                writeln!(out, "{}", line)?;
                lines += 1;
            }
        }
        out.flush()?;
        out.get_ref().sync_all()?;
        drop(out);
        fs::rename(&staging, &target)?;

        for source in &sources {
            if let Err(e) = fs::remove_file(source) {
                warn!("Could not remove {}: {}", source.display(), e);
            }
        }
        info!("{}: {} identifiers", target.display(), lines);
        report.counts.push((category, lines));
    }
    Ok(report)
}
