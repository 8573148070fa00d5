//! Partition-scoped checkpoint files and the writer thread that serialises flushes.
//!
//! Each worker owns one partition file (`<tmp>/<base>.part<i>`) plus one file per
//! missing-info category (`<tmp>/<base>.part<i>.<category>`). All flushes go
//! through a single writer thread, so at most one checkpoint write is in flight.

use std::collections::{BTreeSet, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use glob::{glob, Pattern};
use log::{debug, error, info, warn};

use crate::error::{HarvestError, Result};
use crate::identifier::Identifier;
use crate::record::{FetchedItem, MissingCategory, MissingFlags, Record};

#[derive(Debug, Clone)]
pub struct OutputLayout {
    outfile: PathBuf,
    tmp_dir: PathBuf,
    base_name: String,
}

impl OutputLayout {
    pub fn new<P: AsRef<Path>>(outfile: P) -> Self {
        let outfile = outfile.as_ref().to_path_buf();
        let parent = match outfile.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let base_name = outfile
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "output".to_string());
        Self {
            tmp_dir: parent.join("tmp"),
            outfile,
            base_name,
        }
    }

    pub fn outfile(&self) -> &Path {
        &self.outfile
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn partition_file(&self, partition: usize) -> PathBuf {
        self.tmp_dir.join(format!("{}.part{}", self.base_name, partition))
    }

    pub fn partition_missing_file(&self, partition: usize, category: MissingCategory) -> PathBuf {
        self.tmp_dir
            .join(format!("{}.part{}.{}", self.base_name, partition, category.as_str()))
    }

    pub fn global_missing_file(&self, category: MissingCategory) -> PathBuf {
        with_suffix(&self.outfile, category.as_str())
    }

    pub fn discover_partitions(&self) -> Result<Vec<usize>> {
        let pattern = format!(
            "{}/{}.part*",
            Pattern::escape(&self.tmp_dir.to_string_lossy()),
            Pattern::escape(&self.base_name)
        );
        let prefix = format!("{}.part", self.base_name);
        let mut indexes = BTreeSet::new();
        let entries = glob(&pattern)
            .map_err(|e| HarvestError::Configuration(format!("bad temporary file pattern {}: {}", pattern, e)))?;
        for path in entries.filter_map(std::result::Result::ok) {
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => continue,
            };
            let suffix = match name.strip_prefix(&prefix) {
                Some(suffix) => suffix,
                None => continue,
            };
            let digits = suffix.split('.').next().unwrap_or("");
            match digits.parse::<usize>() {
                Ok(index) => {
                    indexes.insert(index);
                }
                Err(_) => debug!("Ignoring unrelated temporary file {}", path.display()),
            }
        }
        Ok(indexes.into_iter().collect())
    }
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[derive(Debug, Default, Clone)]
pub struct CheckpointBatch {
    pub records: Vec<Record>,
    pub missing: Vec<(Identifier, MissingFlags)>,
}

impl CheckpointBatch {
    pub fn push(&mut self, item: FetchedItem) {
        if !item.missing.is_empty() {
            self.missing.push((item.record.id.clone(), item.missing));
        }
        self.records.push(item.record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.missing.is_empty()
    }
}

pub trait CheckpointSink: Sync {
    /// Returns once the batch is on disk.
    fn flush(&self, partition: usize, batch: CheckpointBatch) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    layout: OutputLayout,
    id_column: String,
}

impl CheckpointStore {
    pub fn new(layout: OutputLayout, id_column: impl Into<String>) -> Self {
        Self {
            layout,
            id_column: id_column.into(),
        }
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn write(&self, partition: usize, batch: &CheckpointBatch) -> Result<()> {
        fs::create_dir_all(self.layout.tmp_dir())?;
        if !batch.records.is_empty() {
            self.write_records(&self.layout.partition_file(partition), &batch.records)?;
        }
        if !batch.missing.is_empty() {
            self.write_missing(partition, &batch.missing)?;
        }
        Ok(())
    }

    fn batch_columns(&self, records: &[Record]) -> Vec<String> {
        let fields: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| r.fields.keys().map(String::as_str))
            .filter(|name| *name != self.id_column)
            .collect();
        std::iter::once(self.id_column.as_str())
            .chain(fields)
            .map(str::to_string)
            .collect()
    }

    fn row_for(&self, record: &Record, header: &[String]) -> Vec<String> {
        header
            .iter()
            .map(|column| {
                if *column == self.id_column {
                    record.id.to_string()
                } else {
                    record.get(column).unwrap_or("").to_string()
                }
            })
            .collect()
    }

    fn write_records(&self, path: &Path, records: &[Record]) -> Result<()> {
        let batch_columns = self.batch_columns(records);

        if !path.exists() {
            let mut writer = WriterBuilder::new().from_path(path)?;
            writer.write_record(&batch_columns)?;
            for record in records {
                writer.write_record(self.row_for(record, &batch_columns))?;
            }
            return sync_writer(writer);
        }

        let mut reader = ReaderBuilder::new().from_path(path)?;
        let existing: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let known: HashSet<&str> = existing.iter().map(String::as_str).collect();
        let new_columns: Vec<String> = batch_columns
            .iter()
            .filter(|c| !known.contains(c.as_str()))
            .cloned()
            .collect();

        if new_columns.is_empty() {
            let file = OpenOptions::new().append(true).open(path)?;
            let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
            for record in records {
                writer.write_record(self.row_for(record, &existing))?;
            }
            return sync_writer(writer);
        }

        debug!(
            "Widening {} with {} new columns: {:?}",
            path.display(),
            new_columns.len(),
            new_columns
        );
        let old_rows: Vec<StringRecord> = reader.records().collect::<std::result::Result<_, _>>()?;
        drop(reader);

        let mut header = existing.clone();
        header.extend(new_columns.iter().cloned());
        let padding = new_columns.len();

        let staging = with_suffix(path, "tmp");
        let mut writer = WriterBuilder::new().from_path(&staging)?;
        writer.write_record(&header)?;
        for row in &old_rows {
            let padded = row.iter().chain(std::iter::repeat("").take(padding));
            writer.write_record(padded)?;
        }
        for record in records {
            writer.write_record(self.row_for(record, &header))?;
        }
        sync_writer(writer)?;
        fs::rename(&staging, path)?;
        Ok(())
    }

    fn write_missing(&self, partition: usize, missing: &[(Identifier, MissingFlags)]) -> Result<()> {
        for category in MissingCategory::ALL {
            let flagged: Vec<&Identifier> = missing
                .iter()
                .filter(|(_, flags)| flags.contains(category))
                .map(|(id, _)| id)
                .collect();
            if flagged.is_empty() {
                continue;
            }
            let path = self.layout.partition_missing_file(partition, category);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut out = BufWriter::new(file);
            for id in flagged {
                writeln!(out, "{}", id)?;
            }
            out.flush()?;
            out.get_ref().sync_data()?;
        }
        Ok(())
    }
}

fn sync_writer(mut writer: csv::Writer<File>) -> Result<()> {
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_data()?;
    Ok(())
}

struct FlushRequest {
    partition: usize,
    batch: CheckpointBatch,
    reply: Sender<Result<()>>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriterStats {
    pub flushes: usize,
    pub rows_written: usize,
    pub failed_flushes: usize,
}

/// Owns the [`CheckpointStore`] on a dedicated thread and serves flush requests in arrival order.
pub struct CheckpointWriter {
    sender: Sender<FlushRequest>,
    thread: JoinHandle<WriterStats>,
}

impl CheckpointWriter {
    pub fn spawn(store: CheckpointStore, capacity: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<FlushRequest>(capacity.max(1));
        let thread = thread::Builder::new()
            .name("checkpoint-writer".to_string())
            .spawn(move || {
                debug!("Checkpoint writer started for {}", store.layout().tmp_dir().display());
                let mut stats = WriterStats::default();
                for request in receiver {
                    let rows = request.batch.len();
                    let result = store.write(request.partition, &request.batch);
                    match &result {
                        Ok(()) => {
                            stats.flushes += 1;
                            stats.rows_written += rows;
                            debug!("Flushed {} rows for partition {}", rows, request.partition);
                        }
                        Err(e) => {
                            stats.failed_flushes += 1;
                            error!("Checkpoint flush for partition {} failed: {}", request.partition, e);
                        }
                    }
                    if request.reply.send(result).is_err() {
                        warn!("Partition {} stopped waiting for its flush result", request.partition);
                    }
                }
                stats
            })?;
        Ok(Self { sender, thread })
    }

    pub fn shutdown(self) -> Result<WriterStats> {
        drop(self.sender);
        let stats = self.thread.join().map_err(|_| HarvestError::WriterPanicked)?;
        info!(
            "Checkpoint writer finished: {} flushes, {} rows, {} failed",
            stats.flushes, stats.rows_written, stats.failed_flushes
        );
        Ok(stats)
    }
}

impl CheckpointSink for CheckpointWriter {
    fn flush(&self, partition: usize, batch: CheckpointBatch) -> Result<()> {
        let (reply, response) = bounded(1);
        self.sender
            .send(FlushRequest { partition, batch, reply })
            .map_err(|_| HarvestError::WriterClosed)?;
        response.recv().map_err(|_| HarvestError::WriterClosed)?
    }
}
