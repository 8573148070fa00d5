use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Barrier;

use met_harvest::checkpoint::{CheckpointStore, CheckpointWriter};
use met_harvest::partition::Partition;
use met_harvest::progress::ProgressReporter;
use met_harvest::worker::run_partition;
use met_harvest::{
    consolidate, run, FetchError, FetchedItem, HarvestError, HarvestOptions, Identifier, MissingCategory,
    MissingFlags, OutputLayout, Record, Throttle, WorkerSettings,
};

fn options(dir: &Path, workers: usize, flush_every: usize) -> HarvestOptions {
    HarvestOptions {
        layout: OutputLayout::new(dir.join("harvest.csv")),
        workers,
        resume_after: None,
        settings: WorkerSettings {
            flush_every,
            throttle: Throttle::none(),
        },
        id_column: "met_id".to_string(),
        show_progress: false,
    }
}

fn ids(range: std::ops::RangeInclusive<u64>) -> Vec<Identifier> {
    range.map(Identifier::Numeric).collect()
}

fn full_item(id: &Identifier) -> FetchedItem {
    FetchedItem {
        record: Record::new(id.clone())
            .with_field("title", format!("Object {}", id))
            .with_field("description", format!("About {}", id))
            .with_field("keywords", "Art"),
        missing: MissingFlags::none(),
    }
}

fn read_table(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let mut reader = csv::Reader::from_path(path).unwrap();
    let header = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}

fn column(header: &[String], name: &str) -> usize {
    header.iter().position(|h| h == name).unwrap()
}

#[test]
fn four_items_two_workers_with_one_failure() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 2, 10);
    let fetcher = |id: &Identifier| -> Result<FetchedItem, FetchError> {
        if *id == Identifier::Numeric(3) {
            Err(FetchError::Http {
                url: format!("https://catalog.test/{}", id),
                reason: "HTTP status 503".to_string(),
            })
        } else {
            Ok(full_item(id))
        }
    };

    let report = run(&ids(1..=4), &fetcher, &opts).unwrap();
    assert!(report.all_partitions_succeeded());
    assert_eq!(report.processed(), 4);
    assert_eq!(report.fetch_failures(), 1);

    let (header, rows) = read_table(opts.layout.outfile());
    assert_eq!(header, vec!["met_id", "description", "keywords", "title"]);
    let order: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(order, vec!["1", "3", "2", "4"]);

    let failed_row = &rows[1];
    assert!(failed_row[1..].iter().all(String::is_empty));
    assert_eq!(rows[2][column(&header, "title")], "Object 2");

    let no_description = fs::read_to_string(opts.layout.global_missing_file(MissingCategory::Description)).unwrap();
    assert_eq!(no_description, "3\n");
    assert_eq!(report.missing.count(MissingCategory::Keywords), 1);

    assert!(!opts.layout.tmp_dir().exists());
}

#[test]
fn divergent_schemas_merge_to_union() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 2, 3);
    let fetcher = |id: &Identifier| -> Result<FetchedItem, FetchError> {
        let mut record = Record::new(id.clone()).with_field("title", format!("Object {}", id));
        if let Identifier::Numeric(n) = id {
            if n % 2 == 0 {
                record.insert("medium", "Bronze");
            }
        }
        Ok(FetchedItem {
            record,
            missing: MissingFlags::none(),
        })
    };

    let report = run(&ids(1..=7), &fetcher, &opts).unwrap();
    assert_eq!(report.merge.columns, vec!["met_id", "medium", "title"]);

    let (header, rows) = read_table(opts.layout.outfile());
    assert_eq!(rows.len(), 7);
    let medium = column(&header, "medium");
    for row in &rows {
        let n: u64 = row[0].parse().unwrap();
        let expected = if n % 2 == 0 { "Bronze" } else { "" };
        assert_eq!(row[medium], expected, "row {}", n);
    }
    // Partition 0 holds the odd ids, partition 1 the even ones, each in input order.
    let order: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(order, vec!["1", "3", "5", "7", "2", "4", "6"]);
}

#[test]
fn failing_partition_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 3, 2);
    let fetcher = |id: &Identifier| -> Result<FetchedItem, FetchError> {
        if *id == Identifier::Numeric(8) {
            panic!("parser bug on {}", id);
        }
        Ok(full_item(id))
    };

    // Partition 1 gets 2, 5, 8, 11: it checkpoints 2 and 5, then dies on 8.
    let report = run(&ids(1..=12), &fetcher, &opts).unwrap();
    assert!(!report.all_partitions_succeeded());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].partition, 1);
    assert!(report.failed[0].message.contains("parser bug"));
    assert_eq!(report.completed.len(), 2);

    let (_, rows) = read_table(opts.layout.outfile());
    let mut merged: Vec<u64> = rows.iter().map(|r| r[0].parse().unwrap()).collect();
    merged.sort();
    assert_eq!(merged, vec![1, 2, 3, 4, 5, 6, 7, 9, 10, 12]);
}

#[test]
fn crash_loses_only_unflushed_items_and_resume_completes() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 1, 10);
    let layout = opts.layout.clone();

    let crashing = |id: &Identifier| -> Result<FetchedItem, FetchError> {
        if *id == Identifier::Numeric(22) {
            panic!("process killed");
        }
        Ok(full_item(id))
    };
    let partition = Partition {
        index: 0,
        ids: ids(1..=25),
    };
    let writer = CheckpointWriter::spawn(CheckpointStore::new(layout.clone(), "met_id"), 1).unwrap();
    let reporter = ProgressReporter::hidden(&[partition.len()]);
    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        run_partition(&partition, &crashing, &writer, &opts.settings, &reporter.worker(0))
    }));
    assert!(crashed.is_err());
    assert_eq!(writer.shutdown().unwrap().rows_written, 20);

    let (_, durable) = read_table(&layout.partition_file(0));
    assert_eq!(durable.len(), 20);
    assert_eq!(durable.last().unwrap()[0], "20");

    let resumed = HarvestOptions {
        resume_after: Some(Identifier::Numeric(20)),
        ..opts.clone()
    };
    let report = run(&ids(1..=25), &full_item_fetcher, &resumed).unwrap();
    assert_eq!(report.processed(), 5);

    let (_, rows) = read_table(layout.outfile());
    let merged: Vec<u64> = rows.iter().map(|r| r[0].parse().unwrap()).collect();
    assert_eq!(merged, (1..=25).collect::<Vec<u64>>());
}

fn full_item_fetcher(id: &Identifier) -> Result<FetchedItem, FetchError> {
    Ok(full_item(id))
}

#[test]
fn unknown_resume_point_aborts_before_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let opts = HarvestOptions {
        resume_after: Some(Identifier::Numeric(99)),
        ..options(dir.path(), 2, 10)
    };

    let err = run(&ids(1..=4), &full_item_fetcher, &opts).unwrap_err();
    assert!(matches!(err, HarvestError::ResumePointNotFound(Identifier::Numeric(99))));
    assert!(!opts.layout.tmp_dir().exists());
    assert!(!opts.layout.outfile().exists());
}

#[test]
fn partitions_are_fetched_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 4, 10);
    // Ids 1..=4 open the four partitions; none gets past the barrier until all four are in flight.
    let all_started = Barrier::new(4);
    let fetcher = |id: &Identifier| -> Result<FetchedItem, FetchError> {
        if let Identifier::Numeric(n) = id {
            if *n <= 4 {
                all_started.wait();
            }
        }
        Ok(full_item(id))
    };

    let report = run(&ids(1..=8), &fetcher, &opts).unwrap();
    assert!(report.all_partitions_succeeded());
    assert_eq!(report.completed.len(), 4);
    assert_eq!(report.merge.rows, 8);
}

#[test]
fn more_workers_than_items_tolerates_empty_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path(), 5, 10);

    let report = run(&ids(1..=2), &full_item_fetcher, &opts).unwrap();
    assert!(report.all_partitions_succeeded());
    assert_eq!(report.merge.partitions_merged, 2);
    assert_eq!(report.merge.rows, 2);
}

#[test]
fn merge_only_retries_consolidation_from_leftovers() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path().join("harvest.csv"));
    fs::create_dir_all(layout.tmp_dir()).unwrap();
    fs::write(layout.partition_file(0), "met_id,title\n10,Cup\n").unwrap();
    fs::write(layout.partition_file(7), "met_id,title,medium\n11,Vase,Clay\n").unwrap();
    fs::write(layout.partition_missing_file(7, MissingCategory::Details), "11\n").unwrap();

    let (merge, missing) = consolidate(&layout, "met_id").unwrap();
    assert_eq!(merge.rows, 2);
    assert_eq!(missing.count(MissingCategory::Details), 1);
    assert_eq!(
        fs::read_to_string(layout.outfile()).unwrap(),
        "met_id,medium,title\n10,,Cup\n11,Clay,Vase\n"
    );
    assert!(!layout.tmp_dir().exists());
}
