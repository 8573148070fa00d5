//! Concurrent metadata harvester for museum catalog pages.
//!
//! Identifiers are dealt round-robin to a fixed pool of workers. Each worker
//! fetches its items one at a time, checkpoints progress to partition-scoped
//! files every few items, and the partitions are merged into a single CSV
//! table (union of all discovered columns) plus one missing-info list per
//! diagnostic category.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod fetch;
pub mod identifier;
pub mod merge;
pub mod met;
pub mod partition;
pub mod pipeline;
pub mod progress;
pub mod record;
pub mod worker;

pub use checkpoint::{CheckpointBatch, CheckpointSink, CheckpointStore, CheckpointWriter, OutputLayout};
pub use config::{DelayConfig, HarvestConfig};
pub use error::HarvestError;
pub use fetch::{FetchError, Fetcher};
pub use identifier::{load_identifiers, Identifier};
pub use met::MetPageFetcher;
pub use pipeline::{consolidate, run, HarvestOptions, RunReport};
pub use record::{FetchedItem, MissingCategory, MissingFlags, Record};
pub use worker::{Throttle, WorkerSettings};
