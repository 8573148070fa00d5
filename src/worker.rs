use std::mem;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;

use crate::checkpoint::{CheckpointBatch, CheckpointSink};
use crate::config::DelayConfig;
use crate::error::Result;
use crate::fetch::Fetcher;
use crate::partition::Partition;
use crate::progress::WorkerProgress;
use crate::record::FetchedItem;

#[derive(Debug, Clone, Copy)]
pub struct Throttle {
    min_secs: f64,
    max_secs: f64,
}

impl Throttle {
    pub fn new(delay: DelayConfig) -> Self {
        Self {
            min_secs: delay.min_secs,
            max_secs: delay.max_secs,
        }
    }

    pub fn none() -> Self {
        Self::new(DelayConfig::none())
    }

    pub fn next_delay(&self) -> Duration {
        let secs = if self.max_secs > self.min_secs {
            rand::thread_rng().gen_range(self.min_secs..=self.max_secs)
        } else {
            self.min_secs
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub flush_every: usize,
    pub throttle: Throttle,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PartitionOutcome {
    pub partition: usize,
    pub processed: usize,
    pub fetch_failures: usize,
    pub flushes: usize,
}

/// A flush error aborts this partition only; fetch failures never do.
pub fn run_partition(
    partition: &Partition,
    fetcher: &dyn Fetcher,
    sink: &dyn CheckpointSink,
    settings: &WorkerSettings,
    progress: &WorkerProgress,
) -> Result<PartitionOutcome> {
    let flush_every = settings.flush_every.max(1);
    let mut outcome = PartitionOutcome {
        partition: partition.index,
        ..PartitionOutcome::default()
    };
    let mut buffer = CheckpointBatch::default();

    for id in &partition.ids {
        let item = match fetcher.fetch(id) {
            Ok(mut item) => {
                if item.record.id != *id {
                    warn!("Fetcher answered {} for requested {}; keeping the requested id", item.record.id, id);
                    item.record.id = id.clone();
                }
                item
            }
            Err(e) => {
                warn!("Partition {}: fetch failed for {}: {}", partition.index, id, e);
                outcome.fetch_failures += 1;
                FetchedItem::unavailable(id.clone())
            }
        };
        settings.throttle.pause();

        buffer.push(item);
        outcome.processed += 1;
        progress.advance();

        if outcome.processed % flush_every == 0 {
            sink.flush(partition.index, mem::take(&mut buffer))?;
            outcome.flushes += 1;
            progress.note(format!("checkpoint after {}", id));
        }
    }

    if !buffer.is_empty() {
        sink.flush(partition.index, buffer)?;
        outcome.flushes += 1;
    }
    debug!(
        "Partition {} finished: {} items, {} fetch failures, {} flushes",
        partition.index, outcome.processed, outcome.fetch_failures, outcome.flushes
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarvestError;
    use crate::fetch::FetchError;
    use crate::identifier::Identifier;
    use crate::progress::ProgressReporter;
    use crate::record::{MissingFlags, Record};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        flushes: Mutex<Vec<(usize, Vec<Identifier>)>>,
        fail_on_flush: Option<usize>,
    }

    impl CheckpointSink for RecordingSink {
        fn flush(&self, partition: usize, batch: CheckpointBatch) -> Result<()> {
            let mut flushes = self.flushes.lock().unwrap();
            if Some(flushes.len()) == self.fail_on_flush {
                return Err(HarvestError::WriterClosed);
            }
            flushes.push((partition, batch.records.into_iter().map(|r| r.id).collect()));
            Ok(())
        }
    }

    fn partition_of(n: u64) -> Partition {
        Partition {
            index: 0,
            ids: (1..=n).map(Identifier::Numeric).collect(),
        }
    }

    fn ok_fetch(id: &Identifier) -> std::result::Result<FetchedItem, FetchError> {
        Ok(FetchedItem {
            record: Record::new(id.clone()).with_field("title", format!("Object {}", id)),
            missing: MissingFlags::none(),
        })
    }

    fn settings(flush_every: usize) -> WorkerSettings {
        WorkerSettings {
            flush_every,
            throttle: Throttle::none(),
        }
    }

    #[test]
    fn flushes_every_k_items_and_at_end() {
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::hidden(&[25]);
        let progress = reporter.worker(0);
        let outcome = run_partition(&partition_of(25), &ok_fetch, &sink, &settings(10), &progress).unwrap();

        assert_eq!(outcome.processed, 25);
        assert_eq!(outcome.flushes, 3);
        assert_eq!(progress.position(), 25);
        let sizes: Vec<usize> = sink.flushes.lock().unwrap().iter().map(|(_, ids)| ids.len()).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn exact_multiple_skips_empty_final_flush() {
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::hidden(&[20]);
        let outcome = run_partition(&partition_of(20), &ok_fetch, &sink, &settings(10), &reporter.worker(0)).unwrap();
        assert_eq!(outcome.flushes, 2);
    }

    #[test]
    fn fetch_failure_becomes_flagged_placeholder() {
        let fetch = |id: &Identifier| {
            if *id == Identifier::Numeric(2) {
                Err(FetchError::Http {
                    url: "https://example.invalid/2".into(),
                    reason: "connection reset".into(),
                })
            } else {
                ok_fetch(id)
            }
        };
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::hidden(&[3]);
        let outcome = run_partition(&partition_of(3), &fetch, &sink, &settings(10), &reporter.worker(0)).unwrap();

        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.fetch_failures, 1);
        let flushes = sink.flushes.lock().unwrap();
        assert_eq!(flushes[0].1, vec![Identifier::Numeric(1), Identifier::Numeric(2), Identifier::Numeric(3)]);
    }

    #[test]
    fn flush_error_aborts_partition() {
        let sink = RecordingSink {
            fail_on_flush: Some(1),
            ..RecordingSink::default()
        };
        let reporter = ProgressReporter::hidden(&[25]);
        let err = run_partition(&partition_of(25), &ok_fetch, &sink, &settings(10), &reporter.worker(0)).unwrap_err();
        assert!(matches!(err, HarvestError::WriterClosed));
        assert_eq!(sink.flushes.lock().unwrap().len(), 1);
    }

    #[test]
    fn pauses_after_every_fetch_including_failures() {
        let fetch = |id: &Identifier| -> std::result::Result<FetchedItem, FetchError> {
            Err(FetchError::Http {
                url: format!("https://example.invalid/{}", id),
                reason: "HTTP status 404".into(),
            })
        };
        let throttled = WorkerSettings {
            flush_every: 10,
            throttle: Throttle::new(DelayConfig { min_secs: 0.05, max_secs: 0.05 }),
        };
        let sink = RecordingSink::default();
        let reporter = ProgressReporter::hidden(&[5]);

        let started = std::time::Instant::now();
        let outcome = run_partition(&partition_of(5), &fetch, &sink, &throttled, &reporter.worker(0)).unwrap();
        let elapsed = started.elapsed();

        assert_eq!(outcome.fetch_failures, 5);
        assert!(elapsed >= Duration::from_millis(250), "elapsed {:?}", elapsed);
    }

    #[test]
    fn throttle_stays_within_bounds() {
        let throttle = Throttle::new(DelayConfig { min_secs: 0.25, max_secs: 0.5 });
        for _ in 0..100 {
            let delay = throttle.next_delay();
            assert!(delay >= Duration::from_millis(250) && delay <= Duration::from_millis(500));
        }
        assert!(Throttle::none().next_delay().is_zero());
    }
}
