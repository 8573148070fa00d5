use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str = "{prefix:>10} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}";

/// One progress bar per worker, stacked in worker order.
pub struct ProgressReporter {
    _multi: MultiProgress,
    bars: Vec<ProgressBar>,
}

impl ProgressReporter {
    pub fn new(partition_sizes: &[usize]) -> Self {
        Self::with_target(partition_sizes, ProgressDrawTarget::stderr())
    }

    /// Counts progress without drawing anything.
    pub fn hidden(partition_sizes: &[usize]) -> Self {
        Self::with_target(partition_sizes, ProgressDrawTarget::hidden())
    }

    fn with_target(partition_sizes: &[usize], target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .expect("Failed to create progress bar template")
            .progress_chars("=> ");
        let bars = partition_sizes
            .iter()
            .enumerate()
            .map(|(i, &size)| {
                let bar = multi.add(ProgressBar::new(size as u64));
                bar.set_style(style.clone());
                bar.set_prefix(format!("Worker {}", i + 1));
                bar
            })
            .collect();
        Self { _multi: multi, bars }
    }

    /// Handle for worker `partition`. Updates through it never block on drawing.
    pub fn worker(&self, partition: usize) -> WorkerProgress {
        WorkerProgress {
            bar: self.bars.get(partition).cloned().unwrap_or_else(ProgressBar::hidden),
        }
    }

    pub fn finish(&self) {
        for bar in &self.bars {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
    }
}

#[derive(Clone)]
pub struct WorkerProgress {
    bar: ProgressBar,
}

impl WorkerProgress {
    pub fn advance(&self) {
        self.bar.inc(1);
    }

    pub fn note(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
    }

    pub fn complete(&self) {
        self.bar.finish_with_message("done");
    }

    pub fn fail(&self) {
        self.bar.abandon_with_message("failed");
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }
}
