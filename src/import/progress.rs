//! Progress tracking for streamed dump files

use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use super::source::IngestStats;
use crate::util::truncate_str;

/// Progress tracker for one file being imported
pub struct ImportProgress {
    /// Progress bar (None if running in quiet mode)
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
    records: AtomicU64,
    errors: AtomicU64,
    source_path: PathBuf,
    cancelled: AtomicBool,
}

impl ImportProgress {
    /// Create a new progress tracker
    pub fn new(source_path: PathBuf, quiet: bool) -> Self {
        let progress_bar = if !quiet {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} [{elapsed_precise}] {pos} records {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            let name = source_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            pb.set_message(truncate_str(&name, 40));
            Some(pb)
        } else {
            None
        };

        Self {
            progress_bar,
            start_time: Instant::now(),
            records: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            source_path,
            cancelled: AtomicBool::new(false),
        }
    }

    /// Count one record handed to the writer
    pub fn record_processed(&self) {
        let processed = self.records.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(ref pb) = self.progress_bar {
            // Redrawing on every record would dominate the parse loop
            if processed % 10_000 == 0 {
                pb.set_position(processed);
            }
        }
    }

    /// Count one element that could not be decoded
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> IngestStats {
        IngestStats {
            records: self.records.load(Ordering::Relaxed),
            skipped: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Records per second since the tracker was created
    pub fn rate(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.records.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        if let Some(ref pb) = self.progress_bar {
            pb.abandon_with_message("Cancelled");
        }
    }

    /// Finish the progress bar
    pub fn finish(&self) {
        let stats = self.get_stats();
        if let Some(ref pb) = self.progress_bar {
            pb.set_position(stats.records);
            pb.finish_with_message(format!(
                "{}: {} records, {} skipped, {:.1} rec/s",
                self.source_path.display(),
                stats.records,
                stats.skipped,
                self.rate()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_tracking() {
        let progress = ImportProgress::new(PathBuf::from("/tmp/AS_ADDROBJ_1.XML"), true);
        progress.record_processed();
        progress.record_processed();
        progress.record_error();

        let stats = progress.get_stats();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.skipped, 1);
        progress.finish();
    }

    #[test]
    fn test_cancellation() {
        let progress = ImportProgress::new(PathBuf::from("/tmp/AS_HOUSE_1.XML"), true);
        assert!(!progress.is_cancelled());
        progress.cancel();
        assert!(progress.is_cancelled());
    }
}
