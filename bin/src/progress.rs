//! Download progress display.

use indicatif::{ProgressBar, ProgressStyle};
use kiln_jobs::{ItemCallback, ItemReport, ItemStatus, Report};
use std::sync::Arc;

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} items ({percent}%) {msg}";

/// Progress bar advanced once per finished item.
pub(crate) struct JobProgress {
    bar: ProgressBar,
}

impl JobProgress {
    pub(crate) fn new(items: usize, quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            let style = ProgressStyle::with_template(TEMPLATE)
                .map_or_else(|_| ProgressStyle::default_bar(), |s| s.progress_chars("=>-"));
            let pb = ProgressBar::new(items as u64);
            pb.set_style(style);
            pb
        };
        Self { bar }
    }

    /// Returns the per-item callback for the job runner.
    pub(crate) fn callback(&self) -> ItemCallback {
        let bar = self.bar.clone();
        Arc::new(move |item: &ItemReport| {
            if item.status == ItemStatus::Failed {
                bar.println(format!(
                    "  failed: {} ({})",
                    item.name,
                    item.error.as_deref().unwrap_or("unknown error")
                ));
            }
            bar.set_message(item.name.clone());
            bar.inc(1);
        })
    }

    /// Finishes the bar with a one-line summary of `report`.
    pub(crate) fn finish(&self, report: Option<&Report>) {
        let Some(report) = report else {
            self.bar.abandon();
            return;
        };
        let counts = report.counts();
        let mut message = format!(
            "{}: {} fetched, {} skipped",
            report.outcome, counts.fetched, counts.skipped
        );
        if counts.failed > 0 {
            message.push_str(&format!(", {} failed", counts.failed));
        }
        if counts.cancelled > 0 {
            message.push_str(&format!(", {} cancelled", counts.cancelled));
        }
        self.bar.finish_with_message(message);
    }
}
