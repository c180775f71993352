//! Terminal progress for pipeline runs.

use std::time::Duration;

use dnacommit_core::ProgressReporter;
use dnacommit_shared::{ItemId, Stage, StageCounts};
use indicatif::{ProgressBar, ProgressStyle};

/// Per-stage progress bar using indicatif.
pub(crate) struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    pub(crate) fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:>8} [{bar:30}] {pos}/{len} {msg}")
            .map(|s| {
                s.progress_chars("=> ")
                    .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            })
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: Stage, eligible: usize) {
        self.bar.reset();
        self.bar.set_length(eligible as u64);
        self.bar.set_prefix(stage.to_string());
        self.bar.set_message("");
    }

    fn item_finished(&self, _stage: Stage, id: &ItemId, outcome: &str) {
        // Collection does not know its item count up front.
        if self.bar.position() >= self.bar.length().unwrap_or(0) {
            self.bar.inc_length(1);
        }
        self.bar.set_message(format!("{id} {outcome}"));
        self.bar.inc(1);
    }

    fn stage_finished(&self, stage: Stage, counts: &StageCounts) {
        self.bar.println(format!(
            "  {stage:<8} accepted {:>3}  rejected {:>3}  retried {:>3}  errored {:>3}",
            counts.accepted, counts.rejected, counts.retried, counts.errored
        ));
    }
}
