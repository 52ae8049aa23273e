//! Progress bar utilities for CLI transfers

use bgdl_types::{TransferEvent, TransferId};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;

/// Bar length; progress arrives as a fraction
const BAR_SCALE: u64 = 1000;

/// Manages progress bars for multiple transfers
pub struct TransferProgress {
    multi: MultiProgress,
    bars: HashMap<TransferId, ProgressBar>,
}

impl TransferProgress {
    pub fn new(visible: bool) -> Self {
        let multi = if visible {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self {
            multi,
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a transfer
    pub fn add_transfer(&mut self, id: TransferId) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(BAR_SCALE));

        if let Ok(bar_style) = ProgressStyle::default_bar()
            .template("{spinner:.green} #{prefix} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
        {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }
        pb.set_prefix(id.to_string());

        self.bars.insert(id, pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &TransferEvent) {
        let Some(pb) = event.id().and_then(|id| self.bars.get(&id)) else {
            return;
        };

        match event {
            TransferEvent::Progress { fraction, .. } => {
                pb.set_position((fraction * BAR_SCALE as f64).round() as u64);
            }

            TransferEvent::PreviousDownloadDetected { .. } => {
                pb.set_message(format!("{} Picked up from last run", style("↻").cyan()));
            }

            TransferEvent::Completed { .. } => {
                pb.set_position(BAR_SCALE);
                pb.finish_with_message(format!("{} Download complete", style("✓").green().bold()));
            }

            TransferEvent::Paused { .. } => {
                pb.abandon_with_message(format!("{} Paused", style("⏸").yellow()));
            }

            TransferEvent::Error { message, .. } => {
                pb.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    message
                ));
            }
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}
