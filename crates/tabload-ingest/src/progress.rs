//! Terminal progress bars, one per source

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::report::{RunEvent, RunObserver};

const BAR_TEMPLATE: &str =
    "{prefix:.bold} {spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}";

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Draws a bar per source and advances it on every committed batch
#[derive(Debug, Default)]
pub struct ProgressReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_bar(&self, source: &str, f: impl FnOnce(&ProgressBar)) {
        let Ok(bars) = self.bars.lock() else {
            return;
        };
        if let Some(bar) = bars.get(source) {
            f(bar);
        }
    }
}

impl RunObserver for ProgressReporter {
    fn observe(&self, event: &RunEvent) {
        match event {
            RunEvent::Extracted { source, records } => {
                let bar = self.multi.add(ProgressBar::new(*records as u64));
                bar.set_style(bar_style());
                bar.set_prefix(source.clone());
                bar.set_message("normalizing");
                if let Ok(mut bars) = self.bars.lock() {
                    bars.insert(source.clone(), bar);
                }
            },
            RunEvent::Transformed { source } => self.with_bar(source, |bar| bar.set_message("loading")),
            RunEvent::BatchInserted {
                source,
                running_total,
                ..
            } => self.with_bar(source, |bar| bar.set_position(*running_total as u64)),
            RunEvent::JobCompleted { source, inserted, .. } => self.with_bar(source, |bar| {
                bar.finish_with_message(format!("done, {} inserted", inserted))
            }),
            RunEvent::JobFailed { source, stage, .. } => self.with_bar(source, |bar| {
                let stage = stage.map(|s| s.as_str()).unwrap_or("unknown");
                bar.abandon_with_message(format!("failed during {}", stage))
            }),
            _ => {},
        }
    }
}
