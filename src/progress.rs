//! Terminal progress bars for active transfers

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::LazyLock;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::trace;

use crate::downloader::{Progress, TransferStatus};

const BAR_TEMPLATE: &str =
    "{msg:30} [{bar:40.cyan/blue}] {percent:>3}% {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";
const SPINNER_TEMPLATE: &str = "{msg:30} {spinner} {bytes} ({bytes_per_sec})";

static BAR_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
});

static SPINNER_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// Owns the bar area; one bar per transfer that actually starts streaming
#[derive(Clone)]
pub struct ProgressBoard {
    multi: MultiProgress,
}

impl ProgressBoard {
    pub fn new(visible: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stdout()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
        }
    }

    pub fn hidden() -> Self {
        Self::new(false)
    }

    /// Drive a bar from a transfer's progress channel until the sender is dropped
    pub fn track(&self, label: String, mut rx: mpsc::Receiver<Progress>) -> JoinHandle<()> {
        let multi = self.multi.clone();
        tokio::spawn(async move {
            let mut bar: Option<ProgressBar> = None;

            while let Some(progress) = rx.recv().await {
                let pb = bar.get_or_insert_with(|| {
                    let pb = match progress.total_size {
                        Some(len) => ProgressBar::new(len).with_style(BAR_STYLE.clone()),
                        None => ProgressBar::no_length().with_style(SPINNER_STYLE.clone()),
                    };
                    multi.add(pb.with_message(label.clone()))
                });

                match progress.percentage() {
                    Some(percentage) => trace!(
                        path = ?progress.file_path,
                        bytes = progress.downloaded,
                        total = progress.total_size,
                        percentage,
                        "Download progress"
                    ),
                    None => trace!(
                        path = ?progress.file_path,
                        bytes = progress.downloaded,
                        "Download progress (size unknown)"
                    ),
                }

                pb.set_position(progress.downloaded);
                if progress.is_complete() {
                    match progress.status {
                        TransferStatus::Failed(_) => pb.abandon(),
                        _ => pb.finish_and_clear(),
                    }
                }
            }

            if let Some(pb) = bar.filter(|pb| !pb.is_finished()) {
                pb.finish_and_clear();
            }
        })
    }
}
