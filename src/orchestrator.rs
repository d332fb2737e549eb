//! Drives one run: ledger snapshot, manifest, then song and cover per item.
//!
//! Every target is checked against the ledger snapshot first; a target whose
//! `(artist, name, kind)` is already recorded is skipped without touching the
//! disk or the network. Everything else goes to the downloader, whose size
//! check short-circuits files that are already present. Failures stay local to
//! the target that hit them.

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::RunMode,
    downloader::{Downloader, TransferOutcome},
    ledger::{AssetKind, CompletedSet, Ledger},
    manifest::{DownloadItem, ManifestFetcher},
    progress::ProgressBoard,
};

const COVER_FILE: &str = "cover.png";

/// `<root>/<artist>/<name>.mp3` and `<root>/<artist>/cover.png`
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn artist_dir(&self, item: &DownloadItem) -> PathBuf {
        self.root.join(&item.artist)
    }

    pub fn target(&self, item: &DownloadItem, kind: AssetKind) -> TransferTarget {
        let dir = self.artist_dir(item);
        match kind {
            AssetKind::Song => TransferTarget {
                kind,
                source_url: item.song_url.clone(),
                destination: dir.join(format!("{}.mp3", item.name)),
            },
            // covers are shared by every song of the artist
            AssetKind::Cover => TransferTarget {
                kind,
                source_url: item.cover_url.clone(),
                destination: dir.join(COVER_FILE),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTarget {
    pub kind: AssetKind,
    pub source_url: String,
    pub destination: PathBuf,
}

/// Per-target tallies of a run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub items: usize,
    pub downloaded: usize,
    pub already_present: usize,
    pub skipped: usize,
    pub failed: usize,
    pub ledger_failures: usize,
    pub manifest_failed: bool,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.items += other.items;
        self.downloaded += other.downloaded;
        self.already_present += other.already_present;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.ledger_failures += other.ledger_failures;
        self.manifest_failed |= other.manifest_failed;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} items: {} downloaded, {} already present, {} skipped, {} failed",
            self.items, self.downloaded, self.already_present, self.skipped, self.failed
        )?;
        if self.ledger_failures > 0 {
            write!(f, ", {} not recorded", self.ledger_failures)?;
        }
        Ok(())
    }
}

/// Everything an item pipeline needs, cheap to clone into spawned tasks
#[derive(Clone)]
struct Pipeline {
    downloader: Arc<Downloader>,
    ledger: Ledger,
    layout: Arc<Layout>,
    progress: ProgressBoard,
    completed: Arc<CompletedSet>,
}

pub struct Orchestrator {
    fetcher: ManifestFetcher,
    downloader: Arc<Downloader>,
    ledger: Ledger,
    layout: Arc<Layout>,
    progress: ProgressBoard,
    max_concurrent: usize,
}

impl Orchestrator {
    pub fn new(
        fetcher: ManifestFetcher,
        downloader: Downloader,
        ledger: Ledger,
        root: impl AsRef<Path>,
    ) -> Self {
        Self {
            fetcher,
            downloader: Arc::new(downloader),
            ledger,
            layout: Arc::new(Layout::new(root.as_ref())),
            progress: ProgressBoard::hidden(),
            max_concurrent: 0,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBoard) -> Self {
        self.progress = progress;
        self
    }

    /// Limit concurrent mode to `max` items in flight; 0 means no limit
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Run to completion. Individual failures are counted, never returned.
    #[instrument(name = "run", skip(self))]
    pub async fn run(&self, mode: RunMode) -> RunSummary {
        let completed = Arc::new(self.ledger.load_completed().await);

        let (items, manifest_failed) = match self.fetcher.try_fetch().await {
            Ok(items) => (items, false),
            Err(e) => {
                error!(error = %e, "Error fetching list, nothing to download");
                (Vec::new(), true)
            }
        };
        info!(items = items.len(), ?mode, "Processing manifest");

        let pipeline = Pipeline {
            downloader: self.downloader.clone(),
            ledger: self.ledger.clone(),
            layout: self.layout.clone(),
            progress: self.progress.clone(),
            completed,
        };

        let mut summary = match mode {
            RunMode::Sequential => run_sequential(&pipeline, items).await,
            RunMode::Concurrent => run_concurrent(&pipeline, items, self.max_concurrent).await,
        };
        summary.manifest_failed = manifest_failed;

        info!(%summary, "Run finished");
        summary
    }
}

async fn run_sequential(pipeline: &Pipeline, items: Vec<DownloadItem>) -> RunSummary {
    let mut summary = RunSummary::default();
    for item in &items {
        summary.merge(pipeline.process_item(item).await);
    }
    summary
}

async fn run_concurrent(
    pipeline: &Pipeline,
    items: Vec<DownloadItem>,
    max_concurrent: usize,
) -> RunSummary {
    let limiter = (max_concurrent > 0).then(|| Arc::new(Semaphore::new(max_concurrent)));
    let mut tasks = JoinSet::new();

    for item in items {
        let pipeline = pipeline.clone();
        let limiter = limiter.clone();
        tasks.spawn(async move {
            let _permit = match limiter {
                Some(limiter) => limiter.acquire_owned().await.ok(),
                None => None,
            };
            pipeline.process_item(&item).await
        });
    }

    let mut summary = RunSummary::default();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(item_summary) => summary.merge(item_summary),
            Err(e) => {
                error!(error = %e, "Item task panicked");
                summary.items += 1;
                summary.failed += 1;
            }
        }
    }
    summary
}

impl Pipeline {
    #[instrument(name = "item", skip_all, fields(artist = %item.artist, name = %item.name))]
    async fn process_item(&self, item: &DownloadItem) -> RunSummary {
        let mut summary = RunSummary {
            items: 1,
            ..Default::default()
        };

        if AssetKind::ALL
            .iter()
            .all(|kind| self.completed.contains(item, *kind))
        {
            info!("Already downloaded: {}", item.identifier());
            summary.skipped += AssetKind::ALL.len();
            return summary;
        }

        // cover only starts once the song's outcome is known
        for kind in AssetKind::ALL {
            self.process_target(item, kind, &mut summary).await;
        }
        summary
    }

    async fn process_target(&self, item: &DownloadItem, kind: AssetKind, summary: &mut RunSummary) {
        if self.completed.contains(item, kind) {
            debug!(%kind, "Already recorded, skipping");
            summary.skipped += 1;
            return;
        }

        let target = self.layout.target(item, kind);
        match kind {
            AssetKind::Song => info!("Downloading song: {}", item.name),
            AssetKind::Cover => info!("Downloading cover for: {}", item.artist),
        }

        let (tx, rx) = mpsc::channel(16);
        let tracker = self
            .progress
            .track(format!("{} - {} ({kind})", item.artist, item.name), rx);
        let result = self
            .downloader
            .transfer_with_progress(&target.source_url, &target.destination, tx)
            .await;
        if let Err(e) = tracker.await {
            warn!(error = %e, "Progress display task failed");
        }

        match result {
            Ok(outcome) => {
                match outcome {
                    TransferOutcome::AlreadyPresent => summary.already_present += 1,
                    TransferOutcome::Downloaded { bytes } => {
                        summary.downloaded += 1;
                        debug!(bytes, path = ?target.destination, "Transfer finished");
                    }
                }
                match kind {
                    AssetKind::Song => info!("Downloaded song: {}", item.name),
                    AssetKind::Cover => info!("Downloaded cover for: {}", item.artist),
                }

                if let Err(e) = self.ledger.record(item, kind).await {
                    error!(
                        %kind,
                        error = %e,
                        "Failed to record completion, it will be fetched again next run"
                    );
                    summary.ledger_failures += 1;
                }
            }
            Err(e) => {
                error!(
                    kind = %target.kind,
                    url = %target.source_url,
                    error = %e,
                    "Error downloading {kind}"
                );
                summary.failed += 1;
            }
        }
    }
}
