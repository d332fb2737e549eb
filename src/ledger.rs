//! Completion ledger
//!
//! An append-only text log with one line per finished transfer:
//!
//! ```text
//! 2024-05-01T12:00:00.000Z - song - Artist - Name
//! ```
//!
//! All appends go through a single writer task, so concurrent transfers can
//! record completions without interleaving partial lines.

use std::{
    collections::HashSet,
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

use crate::manifest::DownloadItem;

pub const FIELD_DELIMITER: &str = " - ";
pub const DEFAULT_LEDGER_FILE: &str = "downloading.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetKind {
    Song,
    Cover,
}

impl AssetKind {
    /// Processing order within one item
    pub const ALL: [AssetKind; 2] = [AssetKind::Song, AssetKind::Cover];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Song => "song",
            Self::Cover => "cover",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "song" => Ok(Self::Song),
            "cover" => Ok(Self::Cover),
            other => Err(LedgerError::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unknown asset kind: {0}")]
    UnknownKind(String),

    #[error("Ledger writer has shut down")]
    WriterClosed,
}

/// One line of the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: AssetKind,
    pub artist: String,
    pub name: String,
}

impl CompletionRecord {
    pub fn new(item: &DownloadItem, kind: AssetKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            artist: item.artist.clone(),
            name: item.name.clone(),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{ts}{d}{kind}{d}{artist}{d}{name}\n",
            ts = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            d = FIELD_DELIMITER,
            kind = self.kind,
            artist = self.artist,
            name = self.name,
        )
    }

    /// Parse a stored line; `None` for anything malformed.
    ///
    /// The name is the remainder after the third delimiter, so names that
    /// themselves contain `" - "` survive.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut fields = line.trim_end_matches(['\r', '\n']).splitn(4, FIELD_DELIMITER);
        let timestamp = DateTime::parse_from_rfc3339(fields.next()?).ok()?;
        let kind = fields.next()?.parse().ok()?;
        let artist = fields.next()?;
        let name = fields.next()?;
        if artist.is_empty() || name.is_empty() {
            return None;
        }

        Some(Self {
            timestamp: timestamp.with_timezone(&Utc),
            kind,
            artist: artist.to_string(),
            name: name.to_string(),
        })
    }
}

/// Snapshot of every completion found in the ledger
#[derive(Debug, Default, Clone)]
pub struct CompletedSet {
    entries: HashSet<(String, String, AssetKind)>,
}

impl CompletedSet {
    pub fn from_log(text: &str) -> Self {
        let mut set = Self::default();
        let mut skipped = 0usize;
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            match CompletionRecord::parse_line(line) {
                Some(record) => set.insert(&record),
                None => {
                    skipped += 1;
                    trace!(line, "Skipping malformed ledger line");
                }
            }
        }
        if skipped > 0 {
            debug!(skipped, "Ignored malformed ledger lines");
        }
        set
    }

    pub fn insert(&mut self, record: &CompletionRecord) {
        self.entries
            .insert((record.artist.clone(), record.name.clone(), record.kind));
    }

    /// Whether this exact asset of the item was recorded
    pub fn contains(&self, item: &DownloadItem, kind: AssetKind) -> bool {
        self.entries
            .contains(&(item.artist.clone(), item.name.clone(), kind))
    }

    /// Whether any asset was recorded under `<artist>-<name>`
    #[cfg(test)]
    pub fn contains_identifier(&self, identifier: &str) -> bool {
        self.entries
            .iter()
            .any(|(artist, name, _)| format!("{artist}-{name}") == identifier)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct AppendRequest {
    line: String,
    ack: oneshot::Sender<io::Result<()>>,
}

/// Handle to the ledger. Clones share the same writer task.
#[derive(Clone)]
pub struct Ledger {
    path: Arc<PathBuf>,
    tx: mpsc::Sender<AppendRequest>,
}

/// The writer task behind every [`Ledger`] clone; it exits once they are all dropped
pub struct LedgerWriter {
    handle: JoinHandle<()>,
}

impl LedgerWriter {
    /// Wait for pending appends to land on disk
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "Ledger writer task failed");
        }
    }
}

impl Ledger {
    /// Spawn the writer task. The file is only created on the first append.
    pub fn open(path: impl Into<PathBuf>) -> (Self, LedgerWriter) {
        let path = Arc::new(path.into());
        let (tx, rx) = mpsc::channel(64);
        let handle = tokio::spawn(run_writer(path.clone(), rx));
        (Self { path, tx }, LedgerWriter { handle })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every completion recorded so far. Never fails: an absent or
    /// unreadable log counts as empty.
    pub async fn load_completed(&self) -> CompletedSet {
        match fs::read(self.path.as_path()).await {
            Ok(bytes) => {
                let set = CompletedSet::from_log(&String::from_utf8_lossy(&bytes));
                if set.is_empty() {
                    warn!(path = ?self.path, "Ledger exists but holds no readable entries");
                } else {
                    info!(path = ?self.path, entries = set.len(), "Loaded ledger");
                }
                set
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No ledger yet, starting fresh");
                CompletedSet::default()
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to read ledger, treating it as empty");
                CompletedSet::default()
            }
        }
    }

    /// Append a completion line and wait until it is written
    pub async fn record(&self, item: &DownloadItem, kind: AssetKind) -> Result<(), LedgerError> {
        let line = CompletionRecord::new(item, kind).to_line();
        let (ack, done) = oneshot::channel();
        self.tx
            .send(AppendRequest { line, ack })
            .await
            .map_err(|_| LedgerError::WriterClosed)?;
        done.await.map_err(|_| LedgerError::WriterClosed)??;
        trace!(artist = %item.artist, name = %item.name, %kind, "Recorded completion");
        Ok(())
    }
}

async fn run_writer(path: Arc<PathBuf>, mut rx: mpsc::Receiver<AppendRequest>) {
    let mut file: Option<File> = None;

    while let Some(request) = rx.recv().await {
        let result = append_line(&path, &mut file, &request.line).await;
        if let Err(ref e) = result {
            warn!(path = ?path, error = %e, "Ledger append failed");
            // reopen on the next request
            file = None;
        }
        let _ = request.ack.send(result);
    }

    trace!("Ledger writer closed");
}

async fn append_line(path: &Path, file: &mut Option<File>, line: &str) -> io::Result<()> {
    let handle = match file.take() {
        Some(handle) => handle,
        None => {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?
        }
    };
    let handle = file.insert(handle);
    handle.write_all(line.as_bytes()).await?;
    handle.flush().await
}
