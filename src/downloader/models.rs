//! Data structures for the transfer engine
//!
//! Progress snapshots, terminal outcomes and the error type shared by every
//! transfer.

use std::{fmt, io, path::PathBuf, time::Duration};

use reqwest::StatusCode;

/// Status of a single transfer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Response headers received, body is being streamed
    #[default]
    Downloading,
    /// Body fully written and the destination is in place
    Completed,
    /// Transfer failed with an error
    Failed(String),
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downloading => write!(f, "Downloading"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

/// Represents the progress of a transfer
#[derive(Debug, Clone, Default)]
pub struct Progress {
    /// Total size of the download in bytes (if known)
    pub total_size: Option<u64>,
    /// Number of bytes downloaded so far
    pub downloaded: u64,
    /// Status of the transfer
    pub status: TransferStatus,
    /// Destination the bytes end up in
    pub file_path: Option<PathBuf>,
}

impl Progress {
    /// Calculate the download progress as a percentage
    ///
    /// Returns None if the total size is unknown or zero
    pub fn percentage(&self) -> Option<f32> {
        self.total_size
            .filter(|total| *total > 0)
            .map(|total| (self.downloaded as f32 / total as f32) * 100.0)
    }

    /// Check if the transfer reached a terminal state
    pub fn is_complete(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Completed | TransferStatus::Failed(_)
        )
    }
}

/// Successful result of [`Downloader::transfer`](super::Downloader::transfer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The destination already held a non-empty file, nothing was requested
    AlreadyPresent,
    /// The body was streamed to the destination
    Downloaded { bytes: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP error: {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("No response within {0:?}")]
    Timeout(Duration),

    // Body stream broke after some bytes were already written
    #[error("Download failed after {bytes_downloaded} bytes: {source}")]
    Interrupted {
        bytes_downloaded: u64,
        #[source]
        source: Box<TransferError>,
    },
}

impl TransferError {
    pub(crate) fn interrupted(bytes_downloaded: u64, source: TransferError) -> Self {
        Self::Interrupted {
            bytes_downloaded,
            source: Box::new(source),
        }
    }
}
