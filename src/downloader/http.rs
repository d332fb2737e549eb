//! HTTP transfer implementation
//!
//! Streams a single remote resource to a destination path. The body is written
//! to a sibling `.part` file that only replaces the destination once it has been
//! flushed, so a half-written file never looks like a finished one.

use futures_util::StreamExt;
use reqwest::{
    Client, Response,
    header::{self, HeaderMap, HeaderValue},
};
use std::{
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
    sync::mpsc,
    time::timeout,
};
use tracing::{debug, error, info, instrument, trace, warn};

use super::models::{Progress, TransferError, TransferOutcome, TransferStatus};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(100);
const MAX_REDIRECTS: usize = 10;

static PART_SEQ: AtomicU64 = AtomicU64::new(0);

/// Build the HTTP client shared by the manifest fetcher and the downloader
pub fn client(connect_timeout: Duration) -> reqwest::Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

    Client::builder()
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .default_headers(headers)
        .user_agent(concat!(
            env!("CARGO_PKG_NAME"),
            "/",
            env!("CARGO_PKG_VERSION")
        ))
        .connect_timeout(connect_timeout)
        .build()
}

pub struct Downloader {
    client: Client,
    timeout: Duration,
    progress_interval: Duration,
}

impl Downloader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: DEFAULT_TIMEOUT,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Deadline for the response headers and for every body chunk
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Minimum gap between two intermediate progress events
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    #[cfg(test)]
    pub async fn transfer<P: AsRef<Path>>(
        &self,
        url: &str,
        output_path: P,
    ) -> Result<TransferOutcome, TransferError> {
        // Create a null channel that drops all progress updates
        let (tx, _) = mpsc::channel(1);
        self.transfer_with_progress(url, output_path, tx).await
    }

    #[instrument(name = "transfer", level = "debug", skip(self, progress_tx, output_path), fields(url = %url))]
    pub async fn transfer_with_progress<P: AsRef<Path>>(
        &self,
        url: &str,
        output_path: P,
        progress_tx: mpsc::Sender<Progress>,
    ) -> Result<TransferOutcome, TransferError> {
        let output_path = output_path.as_ref();

        if let Some(size) = existing_size(output_path).await {
            info!(path = ?output_path, bytes = size, "File already exists, skipping download");
            return Ok(TransferOutcome::AlreadyPresent);
        }

        if let Some(parent) = output_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let response = self.send(url).await?;

        // Get content length if available
        let total_size = response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|cl| cl.to_str().ok())
            .and_then(|cl| cl.parse::<u64>().ok());

        if let Some(size) = total_size {
            info!(bytes = size, path = ?output_path, "Starting download");
        } else {
            info!(path = ?output_path, "Starting download of unknown size");
        }

        let part_path = partial_path(output_path);
        let result = match self
            .write_body(response, &part_path, output_path, total_size, &progress_tx)
            .await
        {
            Ok(bytes) => fs::rename(&part_path, output_path)
                .await
                .map(|_| bytes)
                .map_err(TransferError::from),
            Err(e) => Err(e),
        };

        match result {
            Ok(downloaded) => {
                info!(bytes = downloaded, path = ?output_path, "Download completed");
                let _ = progress_tx
                    .send(Progress {
                        total_size,
                        downloaded,
                        status: TransferStatus::Completed,
                        file_path: Some(output_path.to_path_buf()),
                    })
                    .await;
                Ok(TransferOutcome::Downloaded { bytes: downloaded })
            }
            Err(e) => {
                error!(error = %e, path = ?output_path, "Download failed, discarding partial file");
                discard(&part_path).await;
                let _ = progress_tx
                    .send(Progress {
                        total_size,
                        downloaded: 0,
                        status: TransferStatus::Failed(e.to_string()),
                        file_path: Some(output_path.to_path_buf()),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn send(&self, url: &str) -> Result<Response, TransferError> {
        let response = timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| TransferError::Timeout(self.timeout))??;

        trace!(status = %response.status(), "Got response");

        if !response.status().is_success() {
            return Err(TransferError::Status {
                status: response.status(),
                url: url.to_string(),
            });
        }

        Ok(response)
    }

    // Stream the response into `part_path`, returning the number of bytes written
    async fn write_body(
        &self,
        response: Response,
        part_path: &Path,
        final_path: &Path,
        total_size: Option<u64>,
        progress_tx: &mpsc::Sender<Progress>,
    ) -> Result<u64, TransferError> {
        let snapshot = |downloaded: u64| Progress {
            total_size,
            downloaded,
            status: TransferStatus::Downloading,
            file_path: Some(final_path.to_path_buf()),
        };

        let mut file = File::create(part_path).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        let _ = progress_tx.send(snapshot(0)).await;
        let mut last_report = Instant::now();

        loop {
            let next = timeout(self.timeout, stream.next()).await.map_err(|_| {
                TransferError::interrupted(downloaded, TransferError::Timeout(self.timeout))
            })?;

            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| TransferError::interrupted(downloaded, e.into()))?;

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            trace!(
                bytes = downloaded,
                chunk_size = chunk.len(),
                "Received chunk"
            );

            if last_report.elapsed() >= self.progress_interval {
                last_report = Instant::now();
                let _ = progress_tx.send(snapshot(downloaded)).await;
            }
        }

        // Make sure the file is completely written
        file.flush().await?;
        file.shutdown().await?;

        Ok(downloaded)
    }
}

/// Size of the file at `path` when it counts as already downloaded
async fn existing_size(path: &Path) -> Option<u64> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

// Unique per transfer: songs by the same artist share one cover destination
fn partial_path(path: &Path) -> PathBuf {
    let seq = PART_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}-{seq}.part", std::process::id()));
    PathBuf::from(name)
}

async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = ?path, "Removed partial file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = ?path, error = %e, "Failed to remove partial file"),
    }
}
