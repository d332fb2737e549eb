//! Remote manifest fetching
//!
//! The manifest is a list of songs, each with a song URL and a cover URL. It is
//! decoded as plain JSON; script-style wrappers such as `var list = [...];` are
//! peeled off, but nothing is ever evaluated.

use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::ledger::FIELD_DELIMITER;

pub const DEFAULT_MANIFEST_URL: &str =
    "https://testingcf.jsdelivr.net/gh/nj-lizhi/song@master/audio/list-v2.js";

/// One song entry of the manifest. Identity is `(artist, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DownloadItem {
    pub artist: String,
    pub name: String,
    #[serde(rename = "url")]
    pub song_url: String,
    #[serde(rename = "cover")]
    pub cover_url: String,
}

impl DownloadItem {
    /// `<artist>-<name>`, the identifier older ledgers were keyed by
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.artist, self.name)
    }

    fn validate(&self) -> Result<(), String> {
        for (field, value) in [("artist", &self.artist), ("name", &self.name)] {
            if !is_path_component(value) {
                return Err(format!("{field} {value:?} is not a usable file name"));
            }
        }
        // the name is the last ledger field and may hold the delimiter, the artist may not
        if self.artist.contains(FIELD_DELIMITER) {
            return Err(format!("artist {:?} contains {FIELD_DELIMITER:?}", self.artist));
        }
        for (field, value) in [("url", &self.song_url), ("cover", &self.cover_url)] {
            match Url::parse(value) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                _ => return Err(format!("{field} {value:?} is not an http(s) URL")),
            }
        }
        Ok(())
    }
}

fn is_path_component(value: &str) -> bool {
    !value.trim().is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\'])
        && !value.chars().any(char::is_control)
}

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Manifest endpoint answered {0}")]
    Status(StatusCode),

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Manifest is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Manifest does not contain a list")]
    NoList,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Bare(Vec<DownloadItem>),
    Wrapped { list: Vec<DownloadItem> },
}

/// Decode a manifest body into its items, dropping entries that fail validation
pub fn parse_manifest(body: &str) -> Result<Vec<DownloadItem>, ManifestError> {
    let body = body.trim_start_matches('\u{feff}').trim();
    let json = if body.starts_with('[') || body.starts_with('{') {
        body
    } else {
        strip_assignment(body).ok_or(ManifestError::NoList)?
    };

    let items = match serde_json::from_str::<ManifestDocument>(json) {
        Ok(ManifestDocument::Bare(items)) | Ok(ManifestDocument::Wrapped { list: items }) => {
            items
        }
        // untagged errors say nothing useful, decode again for the real message
        Err(_) => serde_json::from_str::<Vec<DownloadItem>>(json)?,
    };

    let total = items.len();
    let items: Vec<DownloadItem> = items
        .into_iter()
        .filter(|item| match item.validate() {
            Ok(()) => true,
            Err(reason) => {
                warn!(artist = %item.artist, name = %item.name, %reason, "Dropping manifest entry");
                false
            }
        })
        .collect();
    debug!(total, kept = items.len(), "Parsed manifest");

    Ok(items)
}

// `list = [...]`, `var list = [...];` and friends: return the right-hand side
fn strip_assignment(body: &str) -> Option<&str> {
    let (lhs, rhs) = body.split_once('=')?;
    let target = lhs.split_whitespace().last()?;
    if !target
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        return None;
    }
    let rhs = rhs.trim().trim_end_matches(';').trim_end();
    rhs.starts_with('[').then_some(rhs)
}

pub struct ManifestFetcher {
    client: Client,
    url: String,
    timeout: Duration,
}

impl ManifestFetcher {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch the manifest, logging and swallowing any failure
    #[cfg(test)]
    pub async fn fetch(&self) -> Vec<DownloadItem> {
        match self.try_fetch().await {
            Ok(items) => items,
            Err(e) => {
                tracing::error!(url = %self.url, error = %e, "Error fetching list");
                Vec::new()
            }
        }
    }

    #[instrument(name = "fetch_manifest", skip(self), fields(url = %self.url))]
    pub async fn try_fetch(&self) -> Result<Vec<DownloadItem>, ManifestError> {
        let body = timeout(self.timeout, async {
            let response = self.client.get(&self.url).send().await?;
            if !response.status().is_success() {
                return Err(ManifestError::Status(response.status()));
            }
            Ok::<_, ManifestError>(response.text().await?)
        })
        .await
        .map_err(|_| ManifestError::Timeout(self.timeout))??;

        let items = parse_manifest(&body)?;
        info!(count = items.len(), "Fetched manifest");
        Ok(items)
    }
}
