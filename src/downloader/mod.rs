//! Module for downloading files from HTTP sources
//!
//! This module provides the transfer engine: a single streamed download to a
//! destination path with progress reporting and a size-based short-circuit for
//! files that are already present.

mod http;
mod models;

// Re-export the public API
pub use http::{Downloader, client};
pub use models::{Progress, TransferOutcome, TransferStatus};
