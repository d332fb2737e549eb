//! Config module for songsync

use std::{path::PathBuf, time::Duration};

use clap::{Parser, ValueEnum};

use crate::{ledger::DEFAULT_LEDGER_FILE, manifest::DEFAULT_MANIFEST_URL};

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum RunMode {
    /// One item at a time, in manifest order
    #[default]
    Sequential,
    /// Every item at once
    Concurrent,
}

#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Where the song manifest is fetched from
    #[clap(long, env = "SONGSYNC_MANIFEST_URL", default_value = DEFAULT_MANIFEST_URL)]
    pub manifest_url: String,

    /// Root directory; one sub-directory per artist is created below it
    #[clap(long, env = "SONGSYNC_OUTPUT_DIR", default_value = ".")]
    pub output_dir: PathBuf,

    /// Completion log, defaults to `downloading.log` inside the output directory
    #[clap(long, env = "SONGSYNC_LEDGER")]
    pub ledger: Option<PathBuf>,

    #[clap(long, env = "SONGSYNC_MODE", value_enum, default_value = "sequential")]
    pub mode: RunMode,

    /// Cap on items in flight in concurrent mode, 0 for no cap
    #[clap(long, env = "SONGSYNC_MAX_CONCURRENT", default_value = "0")]
    pub max_concurrent: usize,

    /// Deadline in seconds for connecting, response headers, and each body chunk
    #[clap(long, env = "SONGSYNC_TIMEOUT_SECS", default_value = "30")]
    pub timeout_secs: u64,

    #[clap(long, env = "SONGSYNC_PROGRESS_INTERVAL_MS", default_value = "100")]
    pub progress_interval_ms: u64,

    #[clap(long, env = "SONGSYNC_NO_PROGRESS", default_value = "false")]
    pub no_progress: bool,
}

impl Config {
    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .clone()
            .unwrap_or_else(|| self.output_dir.join(DEFAULT_LEDGER_FILE))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

pub fn config() -> Config {
    Config::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let config = Config::try_parse_from([
            "songsync",
            "--manifest-url",
            "http://localhost/list.json",
            "--output-dir",
            "/srv/music",
            "--mode",
            "concurrent",
            "--max-concurrent",
            "4",
            "--timeout-secs",
            "5",
            "--no-progress",
        ])
        .unwrap();

        assert_eq!(config.manifest_url, "http://localhost/list.json");
        assert_eq!(config.mode, RunMode::Concurrent);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.timeout(), Duration::from_secs(5));
        assert!(config.no_progress);
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/srv/music/downloading.log")
        );
    }

    #[test]
    fn explicit_ledger_wins() {
        let config =
            Config::try_parse_from(["songsync", "--ledger", "/var/lib/songsync.log"]).unwrap();
        assert_eq!(config.ledger_path(), PathBuf::from("/var/lib/songsync.log"));
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(Config::try_parse_from(["songsync", "--mode", "parallel"]).is_err());
    }
}
