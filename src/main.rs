mod config;
mod downloader;
mod ledger;
mod manifest;
mod orchestrator;
mod progress;
#[cfg(test)]
mod test_support;

use downloader::Downloader;
use ledger::Ledger;
use manifest::ManifestFetcher;
use orchestrator::Orchestrator;
use progress::ProgressBoard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::config();

    // create output directory
    if !config.output_dir.exists() {
        tokio::fs::create_dir_all(&config.output_dir).await?;
        tracing::info!("Directory '{}' does not exist, creating...", config.output_dir.display());
    }

    let client = downloader::client(config.timeout())?;
    let fetcher = ManifestFetcher::new(client.clone(), &config.manifest_url)
        .with_timeout(config.timeout());
    let downloader = Downloader::new(client)
        .with_timeout(config.timeout())
        .with_progress_interval(config.progress_interval());

    let (ledger, writer) = Ledger::open(config.ledger_path());
    tracing::debug!("Completion log: {}", ledger.path().display());

    let summary = Orchestrator::new(fetcher, downloader, ledger, &config.output_dir)
        .with_progress(ProgressBoard::new(!config.no_progress))
        .with_max_concurrent(config.max_concurrent)
        .run(config.mode)
        .await;

    // all ledger handles are gone once the orchestrator is, so this drains the writer
    writer.finish().await;

    if summary.manifest_failed {
        tracing::warn!("The manifest could not be fetched, nothing was downloaded");
    }
    tracing::info!("All downloads completed. {summary}");

    Ok(())
}
