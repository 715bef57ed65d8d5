use std::time::Duration;

use color_eyre::Result;
use retrieval_bot::config;
use retrieval_bot::integrations::refresh;
use retrieval_bot::repository::DealRepository;
use retrieval_bot::worker::shutdown_token;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    retrieval_bot::init_binary()?;

    let shutdown = shutdown_token();
    let interval = config::get_duration(
        config::STATEMARKETDEALS_INTERVAL,
        Duration::from_secs(6 * 3600),
    );
    let repo = DealRepository::connect(&config::get_required_string(
        config::STATEMARKETDEALS_DATABASE_URL,
    )?)
    .await?;

    loop {
        if let Err(err) = refresh(&repo).await {
            error!("deal feed refresh failed: {err:#}");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}
