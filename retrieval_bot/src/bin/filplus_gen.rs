use std::time::Duration;

use color_eyre::Result;
use retrieval_bot::integrations::FilPlusIntegration;
use retrieval_bot::worker::shutdown_token;
use tracing::error;

const RUN_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    retrieval_bot::init_binary()?;

    let shutdown = shutdown_token();
    let integration = FilPlusIntegration::new_from_env().await?;

    loop {
        if let Err(err) = integration.run_once().await {
            error!("filplus generator run failed: {err:#}");
        }

        tokio::select! {
            _ = tokio::time::sleep(RUN_INTERVAL) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }
    }
}
