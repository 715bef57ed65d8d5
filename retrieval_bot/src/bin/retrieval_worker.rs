use color_eyre::Result;
use retrieval_bot::process::ProcessManager;
use retrieval_bot::worker::shutdown_token;

#[tokio::main]
async fn main() -> Result<()> {
    retrieval_bot::init_binary()?;

    let manager = ProcessManager::new_from_env().await?;
    manager.run(shutdown_token()).await;

    Ok(())
}
