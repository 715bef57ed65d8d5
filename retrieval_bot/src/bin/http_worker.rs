use color_eyre::Result;
use retrieval_bot::probes::HttpProbe;
use retrieval_bot::types::ModuleName;
use retrieval_bot::worker::run_worker;

#[tokio::main]
async fn main() -> Result<()> {
    retrieval_bot::init_binary()?;
    run_worker(ModuleName::Http, Box::new(HttpProbe)).await
}
