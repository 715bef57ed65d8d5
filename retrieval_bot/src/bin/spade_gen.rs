use clap::Parser;
use color_eyre::Result;
use retrieval_bot::integrations::run_spade;

/// Queue probes for a logarithmic sample of each provider's replicas,
/// as listed by the corpus replica manifests.
#[derive(Parser)]
#[command(name = "spade_gen")]
struct Args {
    /// Manifest URLs (zstd-compressed JSON)
    #[arg(long, required = true, value_delimiter = ',')]
    sources: Vec<String>,

    /// Requester tag stamped on every task
    #[arg(short, long, default_value = "spadev0")]
    requester: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    retrieval_bot::init_binary()?;

    let args = Args::parse();
    run_spade(args.sources, args.requester).await
}
