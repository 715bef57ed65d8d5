use clap::Parser;
use color_eyre::Result;
use retrieval_bot::integrations::run_coverage;

/// Queue probes covering every live deal of the given providers.
#[derive(Parser)]
#[command(name = "spcoverage_gen")]
struct Args {
    /// Providers to cover, e.g. -p f01234 -p f05678
    #[arg(short = 'p', long = "sp", required = true)]
    providers: Vec<String>,

    /// Requester tag stamped on every task and result
    #[arg(short, long)]
    requester: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    retrieval_bot::init_binary()?;

    let args = Args::parse();
    run_coverage(args.providers, args.requester).await
}
