/// lib exports shared by the worker, generator and supervisor binaries.
pub mod config;
pub mod continents;
pub mod epoch;
pub mod errors;
pub mod integrations;
pub mod model;
pub mod multiaddr_util;
pub mod net;
pub mod probes;
pub mod process;
pub mod repository;
pub mod resolver;
pub mod sampler;
pub mod types;
pub mod utils;
pub mod worker;

pub use errors::RequestError;
pub use types::{ErrorCode, ModuleName, RetrievalResult, Task, TaskResult};

use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Shared binary start-up: `.env` autoload, panic/error reports, tracing.
pub fn init_binary() -> Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::get_string(config::LOG_LEVEL, "info"))),
        )
        .init();

    Ok(())
}
