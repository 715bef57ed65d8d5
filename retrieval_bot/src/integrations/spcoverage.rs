use std::time::Duration;

use color_eyre::{eyre::WrapErr, Result};
use tracing::info;

use crate::config;
use crate::integrations::tasks::add_tasks;
use crate::repository::{DealRepository, ResultRepository, TaskRepository};
use crate::resolver::{
    LocationResolver, ProviderResolver, DEFAULT_IPINFO_URL, DEFAULT_LOTUS_API_URL,
};

/// Coverage generator: probes every live (provider, piece) pair of an
/// explicit provider set once.
pub async fn run_coverage(providers: Vec<String>, requester: String) -> Result<()> {
    let deal_repo = DealRepository::connect(&config::get_required_string(
        config::STATEMARKETDEALS_DATABASE_URL,
    )?)
    .await?;

    let location_resolver = LocationResolver::new(
        config::get_string(config::IPINFO_URL, DEFAULT_IPINFO_URL),
        config::get_optional_string(config::IPINFO_TOKEN),
        config::get_optional_string(config::LOCATION_CACHE_URL),
        config::get_duration(config::LOCATION_CACHE_TTL, Duration::from_secs(24 * 3600)),
    );
    let provider_resolver = ProviderResolver::new(
        config::get_string(config::LOTUS_API_URL, DEFAULT_LOTUS_API_URL),
        config::get_optional_string(config::LOTUS_API_TOKEN),
        config::get_optional_string(config::PROVIDER_CACHE_URL),
        config::get_duration(config::PROVIDER_CACHE_TTL, Duration::from_secs(24 * 3600)),
    );

    let ip_info = location_resolver
        .lookup_self()
        .await
        .wrap_err("failed to get public IP info")?;
    info!(ip = %ip_info.ip, "public IP info retrieved");

    let documents = deal_repo.live_deals_for_providers(&providers).await?;
    info!(count = documents.len(), "market deals retrieved");

    let task_timeout = config::get_duration(
        config::FILPLUS_INTEGRATION_TASK_TIMEOUT,
        Duration::from_secs(15),
    );
    let outcome = add_tasks(
        &requester,
        &ip_info,
        documents,
        &location_resolver,
        &provider_resolver,
        task_timeout,
    )
    .await;

    if !outcome.tasks.is_empty() {
        let task_repo = TaskRepository::connect(&config::get_required_string(
            config::QUEUE_DATABASE_URL,
        )?)
        .await?;
        task_repo
            .enqueue_many(&outcome.tasks)
            .await
            .wrap_err("failed to insert tasks")?;
    }

    if !outcome.results.is_empty() {
        let result_repo = ResultRepository::connect(&config::get_required_string(
            config::RESULT_DATABASE_URL,
        )?)
        .await?;
        result_repo
            .insert_many(&outcome.results)
            .await
            .wrap_err("failed to insert results")?;
    }

    info!(
        tasks = outcome.tasks.len(),
        results = outcome.results.len(),
        "coverage run complete"
    );
    Ok(())
}
