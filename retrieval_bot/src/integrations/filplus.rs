use std::time::Duration;

use color_eyre::{eyre::WrapErr, Result};
use tracing::info;

use crate::config;
use crate::integrations::tasks::add_tasks;
use crate::repository::{DealRepository, ResultRepository, TaskRepository};
use crate::resolver::{
    IpInfo, LocationResolver, ProviderResolver, DEFAULT_IPINFO_URL, DEFAULT_LOTUS_API_URL,
};
use crate::sampler::random_objects;

/// The primary random-sampling generator: keeps the queue topped up with
/// a fair workload drawn across clients and providers.
pub struct FilPlusIntegration {
    task_repo: TaskRepository,
    deal_repo: DealRepository,
    result_repo: ResultRepository,
    location_resolver: LocationResolver,
    provider_resolver: ProviderResolver,
    ip_info: IpInfo,
    requester: String,
    batch_size: i64,
    rand_const: f64,
    task_timeout: Duration,
}

impl FilPlusIntegration {
    pub async fn new_from_env() -> Result<Self> {
        let task_repo = TaskRepository::connect(&config::get_required_string(
            config::QUEUE_DATABASE_URL,
        )?)
        .await?;
        let deal_repo = DealRepository::connect(&config::get_required_string(
            config::STATEMARKETDEALS_DATABASE_URL,
        )?)
        .await?;
        let result_repo = ResultRepository::connect(&config::get_required_string(
            config::RESULT_DATABASE_URL,
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

        Ok(Self {
            task_repo,
            deal_repo,
            result_repo,
            location_resolver,
            provider_resolver,
            ip_info,
            requester: "filplus".to_string(),
            batch_size: config::get_int(config::FILPLUS_INTEGRATION_BATCH_SIZE, 1000),
            rand_const: config::get_f64(config::FILPLUS_INTEGRATION_RANDOM_CONSTANT, 4.0),
            task_timeout: config::get_duration(
                config::FILPLUS_INTEGRATION_TASK_TIMEOUT,
                Duration::from_secs(15),
            ),
        })
    }

    pub async fn run_once(&self) -> Result<()> {
        info!("start running filplus integration");

        let queued = self.task_repo.count(&self.requester).await?;
        info!(count = queued, "current number of tasks in the queue");
        if queued > self.batch_size {
            info!("task queue still has {queued} tasks, doing nothing");
            return Ok(());
        }

        let total_per_client = self.deal_repo.total_per_client().await?;
        let documents = self.deal_repo.sample_live_deals(self.batch_size).await?;

        let half = documents.len() / 2;
        let selected = {
            let mut rng = rand::rng();
            random_objects(&mut rng, &documents, half, self.rand_const, &total_per_client)
        };

        let outcome = add_tasks(
            &self.requester,
            &self.ip_info,
            selected,
            &self.location_resolver,
            &self.provider_resolver,
            self.task_timeout,
        )
        .await;

        log_task_breakdown(&outcome.tasks);

        if !outcome.tasks.is_empty() {
            self.task_repo
                .enqueue_many(&outcome.tasks)
                .await
                .wrap_err("failed to insert tasks")?;
        }
        info!(count = outcome.tasks.len(), "inserted tasks");

        if !outcome.results.is_empty() {
            self.result_repo
                .insert_many(&outcome.results)
                .await
                .wrap_err("failed to insert results")?;
        }
        info!(count = outcome.results.len(), "inserted results");

        Ok(())
    }
}

fn log_task_breakdown(tasks: &[crate::types::Task]) {
    let mut per_country = std::collections::HashMap::new();
    let mut per_continent = std::collections::HashMap::new();
    let mut per_module = std::collections::HashMap::new();
    for task in tasks {
        *per_country
            .entry(task.provider.country.clone().unwrap_or_default())
            .or_insert(0_usize) += 1;
        *per_continent
            .entry(task.provider.continent.clone().unwrap_or_default())
            .or_insert(0_usize) += 1;
        *per_module.entry(task.module).or_insert(0_usize) += 1;
    }

    for (country, count) in per_country {
        info!(country, count, "tasks per country");
    }
    for (continent, count) in per_continent {
        info!(continent, count, "tasks per continent");
    }
    for (module, count) in per_module {
        info!(module = %module, count, "tasks per module");
    }
}
