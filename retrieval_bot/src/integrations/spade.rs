use std::collections::HashMap;
use std::time::Duration;

use async_compression::tokio::bufread::ZstdDecoder;
use chrono::Utc;
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use futures::TryStreamExt;
use rand::seq::index::sample;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::config;
use crate::repository::{DealRepository, TaskRepository};
use crate::resolver::{
    LocationResolver, ProviderResolver, DEFAULT_IPINFO_URL, DEFAULT_LOTUS_API_URL,
};
use crate::types::{Content, ModuleName, Task};

/// Signed replica manifest served by the corpus aggregator.
#[derive(Debug, Deserialize)]
pub struct ActiveReplicas {
    #[serde(default)]
    pub state_epoch: u64,
    #[serde(default)]
    pub active_replicas: Vec<ActiveReplica>,
}

#[derive(Debug, Deserialize)]
pub struct ActiveReplica {
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(flatten)]
    pub replica: Replica,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Replica {
    pub piece_cid: String,
    pub piece_log2_size: u32,
    #[serde(default)]
    pub optional_dag_root: String,
}

#[derive(Debug, Deserialize)]
pub struct Contract {
    pub provider_id: u64,
    #[serde(default)]
    pub legacy_market_id: u64,
    #[serde(default)]
    pub legacy_market_end_epoch: i64,
}

#[derive(Default)]
struct ProviderReplicas {
    size_gib: u64,
    replicas: Vec<Replica>,
}

/// Number of pieces to probe for a provider storing `size_gib`:
/// log2 of the size in TiB, minimum one.
fn num_cids_to_test(size_gib: u64) -> usize {
    let size_tib = (size_gib / 1024).max(1) as f64;
    (size_tib.log2() as usize).max(1)
}

/// Sampled-corpus generator: downloads each replica manifest, sizes the
/// providers, and queues a logarithmic sample of their pieces.
pub async fn run_spade(sources: Vec<String>, requester: String) -> Result<()> {
    for source in sources {
        let replicas = fetch_active_replicas(&source).await?;
        info!(
            source,
            state_epoch = replicas.state_epoch,
            count = replicas.active_replicas.len(),
            "replica manifest fetched"
        );

        let mut per_provider: HashMap<u64, ProviderReplicas> = HashMap::new();
        for replica in replicas.active_replicas {
            for contract in &replica.contracts {
                let entry = per_provider.entry(contract.provider_id).or_default();
                entry.size_gib += (1_u64 << replica.replica.piece_log2_size) >> 30;
                entry.replicas.push(replica.replica.clone());
            }
        }

        let to_test = select_replicas_to_test(per_provider);
        let total: usize = to_test.values().map(Vec::len).sum();
        info!(
            providers = to_test.len(),
            pieces = total,
            "selected replicas to test"
        );

        if let Err(err) = add_spade_tasks(&requester, to_test).await {
            warn!("failed to add tasks: {err:#}");
        }
    }

    Ok(())
}

async fn fetch_active_replicas(url: &str) -> Result<ActiveReplicas> {
    debug!(url, "fetching replica manifest");
    let response = reqwest::get(url).await.wrap_err("failed to make request")?;
    if !response.status().is_success() {
        return Err(eyre!("failed to get replica manifest: {}", response.status()));
    }

    let stream = response
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
    let mut decoder = ZstdDecoder::new(tokio_util::io::StreamReader::new(stream));

    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .await
        .wrap_err("failed to read decompressed manifest")?;

    serde_json::from_slice(&decompressed).wrap_err("failed to decode manifest JSON")
}

fn select_replicas_to_test(
    per_provider: HashMap<u64, ProviderReplicas>,
) -> HashMap<u64, Vec<Replica>> {
    let mut rng = rand::rng();
    let mut to_test = HashMap::new();

    for (provider_id, provider) in per_provider {
        let available = provider.replicas.len();
        let mut wanted = num_cids_to_test(provider.size_gib);
        if wanted > available {
            warn!(
                provider_id,
                available, wanted, "provider has fewer replicas than the test budget"
            );
            wanted = available;
        }

        let picked = sample(&mut rng, available, wanted)
            .into_iter()
            .map(|index| provider.replicas[index].clone())
            .collect();
        to_test.insert(provider_id, picked);
    }

    to_test
}

async fn add_spade_tasks(
    requester: &str,
    replicas_to_test: HashMap<u64, Vec<Replica>>,
) -> Result<()> {
    let deal_repo = DealRepository::connect(&config::get_required_string(
        config::STATEMARKETDEALS_DATABASE_URL,
    )?)
    .await?;
    let task_repo = TaskRepository::connect(&config::get_required_string(
        config::QUEUE_DATABASE_URL,
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

    let task_timeout = config::get_duration(
        config::FILPLUS_INTEGRATION_TASK_TIMEOUT,
        Duration::from_secs(15),
    );

    let mut tasks = Vec::new();
    for (provider_id, replicas) in replicas_to_test {
        let provider = format!("f0{provider_id}");
        let piece_cids: Vec<String> = replicas
            .iter()
            .map(|replica| replica.piece_cid.clone())
            .collect();

        let documents = deal_repo
            .live_deals_for_provider_pieces(&provider, &piece_cids)
            .await?;
        info!(
            provider,
            count = documents.len(),
            "market deals retrieved for sampled pieces"
        );

        for document in documents {
            let provider_info = match provider_resolver.resolve_provider(&document.provider).await
            {
                Ok(info) => info,
                Err(err) => {
                    warn!(provider = %document.provider, "failed to resolve provider: {err:#}");
                    continue;
                }
            };
            let location = match location_resolver
                .resolve_multiaddrs_bytes(&provider_info.multiaddrs)
                .await
            {
                Ok(location) => location,
                Err(err) => {
                    warn!(provider = %document.provider, "failed to resolve location: {err:#}");
                    continue;
                }
            };

            tasks.push(Task {
                requester: requester.to_string(),
                module: ModuleName::Http,
                metadata: std::collections::HashMap::from([
                    ("deal_id".to_string(), document.deal_id.to_string()),
                    ("client".to_string(), document.client.clone()),
                    ("retrieve_type".to_string(), "spade".to_string()),
                    (
                        "retrieve_size".to_string(),
                        crate::integrations::tasks::RETRIEVE_SIZE_BYTES.to_string(),
                    ),
                ]),
                provider: crate::types::Provider {
                    id: document.provider.clone(),
                    peer_id: provider_info.peer_id.clone(),
                    multiaddrs: crate::multiaddr_util::bytes_to_multiaddr_strings(
                        &provider_info.multiaddrs,
                    ),
                    city: (!location.city.is_empty()).then(|| location.city.clone()),
                    region: (!location.region.is_empty()).then(|| location.region.clone()),
                    country: (!location.country.is_empty()).then(|| location.country.clone()),
                    continent: (!location.continent.is_empty())
                        .then(|| location.continent.clone()),
                },
                content: Content {
                    cid: document.piece_cid.clone(),
                },
                timeout: task_timeout,
                created_at: Utc::now(),
            });
        }
    }

    if !tasks.is_empty() {
        task_repo
            .enqueue_many(&tasks)
            .await
            .wrap_err("failed to insert tasks")?;
    }
    info!(count = tasks.len(), "inserted tasks");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_grows_logarithmically() {
        assert_eq!(num_cids_to_test(100), 1); // < 4 TiB
        assert_eq!(num_cids_to_test(4 * 1024), 2);
        assert_eq!(num_cids_to_test(16 * 1024), 4);
        assert_eq!(num_cids_to_test(128 * 1024), 7);
    }

    #[test]
    fn manifest_shape_decodes() {
        let manifest: ActiveReplicas = serde_json::from_str(
            r#"{
                "state_epoch": 3000000,
                "active_replicas": [{
                    "contracts": [
                        {"provider_id": 1234, "legacy_market_id": 1, "legacy_market_end_epoch": 99},
                        {"provider_id": 5678}
                    ],
                    "piece_cid": "baga6ea4seaq",
                    "piece_log2_size": 35,
                    "optional_dag_root": "bafybeib"
                }]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.active_replicas.len(), 1);
        assert_eq!(manifest.active_replicas[0].contracts[0].provider_id, 1234);
        assert_eq!(manifest.active_replicas[0].replica.piece_log2_size, 35);
    }
}
