use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use cid::Cid;
use tracing::{debug, error, info};

use crate::errors::resolve_error;
use crate::model::DealState;
use crate::multiaddr_util::bytes_to_multiaddr_strings;
use crate::net::PAYLOAD_CODECS;
use crate::resolver::{IpInfo, LocationResolver, MinerInfo, ProviderResolver};
use crate::types::{
    Content, ErrorCode, ModuleName, Provider, RetrievalResult, Retriever, Task, TaskResult,
};

pub const RETRIEVE_SIZE_BYTES: &str = "1048576";

/// Tasks plus the error-result rows produced for deals whose provider
/// could not be resolved.
#[derive(Debug, Default)]
pub struct TaskBuildOutcome {
    pub tasks: Vec<Task>,
    pub results: Vec<TaskResult>,
}

impl From<&IpInfo> for Retriever {
    fn from(info: &IpInfo) -> Self {
        Self {
            ip: info.ip.clone(),
            city: info.city.clone(),
            region: info.region.clone(),
            country: info.country.clone(),
            continent: info.continent.clone(),
            asn: info.asn.clone(),
            isp: info.isp.clone(),
            lat: info.latitude,
            long: info.longitude,
        }
    }
}

/// Turns sampled deals into probe tasks: two block-transfer tasks when
/// the label is a payload CID with a recognized codec, one HTTP piece
/// task always. Providers that fail address or peer-id resolution get
/// error result rows instead, and emission for that deal stops.
pub async fn add_tasks(
    requester: &str,
    ip_info: &IpInfo,
    documents: Vec<DealState>,
    location_resolver: &LocationResolver,
    provider_resolver: &ProviderResolver,
    task_timeout: Duration,
) -> TaskBuildOutcome {
    let mut outcome = TaskBuildOutcome::default();

    for document in documents {
        let Ok(label_cid) = document.label.parse::<Cid>() else {
            debug!(
                label = %document.label,
                deal_id = document.deal_id,
                "failed to decode label as CID"
            );
            continue;
        };

        // A piece CID in the label means nothing to fetch over the
        // block-transfer protocols.
        let is_payload_cid = PAYLOAD_CODECS.contains(&label_cid.codec());
        if !is_payload_cid {
            info!(
                provider = %document.provider,
                deal_id = document.deal_id,
                codec = label_cid.codec(),
                "skipping block transfers, label is likely not a payload CID"
            );
        }

        let provider_info = match provider_resolver.resolve_provider(&document.provider).await {
            Ok(info) => info,
            Err(err) => {
                error!(
                    provider = %document.provider,
                    deal_id = document.deal_id,
                    "failed to resolve provider: {err:#}"
                );
                continue;
            }
        };

        let location = match location_resolver
            .resolve_multiaddrs_bytes(&provider_info.multiaddrs)
            .await
        {
            Ok(location) => location,
            Err(err) => {
                if resolve_error(&err) == Some(ErrorCode::NoValidMultiaddrs) {
                    push_error_results(
                        &mut outcome.results,
                        requester,
                        ip_info,
                        &document,
                        &provider_info,
                        &IpInfo::default(),
                        task_timeout,
                        ErrorCode::NoValidMultiaddrs,
                        format!("{err:#}"),
                    );
                } else {
                    error!(
                        provider = %document.provider,
                        deal_id = document.deal_id,
                        "failed to resolve provider location: {err:#}"
                    );
                }
                continue;
            }
        };

        let peer_ok = provider_info
            .peer_id
            .as_deref()
            .is_some_and(|peer| peer.parse::<libp2p::PeerId>().is_ok());
        if !peer_ok {
            info!(
                provider = %document.provider,
                deal_id = document.deal_id,
                peer_id = ?provider_info.peer_id,
                "failed to decode peer id"
            );
            push_error_results(
                &mut outcome.results,
                requester,
                ip_info,
                &document,
                &provider_info,
                &location,
                task_timeout,
                ErrorCode::InvalidPeerid,
                "invalid peer id".to_string(),
            );
            continue;
        }

        let provider = provider_snapshot(&document, &provider_info, &location);

        if is_payload_cid {
            for module in [ModuleName::GraphSync, ModuleName::Bitswap] {
                outcome.tasks.push(Task {
                    requester: requester.to_string(),
                    module,
                    metadata: block_transfer_metadata(&document),
                    provider: provider.clone(),
                    content: Content {
                        cid: document.label.clone(),
                    },
                    timeout: task_timeout,
                    created_at: Utc::now(),
                });
            }
        }

        outcome.tasks.push(Task {
            requester: requester.to_string(),
            module: ModuleName::Http,
            metadata: piece_metadata(&document),
            provider,
            content: Content {
                cid: document.piece_cid.clone(),
            },
            timeout: task_timeout,
            created_at: Utc::now(),
        });
    }

    info!(count = outcome.tasks.len(), "prepared tasks");
    outcome
}

fn provider_snapshot(document: &DealState, info: &MinerInfo, location: &IpInfo) -> Provider {
    Provider {
        id: document.provider.clone(),
        peer_id: info.peer_id.clone(),
        multiaddrs: bytes_to_multiaddr_strings(&info.multiaddrs),
        city: some_unless_empty(&location.city),
        region: some_unless_empty(&location.region),
        country: some_unless_empty(&location.country),
        continent: some_unless_empty(&location.continent),
    }
}

fn some_unless_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn block_transfer_metadata(document: &DealState) -> HashMap<String, String> {
    HashMap::from([
        ("deal_id".to_string(), document.deal_id.to_string()),
        ("client".to_string(), document.client.clone()),
        ("assume_label".to_string(), "true".to_string()),
        ("retrieve_type".to_string(), "root_block".to_string()),
    ])
}

fn piece_metadata(document: &DealState) -> HashMap<String, String> {
    HashMap::from([
        ("deal_id".to_string(), document.deal_id.to_string()),
        ("client".to_string(), document.client.clone()),
        ("retrieve_type".to_string(), "piece".to_string()),
        ("retrieve_size".to_string(), RETRIEVE_SIZE_BYTES.to_string()),
    ])
}

/// Resolution failures are data about the provider: one failed result
/// per probe module, none of them ever queued.
#[allow(clippy::too_many_arguments)]
fn push_error_results(
    results: &mut Vec<TaskResult>,
    requester: &str,
    ip_info: &IpInfo,
    document: &DealState,
    provider_info: &MinerInfo,
    location: &IpInfo,
    task_timeout: Duration,
    error_code: ErrorCode,
    error_message: String,
) {
    let provider = provider_snapshot(document, provider_info, location);

    for (module, mut metadata) in [
        (ModuleName::GraphSync, block_transfer_metadata(document)),
        (ModuleName::Bitswap, block_transfer_metadata(document)),
        (ModuleName::Http, piece_metadata(document)),
    ] {
        metadata.insert("deal_id".to_string(), document.deal_id.to_string());
        metadata.insert("client".to_string(), document.client.clone());

        results.push(TaskResult {
            task: Task {
                requester: requester.to_string(),
                module,
                metadata,
                provider: provider.clone(),
                content: Content {
                    cid: document.label.clone(),
                },
                timeout: task_timeout,
                created_at: Utc::now(),
            },
            retriever: Retriever::from(ip_info),
            result: RetrievalResult::error(error_code, &error_message),
            created_at: Utc::now(),
        });
    }
}
