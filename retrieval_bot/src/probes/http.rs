use async_trait::async_trait;
use color_eyre::{eyre::WrapErr, Result};
use tokio_util::sync::CancellationToken;

use crate::multiaddr_util::{bytes_to_multiaddrs, multiaddr_to_url};
use crate::net::{new_probe_swarm, HttpClient, PeerAddr, RetrievalProtocol};
use crate::resolver::{ProtocolResolver, PROTOCOL_HTTP, PROTOCOL_HTTPS};
use crate::types::{ErrorCode, RetrievalResult, Task};
use crate::worker::Probe;

const KEY_RETRIEVE_SIZE: &str = "retrieve_size";
const DEFAULT_RETRIEVE_SIZE: u64 = 1024 * 1024;

pub struct HttpProbe;

#[async_trait]
impl Probe for HttpProbe {
    async fn do_work(&self, task: &Task, _: &CancellationToken) -> Result<RetrievalResult> {
        let mut swarm = new_probe_swarm()?;

        let (peer_id, addrs) = task.provider.peer_addr()?;
        let provider = PeerAddr { peer_id, addrs };

        let protocols = ProtocolResolver::new(task.timeout);
        if !protocols.is_boost_provider(&mut swarm, &provider).await? {
            return Ok(RetrievalResult::error(
                ErrorCode::ProtocolNotSupported,
                "provider does not serve a transports listing",
            ));
        }

        let listing = protocols
            .get_retrieval_protocols(&mut swarm, &provider)
            .await
            .wrap_err("failed to get retrieval protocols")?;
        drop(swarm);

        let Some(endpoint) = http_endpoint(&listing) else {
            return Ok(RetrievalResult::error(
                ErrorCode::ProtocolNotSupported,
                "no HTTP endpoint found",
            ));
        };

        let size = match task.metadata.get(KEY_RETRIEVE_SIZE) {
            Some(raw) => raw
                .parse::<u64>()
                .wrap_err("failed to parse retrieve_size")?,
            None => DEFAULT_RETRIEVE_SIZE,
        };

        let client = HttpClient::new(task.timeout)?;
        client
            .retrieve_piece(&endpoint, &task.content.cid, size)
            .await
    }
}

/// First advertised HTTP(S) address that converts to a URL.
fn http_endpoint(listing: &[RetrievalProtocol]) -> Option<String> {
    for protocol in listing {
        if protocol.name != PROTOCOL_HTTP && protocol.name != PROTOCOL_HTTPS {
            continue;
        }
        for addr in bytes_to_multiaddrs(&protocol.address_bytes()) {
            if let Ok(url) = multiaddr_to_url(&addr) {
                return Some(url);
            }
        }
    }
    None
}
