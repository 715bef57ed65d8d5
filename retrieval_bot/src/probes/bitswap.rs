use async_trait::async_trait;
use cid::Cid;
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use libp2p::{Multiaddr, PeerId};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::multiaddr_util::{bytes_to_multiaddrs, split_peer_id};
use crate::net::{new_probe_swarm, BitswapClient, PeerAddr, RetrievalProtocol};
use crate::resolver::{ProtocolResolver, PROTOCOL_BITSWAP};
use crate::types::{ErrorCode, RetrievalResult, Task};
use crate::worker::Probe;

/// Metadata keys steering the probe.
const KEY_RETRIEVE_TYPE: &str = "retrieve_type";
const KEY_MAX_TRAVERSE_DEPTH: &str = "max_traverse_depth";
const RETRIEVE_TYPE_DAG: &str = "spade";

pub struct BitswapProbe;

#[async_trait]
impl Probe for BitswapProbe {
    async fn do_work(&self, task: &Task, _: &CancellationToken) -> Result<RetrievalResult> {
        let mut swarm = new_probe_swarm()?;

        let (peer_id, addrs) = task.provider.peer_addr()?;
        let provider = PeerAddr {
            peer_id,
            addrs,
        };
        let content_cid: Cid = task
            .content
            .cid
            .parse()
            .wrap_err("failed to parse content cid")?;

        // The block-exchange endpoint is only advertised through the
        // transports listing.
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

        let Some(endpoint) = bitswap_endpoint(&listing) else {
            return Ok(RetrievalResult::error(
                ErrorCode::ProtocolNotSupported,
                "no bitswap multiaddr available",
            ));
        };

        let client = BitswapClient::new(task.timeout);
        match traverse_depth(task)? {
            Some(depth) => {
                client
                    .traverse(&mut swarm, &endpoint, content_cid, depth)
                    .await
            }
            None => client.retrieve(&mut swarm, &endpoint, content_cid).await,
        }
    }
}

/// Extracts the advertised block-exchange endpoint. Addresses carry the
/// endpoint peer id as a trailing component; mismatched extra peer ids
/// are dropped.
fn bitswap_endpoint(listing: &[RetrievalProtocol]) -> Option<PeerAddr> {
    let mut peer_id: Option<PeerId> = None;
    let mut addrs: Vec<Multiaddr> = Vec::new();

    for protocol in listing {
        if protocol.name != PROTOCOL_BITSWAP {
            continue;
        }
        for addr in bytes_to_multiaddrs(&protocol.address_bytes()) {
            let (remain, peer) = split_peer_id(addr.clone());
            match (peer, peer_id) {
                (Some(found), None) => {
                    peer_id = Some(found);
                    addrs.push(remain);
                }
                (Some(found), Some(existing)) if found == existing => addrs.push(remain),
                (Some(_), Some(_)) => {
                    warn!(%addr, "found multiple peer ids for bitswap");
                }
                (None, _) => addrs.push(remain),
            }
        }
    }

    let peer_id = peer_id?;
    if addrs.is_empty() {
        return None;
    }
    Some(PeerAddr { peer_id, addrs })
}

fn traverse_depth(task: &Task) -> Result<Option<u32>> {
    if task.metadata.get(KEY_RETRIEVE_TYPE).map(String::as_str) != Some(RETRIEVE_TYPE_DAG) {
        return Ok(None);
    }

    let depth = task
        .metadata
        .get(KEY_MAX_TRAVERSE_DEPTH)
        .ok_or_else(|| eyre!("traversal requested without {KEY_MAX_TRAVERSE_DEPTH}"))?
        .parse::<u32>()
        .wrap_err("failed to parse max_traverse_depth")?;

    Ok(Some(depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::AddrBytes;
    use crate::types::{Content, ModuleName, Provider};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::time::Duration;

    const PEER: &str = "12D3KooWD3eckifWpRn9wQpMG9R9hX3sD158z7EqHWmweQAJU5SA";

    fn listing_with(name: &str, addrs: Vec<&str>) -> Vec<RetrievalProtocol> {
        vec![RetrievalProtocol {
            name: name.to_string(),
            addresses: addrs
                .into_iter()
                .map(|addr| AddrBytes(addr.parse::<Multiaddr>().unwrap().to_vec()))
                .collect(),
        }]
    }

    #[test]
    fn endpoint_requires_a_peer_component() {
        let listing = listing_with(PROTOCOL_BITSWAP, vec!["/ip4/1.2.3.4/tcp/1234"]);
        assert!(bitswap_endpoint(&listing).is_none());
    }

    #[test]
    fn endpoint_splits_peer_from_address() {
        let addr = format!("/ip4/1.2.3.4/tcp/1234/p2p/{PEER}");
        let listing = listing_with(PROTOCOL_BITSWAP, vec![addr.as_str()]);

        let endpoint = bitswap_endpoint(&listing).unwrap();
        assert_eq!(endpoint.peer_id.to_string(), PEER);
        assert_eq!(endpoint.addrs[0].to_string(), "/ip4/1.2.3.4/tcp/1234");
    }

    #[test]
    fn non_bitswap_entries_are_ignored() {
        let addr = format!("/ip4/1.2.3.4/tcp/1234/p2p/{PEER}");
        let listing = listing_with("http", vec![addr.as_str()]);
        assert!(bitswap_endpoint(&listing).is_none());
    }

    #[test]
    fn traversal_depth_comes_from_metadata() {
        let mut metadata = HashMap::new();
        metadata.insert(KEY_RETRIEVE_TYPE.to_string(), RETRIEVE_TYPE_DAG.to_string());
        metadata.insert(KEY_MAX_TRAVERSE_DEPTH.to_string(), "4".to_string());

        let task = Task {
            requester: "test".to_string(),
            module: ModuleName::Bitswap,
            metadata,
            provider: Provider::default(),
            content: Content {
                cid: "bafy".to_string(),
            },
            timeout: Duration::from_secs(15),
            created_at: Utc::now(),
        };

        assert_eq!(traverse_depth(&task).unwrap(), Some(4));
    }
}
