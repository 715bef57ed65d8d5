use std::time::Duration;

use futures::StreamExt;
use libp2p::swarm::SwarmEvent;
use libp2p::{request_response, Swarm};
use tracing::debug;

use crate::errors::RequestError;
use crate::net::{
    PeerAddr, ProbeBehaviour, ProbeBehaviourEvent, QueryResponse, RetrievalProtocol,
    TRANSPORTS_PROTOCOL,
};

/// Protocol names a provider may advertise for its endpoints.
pub const PROTOCOL_LIBP2P: &str = "libp2p";
pub const PROTOCOL_BITSWAP: &str = "bitswap";
pub const PROTOCOL_HTTP: &str = "http";
pub const PROTOCOL_HTTPS: &str = "https";

/// Queries a peer for its retrieval transports. Peers that speak the
/// transports protocol return their advertised endpoint list; everybody
/// else gets the single legacy entry pointing at the announced
/// addresses.
pub struct ProtocolResolver {
    timeout: Duration,
}

impl ProtocolResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Whether the peer serves the transports listing at all.
    pub async fn is_boost_provider(
        &self,
        swarm: &mut Swarm<ProbeBehaviour>,
        target: &PeerAddr,
    ) -> Result<bool, RequestError> {
        let info = crate::net::connect_and_identify(swarm, target, self.timeout).await?;
        Ok(info.protocols.iter().any(|p| *p == TRANSPORTS_PROTOCOL))
    }

    pub async fn get_retrieval_protocols(
        &self,
        swarm: &mut Swarm<ProbeBehaviour>,
        target: &PeerAddr,
    ) -> Result<Vec<RetrievalProtocol>, RequestError> {
        let info = crate::net::connect_and_identify(swarm, target, self.timeout).await?;

        if !info.protocols.iter().any(|p| *p == TRANSPORTS_PROTOCOL) {
            debug!("peer has no transports listing, assuming legacy transfer");
            return Ok(vec![RetrievalProtocol {
                name: PROTOCOL_LIBP2P.to_string(),
                addresses: info
                    .listen_addrs
                    .iter()
                    .map(|addr| crate::net::AddrBytes(addr.to_vec()))
                    .collect(),
            }]);
        }

        let response = self.query_transports(swarm, target).await?;
        Ok(response.protocols)
    }

    async fn query_transports(
        &self,
        swarm: &mut Swarm<ProbeBehaviour>,
        target: &PeerAddr,
    ) -> Result<QueryResponse, RequestError> {
        let request_id = swarm
            .behaviour_mut()
            .transports
            .send_request(&target.peer_id, ());

        let wait = async {
            loop {
                match swarm.select_next_some().await {
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Transports(
                        request_response::Event::Message {
                            message:
                                request_response::Message::Response {
                                    request_id: id,
                                    response,
                                },
                            ..
                        },
                    )) if id == request_id => return Ok(response),
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Transports(
                        request_response::Event::OutboundFailure {
                            request_id: id,
                            error,
                            ..
                        },
                    )) if id == request_id => {
                        return Err(RequestError::Stream(error.to_string()));
                    }
                    _ => {}
                }
            }
        };

        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| RequestError::Stream("transports query timed out".to_string()))?
    }
}
