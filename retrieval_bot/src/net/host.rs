use std::time::Duration;

use color_eyre::Result;
use futures::StreamExt;
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, noise, request_response, tcp, yamux, Multiaddr, PeerId, Swarm};

use crate::errors::RequestError;
use crate::net::bitswap::{BitswapCodec, BitswapInbound, WantRequest, BITSWAP_PROTOCOLS};
use crate::net::graphsync::{DataTransferCodec, DATA_TRANSFER_PROTOCOL};
use crate::net::transports::{TransportsCodec, TRANSPORTS_PROTOCOL};

const AGENT_VERSION: &str = concat!("retrieval-bot/", env!("CARGO_PKG_VERSION"));

/// Dialable peer identity: peer id plus its known addresses.
#[derive(Debug, Clone)]
pub struct PeerAddr {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

/// The probe host. One swarm is constructed per retrieval and dropped on
/// every exit path; the protocol clients borrow it mutably in turn.
#[derive(NetworkBehaviour)]
pub struct ProbeBehaviour {
    pub identify: identify::Behaviour,
    pub bitswap: request_response::Behaviour<BitswapCodec>,
    pub transports: request_response::Behaviour<TransportsCodec>,
    pub graphsync: request_response::Behaviour<DataTransferCodec>,
}

pub fn new_probe_swarm() -> Result<Swarm<ProbeBehaviour>> {
    let swarm = libp2p::SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_dns()?
        .with_behaviour(|key| ProbeBehaviour {
            identify: identify::Behaviour::new(
                identify::Config::new("/ipfs/id/1.0.0".to_string(), key.public())
                    .with_agent_version(AGENT_VERSION.to_string()),
            ),
            bitswap: request_response::Behaviour::with_codec(
                BitswapCodec::default(),
                BITSWAP_PROTOCOLS
                    .iter()
                    .map(|protocol| (protocol.clone(), request_response::ProtocolSupport::Full)),
                request_response::Config::default().with_request_timeout(Duration::from_secs(60)),
            ),
            transports: request_response::Behaviour::with_codec(
                TransportsCodec::default(),
                std::iter::once((
                    TRANSPORTS_PROTOCOL.clone(),
                    request_response::ProtocolSupport::Outbound,
                )),
                request_response::Config::default().with_request_timeout(Duration::from_secs(60)),
            ),
            graphsync: request_response::Behaviour::with_codec(
                DataTransferCodec::default(),
                std::iter::once((
                    DATA_TRANSFER_PROTOCOL.clone(),
                    request_response::ProtocolSupport::Outbound,
                )),
                request_response::Config::default().with_request_timeout(Duration::from_secs(60)),
            ),
        })
        .expect("behaviour construction cannot fail")
        .with_swarm_config(|config| config.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

/// Dials the peer and waits for the connection, honoring the timeout.
pub async fn connect(
    swarm: &mut Swarm<ProbeBehaviour>,
    target: &PeerAddr,
    timeout: Duration,
) -> Result<(), RequestError> {
    let dial = DialOpts::peer_id(target.peer_id)
        .condition(PeerCondition::Always)
        .addresses(target.addrs.clone())
        .build();
    swarm.dial(dial).map_err(|err| RequestError::CannotConnect {
        peer: target.peer_id.to_string(),
        message: err.to_string(),
    })?;

    let wait = async {
        loop {
            match swarm.select_next_some().await {
                SwarmEvent::ConnectionEstablished { peer_id, .. }
                    if peer_id == target.peer_id =>
                {
                    return Ok(());
                }
                SwarmEvent::OutgoingConnectionError {
                    peer_id: Some(peer_id),
                    error,
                    ..
                } if peer_id == target.peer_id => {
                    return Err(RequestError::CannotConnect {
                        peer: target.peer_id.to_string(),
                        message: error.to_string(),
                    });
                }
                _ => {}
            }
        }
    };

    match tokio::time::timeout(timeout, wait).await {
        Ok(result) => result,
        Err(_) => Err(RequestError::CannotConnect {
            peer: target.peer_id.to_string(),
            message: "dial timed out".to_string(),
        }),
    }
}

/// Connects and waits for the identify exchange, returning the peer's
/// announced protocol set and addresses.
pub async fn connect_and_identify(
    swarm: &mut Swarm<ProbeBehaviour>,
    target: &PeerAddr,
    timeout: Duration,
) -> Result<identify::Info, RequestError> {
    let deadline = tokio::time::Instant::now() + timeout;
    connect(swarm, target, timeout).await?;

    let wait = async {
        loop {
            if let SwarmEvent::Behaviour(ProbeBehaviourEvent::Identify(
                identify::Event::Received { peer_id, info, .. },
            )) = swarm.select_next_some().await
            {
                if peer_id == target.peer_id {
                    return info;
                }
            }
        }
    };

    tokio::time::timeout_at(deadline, wait)
        .await
        .map_err(|_| RequestError::Stream("identify timed out".to_string()))
}

/// Inbound bitswap streams carry the peer's responses; each one is
/// acknowledged so the stream closes cleanly.
pub fn acknowledge_bitswap_request(
    swarm: &mut Swarm<ProbeBehaviour>,
    channel: request_response::ResponseChannel<()>,
) {
    let _ = swarm.behaviour_mut().bitswap.send_response(channel, ());
}

/// Convenience alias for the bitswap request-response events.
pub type BitswapEvent = request_response::Event<WantRequest, Vec<BitswapInbound>>;
