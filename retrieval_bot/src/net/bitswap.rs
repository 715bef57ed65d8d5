use std::time::{Duration, Instant};

use async_trait::async_trait;
use cid::Cid;
use color_eyre::Result;
use futures::{AsyncRead, AsyncWrite, StreamExt};
use libp2p::swarm::SwarmEvent;
use libp2p::{request_response, StreamProtocol, Swarm};
use prost::Message as _;
use rand::Rng;
use tracing::{debug, info};

use crate::net::host::{
    acknowledge_bitswap_request, connect, PeerAddr, ProbeBehaviour, ProbeBehaviourEvent,
};
use crate::net::pb;
use crate::net::transports::{read_length_prefixed, write_length_prefixed};
use crate::net::traverse::{decode_links, TraverseError, RAW_CODEC};
use crate::types::{ErrorCode, RetrievalResult};

/// Wire protocols in `go-bitswap` preference order.
pub const BITSWAP_PROTOCOLS: [StreamProtocol; 4] = [
    StreamProtocol::new("/ipfs/bitswap/1.2.0"),
    StreamProtocol::new("/ipfs/bitswap/1.1.0"),
    StreamProtocol::new("/ipfs/bitswap/1.0.0"),
    StreamProtocol::new("/ipfs/bitswap"),
];

/// 2 MiB block size cap, per the bitswap spec.
const MAX_BLOCK_SIZE: usize = 2 * 1024 * 1024;

/// Both directions of the protocol share the request slot: the probe
/// sends wants, and the peer's blocks and presences arrive as new
/// inbound streams parsed into `Inbound`.
#[derive(Debug, Clone)]
pub enum WantRequest {
    /// Outbound want-block with send-dont-have set, so a missing block
    /// is reported instead of silently ignored.
    Want(Cid),
    /// Parsed payload of one inbound stream from the peer.
    Inbound(Vec<BitswapInbound>),
}

#[derive(Debug, Clone)]
pub enum BitswapInbound {
    Block { cid: Cid, data: Vec<u8> },
    Have(Cid),
    DontHave(Cid),
}

#[derive(Debug, Clone, Default)]
pub struct BitswapCodec;

#[async_trait]
impl request_response::Codec for BitswapCodec {
    type Protocol = StreamProtocol;
    type Request = WantRequest;
    type Response = ();

    async fn read_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let frame = read_length_prefixed(io, MAX_BLOCK_SIZE + 1024).await?;
        let message = pb::BitswapMessage::decode(frame.as_slice())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

        let mut parts = Vec::new();
        for payload in message.payload {
            let prefix = pb::Prefix::parse(&payload.prefix)?;
            let cid = prefix.to_cid(&payload.data)?;
            parts.push(BitswapInbound::Block {
                cid,
                data: payload.data,
            });
        }
        for presence in message.block_presences {
            let cid = Cid::try_from(presence.cid.as_slice())
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
            match pb::BlockPresenceType::try_from(presence.presence_type) {
                Ok(pb::BlockPresenceType::Have) => parts.push(BitswapInbound::Have(cid)),
                Ok(pb::BlockPresenceType::DontHave) => parts.push(BitswapInbound::DontHave(cid)),
                Err(_) => continue,
            }
        }

        Ok(WantRequest::Inbound(parts))
    }

    /// The peer answers on new inbound streams; the outbound stream just
    /// closes.
    async fn read_response<T>(&mut self, _: &Self::Protocol, _: &mut T) -> std::io::Result<()>
    where
        T: AsyncRead + Unpin + Send,
    {
        Ok(())
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        request: Self::Request,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let WantRequest::Want(cid) = request else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "only wants are sent",
            ));
        };

        let message = pb::BitswapMessage {
            wantlist: Some(pb::Wantlist {
                entries: vec![pb::WantlistEntry {
                    block: cid.to_bytes(),
                    priority: 1,
                    cancel: false,
                    want_type: pb::WantType::Block as i32,
                    send_dont_have: true,
                }],
                full: false,
            }),
            ..Default::default()
        };

        write_length_prefixed(io, &message.encode_to_vec()).await
    }

    async fn write_response<T>(
        &mut self,
        _: &Self::Protocol,
        _: &mut T,
        _: Self::Response,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        Ok(())
    }
}

enum FetchOutcome {
    Block(Vec<u8>),
    NotFound,
    Timeout,
    Failure(String),
}

/// Timed block-exchange retrievals against a single peer.
pub struct BitswapClient {
    timeout: Duration,
    skip_root_manifest_link: bool,
}

impl BitswapClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            skip_root_manifest_link: true,
        }
    }

    /// Known corpus shapes reserve the root's child 0 for an aggregate
    /// manifest; traversal skips it unless told otherwise.
    pub fn with_root_manifest_link(mut self, skip: bool) -> Self {
        self.skip_root_manifest_link = skip;
        self
    }

    /// Single-block retrieval: the block, a DONT_HAVE, or the deadline,
    /// whichever comes first.
    pub async fn retrieve(
        &self,
        swarm: &mut Swarm<ProbeBehaviour>,
        target: &PeerAddr,
        cid: Cid,
    ) -> Result<RetrievalResult> {
        info!("connecting to target peer {}", target.peer_id);
        if let Err(err) = connect(swarm, target, self.timeout).await {
            return Ok(RetrievalResult::error(ErrorCode::CannotConnect, err));
        }

        let started = Instant::now();
        match self.fetch_block(swarm, target, cid).await? {
            FetchOutcome::Block(data) => {
                let elapsed = started.elapsed();
                info!(size = data.len(), ?elapsed, "retrieved block");
                Ok(RetrievalResult::success(elapsed, data.len() as u64, elapsed))
            }
            FetchOutcome::NotFound => Ok(RetrievalResult::error(
                ErrorCode::NotFound,
                "DONT_HAVE received from the target peer",
            )),
            FetchOutcome::Timeout => Ok(RetrievalResult::error(
                ErrorCode::Timeout,
                format!("timed out after {:?}", self.timeout),
            )),
            FetchOutcome::Failure(message) => {
                Ok(RetrievalResult::error(ErrorCode::RetrievalFailure, message))
            }
        }
    }

    /// Depth-limited walk down the DAG: fetch a block, decode its links,
    /// recurse into one child. A raw leaf stops the walk as success.
    pub async fn traverse(
        &self,
        swarm: &mut Swarm<ProbeBehaviour>,
        target: &PeerAddr,
        root: Cid,
        max_depth: u32,
    ) -> Result<RetrievalResult> {
        info!("connecting to target peer {}", target.peer_id);
        if let Err(err) = connect(swarm, target, self.timeout).await {
            return Ok(RetrievalResult::error(ErrorCode::CannotConnect, err));
        }

        let started = Instant::now();
        let mut ttfb = None;
        let mut current = root;
        let mut depth = 0_u32;

        loop {
            let data = match self.fetch_block(swarm, target, current).await? {
                FetchOutcome::Block(data) => data,
                FetchOutcome::NotFound => {
                    return Ok(RetrievalResult::error(
                        ErrorCode::NotFound,
                        format!("DONT_HAVE received for {current}"),
                    ));
                }
                FetchOutcome::Timeout => {
                    return Ok(RetrievalResult::error(
                        ErrorCode::Timeout,
                        format!("timed out after {:?}", self.timeout),
                    ));
                }
                FetchOutcome::Failure(message) => {
                    return Ok(RetrievalResult::error(ErrorCode::RetrievalFailure, message));
                }
            };
            ttfb.get_or_insert_with(|| started.elapsed());
            debug!(cid = %current, depth, size = data.len(), "retrieved block");

            if current.codec() == RAW_CODEC || depth >= max_depth {
                let duration = started.elapsed();
                return Ok(RetrievalResult::success(
                    ttfb.unwrap_or(duration),
                    data.len() as u64,
                    duration,
                ));
            }

            let links = match decode_links(&current, &data) {
                Ok(links) => links,
                Err(err) => return Ok(traverse_error_result(err)),
            };
            if links.is_empty() {
                return Ok(RetrievalResult::error(
                    ErrorCode::CannotTraverse,
                    format!("{current} has no links to traverse"),
                ));
            }

            current = pick_child(&links, depth == 0 && self.skip_root_manifest_link);
            depth += 1;
        }
    }

    async fn fetch_block(
        &self,
        swarm: &mut Swarm<ProbeBehaviour>,
        target: &PeerAddr,
        cid: Cid,
    ) -> Result<FetchOutcome> {
        debug!(%cid, "retrieving block");
        swarm
            .behaviour_mut()
            .bitswap
            .send_request(&target.peer_id, WantRequest::Want(cid));

        let wait = async {
            loop {
                match swarm.select_next_some().await {
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Bitswap(
                        request_response::Event::Message {
                            peer,
                            message:
                                request_response::Message::Request {
                                    request, channel, ..
                                },
                            ..
                        },
                    )) => {
                        acknowledge_bitswap_request(swarm, channel);
                        if peer != target.peer_id {
                            continue;
                        }
                        let WantRequest::Inbound(parts) = request else {
                            continue;
                        };
                        for part in parts {
                            match part {
                                BitswapInbound::Block { cid: got, data } if got == cid => {
                                    return FetchOutcome::Block(data);
                                }
                                BitswapInbound::DontHave(got) if got == cid => {
                                    info!("block not found");
                                    return FetchOutcome::NotFound;
                                }
                                _ => {}
                            }
                        }
                    }
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Bitswap(
                        request_response::Event::OutboundFailure { peer, error, .. },
                    )) if peer == target.peer_id => {
                        return FetchOutcome::Failure(error.to_string());
                    }
                    SwarmEvent::ConnectionClosed {
                        peer_id,
                        num_established: 0,
                        ..
                    } if peer_id == target.peer_id => {
                        return FetchOutcome::Failure("connection closed".to_string());
                    }
                    _ => {}
                }
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => Ok(FetchOutcome::Timeout),
        }
    }
}

fn pick_child(links: &[Cid], skip_first: bool) -> Cid {
    let mut rng = rand::rng();
    if skip_first && links.len() > 1 {
        links[rng.random_range(1..links.len())]
    } else {
        links[rng.random_range(0..links.len())]
    }
}

fn traverse_error_result(err: TraverseError) -> RetrievalResult {
    let code = match err {
        TraverseError::UnsupportedCodec(_) => ErrorCode::CidCodecNotSupported,
        TraverseError::DecodeFailure(_) => ErrorCode::CannotDecodeLinks,
    };
    RetrievalResult::error(code, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use multihash_codetable::{Code, MultihashDigest};

    fn cid_n(n: u8) -> Cid {
        Cid::new_v1(RAW_CODEC, Code::Sha2_256.digest(&[n]))
    }

    #[test]
    fn child_picker_skips_manifest_slot_at_root() {
        let links = vec![cid_n(0), cid_n(1), cid_n(2)];
        for _ in 0..64 {
            assert_ne!(pick_child(&links, true), links[0]);
        }
    }

    #[test]
    fn child_picker_uses_single_link_even_when_skipping() {
        let links = vec![cid_n(0)];
        assert_eq!(pick_child(&links, true), links[0]);
    }

    #[test]
    fn traverse_errors_map_to_taxonomy() {
        let result = traverse_error_result(TraverseError::UnsupportedCodec(0x99));
        assert_eq!(result.error_code, Some(ErrorCode::CidCodecNotSupported));

        let result = traverse_error_result(TraverseError::DecodeFailure("bad".to_string()));
        assert_eq!(result.error_code, Some(ErrorCode::CannotDecodeLinks));
    }
}
