use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use cid::Cid;
use color_eyre::{eyre::eyre, Result};
use futures::{AsyncRead, AsyncWrite, StreamExt};
use libp2p::swarm::SwarmEvent;
use libp2p::{request_response, StreamProtocol, Swarm};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::net::host::{connect, PeerAddr, ProbeBehaviour, ProbeBehaviourEvent};
use crate::net::transports::{read_length_prefixed, write_length_prefixed};
use crate::types::{ErrorCode, RetrievalResult};

pub const DATA_TRANSFER_PROTOCOL: StreamProtocol = StreamProtocol::new("/fil/datatransfer/1.2.0");

const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Session ids must increase monotonically per deal; the counter is
/// seeded from wall time so restarts do not reuse ids.
pub struct SessionCounter(AtomicU64);

impl SessionCounter {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self(AtomicU64::new(seed))
    }

    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Default for SessionCounter {
    fn default() -> Self {
        Self::new()
    }
}

static SESSION_COUNTER: Lazy<SessionCounter> = Lazy::new(SessionCounter::new);

/// Zero-priced retrieval proposal with a match-point selector: the
/// session transfers just the root node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DealProposal {
    #[serde(rename = "PayloadCID")]
    pub payload_cid: String,
    #[serde(rename = "ID")]
    pub id: u64,
    pub params: DealParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DealParams {
    pub selector: ciborium::Value,
    pub price_per_byte: String,
    pub unseal_price: String,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

impl DealProposal {
    pub fn zero_priced(payload_cid: &Cid, id: u64) -> Self {
        Self {
            payload_cid: payload_cid.to_string(),
            id,
            params: DealParams {
                selector: match_point_selector(),
                price_per_byte: "0".to_string(),
                unseal_price: "0".to_string(),
                payment_interval: 0,
                payment_interval_increase: 0,
            },
        }
    }
}

/// The `Matcher` selector: visit the root, match it, descend nowhere.
pub fn match_point_selector() -> ciborium::Value {
    ciborium::Value::Map(vec![(
        ciborium::Value::Text(".".to_string()),
        ciborium::Value::Map(vec![]),
    )])
}

/// One frame of the session event stream.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TransferEvent {
    #[serde(default)]
    completed: bool,
    #[serde(default)]
    rejected: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<ciborium::Value>,
}

/// Aggregate timings of one completed session.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub ttfb: Duration,
    pub downloaded: u64,
    pub duration: Duration,
    pub rejected: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DataTransferCodec;

#[async_trait]
impl request_response::Codec for DataTransferCodec {
    type Protocol = StreamProtocol;
    type Request = DealProposal;
    type Response = TransferStats;

    async fn read_request<T>(
        &mut self,
        _: &Self::Protocol,
        _: &mut T,
    ) -> std::io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "inbound sessions are not served",
        ))
    }

    /// Streams event frames until the provider reports completion,
    /// timing the first data byte and counting payload bytes.
    async fn read_response<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
    ) -> std::io::Result<TransferStats>
    where
        T: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let mut stats = TransferStats::default();
        let mut saw_data = false;

        loop {
            let frame = match read_length_prefixed(io, MAX_FRAME_SIZE).await {
                Ok(frame) => frame,
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err),
            };

            let event: TransferEvent = ciborium::from_reader(frame.as_slice())
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

            if let Some(ciborium::Value::Bytes(bytes)) = &event.data {
                if !saw_data {
                    stats.ttfb = started.elapsed();
                    saw_data = true;
                }
                stats.downloaded += bytes.len() as u64;
            }

            if event.rejected {
                stats.rejected = Some(event.message);
                break;
            }
            if event.completed {
                break;
            }
        }

        stats.duration = started.elapsed();
        if !saw_data {
            stats.ttfb = stats.duration;
        }
        Ok(stats)
    }

    async fn write_request<T>(
        &mut self,
        _: &Self::Protocol,
        io: &mut T,
        proposal: Self::Request,
    ) -> std::io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let mut frame = Vec::new();
        ciborium::into_writer(&proposal, &mut frame)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        write_length_prefixed(io, &frame).await
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

/// Timed single-root retrieval over the session protocol.
pub struct GraphsyncClient {
    timeout: Duration,
}

impl GraphsyncClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn retrieve(
        &self,
        swarm: &mut Swarm<ProbeBehaviour>,
        target: &PeerAddr,
        cid: Cid,
        shutdown: &CancellationToken,
    ) -> Result<RetrievalResult> {
        info!("connecting to target peer {}", target.peer_id);
        if let Err(err) = connect(swarm, target, self.timeout).await {
            return Ok(RetrievalResult::error(ErrorCode::CannotConnect, err));
        }

        let proposal = DealProposal::zero_priced(&cid, SESSION_COUNTER.next());
        debug!(session = proposal.id, %cid, "opening retrieval session");
        let request_id = swarm
            .behaviour_mut()
            .graphsync
            .send_request(&target.peer_id, proposal);

        let wait = async {
            loop {
                match swarm.select_next_some().await {
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Graphsync(
                        request_response::Event::Message {
                            message:
                                request_response::Message::Response {
                                    request_id: id,
                                    response,
                                },
                            ..
                        },
                    )) if id == request_id => return Ok(response),
                    SwarmEvent::Behaviour(ProbeBehaviourEvent::Graphsync(
                        request_response::Event::OutboundFailure {
                            request_id: id,
                            error,
                            ..
                        },
                    )) if id == request_id => return Err(error.to_string()),
                    _ => {}
                }
            }
        };

        let stats = tokio::select! {
            outcome = tokio::time::timeout(self.timeout, wait) => match outcome {
                Ok(Ok(stats)) => stats,
                Ok(Err(message)) => {
                    return Ok(RetrievalResult::error(ErrorCode::RetrievalFailure, message));
                }
                Err(_) => {
                    return Ok(RetrievalResult::error(
                        ErrorCode::Timeout,
                        format!("timed out after {:?}", self.timeout),
                    ));
                }
            },
            _ = shutdown.cancelled() => {
                return Err(eyre!("retrieval canceled by shutdown"));
            }
        };

        if let Some(message) = stats.rejected {
            return Ok(RetrievalResult::error(
                ErrorCode::ResponseRejected,
                format!("response rejected: {message}"),
            ));
        }
        if stats.downloaded == 0 {
            return Ok(RetrievalResult::error(
                ErrorCode::RetrievalFailure,
                "session completed without payload",
            ));
        }

        Ok(RetrievalResult::success(
            stats.ttfb,
            stats.downloaded,
            stats.duration,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_increase_monotonically() {
        let counter = SessionCounter::new();
        let first = counter.next();
        let second = counter.next();
        assert!(second > first);
    }

    #[test]
    fn proposal_serializes_to_cbor() {
        use multihash_codetable::{Code, MultihashDigest};

        let cid = Cid::new_v1(0x55, Code::Sha2_256.digest(b"root"));
        let proposal = DealProposal::zero_priced(&cid, 7);

        let mut frame = Vec::new();
        ciborium::into_writer(&proposal, &mut frame).unwrap();
        let decoded: ciborium::Value = ciborium::from_reader(frame.as_slice()).unwrap();

        let ciborium::Value::Map(entries) = decoded else {
            panic!("proposal must encode as a map");
        };
        let keys: Vec<String> = entries
            .iter()
            .filter_map(|(key, _)| key.as_text().map(str::to_string))
            .collect();
        assert!(keys.contains(&"PayloadCID".to_string()));
        assert!(keys.contains(&"ID".to_string()));
        assert!(keys.contains(&"Params".to_string()));
    }

    #[test]
    fn event_frames_tolerate_partial_fields() {
        let mut frame = Vec::new();
        ciborium::into_writer(
            &ciborium::Value::Map(vec![(
                ciborium::Value::Text("Completed".to_string()),
                ciborium::Value::Bool(true),
            )]),
            &mut frame,
        )
        .unwrap();

        let event: TransferEvent = ciborium::from_reader(frame.as_slice()).unwrap();
        assert!(event.completed);
        assert!(!event.rejected);
        assert!(event.data.is_none());
    }
}
