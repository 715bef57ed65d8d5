use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::eyre::eyre;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::errors::RequestError;

/// Probe module names as they appear on the wire and in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleName {
    Stub,
    GraphSync,
    Http,
    Bitswap,
}

impl ModuleName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stub => "stub",
            Self::GraphSync => "graphsync",
            Self::Http => "http",
            Self::Bitswap => "bitswap",
        }
    }
}

impl fmt::Display for ModuleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ModuleName {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stub" => Ok(Self::Stub),
            "graphsync" => Ok(Self::GraphSync),
            "http" => Ok(Self::Http),
            "bitswap" => Ok(Self::Bitswap),
            _ => Err(eyre!("invalid module name: {s}")),
        }
    }
}

/// Closed error taxonomy. Wire form is lowercase snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoValidMultiaddrs,
    InvalidPeerid,
    CannotConnect,
    NotFound,
    RetrievalFailure,
    ProtocolNotSupported,
    Timeout,
    DealRejectedPricePerByteTooLow,
    DealRejectedUnsealPriceTooLow,
    Throttled,
    NoAccess,
    UnderMaintenance,
    NotOnline,
    UnconfirmedBlockTransfer,
    CidCodecNotSupported,
    CidMismatch,
    ResponseRejected,
    DealStateMissing,
    CannotDecodeLinks,
    CannotTraverse,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoValidMultiaddrs => "no_valid_multiaddrs",
            Self::InvalidPeerid => "invalid_peerid",
            Self::CannotConnect => "cannot_connect",
            Self::NotFound => "not_found",
            Self::RetrievalFailure => "retrieval_failure",
            Self::ProtocolNotSupported => "protocol_not_supported",
            Self::Timeout => "timeout",
            Self::DealRejectedPricePerByteTooLow => "deal_rejected_price_per_byte_too_low",
            Self::DealRejectedUnsealPriceTooLow => "deal_rejected_unseal_price_too_low",
            Self::Throttled => "throttled",
            Self::NoAccess => "no_access",
            Self::UnderMaintenance => "under_maintenance",
            Self::NotOnline => "not_online",
            Self::UnconfirmedBlockTransfer => "unconfirmed_block_transfer",
            Self::CidCodecNotSupported => "cid_codec_not_supported",
            Self::CidMismatch => "cid_mismatch",
            Self::ResponseRejected => "response_rejected",
            Self::DealStateMissing => "deal_state_missing",
            Self::CannotDecodeLinks => "cannot_decode_links",
            Self::CannotTraverse => "cannot_traverse",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = color_eyre::eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no_valid_multiaddrs" => Ok(Self::NoValidMultiaddrs),
            "invalid_peerid" => Ok(Self::InvalidPeerid),
            "cannot_connect" => Ok(Self::CannotConnect),
            "not_found" => Ok(Self::NotFound),
            "retrieval_failure" => Ok(Self::RetrievalFailure),
            "protocol_not_supported" => Ok(Self::ProtocolNotSupported),
            "timeout" => Ok(Self::Timeout),
            "deal_rejected_price_per_byte_too_low" => Ok(Self::DealRejectedPricePerByteTooLow),
            "deal_rejected_unseal_price_too_low" => Ok(Self::DealRejectedUnsealPriceTooLow),
            "throttled" => Ok(Self::Throttled),
            "no_access" => Ok(Self::NoAccess),
            "under_maintenance" => Ok(Self::UnderMaintenance),
            "not_online" => Ok(Self::NotOnline),
            "unconfirmed_block_transfer" => Ok(Self::UnconfirmedBlockTransfer),
            "cid_codec_not_supported" => Ok(Self::CidCodecNotSupported),
            "cid_mismatch" => Ok(Self::CidMismatch),
            "response_rejected" => Ok(Self::ResponseRejected),
            "deal_state_missing" => Ok(Self::DealStateMissing),
            "cannot_decode_links" => Ok(Self::CannotDecodeLinks),
            "cannot_traverse" => Ok(Self::CannotTraverse),
            _ => Err(eyre!("invalid error code: {s}")),
        }
    }
}

/// Provider snapshot embedded in each task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multiaddrs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continent: Option<String>,
}

impl Provider {
    /// Decodes the snapshot into a dialable peer id plus addresses.
    pub fn peer_addr(&self) -> Result<(PeerId, Vec<Multiaddr>), RequestError> {
        let peer_id = self.peer_id.as_deref().unwrap_or_default();
        let peer_id = peer_id
            .parse::<PeerId>()
            .map_err(|_| RequestError::InvalidPeerId(peer_id.to_string()))?;

        let mut addrs = Vec::with_capacity(self.multiaddrs.len());
        for addr in &self.multiaddrs {
            let parsed = addr
                .parse::<Multiaddr>()
                .map_err(|_| RequestError::NoValidMultiAddr)?;
            addrs.push(parsed);
        }

        Ok((peer_id, addrs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub cid: String,
}

/// One scheduled probe. Tasks are pop-once: dequeuing deletes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub requester: String,
    pub module: ModuleName,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub provider: Provider,
    pub content: Content,
    #[serde(with = "duration_ns")]
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
}

/// The worker's own geo identity, captured once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Retriever {
    pub ip: String,
    pub city: String,
    pub region: String,
    pub country: String,
    pub continent: String,
    pub asn: String,
    pub isp: String,
    pub lat: f32,
    pub long: f32,
}

/// Probe outcome. Exactly one of the two shapes is meaningful: on
/// success the timing fields are set, on failure the error fields are.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    #[serde(with = "duration_ns")]
    pub ttfb: Duration,
    pub speed: f64,
    #[serde(with = "duration_ns")]
    pub duration: Duration,
    pub downloaded: u64,
}

impl RetrievalResult {
    pub fn error(code: ErrorCode, message: impl fmt::Display) -> Self {
        Self {
            success: false,
            error_code: Some(code),
            error_message: message.to_string(),
            ttfb: Duration::ZERO,
            speed: 0.0,
            duration: Duration::ZERO,
            downloaded: 0,
        }
    }

    pub fn success(ttfb: Duration, downloaded: u64, duration: Duration) -> Self {
        Self {
            success: true,
            error_code: None,
            error_message: String::new(),
            ttfb,
            speed: downloaded as f64 / duration.as_secs_f64(),
            duration,
            downloaded,
        }
    }
}

/// Append-only record of one executed task. Persisted flattened: the
/// task's own fields plus the retriever and outcome columns.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: Task,
    pub retriever: Retriever,
    pub result: RetrievalResult,
    pub created_at: DateTime<Utc>,
}

/// Durations persist as signed 64-bit nanosecond counts.
pub mod duration_ns {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.as_nanos() as i64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = i64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos.max(0) as u64))
    }
}
