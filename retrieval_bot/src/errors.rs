use color_eyre::Report;

use crate::types::{ErrorCode, RetrievalResult};

/// Typed failure shapes raised by the resolution and probe layers.
/// The classifier downcasts to these before falling back to substring
/// matching, so wrapping them in `eyre` context is safe at any depth.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid IP: {0}")]
    InvalidIp(String),

    #[error("bogon IP: {0}")]
    BogonIp(String),

    #[error("failed to lookup host {host}: {message}")]
    HostLookup { host: String, message: String },

    #[error("no valid multiaddr")]
    NoValidMultiAddr,

    #[error("failed to decode peer id: {0}")]
    InvalidPeerId(String),

    #[error("failed to connect to peer {peer}: {message}")]
    CannotConnect { peer: String, message: String },

    #[error("failed to get supported protocols from peer: {0}")]
    Stream(String),
}

impl RequestError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidIp(_) | Self::BogonIp(_) | Self::HostLookup { .. } => {
                ErrorCode::NoValidMultiaddrs
            }
            Self::NoValidMultiAddr => ErrorCode::NoValidMultiaddrs,
            Self::InvalidPeerId(_) => ErrorCode::InvalidPeerid,
            Self::CannotConnect { .. } => ErrorCode::CannotConnect,
            Self::Stream(_) => ErrorCode::RetrievalFailure,
        }
    }
}

/// Substring table applied to the stringified error chain after typed
/// matching fails. Case-sensitive, first match wins.
const SUBSTRING_TABLE: &[(&str, ErrorCode)] = &[
    (
        "Price per byte too low",
        ErrorCode::DealRejectedPricePerByteTooLow,
    ),
    (
        "Unseal price too small",
        ErrorCode::DealRejectedUnsealPriceTooLow,
    ),
    ("Too many retrieval deals received", ErrorCode::Throttled),
    ("Access Control", ErrorCode::NoAccess),
    ("Under maintenance, retry later", ErrorCode::UnderMaintenance),
    (
        "miner is not accepting online retrieval deals",
        ErrorCode::NotOnline,
    ),
    (
        "unconfirmed block transfer",
        ErrorCode::UnconfirmedBlockTransfer,
    ),
    (
        "no decoder registered for multicodec code",
        ErrorCode::CidCodecNotSupported,
    ),
    ("not found", ErrorCode::NotFound),
    ("response rejected", ErrorCode::ResponseRejected),
    (
        "failed to fetch storage deal state",
        ErrorCode::DealStateMissing,
    ),
    (
        "there is no unsealed piece containing payload cid",
        ErrorCode::NotFound,
    ),
];

/// Maps an arbitrary (possibly wrapped) error to the closed taxonomy.
/// Returns `None` when the error is unclassifiable, signaling the caller
/// to surface it as unhandled.
pub fn resolve_error(err: &Report) -> Option<ErrorCode> {
    for cause in err.chain() {
        if cause.is::<tokio::time::error::Elapsed>() {
            return Some(ErrorCode::Timeout);
        }
        if let Some(typed) = cause.downcast_ref::<RequestError>() {
            return Some(typed.error_code());
        }
    }

    let chain = err
        .chain()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(": ");

    SUBSTRING_TABLE
        .iter()
        .find(|(needle, _)| chain.contains(needle))
        .map(|(_, code)| *code)
}

/// Converts a raw error into a failed result when it classifies.
pub fn resolve_error_result(err: &Report) -> Option<RetrievalResult> {
    resolve_error(err).map(|code| RetrievalResult::error(code, format!("{err:#}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use color_eyre::eyre::eyre;

    #[test]
    fn cannot_connect_classifies_through_arbitrary_wrapping() {
        let err = Report::new(RequestError::CannotConnect {
            peer: "12D3KooW".to_string(),
            message: "cannot dial".to_string(),
        })
        .wrap_err("failed to check if provider is boost")
        .wrap_err("probe failed");

        assert_eq!(resolve_error(&err), Some(ErrorCode::CannotConnect));
    }

    #[test]
    fn deadline_exceeded_classifies_as_timeout() {
        let elapsed = tokio_test::block_on(async {
            tokio::time::timeout(std::time::Duration::ZERO, std::future::pending::<()>()).await
        })
        .unwrap_err();
        let err = Report::new(elapsed).wrap_err("retrieval stalled");

        assert_eq!(resolve_error(&err), Some(ErrorCode::Timeout));
    }

    #[test]
    fn substring_table_matches_stringified_cause() {
        let err = eyre!("deal rejected: Too many retrieval deals received");
        assert_eq!(resolve_error(&err), Some(ErrorCode::Throttled));

        let err = eyre!("getting proposal: Price per byte too low");
        assert_eq!(
            resolve_error(&err),
            Some(ErrorCode::DealRejectedPricePerByteTooLow)
        );

        let err = eyre!("block was not found locally (offline)");
        assert_eq!(resolve_error(&err), Some(ErrorCode::NotFound));
    }

    #[test]
    fn substring_matching_is_case_sensitive() {
        let err = eyre!("access control");
        assert_eq!(resolve_error(&err), None);
    }

    #[test]
    fn typed_match_wins_over_substrings() {
        let err = Report::new(RequestError::BogonIp("0.0.0.0".to_string()))
            .wrap_err("not found while resolving");
        assert_eq!(resolve_error(&err), Some(ErrorCode::NoValidMultiaddrs));
    }

    #[test]
    fn unmatched_errors_stay_unclassified() {
        let err = eyre!("some novel failure nobody anticipated");
        assert_eq!(resolve_error(&err), None);
        assert!(resolve_error_result(&err).is_none());
    }

    #[test]
    fn resolved_result_carries_message_and_code() {
        let err = eyre!("Under maintenance, retry later");
        let result = resolve_error_result(&err).unwrap();
        assert!(!result.success);
        assert_eq!(result.error_code, Some(ErrorCode::UnderMaintenance));
        assert!(result.error_message.contains("Under maintenance"));
    }
}
