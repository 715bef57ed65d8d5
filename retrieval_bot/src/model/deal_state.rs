use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::epoch::epoch_to_time;
use crate::model::rpc;

/// One observed storage agreement, as persisted in the deal store.
/// Epochs are converted to wall-clock at the ingest boundary.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DealState {
    #[sqlx(try_from = "i64")]
    #[serde(deserialize_with = "deserialize_deal_id")]
    pub deal_id: u64,
    pub piece_cid: String,
    pub piece_size: i64,
    pub label: String,
    pub verified: bool,
    pub client: String,
    pub provider: String,
    pub start: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
    pub sector_start: DateTime<Utc>,
    pub slashed: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl DealState {
    pub fn from_rpc(deal_id: u64, deal: &rpc::Deal) -> Self {
        Self {
            deal_id,
            piece_cid: deal.proposal.piece_cid.root.clone(),
            piece_size: deal.proposal.piece_size,
            label: deal.proposal.label.clone(),
            verified: deal.proposal.verified_deal,
            client: deal.proposal.client.clone(),
            provider: deal.proposal.provider.clone(),
            start: epoch_to_time(deal.proposal.start_epoch),
            expiration: epoch_to_time(deal.proposal.end_epoch),
            sector_start: epoch_to_time(deal.state.sector_start_epoch),
            slashed: epoch_to_time(deal.state.slash_epoch),
            last_updated: epoch_to_time(deal.state.last_updated_epoch),
        }
    }

    /// Deal age measured from sector activation, in fractional years.
    pub fn age_in_years(&self) -> f64 {
        let elapsed = Utc::now() - self.sector_start;
        elapsed.num_seconds() as f64 / (24.0 * 365.0 * 3600.0)
    }
}

/// Historical documents carried deal ids in both 32- and 64-bit widths;
/// accept any unsigned integer and normalize to u64.
fn deserialize_deal_id<'de, D: serde::Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let raw = serde_json::Number::deserialize(deserializer)?;
    raw.as_u64()
        .ok_or_else(|| serde::de::Error::custom(format!("deal id out of range: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epoch::time_to_epoch;

    fn deal_with_sector_start(sector_start: DateTime<Utc>) -> DealState {
        DealState {
            deal_id: 1,
            piece_cid: "baga".to_string(),
            piece_size: 100,
            label: String::new(),
            verified: true,
            client: "f0100".to_string(),
            provider: "f0200".to_string(),
            start: sector_start,
            expiration: Utc::now() + chrono::Duration::days(180),
            sector_start,
            slashed: epoch_to_time(-1),
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn age_is_about_one_year_for_year_old_deals() {
        let deal = deal_with_sector_start(Utc::now() - chrono::Duration::days(365));
        assert!((deal.age_in_years() - 1.0).abs() < 0.01);
    }

    #[test]
    fn rpc_conversion_normalizes_epochs() {
        let now_epoch = time_to_epoch(Utc::now());
        let deal = rpc::Deal {
            proposal: rpc::DealProposal {
                piece_cid: rpc::CidRef {
                    root: "baga6ea4seaq".to_string(),
                },
                piece_size: 34_359_738_368,
                verified_deal: true,
                client: "f0999".to_string(),
                provider: "f0888".to_string(),
                label: "bafybeib".to_string(),
                start_epoch: now_epoch,
                end_epoch: now_epoch + 10,
            },
            state: rpc::DealStateInfo {
                sector_start_epoch: now_epoch,
                last_updated_epoch: -1,
                slash_epoch: -1,
            },
        };

        let state = DealState::from_rpc(42, &deal);
        assert_eq!(state.deal_id, 42);
        assert_eq!(state.piece_cid, "baga6ea4seaq");
        assert_eq!(time_to_epoch(state.sector_start), now_epoch);
        assert_eq!(state.last_updated.timestamp(), 0);
    }

    #[test]
    fn deal_id_widths_normalize_to_u64() {
        let narrow: DealState = serde_json::from_value(serde_json::json!({
            "deal_id": 77_i32,
            "piece_cid": "baga", "piece_size": 1, "label": "", "verified": false,
            "client": "a", "provider": "b",
            "start": "2023-01-01T00:00:00Z", "expiration": "2024-01-01T00:00:00Z",
            "sector_start": "2023-01-01T00:00:00Z", "slashed": "1970-01-01T00:00:00Z",
            "last_updated": "2023-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(narrow.deal_id, 77);

        let wide: DealState = serde_json::from_value(serde_json::json!({
            "deal_id": 9_000_000_000_u64,
            "piece_cid": "baga", "piece_size": 1, "label": "", "verified": false,
            "client": "a", "provider": "b",
            "start": "2023-01-01T00:00:00Z", "expiration": "2024-01-01T00:00:00Z",
            "sector_start": "2023-01-01T00:00:00Z", "slashed": "1970-01-01T00:00:00Z",
            "last_updated": "2023-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(wide.deal_id, 9_000_000_000);
    }
}
