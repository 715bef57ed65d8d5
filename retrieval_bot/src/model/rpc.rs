use serde::{Deserialize, Serialize};

/// Wire shapes of the upstream deal feed and the chain RPC, which both
/// serialize deals the same way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deal {
    #[serde(rename = "Proposal")]
    pub proposal: DealProposal,
    #[serde(rename = "State")]
    pub state: DealStateInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CidRef {
    #[serde(rename = "/")]
    pub root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DealProposal {
    #[serde(rename = "PieceCID")]
    pub piece_cid: CidRef,
    pub piece_size: i64,
    pub verified_deal: bool,
    pub client: String,
    pub provider: String,
    #[serde(default)]
    pub label: String,
    pub start_epoch: i32,
    pub end_epoch: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DealStateInfo {
    pub sector_start_epoch: i32,
    pub last_updated_epoch: i32,
    pub slash_epoch: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_feed_shape() {
        let deal: Deal = serde_json::from_str(
            r#"{
                "Proposal": {
                    "PieceCID": {"/": "baga6ea4seaqao7s73y24kcutaosvacpdjgfe5pw76ooefnyqw4ynr3d2y6x2mpq"},
                    "PieceSize": 34359738368,
                    "VerifiedDeal": true,
                    "Client": "f01850099",
                    "Provider": "f01895913",
                    "Label": "bafybeid6s5cuwe3e3b54gvmrhieqvlyxwxitjhigtqvyh2cb6ks2yyz7ka",
                    "StartEpoch": 2779457,
                    "EndEpoch": 4324157
                },
                "State": {
                    "SectorStartEpoch": 2776138,
                    "LastUpdatedEpoch": 3575447,
                    "SlashEpoch": -1
                }
            }"#,
        )
        .unwrap();

        assert_eq!(deal.proposal.provider, "f01895913");
        assert_eq!(deal.state.slash_epoch, -1);
        assert!(deal.proposal.piece_cid.root.starts_with("baga"));
    }
}
