use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use moka::future::Cache;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::utils::build_reqwest_retry_client;

pub const DEFAULT_LOTUS_API_URL: &str = "https://api.node.glif.io/rpc/v0";

/// Chain-level view of one provider: peer id plus announced addresses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinerInfo {
    #[serde(rename = "PeerId", default)]
    pub peer_id: Option<String>,
    #[serde(
        rename = "Multiaddrs",
        default,
        deserialize_with = "nullable_string_vec"
    )]
    pub multiaddrs_base64: Vec<String>,
    #[serde(skip)]
    pub multiaddrs: Vec<Vec<u8>>,
}

/// The RPC serializes an absent address list as an explicit null.
fn nullable_string_vec<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<MinerInfo>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    message: String,
}

/// Read-through cache over `Filecoin.StateMinerInfo`, with an optional
/// shared remote cache between the in-process tier and the RPC.
pub struct ProviderResolver {
    cache: Cache<String, MinerInfo>,
    http: ClientWithMiddleware,
    lotus_url: String,
    lotus_token: Option<String>,
    remote_cache_url: Option<String>,
}

impl ProviderResolver {
    pub fn new(
        lotus_url: String,
        lotus_token: Option<String>,
        remote_cache_url: Option<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
            http: build_reqwest_retry_client(250, 4000),
            lotus_url,
            lotus_token,
            remote_cache_url,
        }
    }

    pub async fn resolve_provider(&self, provider: &str) -> Result<MinerInfo> {
        if let Some(cached) = self.cache.get(provider).await {
            return Ok(cached);
        }

        if let Some(remote) = self.remote_cache_get(provider).await {
            self.cache.insert(provider.to_string(), remote.clone()).await;
            return Ok(remote);
        }

        debug!("getting miner info for {provider}");
        let info = self.fetch_miner_info(provider).await?;

        self.cache.insert(provider.to_string(), info.clone()).await;
        self.remote_cache_put(provider, &info);
        Ok(info)
    }

    async fn fetch_miner_info(&self, provider: &str) -> Result<MinerInfo> {
        let mut request = self.http.post(&self.lotus_url).json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "Filecoin.StateMinerInfo",
            "params": [provider, null],
        }));
        if let Some(token) = &self.lotus_token {
            request = request.bearer_auth(token);
        }

        let response: RpcResponse = request
            .send()
            .await
            .wrap_err("failed to call chain RPC")?
            .json()
            .await
            .wrap_err("failed to decode miner info")?;

        if let Some(error) = response.error {
            return Err(eyre!("chain RPC error: {}", error.message));
        }
        let mut info = response
            .result
            .ok_or_else(|| eyre!("chain RPC returned no result"))?;

        info.multiaddrs = Vec::with_capacity(info.multiaddrs_base64.len());
        for encoded in &info.multiaddrs_base64 {
            let decoded = BASE64
                .decode(encoded)
                .wrap_err("failed to decode multiaddr")?;
            info.multiaddrs.push(decoded);
        }

        Ok(info)
    }

    async fn remote_cache_get(&self, provider: &str) -> Option<MinerInfo> {
        let base = self.remote_cache_url.as_ref()?;
        let response = self
            .http
            .get(format!("{base}/getProviderInfo"))
            .query(&[("provider", provider)])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }

        let mut info: MinerInfo = response.json().await.ok()?;
        info.multiaddrs = info
            .multiaddrs_base64
            .iter()
            .filter_map(|encoded| BASE64.decode(encoded).ok())
            .collect();
        Some(info)
    }

    fn remote_cache_put(&self, provider: &str, info: &MinerInfo) {
        let Some(base) = self.remote_cache_url.clone() else {
            return;
        };
        let http = self.http.clone();
        let provider = provider.to_string();
        let info = info.clone();
        tokio::spawn(async move {
            if let Err(err) = http
                .post(format!("{base}/setProviderInfo"))
                .query(&[("provider", provider.as_str())])
                .json(&info)
                .send()
                .await
            {
                warn!("failed to write provider to shared cache: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn miner_info_decodes_rpc_shape() {
        let info: MinerInfo = serde_json::from_str(
            r#"{"PeerId": "12D3KooWGQmdpbssrYHWFTwwbKmKL3i54EJC9j7RRNb47U9jUv1U",
                "Multiaddrs": ["BGh00wYGJ5s="],
                "SectorSize": 34359738368}"#,
        )
        .unwrap();
        assert_eq!(
            info.peer_id.as_deref(),
            Some("12D3KooWGQmdpbssrYHWFTwwbKmKL3i54EJC9j7RRNb47U9jUv1U")
        );
        assert_eq!(info.multiaddrs_base64.len(), 1);
    }

    #[test]
    fn miner_info_tolerates_null_fields() {
        let info: MinerInfo =
            serde_json::from_str(r#"{"PeerId": null, "Multiaddrs": null}"#).unwrap();
        assert!(info.peer_id.is_none());
        assert!(info.multiaddrs_base64.is_empty());
    }
}
