use std::net::IpAddr;
use std::time::Duration;

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use moka::future::Cache;
use multiaddr::Multiaddr;
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::continents::continent_for_country;
use crate::errors::RequestError;
use crate::multiaddr_util::decode_host_port;
use crate::utils::build_reqwest_retry_client;

pub const DEFAULT_IPINFO_URL: &str = "https://ipinfo.io";

/// Geo record for one IP, as served by the geo API plus the derived
/// continent, coordinates and org split.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpInfo {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub continent: String,
    #[serde(default)]
    pub loc: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub postal: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub bogon: bool,
    #[serde(default)]
    pub latitude: f32,
    #[serde(default)]
    pub longitude: f32,
    #[serde(default)]
    pub asn: String,
    #[serde(default)]
    pub isp: String,
}

impl IpInfo {
    /// Splits the `"lat,long"` and `"ASN ISP"` strings into their parts.
    pub fn resolve_derived_fields(&mut self) {
        let loc: Vec<&str> = self.loc.split(',').collect();
        if loc.len() == 2 {
            if let Ok(lat) = loc[0].parse() {
                self.latitude = lat;
            }
            if let Ok(long) = loc[1].parse() {
                self.longitude = long;
            }
        }

        if let Some((asn, isp)) = self.org.split_once(' ') {
            self.asn = asn.to_string();
            self.isp = isp.to_string();
        }
    }
}

/// Two-level read-through cache over the geo API: in-process TTL cache,
/// then the optional shared remote cache, then the API itself.
pub struct LocationResolver {
    cache: Cache<String, IpInfo>,
    http: ClientWithMiddleware,
    ipinfo_url: String,
    ipinfo_token: Option<String>,
    remote_cache_url: Option<String>,
}

impl LocationResolver {
    pub fn new(
        ipinfo_url: String,
        ipinfo_token: Option<String>,
        remote_cache_url: Option<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
            http: build_reqwest_retry_client(250, 4000),
            ipinfo_url,
            ipinfo_token,
            remote_cache_url,
        }
    }

    /// Resolves the worker's own public IP geo record.
    pub async fn lookup_self(&self) -> Result<IpInfo> {
        self.fetch_ip_info(None).await
    }

    pub async fn resolve_ip(&self, ip: IpAddr) -> Result<IpInfo> {
        let key = ip.to_string();
        if let Some(cached) = self.cache.get(&key).await {
            return Ok(cached);
        }

        if let Some(remote) = self.remote_cache_get(&key).await {
            self.cache.insert(key, remote.clone()).await;
            return Ok(remote);
        }

        let info = self.fetch_ip_info(Some(&key)).await?;
        if info.bogon {
            return Err(RequestError::BogonIp(key).into());
        }

        self.cache.insert(key.clone(), info.clone()).await;
        self.remote_cache_put(&key, &info);
        Ok(info)
    }

    pub async fn resolve_ip_str(&self, ip: &str) -> Result<IpInfo> {
        let parsed: IpAddr = ip
            .parse()
            .map_err(|_| RequestError::InvalidIp(ip.to_string()))?;
        self.resolve_ip(parsed).await
    }

    pub async fn resolve_multiaddr(&self, addr: &Multiaddr) -> Result<IpInfo> {
        let decoded = decode_host_port(addr)?;

        let host = if decoded.is_hostname {
            let mut records = tokio::net::lookup_host((decoded.host.as_str(), decoded.port))
                .await
                .map_err(|err| RequestError::HostLookup {
                    host: decoded.host.clone(),
                    message: err.to_string(),
                })?;
            match records.next() {
                Some(record) => record.ip().to_string(),
                None => {
                    return Err(RequestError::HostLookup {
                        host: decoded.host.clone(),
                        message: "no records".to_string(),
                    }
                    .into())
                }
            }
        } else {
            decoded.host
        };

        self.resolve_ip_str(&host).await
    }

    /// Tries each address in order; first success wins, else the last
    /// error, else `NoValidMultiAddr` for an empty list.
    pub async fn resolve_multiaddrs(&self, addrs: &[Multiaddr]) -> Result<IpInfo> {
        let mut last_err: Option<color_eyre::Report> = None;
        for addr in addrs {
            match self.resolve_multiaddr(addr).await {
                Ok(info) => return Ok(info),
                Err(err) => {
                    debug!("failed to resolve multiaddr {addr}: {err:#}");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| RequestError::NoValidMultiAddr.into()))
    }

    pub async fn resolve_multiaddrs_bytes(&self, addrs: &[Vec<u8>]) -> Result<IpInfo> {
        self.resolve_multiaddrs(&crate::multiaddr_util::bytes_to_multiaddrs(addrs))
            .await
    }

    async fn fetch_ip_info(&self, ip: Option<&str>) -> Result<IpInfo> {
        let mut url = match ip {
            Some(ip) => format!("{}/{}/json", self.ipinfo_url, ip),
            None => format!("{}/json", self.ipinfo_url),
        };
        if let Some(token) = &self.ipinfo_token {
            url = format!("{url}?token={token}");
        }

        debug!("getting IP info for {}", ip.unwrap_or("self"));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .wrap_err("failed to get IP info")?;

        if !response.status().is_success() {
            return Err(eyre!("failed to get IP info: {}", response.status()));
        }

        let mut info: IpInfo = response
            .json()
            .await
            .wrap_err("failed to decode IP info")?;
        info.resolve_derived_fields();

        if info.bogon {
            return Ok(info);
        }

        info.continent = continent_for_country(&info.country)?.to_string();
        Ok(info)
    }

    async fn remote_cache_get(&self, ip: &str) -> Option<IpInfo> {
        let base = self.remote_cache_url.as_ref()?;
        let response = self
            .http
            .get(format!("{base}/getIpInfo"))
            .query(&[("ip", ip)])
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().await.ok()
    }

    /// Write-through to the shared cache, fire-and-forget.
    fn remote_cache_put(&self, ip: &str, info: &IpInfo) {
        let Some(base) = self.remote_cache_url.clone() else {
            return;
        };
        let http = self.http.clone();
        let ip = ip.to_string();
        let info = info.clone();
        tokio::spawn(async move {
            if let Err(err) = http
                .post(format!("{base}/setIpInfo"))
                .query(&[("ip", ip.as_str())])
                .json(&info)
                .send()
                .await
            {
                warn!("failed to write location to shared cache: {err}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_coordinates_and_org_split() {
        let mut info = IpInfo {
            loc: "37.3860,-122.0838".to_string(),
            org: "AS15169 Google LLC".to_string(),
            ..Default::default()
        };
        info.resolve_derived_fields();
        assert!((info.latitude - 37.3860).abs() < 1e-4);
        assert!((info.longitude + 122.0838).abs() < 1e-4);
        assert_eq!(info.asn, "AS15169");
        assert_eq!(info.isp, "Google LLC");
    }

    #[test]
    fn malformed_loc_is_ignored() {
        let mut info = IpInfo {
            loc: "not-a-location".to_string(),
            ..Default::default()
        };
        info.resolve_derived_fields();
        assert_eq!(info.latitude, 0.0);
        assert_eq!(info.longitude, 0.0);
    }
}
