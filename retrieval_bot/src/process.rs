use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config;
use crate::resolver::{IpInfo, LocationResolver, DEFAULT_IPINFO_URL};

/// Fans out N copies of each probe worker binary and restarts them on
/// failure. A crashed probe cannot take down its peers.
pub struct ProcessManager {
    concurrency: HashMap<PathBuf, usize>,
    error_interval: Duration,
    retriever_env: Vec<(String, String)>,
}

impl ProcessManager {
    pub async fn new_from_env() -> Result<Self> {
        let modules = config::get_required_string(config::PROCESS_MODULES)?;
        let mut concurrency = HashMap::new();
        for module in modules.split(',') {
            let path = find_module(module)
                .wrap_err_with(|| format!("failed to find module {module}"))?;

            let module_key = module.to_uppercase();
            let count = config::get_int(&format!("CONCURRENCY_{module_key}"), 1).max(0) as usize;
            info!("found module {module} at {}, concurrency {count}", path.display());
            concurrency.insert(path, count);
        }

        // The workers inherit one self-location snapshot taken here.
        let resolver = LocationResolver::new(
            config::get_string(config::IPINFO_URL, DEFAULT_IPINFO_URL),
            config::get_optional_string(config::IPINFO_TOKEN),
            None,
            Duration::from_secs(3600),
        );
        let ip_info = resolver
            .lookup_self()
            .await
            .wrap_err("failed to get public IP info")?;
        info!(ip = %ip_info.ip, country = %ip_info.country, "public IP info retrieved");

        Ok(Self {
            concurrency,
            error_interval: config::get_duration(
                config::PROCESS_ERROR_INTERVAL,
                Duration::from_secs(5),
            ),
            retriever_env: retriever_env(&ip_info),
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut children = Vec::new();
        for (path, count) in &self.concurrency {
            for _ in 0..*count {
                let path = path.clone();
                let env = self.retriever_env.clone();
                let error_interval = self.error_interval;
                let shutdown = shutdown.clone();

                children.push(tokio::spawn(async move {
                    loop {
                        if shutdown.is_cancelled() {
                            return;
                        }

                        let correlation_id = Uuid::new_v4();
                        debug!(module = %path.display(), %correlation_id, "spawning new process");
                        let mut command = tokio::process::Command::new(&path);
                        command
                            .envs(env.iter().cloned())
                            .env("CORRELATION_ID", correlation_id.to_string());

                        tokio::select! {
                            status = command.status() => {
                                match status {
                                    Ok(status) if status.success() => {
                                        info!(module = %path.display(), "process exited cleanly");
                                    }
                                    Ok(status) => {
                                        error!(
                                            module = %path.display(),
                                            ?status,
                                            "process failed, waiting {:?}",
                                            error_interval
                                        );
                                        tokio::time::sleep(error_interval).await;
                                    }
                                    Err(err) => {
                                        error!(module = %path.display(), "failed to spawn: {err}");
                                        tokio::time::sleep(error_interval).await;
                                    }
                                }
                            }
                            _ = shutdown.cancelled() => {
                                info!(module = %path.display(), "process canceled");
                                return;
                            }
                        }
                    }
                }));
            }
        }

        shutdown.cancelled().await;
        for child in children {
            let _ = child.await;
        }
    }
}

/// Workers receive the identity as plain environment data.
fn retriever_env(info: &IpInfo) -> Vec<(String, String)> {
    vec![
        (config::PUBLIC_IP.to_string(), info.ip.clone()),
        (config::CITY.to_string(), info.city.clone()),
        (config::REGION.to_string(), info.region.clone()),
        (config::COUNTRY.to_string(), info.country.clone()),
        (config::CONTINENT.to_string(), info.continent.clone()),
        (config::ASN.to_string(), info.asn.clone()),
        (config::ISP.to_string(), info.isp.clone()),
        (config::LATITUDE.to_string(), info.latitude.to_string()),
        (config::LONGITUDE.to_string(), info.longitude.to_string()),
    ]
}

/// Sibling binaries live next to the supervisor; anything else comes
/// from PATH.
fn find_module(module: &str) -> Result<PathBuf> {
    if let Ok(current) = std::env::current_exe() {
        if let Some(dir) = current.parent() {
            let sibling = dir.join(module);
            if sibling.is_file() {
                return Ok(sibling);
            }
        }
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(module);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(eyre!("module {module} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriever_env_carries_the_full_identity() {
        let info = IpInfo {
            ip: "1.2.3.4".to_string(),
            city: "Berlin".to_string(),
            region: "Berlin".to_string(),
            country: "DE".to_string(),
            continent: "EU".to_string(),
            asn: "AS3320".to_string(),
            isp: "Deutsche Telekom".to_string(),
            latitude: 52.52,
            longitude: 13.405,
            ..Default::default()
        };

        let env = retriever_env(&info);
        let keys: Vec<&str> = env.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "_PUBLIC_IP",
                "_CITY",
                "_REGION",
                "_COUNTRY",
                "_CONTINENT",
                "_ASN",
                "_ISP",
                "_LATITUDE",
                "_LONGITUDE"
            ]
        );
    }

    #[test]
    fn missing_modules_are_an_error() {
        assert!(find_module("definitely-not-a-real-binary-name").is_err());
    }
}
