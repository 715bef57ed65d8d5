use std::env;
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};

/// Recognized configuration keys. Workers and generators each read the
/// subset they need; the supervisor additionally sets the `_`-prefixed
/// retriever identity keys on its children.
pub const PROCESS_MODULES: &str = "PROCESS_MODULES";
pub const PROCESS_ERROR_INTERVAL: &str = "PROCESS_ERROR_INTERVAL";
pub const TASK_WORKER_POLL_INTERVAL: &str = "TASK_WORKER_POLL_INTERVAL";
pub const TASK_WORKER_TIMEOUT_BUFFER: &str = "TASK_WORKER_TIMEOUT_BUFFER";
pub const LOTUS_API_URL: &str = "LOTUS_API_URL";
pub const LOTUS_API_TOKEN: &str = "LOTUS_API_TOKEN";
pub const QUEUE_DATABASE_URL: &str = "QUEUE_DATABASE_URL";
pub const RESULT_DATABASE_URL: &str = "RESULT_DATABASE_URL";
pub const STATEMARKETDEALS_DATABASE_URL: &str = "STATEMARKETDEALS_DATABASE_URL";
pub const STATEMARKETDEALS_BATCH_SIZE: &str = "STATEMARKETDEALS_BATCH_SIZE";
pub const STATEMARKETDEALS_INTERVAL: &str = "STATEMARKETDEALS_INTERVAL";
pub const STATEMARKETDEALS_URL: &str = "STATEMARKETDEALS_URL";
pub const FILPLUS_INTEGRATION_BATCH_SIZE: &str = "FILPLUS_INTEGRATION_BATCH_SIZE";
pub const FILPLUS_INTEGRATION_TASK_TIMEOUT: &str = "FILPLUS_INTEGRATION_TASK_TIMEOUT";
pub const FILPLUS_INTEGRATION_RANDOM_CONSTANT: &str = "FILPLUS_INTEGRATION_RANDOM_CONSTANT";
pub const PROVIDER_CACHE_URL: &str = "PROVIDER_CACHE_URL";
pub const PROVIDER_CACHE_TTL: &str = "PROVIDER_CACHE_TTL";
pub const LOCATION_CACHE_URL: &str = "LOCATION_CACHE_URL";
pub const LOCATION_CACHE_TTL: &str = "LOCATION_CACHE_TTL";
pub const ACCEPTED_CONTINENTS: &str = "ACCEPTED_CONTINENTS";
pub const ACCEPTED_COUNTRIES: &str = "ACCEPTED_COUNTRIES";
pub const IPINFO_TOKEN: &str = "IPINFO_TOKEN";
pub const IPINFO_URL: &str = "IPINFO_URL";
pub const LOG_LEVEL: &str = "LOG_LEVEL";

pub const PUBLIC_IP: &str = "_PUBLIC_IP";
pub const CITY: &str = "_CITY";
pub const REGION: &str = "_REGION";
pub const COUNTRY: &str = "_COUNTRY";
pub const CONTINENT: &str = "_CONTINENT";
pub const ASN: &str = "_ASN";
pub const ISP: &str = "_ISP";
pub const LATITUDE: &str = "_LATITUDE";
pub const LONGITUDE: &str = "_LONGITUDE";

pub fn get_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value,
        _ => default.to_string(),
    }
}

pub fn get_optional_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.is_empty())
}

pub fn get_required_string(key: &str) -> Result<String> {
    env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| eyre!("{key} not set"))
}

pub fn get_int(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().unwrap_or_else(|_| {
            tracing::debug!("failed to parse {key} as int, using default");
            default
        }),
        _ => default,
    }
}

pub fn get_f64(key: &str, default: f64) -> f64 {
    match env::var(key) {
        Ok(value) if !value.is_empty() => value.parse().unwrap_or_else(|_| {
            tracing::debug!("failed to parse {key} as float, using default");
            default
        }),
        _ => default,
    }
}

pub fn get_required_f32(key: &str) -> Result<f32> {
    get_required_string(key)?
        .parse()
        .map_err(|_| eyre!("failed to parse {key} as float"))
}

/// Durations are configured as integer seconds.
pub fn get_duration(key: &str, default: Duration) -> Duration {
    match env::var(key) {
        Ok(value) if !value.is_empty() => match value.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                tracing::debug!("failed to parse {key} as seconds, using default");
                default
            }
        },
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        assert_eq!(get_string("RB_TEST_NOT_SET", "fallback"), "fallback");
        assert_eq!(get_int("RB_TEST_NOT_SET", 42), 42);
        assert_eq!(
            get_duration("RB_TEST_NOT_SET", Duration::from_secs(15)),
            Duration::from_secs(15)
        );
        assert!(get_required_string("RB_TEST_NOT_SET").is_err());
    }

    #[test]
    fn set_keys_parse() {
        std::env::set_var("RB_TEST_DURATION", "30");
        assert_eq!(
            get_duration("RB_TEST_DURATION", Duration::from_secs(1)),
            Duration::from_secs(30)
        );
        std::env::set_var("RB_TEST_FLOAT", "2.5");
        assert_eq!(get_f64("RB_TEST_FLOAT", 1.0), 2.5);
    }
}
