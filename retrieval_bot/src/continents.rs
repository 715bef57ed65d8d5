use std::collections::HashMap;

use color_eyre::{eyre::eyre, Result};
use once_cell::sync::Lazy;

static COUNTRY_TO_CONTINENT: Lazy<HashMap<String, String>> = Lazy::new(|| {
    serde_json::from_str(include_str!("../resources/country_to_continent.json"))
        .expect("bundled country table must parse")
});

/// Maps an ISO-3166 alpha-2 country code to its continent code.
/// An unknown country is a hard error: persisting a geo record without a
/// continent would break the worker-side affinity filters.
pub fn continent_for_country(country: &str) -> Result<&'static str> {
    COUNTRY_TO_CONTINENT
        .get(country)
        .map(String::as_str)
        .ok_or_else(|| eyre!("unknown country: {country}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_countries() {
        assert_eq!(continent_for_country("US").unwrap(), "NA");
        assert_eq!(continent_for_country("DE").unwrap(), "EU");
        assert_eq!(continent_for_country("JP").unwrap(), "AS");
        assert_eq!(continent_for_country("BR").unwrap(), "SA");
        assert_eq!(continent_for_country("AU").unwrap(), "OC");
        assert_eq!(continent_for_country("ZA").unwrap(), "AF");
    }

    #[test]
    fn unknown_country_is_an_error() {
        assert!(continent_for_country("XX").is_err());
        assert!(continent_for_country("").is_err());
    }
}
