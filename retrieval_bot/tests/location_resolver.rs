use std::time::Duration;

use retrieval_bot::resolver::LocationResolver;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resolver_for(server: &MockServer) -> LocationResolver {
    LocationResolver::new(server.uri(), None, None, Duration::from_secs(60))
}

#[tokio::test]
async fn resolved_records_carry_a_derived_continent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/8.8.8.8/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ip": "8.8.8.8",
            "city": "Mountain View",
            "region": "California",
            "country": "US",
            "loc": "37.3860,-122.0838",
            "org": "AS15169 Google LLC"
        })))
        .mount(&server)
        .await;

    let resolver = resolver_for(&server);
    let info = resolver.resolve_ip_str("8.8.8.8").await.unwrap();

    assert_eq!(info.country, "US");
    assert_eq!(info.continent, "NA");
    assert_eq!(info.asn, "AS15169");
    assert_eq!(info.isp, "Google LLC");
    assert!((info.latitude - 37.386).abs() < 1e-3);
}

#[tokio::test]
async fn unknown_countries_are_hard_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/8.8.4.4/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ip": "8.8.4.4",
            "country": "ZZ"
        })))
        .mount(&server)
        .await;

    let resolver = resolver_for(&server);
    let err = resolver.resolve_ip_str("8.8.4.4").await.unwrap_err();
    assert!(format!("{err:#}").contains("unknown country"));
}

#[tokio::test]
async fn bogon_ips_error_and_are_never_cached() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/0.0.0.0/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ip": "0.0.0.0",
            "bogon": true
        })))
        .expect(2)
        .mount(&server)
        .await;

    let resolver = resolver_for(&server);
    for _ in 0..2 {
        let err = resolver.resolve_ip_str("0.0.0.0").await.unwrap_err();
        assert!(format!("{err:#}").contains("bogon IP"));
    }
    // Both lookups hit the upstream: a bogon is not a cacheable answer.
    server.verify().await;
}

#[tokio::test]
async fn positive_results_are_cached_in_process() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/1.1.1.1/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ip": "1.1.1.1",
            "country": "AU",
            "org": "AS13335 Cloudflare Inc"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = resolver_for(&server);
    let first = resolver.resolve_ip_str("1.1.1.1").await.unwrap();
    let second = resolver.resolve_ip_str("1.1.1.1").await.unwrap();

    assert_eq!(first.continent, "OC");
    assert_eq!(second.continent, "OC");
    server.verify().await;
}

#[tokio::test]
async fn invalid_ip_strings_fail_without_io() {
    let server = MockServer::start().await;
    let resolver = resolver_for(&server);

    let err = resolver.resolve_ip_str("not-an-ip").await.unwrap_err();
    assert!(format!("{err:#}").contains("invalid IP"));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn address_lists_resolve_in_order_first_success_wins() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/9.9.9.9/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ip": "9.9.9.9",
            "country": "CH",
            "org": "AS19281 Quad9"
        })))
        .mount(&server)
        .await;

    let resolver = resolver_for(&server);
    let addrs = vec![
        // rejected without I/O: not an <ip|dns>/tcp shape
        "/ip4/1.2.3.4/udp/1".parse().unwrap(),
        "/ip4/9.9.9.9/tcp/443".parse().unwrap(),
    ];

    let info = resolver.resolve_multiaddrs(&addrs).await.unwrap();
    assert_eq!(info.country, "CH");
    assert_eq!(info.continent, "EU");
}

#[tokio::test]
async fn empty_address_lists_are_no_valid_multiaddr() {
    let server = MockServer::start().await;
    let resolver = resolver_for(&server);

    let err = resolver.resolve_multiaddrs(&[]).await.unwrap_err();
    assert!(format!("{err:#}").contains("no valid multiaddr"));
}

#[tokio::test]
async fn remote_cache_hit_skips_the_geo_api() {
    let cache = MockServer::start().await;
    let api = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/getIpInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ip": "5.5.5.5",
            "country": "DE",
            "continent": "EU"
        })))
        .mount(&cache)
        .await;

    let resolver = LocationResolver::new(
        api.uri(),
        None,
        Some(cache.uri()),
        Duration::from_secs(60),
    );
    let info = resolver.resolve_ip_str("5.5.5.5").await.unwrap();

    assert_eq!(info.country, "DE");
    assert!(api.received_requests().await.unwrap().is_empty());
}
