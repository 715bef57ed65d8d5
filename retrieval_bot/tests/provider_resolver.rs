use std::time::Duration;

use multiaddr::Multiaddr;
use retrieval_bot::resolver::ProviderResolver;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PEER: &str = "12D3KooWGQmdpbssrYHWFTwwbKmKL3i54EJC9j7RRNb47U9jUv1U";

fn base64_addr(addr: &str) -> String {
    use base64::Engine;
    let addr: Multiaddr = addr.parse().unwrap();
    base64::engine::general_purpose::STANDARD.encode(addr.to_vec())
}

#[tokio::test]
async fn resolves_miner_info_through_the_chain_rpc() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_partial_json(json!({
            "method": "Filecoin.StateMinerInfo",
            "params": ["f01234", null]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "PeerId": PEER,
                "Multiaddrs": [base64_addr("/ip4/10.0.0.9/tcp/24001")]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = ProviderResolver::new(server.uri(), None, None, Duration::from_secs(60));
    let info = resolver.resolve_provider("f01234").await.unwrap();

    assert_eq!(info.peer_id.as_deref(), Some(PEER));
    let addr = Multiaddr::try_from(info.multiaddrs[0].clone()).unwrap();
    assert_eq!(addr.to_string(), "/ip4/10.0.0.9/tcp/24001");

    // Second lookup is served from the in-process cache.
    resolver.resolve_provider("f01234").await.unwrap();
    server.verify().await;
}

#[tokio::test]
async fn rpc_errors_surface_and_are_not_cached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {"code": 1, "message": "actor not found"}
        })))
        .expect(2)
        .mount(&server)
        .await;

    let resolver = ProviderResolver::new(server.uri(), None, None, Duration::from_secs(60));
    for _ in 0..2 {
        let err = resolver.resolve_provider("f09999").await.unwrap_err();
        assert!(format!("{err:#}").contains("actor not found"));
    }
    server.verify().await;
}

#[tokio::test]
async fn undecodable_multiaddrs_are_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "PeerId": PEER,
                "Multiaddrs": ["!!! not base64 !!!"]
            }
        })))
        .mount(&server)
        .await;

    let resolver = ProviderResolver::new(server.uri(), None, None, Duration::from_secs(60));
    assert!(resolver.resolve_provider("f01234").await.is_err());
}

#[tokio::test]
async fn shared_cache_hit_skips_the_rpc() {
    let cache = MockServer::start().await;
    let rpc = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/getProviderInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "PeerId": PEER,
            "Multiaddrs": [base64_addr("/dns4/miner.example/tcp/24001")]
        })))
        .mount(&cache)
        .await;

    let resolver = ProviderResolver::new(
        rpc.uri(),
        None,
        Some(cache.uri()),
        Duration::from_secs(60),
    );
    let info = resolver.resolve_provider("f01234").await.unwrap();

    assert_eq!(info.peer_id.as_deref(), Some(PEER));
    assert_eq!(info.multiaddrs.len(), 1);
    assert!(rpc.received_requests().await.unwrap().is_empty());
}
