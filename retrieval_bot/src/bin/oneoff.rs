use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use retrieval_bot::config;
use retrieval_bot::integrations::add_tasks;
use retrieval_bot::model::{Deal, DealState};
use retrieval_bot::probes::{BitswapProbe, GraphsyncProbe, HttpProbe};
use retrieval_bot::resolver::{
    LocationResolver, ProviderResolver, DEFAULT_IPINFO_URL, DEFAULT_LOTUS_API_URL,
};
use retrieval_bot::types::ModuleName;
use retrieval_bot::worker::{shutdown_token, Probe};
use serde_json::json;

/// Build the standard probe tasks for one provider and deal, then run
/// them inline and print the outcomes.
#[derive(Parser)]
#[command(name = "oneoff")]
struct Args {
    provider_id: String,
    deal_id: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    retrieval_bot::init_binary()?;
    let args = Args::parse();

    let lotus_url = config::get_string(config::LOTUS_API_URL, DEFAULT_LOTUS_API_URL);
    let provider_resolver = ProviderResolver::new(
        lotus_url.clone(),
        config::get_optional_string(config::LOTUS_API_TOKEN),
        None,
        Duration::from_secs(60),
    );
    let location_resolver = LocationResolver::new(
        config::get_string(config::IPINFO_URL, DEFAULT_IPINFO_URL),
        config::get_optional_string(config::IPINFO_TOKEN),
        None,
        Duration::from_secs(60),
    );

    let provider_info = provider_resolver
        .resolve_provider(&args.provider_id)
        .await
        .wrap_err("failed to resolve provider")?;
    location_resolver
        .resolve_multiaddrs_bytes(&provider_info.multiaddrs)
        .await
        .wrap_err("failed to resolve location")?;

    let ip_info = location_resolver.lookup_self().await?;

    let deal = fetch_deal(&lotus_url, args.deal_id).await?;
    let deal_states = vec![DealState::from_rpc(args.deal_id, &deal)];

    let outcome = add_tasks(
        "oneoff",
        &ip_info,
        deal_states,
        &location_resolver,
        &provider_resolver,
        Duration::from_secs(15),
    )
    .await;

    if !outcome.results.is_empty() {
        println!("Errors encountered when creating tasks:");
        for result in &outcome.results {
            println!(
                " -- {}: {} ({})",
                result.task.module,
                result
                    .result
                    .error_code
                    .map(|code| code.as_str())
                    .unwrap_or("unknown"),
                result.result.error_message
            );
        }
    }

    let shutdown = shutdown_token();
    for task in &outcome.tasks {
        println!(" -- Test {} --", task.module);
        let probe: Box<dyn Probe> = match task.module {
            ModuleName::GraphSync => Box::new(GraphsyncProbe),
            ModuleName::Http => Box::new(HttpProbe),
            ModuleName::Bitswap => Box::new(BitswapProbe),
            ModuleName::Stub => continue,
        };
        match probe.do_work(task, &shutdown).await {
            Ok(result) if result.success => println!(
                "Success: {} bytes in {:?} (ttfb {:?})",
                result.downloaded, result.duration, result.ttfb
            ),
            Ok(result) => println!(
                "Failed: {} ({})",
                result
                    .error_code
                    .map(|code| code.as_str())
                    .unwrap_or("unknown"),
                result.error_message
            ),
            Err(err) => println!("Error: {err:#}"),
        }
    }

    Ok(())
}

async fn fetch_deal(lotus_url: &str, deal_id: u64) -> Result<Deal> {
    let response: serde_json::Value = reqwest::Client::new()
        .post(lotus_url)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "Filecoin.StateMarketStorageDeal",
            "params": [deal_id, null],
        }))
        .send()
        .await?
        .json()
        .await
        .wrap_err("failed to decode deal")?;

    if let Some(error) = response.get("error") {
        return Err(eyre!("chain RPC error: {error}"));
    }
    let result = response
        .get("result")
        .ok_or_else(|| eyre!("chain RPC returned no result"))?;

    serde_json::from_value(result.clone()).wrap_err("failed to decode deal shape")
}
