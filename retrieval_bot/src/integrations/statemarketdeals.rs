use std::collections::HashMap;

use async_compression::tokio::bufread::ZstdDecoder;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use futures::TryStreamExt;
use serde::de::DeserializeSeed;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::config;
use crate::model::DealState;
use crate::repository::DealRepository;

pub const DEFAULT_MARKET_DEALS_URL: &str =
    "https://marketdeals.s3.amazonaws.com/StateMarketDeals.json.zst";

/// Mirrors the upstream deal feed into the deal store: new deals are
/// inserted, known deals refreshed when their `last_updated` advanced.
pub async fn refresh(repo: &DealRepository) -> Result<()> {
    let batch_size = config::get_int(config::STATEMARKETDEALS_BATCH_SIZE, 1000).max(1) as usize;
    let url = config::get_string(config::STATEMARKETDEALS_URL, DEFAULT_MARKET_DEALS_URL);

    info!("getting known deal ids from the deal store");
    let known = repo.known_last_updated().await?;
    info!(count = known.len(), "known deals loaded");

    info!("downloading state market deals feed");
    let response = reqwest::get(&url).await.wrap_err("failed to make request")?;
    if !response.status().is_success() {
        return Err(eyre!(
            "failed to get state market deals: {}",
            response.status()
        ));
    }

    let stream = response
        .bytes_stream()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err));
    let mut decoder = ZstdDecoder::new(tokio_util::io::StreamReader::new(stream));
    let mut body = Vec::new();
    decoder
        .read_to_end(&mut body)
        .await
        .wrap_err("failed to decompress deal feed")?;

    // The feed is one huge `{deal_id: Deal}` object; walk it entry by
    // entry instead of materializing a parsed tree.
    let (sender, mut receiver) = tokio::sync::mpsc::channel::<Vec<DealState>>(4);
    let parser = tokio::task::spawn_blocking(move || -> Result<FeedStats> {
        let mut deserializer = serde_json::Deserializer::from_slice(&body);
        let seed = FeedSeed {
            known,
            batch_size,
            sender,
        };
        seed.deserialize(&mut deserializer)
            .wrap_err("failed to decode json further")
    });

    let mut written = 0_u64;
    while let Some(batch) = receiver.recv().await {
        debug!(count = batch.len(), "upserting deal batch");
        written += repo.upsert_batch(&batch).await?;
    }

    let stats = parser.await.wrap_err("feed parser panicked")??;
    info!(
        scanned = stats.scanned,
        changed = stats.changed,
        not_active = stats.not_active,
        written,
        "finished ingesting deals"
    );

    let deleted = repo.delete_expired(Utc::now()).await?;
    info!(count = deleted, "removed expired deals");

    Ok(())
}

struct FeedStats {
    scanned: u64,
    changed: u64,
    not_active: u64,
}

struct FeedSeed {
    known: HashMap<u64, DateTime<Utc>>,
    batch_size: usize,
    sender: tokio::sync::mpsc::Sender<Vec<DealState>>,
}

impl<'de> DeserializeSeed<'de> for FeedSeed {
    type Value = FeedStats;

    fn deserialize<D: serde::Deserializer<'de>>(
        self,
        deserializer: D,
    ) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(FeedVisitor {
            known: self.known,
            batch_size: self.batch_size,
            sender: self.sender,
        })
    }
}

struct FeedVisitor {
    known: HashMap<u64, DateTime<Utc>>,
    batch_size: usize,
    sender: tokio::sync::mpsc::Sender<Vec<DealState>>,
}

impl<'de> serde::de::Visitor<'de> for FeedVisitor {
    type Value = FeedStats;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a map of deal id to deal")
    }

    fn visit_map<A: serde::de::MapAccess<'de>>(
        self,
        mut map: A,
    ) -> Result<Self::Value, A::Error> {
        let mut stats = FeedStats {
            scanned: 0,
            changed: 0,
            not_active: 0,
        };
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some(key) = map.next_key::<String>()? {
            let deal: crate::model::Deal = map.next_value()?;
            stats.scanned += 1;

            // A deal whose sector has not started yet cannot be
            // retrieved from; skip it until a later feed activates it.
            if deal.state.sector_start_epoch <= 0 {
                stats.not_active += 1;
                continue;
            }

            let deal_id: u64 = key
                .parse()
                .map_err(|_| serde::de::Error::custom(format!("invalid deal id key: {key}")))?;

            let state = DealState::from_rpc(deal_id, &deal);
            let unchanged = self
                .known
                .get(&deal_id)
                .is_some_and(|last| *last >= state.last_updated);
            if unchanged {
                continue;
            }

            stats.changed += 1;
            batch.push(state);
            if batch.len() == self.batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size));
                if self.sender.blocking_send(full).is_err() {
                    return Err(serde::de::Error::custom("deal sink closed"));
                }
            }
        }

        if !batch.is_empty() && self.sender.blocking_send(batch).is_err() {
            return Err(serde::de::Error::custom("deal sink closed"));
        }

        Ok(stats)
    }
}
