use std::collections::HashMap;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sqlx::PgPool;

use crate::model::DealState;

/// Read/write access to the mirrored deal store.
#[derive(Clone)]
pub struct DealRepository {
    pool: PgPool,
}

impl DealRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(PgPool::connect(url).await?))
    }

    /// Total live bytes per client, the denominator of the sampler weight.
    pub async fn total_per_client(&self) -> Result<HashMap<String, i64>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT client, SUM(piece_size)::bigint
               FROM state_market_deals
               WHERE expiration > now()
               GROUP BY client
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// A uniformly random batch of live deals.
    pub async fn sample_live_deals(&self, limit: i64) -> Result<Vec<DealState>> {
        let deals = sqlx::query_as::<_, DealState>(
            r#"SELECT deal_id, piece_cid, piece_size, label, verified, client, provider,
                      start, expiration, sector_start, slashed, last_updated
               FROM state_market_deals
               WHERE expiration > now()
               ORDER BY random()
               LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(deals)
    }

    /// All live deals for the given providers, one representative deal per
    /// (provider, piece_cid) pair.
    pub async fn live_deals_for_providers(&self, providers: &[String]) -> Result<Vec<DealState>> {
        if providers.is_empty() {
            return Ok(vec![]);
        }

        let deals = sqlx::query_as::<_, DealState>(
            r#"SELECT DISTINCT ON (provider, piece_cid)
                      deal_id, piece_cid, piece_size, label, verified, client, provider,
                      start, expiration, sector_start, slashed, last_updated
               FROM state_market_deals
               WHERE provider = ANY($1)
                 AND expiration > now()
               ORDER BY provider, piece_cid, deal_id
            "#,
        )
        .bind(providers)
        .fetch_all(&self.pool)
        .await?;

        Ok(deals)
    }

    /// Live deals for one provider restricted to an explicit piece set.
    pub async fn live_deals_for_provider_pieces(
        &self,
        provider: &str,
        piece_cids: &[String],
    ) -> Result<Vec<DealState>> {
        if piece_cids.is_empty() {
            return Ok(vec![]);
        }

        let deals = sqlx::query_as::<_, DealState>(
            r#"SELECT DISTINCT ON (piece_cid)
                      deal_id, piece_cid, piece_size, label, verified, client, provider,
                      start, expiration, sector_start, slashed, last_updated
               FROM state_market_deals
               WHERE provider = $1
                 AND piece_cid = ANY($2)
                 AND expiration > now()
               ORDER BY piece_cid, deal_id
            "#,
        )
        .bind(provider)
        .bind(piece_cids)
        .fetch_all(&self.pool)
        .await?;

        Ok(deals)
    }

    /// Known deal ids with their last-updated stamps, for ingest dedup.
    pub async fn known_last_updated(&self) -> Result<HashMap<u64, DateTime<Utc>>> {
        let rows: Vec<(i64, DateTime<Utc>)> =
            sqlx::query_as(r#"SELECT deal_id, last_updated FROM state_market_deals"#)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, updated)| (id as u64, updated))
            .collect())
    }

    /// Inserts new deals and refreshes rows whose `last_updated` advanced.
    pub async fn upsert_batch(&self, deals: &[DealState]) -> Result<u64> {
        if deals.is_empty() {
            return Ok(0);
        }

        let mut affected = 0;
        let mut tx = self.pool.begin().await?;
        for deal in deals {
            let result = sqlx::query(
                r#"INSERT INTO state_market_deals
                        (deal_id, piece_cid, piece_size, label, verified, client, provider,
                         start, expiration, sector_start, slashed, last_updated)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                   ON CONFLICT (deal_id) DO UPDATE SET
                        sector_start = EXCLUDED.sector_start,
                        slashed = EXCLUDED.slashed,
                        last_updated = EXCLUDED.last_updated
                   WHERE state_market_deals.last_updated < EXCLUDED.last_updated
                "#,
            )
            .bind(deal.deal_id as i64)
            .bind(&deal.piece_cid)
            .bind(deal.piece_size)
            .bind(&deal.label)
            .bind(deal.verified)
            .bind(&deal.client)
            .bind(&deal.provider)
            .bind(deal.start)
            .bind(deal.expiration)
            .bind(deal.sector_start)
            .bind(deal.slashed)
            .bind(deal.last_updated)
            .execute(&mut *tx)
            .await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;

        Ok(affected)
    }

    /// Removes deals that expired before the given moment.
    pub async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(r#"DELETE FROM state_market_deals WHERE expiration < $1"#)
            .bind(before)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
