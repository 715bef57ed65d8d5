use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::types::{Content, ModuleName, Provider, Task};

/// Worker geo affinity filter. `!`-prefixed values invert the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoFilter {
    pub values: Vec<String>,
    pub invert: bool,
}

impl GeoFilter {
    /// Parses `"US,CN"` / `"!US,CN"`; empty input means "match any".
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.is_empty() {
            return None;
        }
        let (invert, list) = match raw.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };
        Some(Self {
            values: list.split(',').map(str::to_string).collect(),
            invert,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    requester: String,
    module: String,
    metadata: Json<HashMap<String, String>>,
    provider_id: String,
    peer_id: Option<String>,
    multiaddrs: Json<Vec<String>>,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    continent: Option<String>,
    content_cid: String,
    timeout_ns: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = color_eyre::eyre::Error;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(Task {
            requester: row.requester,
            module: row.module.parse()?,
            metadata: row.metadata.0,
            provider: Provider {
                id: row.provider_id,
                peer_id: row.peer_id,
                multiaddrs: row.multiaddrs.0,
                city: row.city,
                region: row.region,
                country: row.country,
                continent: row.continent,
            },
            content: Content {
                cid: row.content_cid,
            },
            timeout: Duration::from_nanos(row.timeout_ns.max(0) as u64),
            created_at: row.created_at,
        })
    }
}

/// Durable task queue with pop-once semantics. The row lock plus
/// SKIP LOCKED makes concurrent pops disjoint without external locking.
#[derive(Clone)]
pub struct TaskRepository {
    pool: PgPool,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(PgPool::connect(url).await?))
    }

    /// Atomic batch insert.
    pub async fn enqueue_many(&self, tasks: &[Task]) -> Result<u64> {
        if tasks.is_empty() {
            return Ok(0);
        }

        let len = tasks.len();
        let mut requesters = Vec::with_capacity(len);
        let mut modules = Vec::with_capacity(len);
        let mut metadatas: Vec<serde_json::Value> = Vec::with_capacity(len);
        let mut provider_ids = Vec::with_capacity(len);
        let mut peer_ids: Vec<Option<String>> = Vec::with_capacity(len);
        let mut multiaddrs: Vec<serde_json::Value> = Vec::with_capacity(len);
        let mut cities: Vec<Option<String>> = Vec::with_capacity(len);
        let mut regions: Vec<Option<String>> = Vec::with_capacity(len);
        let mut countries: Vec<Option<String>> = Vec::with_capacity(len);
        let mut continents: Vec<Option<String>> = Vec::with_capacity(len);
        let mut content_cids = Vec::with_capacity(len);
        let mut timeouts = Vec::with_capacity(len);
        let mut created_ats = Vec::with_capacity(len);

        for task in tasks {
            requesters.push(task.requester.clone());
            modules.push(task.module.as_str().to_string());
            metadatas.push(serde_json::to_value(&task.metadata)?);
            provider_ids.push(task.provider.id.clone());
            peer_ids.push(task.provider.peer_id.clone());
            multiaddrs.push(serde_json::to_value(&task.provider.multiaddrs)?);
            cities.push(task.provider.city.clone());
            regions.push(task.provider.region.clone());
            countries.push(task.provider.country.clone());
            continents.push(task.provider.continent.clone());
            content_cids.push(task.content.cid.clone());
            timeouts.push(task.timeout.as_nanos() as i64);
            created_ats.push(task.created_at);
        }

        let result = sqlx::query(
            r#"INSERT INTO task_queue
                    (requester, module, metadata, provider_id, peer_id, multiaddrs,
                     city, region, country, continent, content_cid, timeout_ns, created_at)
               SELECT
                    a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13
               FROM UNNEST(
                    $1::text[], $2::text[], $3::jsonb[], $4::text[], $5::text[],
                    $6::jsonb[], $7::text[], $8::text[], $9::text[], $10::text[],
                    $11::text[], $12::bigint[], $13::timestamptz[]
               ) AS t(a1, a2, a3, a4, a5, a6, a7, a8, a9, a10, a11, a12, a13)
            "#,
        )
        .bind(&requesters)
        .bind(&modules)
        .bind(&metadatas)
        .bind(&provider_ids)
        .bind(&peer_ids)
        .bind(&multiaddrs)
        .bind(&cities)
        .bind(&regions)
        .bind(&countries)
        .bind(&continents)
        .bind(&content_cids)
        .bind(&timeouts)
        .bind(&created_ats)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Atomically match-and-delete the oldest task for the module that
    /// passes the optional geo filters. Rows with no recorded
    /// country/continent compare as the empty string.
    pub async fn pop_one_matching(
        &self,
        module: ModuleName,
        accepted_countries: Option<&GeoFilter>,
        accepted_continents: Option<&GeoFilter>,
    ) -> Result<Option<Task>> {
        let (countries, countries_invert) = match accepted_countries {
            Some(filter) => (Some(filter.values.clone()), filter.invert),
            None => (None, false),
        };
        let (continents, continents_invert) = match accepted_continents {
            Some(filter) => (Some(filter.values.clone()), filter.invert),
            None => (None, false),
        };

        let row = sqlx::query_as::<_, TaskRow>(
            r#"DELETE FROM task_queue
               WHERE id = (
                    SELECT id FROM task_queue
                    WHERE module = $1
                      AND ($2::text[] IS NULL OR (COALESCE(country, '') = ANY($2)) <> $3)
                      AND ($4::text[] IS NULL OR (COALESCE(continent, '') = ANY($4)) <> $5)
                    ORDER BY created_at
                    FOR UPDATE SKIP LOCKED
                    LIMIT 1
               )
               RETURNING requester, module, metadata, provider_id, peer_id, multiaddrs,
                         city, region, country, continent, content_cid, timeout_ns, created_at
            "#,
        )
        .bind(module.as_str())
        .bind(&countries)
        .bind(countries_invert)
        .bind(&continents)
        .bind(continents_invert)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Task::try_from).transpose()
    }

    /// Queue depth for a requester, used for generator backpressure.
    pub async fn count(&self, requester: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar(r#"SELECT COUNT(*) FROM task_queue WHERE requester = $1"#)
                .bind(requester)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_filter() {
        let filter = GeoFilter::parse("US,CN").unwrap();
        assert_eq!(filter.values, vec!["US", "CN"]);
        assert!(!filter.invert);
    }

    #[test]
    fn parses_inverted_filter() {
        let filter = GeoFilter::parse("!US").unwrap();
        assert_eq!(filter.values, vec!["US"]);
        assert!(filter.invert);
    }

    #[test]
    fn empty_filter_matches_any() {
        assert_eq!(GeoFilter::parse(""), None);
    }
}
