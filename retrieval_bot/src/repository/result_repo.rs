use color_eyre::Result;
use sqlx::PgPool;

use crate::types::TaskResult;

/// Append-only sink for probe outcomes.
#[derive(Clone)]
pub struct ResultRepository {
    pool: PgPool,
}

impl ResultRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        Ok(Self::new(PgPool::connect(url).await?))
    }

    pub async fn insert_one(&self, result: &TaskResult) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO task_result
                    (requester, module, metadata, provider_id, peer_id, multiaddrs,
                     city, region, country, continent, content_cid, timeout_ns, task_created_at,
                     retriever_ip, retriever_city, retriever_region, retriever_country,
                     retriever_continent, retriever_asn, retriever_isp, retriever_lat, retriever_long,
                     success, error_code, error_message, ttfb_ns, speed, duration_ns, downloaded,
                     created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                       $14, $15, $16, $17, $18, $19, $20, $21, $22,
                       $23, $24, $25, $26, $27, $28, $29, $30)
            "#,
        )
        .bind(&result.task.requester)
        .bind(result.task.module.as_str())
        .bind(serde_json::to_value(&result.task.metadata)?)
        .bind(&result.task.provider.id)
        .bind(&result.task.provider.peer_id)
        .bind(serde_json::to_value(&result.task.provider.multiaddrs)?)
        .bind(&result.task.provider.city)
        .bind(&result.task.provider.region)
        .bind(&result.task.provider.country)
        .bind(&result.task.provider.continent)
        .bind(&result.task.content.cid)
        .bind(result.task.timeout.as_nanos() as i64)
        .bind(result.task.created_at)
        .bind(&result.retriever.ip)
        .bind(&result.retriever.city)
        .bind(&result.retriever.region)
        .bind(&result.retriever.country)
        .bind(&result.retriever.continent)
        .bind(&result.retriever.asn)
        .bind(&result.retriever.isp)
        .bind(result.retriever.lat)
        .bind(result.retriever.long)
        .bind(result.result.success)
        .bind(result.result.error_code.map(|code| code.as_str()))
        .bind(&result.result.error_message)
        .bind(result.result.ttfb.as_nanos() as i64)
        .bind(result.result.speed)
        .bind(result.result.duration.as_nanos() as i64)
        .bind(result.result.downloaded as i64)
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn insert_many(&self, results: &[TaskResult]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for result in results {
            sqlx::query(
                r#"INSERT INTO task_result
                        (requester, module, metadata, provider_id, peer_id, multiaddrs,
                         city, region, country, continent, content_cid, timeout_ns, task_created_at,
                         retriever_ip, retriever_city, retriever_region, retriever_country,
                         retriever_continent, retriever_asn, retriever_isp, retriever_lat,
                         retriever_long, success, error_code, error_message, ttfb_ns, speed,
                         duration_ns, downloaded, created_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                           $14, $15, $16, $17, $18, $19, $20, $21, $22,
                           $23, $24, $25, $26, $27, $28, $29, $30)
                "#,
            )
            .bind(&result.task.requester)
            .bind(result.task.module.as_str())
            .bind(serde_json::to_value(&result.task.metadata)?)
            .bind(&result.task.provider.id)
            .bind(&result.task.provider.peer_id)
            .bind(serde_json::to_value(&result.task.provider.multiaddrs)?)
            .bind(&result.task.provider.city)
            .bind(&result.task.provider.region)
            .bind(&result.task.provider.country)
            .bind(&result.task.provider.continent)
            .bind(&result.task.content.cid)
            .bind(result.task.timeout.as_nanos() as i64)
            .bind(result.task.created_at)
            .bind(&result.retriever.ip)
            .bind(&result.retriever.city)
            .bind(&result.retriever.region)
            .bind(&result.retriever.country)
            .bind(&result.retriever.continent)
            .bind(&result.retriever.asn)
            .bind(&result.retriever.isp)
            .bind(result.retriever.lat)
            .bind(result.retriever.long)
            .bind(result.result.success)
            .bind(result.result.error_code.map(|code| code.as_str()))
            .bind(&result.result.error_message)
            .bind(result.result.ttfb.as_nanos() as i64)
            .bind(result.result.speed)
            .bind(result.result.duration.as_nanos() as i64)
            .bind(result.result.downloaded as i64)
            .bind(result.created_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(results.len())
    }
}
