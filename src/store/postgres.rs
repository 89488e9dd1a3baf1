use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use tracing::info;

use super::{TimeStore, from_sql_total, to_sql_total};
use crate::error::StoreError;

const CREATE_USER_TIMES: &str = "CREATE TABLE IF NOT EXISTS user_times (
    user_id TEXT PRIMARY KEY,
    total_time BIGINT NOT NULL DEFAULT 0
)";

/// Reserved for daily reporting; nothing writes to it yet.
const CREATE_DAILY_USER_TIMES: &str = "CREATE TABLE IF NOT EXISTS daily_user_times (
    user_id TEXT PRIMARY KEY,
    daily_time BIGINT NOT NULL DEFAULT 0
)";

const SELECT_ALL: &str = "SELECT user_id, total_time FROM user_times";

const UPSERT_ABSOLUTE: &str = "INSERT INTO user_times (user_id, total_time)
    SELECT * FROM UNNEST($1::text[], $2::bigint[])
    ON CONFLICT (user_id) DO UPDATE SET total_time = EXCLUDED.total_time";

const UPSERT_ADD: &str = "INSERT INTO user_times (user_id, total_time) VALUES ($1, $2)
    ON CONFLICT (user_id) DO UPDATE SET total_time = user_times.total_time + EXCLUDED.total_time";

const UPSERT_ADD_MANY: &str = "INSERT INTO user_times (user_id, total_time)
    SELECT id, $2::bigint FROM UNNEST($1::text[]) AS id
    ON CONFLICT (user_id) DO UPDATE SET total_time = user_times.total_time + EXCLUDED.total_time";

const MAX_CONNECTIONS: u32 = 5;

/// `user_times` table in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// With `require_ssl` the connection uses TLS without verifying the
    /// server certificate.
    pub async fn connect(url: &str, require_ssl: bool) -> Result<Self, StoreError> {
        let mut options = PgConnectOptions::from_str(url)?;
        if require_ssl {
            options = options.ssl_mode(PgSslMode::Require);
        }
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        info!(require_ssl, "connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_USER_TIMES).execute(&self.pool).await?;
        sqlx::query(CREATE_DAILY_USER_TIMES).execute(&self.pool).await?;
        info!("tables user_times and daily_user_times are ready");
        Ok(())
    }
}

#[async_trait]
impl TimeStore for PostgresStore {
    async fn load_all(&self) -> Result<HashMap<String, u64>, StoreError> {
        let rows = sqlx::query_as::<_, (String, i64)>(SELECT_ALL)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(user_id, total)| (user_id, from_sql_total(total)))
            .collect())
    }

    async fn flush_all(&self, totals: &HashMap<String, u64>) -> Result<(), StoreError> {
        if totals.is_empty() {
            return Ok(());
        }
        let (ids, values): (Vec<String>, Vec<i64>) = totals
            .iter()
            .map(|(user_id, total)| (user_id.clone(), to_sql_total(*total)))
            .unzip();
        sqlx::query(UPSERT_ABSOLUTE)
            .bind(ids)
            .bind(values)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_delta(&self, user_id: &str, delta_ms: u64) -> Result<(), StoreError> {
        sqlx::query(UPSERT_ADD)
            .bind(user_id)
            .bind(to_sql_total(delta_ms))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn apply_delta_all(&self, user_ids: &[String], delta_ms: u64) -> Result<(), StoreError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(UPSERT_ADD_MANY)
            .bind(user_ids)
            .bind(to_sql_total(delta_ms))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
