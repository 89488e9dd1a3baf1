//! Durable per-user voice time totals.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

mod json;
#[cfg(test)]
mod memory;
mod postgres;

pub use json::JsonFileStore;
#[cfg(test)]
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait TimeStore: Send + Sync {
    /// Reads every stored total.
    async fn load_all(&self) -> Result<HashMap<String, u64>, StoreError>;

    /// Replaces stored totals with `totals`. Readers never see a partial set.
    async fn flush_all(&self, totals: &HashMap<String, u64>) -> Result<(), StoreError>;

    /// Adds `delta_ms` to one user's total, inserting the user if absent.
    async fn apply_delta(&self, user_id: &str, delta_ms: u64) -> Result<(), StoreError>;

    /// Adds `delta_ms` to each listed user in one write.
    async fn apply_delta_all(&self, user_ids: &[String], delta_ms: u64) -> Result<(), StoreError>;
}

/// Totals are unsigned in memory and BIGINT in SQL.
pub(crate) fn to_sql_total(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

pub(crate) fn from_sql_total(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_conversions_saturate() {
        assert_eq!(to_sql_total(5), 5);
        assert_eq!(to_sql_total(u64::MAX), i64::MAX);
        assert_eq!(from_sql_total(-3), 0);
        assert_eq!(from_sql_total(9), 9);
    }
}
