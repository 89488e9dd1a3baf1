use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::TimeStore;
use crate::error::StoreError;

/// Test double that keeps totals in memory and can be told to fail.
#[derive(Default)]
pub struct MemoryStore {
    totals: Mutex<HashMap<String, u64>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn with_totals(totals: HashMap<String, u64>) -> Self {
        Self {
            totals: Mutex::new(totals),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn stored(&self, user_id: &str) -> Option<u64> {
        self.totals.lock().unwrap().get(user_id).copied()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Simulated)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TimeStore for MemoryStore {
    async fn load_all(&self) -> Result<HashMap<String, u64>, StoreError> {
        self.check()?;
        Ok(self.totals.lock().unwrap().clone())
    }

    async fn flush_all(&self, totals: &HashMap<String, u64>) -> Result<(), StoreError> {
        self.check()?;
        *self.totals.lock().unwrap() = totals.clone();
        Ok(())
    }

    async fn apply_delta(&self, user_id: &str, delta_ms: u64) -> Result<(), StoreError> {
        self.check()?;
        *self.totals.lock().unwrap().entry(user_id.to_string()).or_insert(0) += delta_ms;
        Ok(())
    }

    async fn apply_delta_all(&self, user_ids: &[String], delta_ms: u64) -> Result<(), StoreError> {
        self.check()?;
        let mut totals = self.totals.lock().unwrap();
        for user_id in user_ids {
            *totals.entry(user_id.clone()).or_insert(0) += delta_ms;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delta_on_absent_user_inserts() {
        let store = MemoryStore::default();
        store.apply_delta("u", 5).await.unwrap();
        store.apply_delta("u", 7).await.unwrap();
        assert_eq!(store.stored("u"), Some(12));
    }
}
