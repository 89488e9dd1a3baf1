//! Voice time accounting: the session table plus the clock and store it
//! depends on.
//!
//! In-memory counters change only under the table lock, and the lock is
//! never held across a storage call.
//!
//! Every storage write holds `write_gate` from its in-memory change until
//! the write lands. The gate is always taken before the table lock. A
//! delta is therefore either already written when a flush checkpoints, or
//! not part of that checkpoint.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::session::{Clock, Presence, SessionTable};
use crate::store::TimeStore;

#[derive(Debug)]
pub enum Transition {
    Opened,
    /// The session closed; `write` is the detached persistence of
    /// `session_ms`.
    Closed {
        session_ms: u64,
        write: JoinHandle<()>,
    },
    Unchanged,
}

pub struct Accounting {
    table: RwLock<SessionTable>,
    write_gate: Arc<Mutex<()>>,
    clock: Arc<dyn Clock>,
    store: Arc<dyn TimeStore>,
}

impl Accounting {
    /// Loads every stored total. Sessions open before a restart are not
    /// restored; time after the last successful write is lost.
    pub async fn load(store: Arc<dyn TimeStore>, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let totals = store.load_all().await?;
        info!(users = totals.len(), "loaded stored voice time");
        Ok(Self {
            table: RwLock::new(SessionTable::from_totals(totals)),
            write_gate: Arc::new(Mutex::new(())),
            clock,
            store,
        })
    }

    pub async fn presence_changed(&self, user_id: &str, old: Presence, new: Presence) -> Transition {
        match (old.is_countable(), new.is_countable()) {
            (false, true) => {
                let now = self.clock.now_ms();
                let mut table = self.table.write().await;
                if table.open(user_id, now) {
                    debug!(user_id, "session started");
                    Transition::Opened
                } else {
                    Transition::Unchanged
                }
            }
            (true, false) => {
                let gate = self.write_gate.clone().lock_owned().await;
                let now = self.clock.now_ms();
                let closed = {
                    let mut table = self.table.write().await;
                    table.ensure(user_id);
                    table.close(user_id, now)
                };
                match closed {
                    Some(session_ms) => {
                        debug!(user_id, session_secs = session_ms / 1000, "session stopped");
                        Transition::Closed {
                            session_ms,
                            write: self.persist_delta(gate, user_id.to_string(), session_ms),
                        }
                    }
                    None => Transition::Unchanged,
                }
            }
            _ => {
                self.table.write().await.ensure(user_id);
                Transition::Unchanged
            }
        }
    }

    fn persist_delta(&self, gate: OwnedMutexGuard<()>, user_id: String, delta_ms: u64) -> JoinHandle<()> {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.apply_delta(&user_id, delta_ms).await {
                warn!(user_id = %user_id, delta_ms, error = %e, "failed to persist session, next flush will retry");
            }
            drop(gate);
        })
    }

    /// Writes every total, checkpointing open sessions first.
    pub async fn flush(&self) -> Result<usize, StoreError> {
        let _gate = self.write_gate.lock().await;
        let totals = self.table.write().await.checkpoint(self.clock.now_ms());
        self.store.flush_all(&totals).await?;
        debug!(users = totals.len(), "flushed voice time");
        Ok(totals.len())
    }

    /// Adds `ms` to every tracked user and persists it in one bulk write.
    /// Returns how many users were credited.
    pub async fn add_to_all(&self, ms: u64) -> usize {
        let _gate = self.write_gate.lock().await;
        let user_ids = self.table.write().await.add_to_all(ms);
        if let Err(e) = self.store.apply_delta_all(&user_ids, ms).await {
            warn!(users = user_ids.len(), ms, error = %e, "failed to persist bulk addition");
        }
        info!(users = user_ids.len(), ms, "added time to every tracked user");
        user_ids.len()
    }

    /// Users with a non-zero effective total, highest first, at most `limit`.
    pub async fn ranking(&self, limit: usize) -> Vec<(String, u64)> {
        let entries = self.table.read().await.snapshot_all(self.clock.now_ms());
        rank(entries, limit)
    }

    pub async fn total_ms(&self) -> u64 {
        self.table.read().await.aggregate(self.clock.now_ms())
    }
}

#[cfg(test)]
impl Accounting {
    pub async fn effective_total(&self, user_id: &str) -> u64 {
        self.table.read().await.snapshot(user_id, self.clock.now_ms())
    }

    pub async fn is_active(&self, user_id: &str) -> bool {
        self.table
            .read()
            .await
            .get(user_id)
            .is_some_and(|session| session.is_active())
    }
}

pub fn rank(mut entries: Vec<(String, u64)>, limit: usize) -> Vec<(String, u64)> {
    entries.retain(|(_, total)| *total > 0);
    entries.sort_by(|(a_id, a), (b_id, b)| b.cmp(a).then_with(|| a_id.cmp(b_id)));
    entries.truncate(limit);
    entries
}
