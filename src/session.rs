use std::collections::HashMap;

/// Milliseconds since the Unix epoch.
pub type Millis = u64;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }
}

/// Voice presence attributes that decide whether time is counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    pub in_channel: bool,
    pub server_mute: bool,
    pub self_mute: bool,
}

impl Presence {
    pub fn is_countable(&self) -> bool {
        self.in_channel && !self.server_mute && !self.self_mute
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserSession {
    pub total_time_ms: u64,
    /// Set while the user is in a countable presence state. Never loaded
    /// from storage.
    pub active_since: Option<Millis>,
}

impl UserSession {
    pub fn with_total(total_time_ms: u64) -> Self {
        Self {
            total_time_ms,
            active_since: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_since.is_some()
    }

    fn effective_total(&self, now: Millis) -> u64 {
        let open = self.active_since.map_or(0, |since| now.saturating_sub(since));
        self.total_time_ms.saturating_add(open)
    }
}

/// In-memory accumulated voice time per user.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, UserSession>,
}

impl SessionTable {
    /// Builds a table from stored totals. Every session starts inactive.
    pub fn from_totals(totals: HashMap<String, u64>) -> Self {
        let sessions = totals
            .into_iter()
            .map(|(user_id, total)| (user_id, UserSession::with_total(total)))
            .collect();
        Self { sessions }
    }

    #[cfg(test)]
    pub fn get(&self, user_id: &str) -> Option<&UserSession> {
        self.sessions.get(user_id)
    }

    pub fn ensure(&mut self, user_id: &str) -> &mut UserSession {
        self.sessions.entry(user_id.to_string()).or_default()
    }

    /// Starts a session. Returns false if one was already open.
    pub fn open(&mut self, user_id: &str, now: Millis) -> bool {
        let session = self.ensure(user_id);
        if session.is_active() {
            return false;
        }
        session.active_since = Some(now);
        true
    }

    /// Ends the open session and returns its elapsed time, or `None` if the
    /// user had no open session.
    pub fn close(&mut self, user_id: &str, now: Millis) -> Option<u64> {
        let session = self.sessions.get_mut(user_id)?;
        let since = session.active_since.take()?;
        let elapsed = now.saturating_sub(since);
        session.total_time_ms = session.total_time_ms.saturating_add(elapsed);
        Some(elapsed)
    }

    #[cfg(test)]
    pub fn snapshot(&self, user_id: &str, now: Millis) -> u64 {
        self.sessions
            .get(user_id)
            .map_or(0, |session| session.effective_total(now))
    }

    /// Effective totals of every tracked user, open sessions included.
    pub fn snapshot_all(&self, now: Millis) -> Vec<(String, u64)> {
        self.sessions
            .iter()
            .map(|(user_id, session)| (user_id.clone(), session.effective_total(now)))
            .collect()
    }

    pub fn aggregate(&self, now: Millis) -> u64 {
        self.sessions
            .values()
            .fold(0u64, |sum, session| sum.saturating_add(session.effective_total(now)))
    }

    /// Adds `ms` to every tracked user and returns their ids. Open sessions
    /// stay open.
    pub fn add_to_all(&mut self, ms: u64) -> Vec<String> {
        self.sessions
            .iter_mut()
            .map(|(user_id, session)| {
                session.total_time_ms = session.total_time_ms.saturating_add(ms);
                user_id.clone()
            })
            .collect()
    }

    /// Folds every open session into its total and restarts it at `now`.
    ///
    /// Returns the closed totals to hand to a full flush. A later `close`
    /// only reports time accrued after this point.
    pub fn checkpoint(&mut self, now: Millis) -> HashMap<String, u64> {
        self.sessions
            .iter_mut()
            .map(|(user_id, session)| {
                if let Some(since) = session.active_since {
                    session.total_time_ms =
                        session.total_time_ms.saturating_add(now.saturating_sub(since));
                    session.active_since = Some(now);
                }
                (user_id.clone(), session.total_time_ms)
            })
            .collect()
    }
}

#[cfg(test)]
pub use manual::ManualClock;
