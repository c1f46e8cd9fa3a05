/// In-memory session table.
///
/// A session memoizes a successful password authentication: the
/// passphrase-derived secret key is cached so follow-up requests can
/// re-unlock the user without the passphrase. Sessions die after an idle
/// timeout or an absolute lifetime, whichever comes first.
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::crypto::{random_token, SecretKey};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: i64,
    pub secret_key: SecretKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Thread-safe table of live sessions. All operations take the lock.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    idle_timeout: Duration,
    life_timeout: Duration,
}

impl SessionStore {
    pub fn new(idle_timeout_secs: u64, life_timeout_secs: u64) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout: Duration::seconds(idle_timeout_secs as i64),
            life_timeout: Duration::seconds(life_timeout_secs as i64),
        }
    }

    /// Register a new session and return its id.
    pub fn create(&self, user_id: i64, secret_key: SecretKey) -> String {
        let now = Utc::now();
        let session = Session {
            id: random_token(),
            user_id,
            secret_key,
            created_at: now,
            updated_at: now,
        };
        let id = session.id.clone();
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .insert(id.clone(), session);
        id
    }

    /// Look up a live session, refreshing its idle clock. Expired sessions
    /// are dropped on sight and reported as absent.
    pub fn fetch(&self, id: &str) -> Option<(i64, SecretKey)> {
        let now = Utc::now();
        let mut sessions = self.sessions.lock().expect("session table lock poisoned");
        let expired = match sessions.get(id) {
            Some(session) => self.expired(session, now),
            None => return None,
        };
        if expired {
            sessions.remove(id);
            return None;
        }
        let session = sessions.get_mut(id).expect("checked above");
        session.updated_at = now;
        Some((session.user_id, session.secret_key.clone()))
    }

    /// Replace a session after a password change: the old id dies, the new
    /// one caches the freshly derived secret key.
    pub fn rotate(&self, old_id: &str, user_id: i64, secret_key: SecretKey) -> String {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(old_id);
        self.create(user_id, secret_key)
    }

    pub fn remove(&self, id: &str) {
        self.sessions
            .lock()
            .expect("session table lock poisoned")
            .remove(id);
    }

    fn expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session.created_at + self.life_timeout < now
            || session.updated_at + self.idle_timeout < now
    }

    #[cfg(test)]
    fn backdate(&self, id: &str, by: Duration) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(id).unwrap();
        session.created_at -= by;
        session.updated_at -= by;
    }
}
