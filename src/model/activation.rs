/// Time-bounded activation tokens for new users.
///
/// An admin creates the account and hands the token to its owner
/// out-of-band; the owner's first authenticated request presents it
/// together with their chosen passphrase.
use chrono::Utc;

use crate::crypto::random_token;

pub const DEFAULT_LIFESPAN_SECS: i64 = 86_400;

#[derive(Debug, Clone)]
pub struct ActivationToken {
    pub user_id: i64,
    pub token: String,
    /// Epoch seconds.
    pub not_before: i64,
    /// Epoch seconds.
    pub not_after: i64,
}

impl ActivationToken {
    pub fn generate(user_id: i64, lifespan_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            user_id,
            token: random_token(),
            not_before: now,
            not_after: now + lifespan_secs,
        }
    }

    pub fn valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}
