//! Set-once markers for change ids.

use docsync_protocol::{ChangeId, SequenceToken};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// What the guard remembers about one id.
#[derive(Debug, Clone, Copy)]
struct Claim {
    token: Option<SequenceToken>,
    claimed_at: Instant,
}

/// Remembers which change ids have been accepted, so that a retried
/// submission is recognised and not applied twice.
///
/// Claims are kept forever unless a TTL is configured. A TTL must be longer
/// than the longest client retry window; once an id expires a retry of it
/// would be appended again.
#[derive(Debug)]
pub struct IdempotencyGuard {
    claims: Mutex<HashMap<ChangeId, Claim>>,
    ttl: Option<Duration>,
}

impl IdempotencyGuard {
    /// Creates a guard with indefinite retention.
    pub fn new() -> Self {
        Self::with_ttl(None)
    }

    /// Creates a guard whose claims expire after `ttl`.
    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            claims: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Atomically marks `id` as taken.
    ///
    /// Returns `true` the first time an id is claimed and `false` while an
    /// earlier claim is still live.
    pub fn claim(&self, id: &ChangeId) -> bool {
        let now = Instant::now();
        let mut claims = self.claims.lock();
        if let Some(existing) = claims.get(id) {
            if !self.is_expired(existing, now) {
                return false;
            }
        }
        claims.insert(
            id.clone(),
            Claim {
                token: None,
                claimed_at: now,
            },
        );
        true
    }

    /// Records the token assigned to a claimed id.
    pub fn assign(&self, id: &ChangeId, token: SequenceToken) {
        let mut claims = self.claims.lock();
        let now = Instant::now();
        claims
            .entry(id.clone())
            .and_modify(|claim| claim.token = Some(token))
            .or_insert(Claim {
                token: Some(token),
                claimed_at: now,
            });
    }

    /// Re-creates a claim loaded from disk that was taken `age` ago.
    pub fn restore(&self, id: &ChangeId, token: SequenceToken, age: Duration) {
        let now = Instant::now();
        let claimed_at = now.checked_sub(age).unwrap_or(now);
        self.claims.lock().insert(
            id.clone(),
            Claim {
                token: Some(token),
                claimed_at,
            },
        );
    }

    /// Drops a claim whose append failed, so the retry can claim it again.
    pub fn release(&self, id: &ChangeId) {
        self.claims.lock().remove(id);
    }

    /// Returns the token recorded for `id`, if its claim is still live.
    pub fn token_of(&self, id: &ChangeId) -> Option<SequenceToken> {
        let claims = self.claims.lock();
        claims
            .get(id)
            .filter(|claim| !self.is_expired(claim, Instant::now()))
            .and_then(|claim| claim.token)
    }

    /// Removes expired claims. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut claims = self.claims.lock();
        let before = claims.len();
        claims.retain(|_, claim| !self.is_expired(claim, now));
        before - claims.len()
    }

    /// Returns the number of remembered ids.
    pub fn len(&self) -> usize {
        self.claims.lock().len()
    }

    /// Returns true if no id is remembered.
    pub fn is_empty(&self) -> bool {
        self.claims.lock().is_empty()
    }

    fn is_expired(&self, claim: &Claim, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(claim.claimed_at) >= ttl,
            None => false,
        }
    }
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new()
    }
}
