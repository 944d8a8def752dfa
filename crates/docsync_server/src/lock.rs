//! Short-lived lease used to keep compactions from overlapping.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Lease {
    id: u64,
    expires_at: Instant,
}

/// A lock that is released when its guard drops or when its TTL runs out.
///
/// The TTL bounds how long a stuck holder can block others.
#[derive(Debug)]
pub struct LeaseLock {
    ttl: Duration,
    current: Mutex<Option<Lease>>,
    next_id: Mutex<u64>,
}

impl LeaseLock {
    /// Creates an unheld lock whose leases last `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            current: Mutex::new(None),
            next_id: Mutex::new(0),
        }
    }

    /// Takes the lease if nobody holds a live one.
    pub fn try_acquire(&self) -> Option<LeaseGuard<'_>> {
        let now = Instant::now();
        let mut current = self.current.lock();
        if let Some(lease) = *current {
            if lease.expires_at > now {
                return None;
            }
        }

        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        *current = Some(Lease {
            id,
            expires_at: now + self.ttl,
        });
        Some(LeaseGuard { lock: self, id })
    }

    /// Returns true if a live lease is held.
    pub fn is_held(&self) -> bool {
        self.current
            .lock()
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }

    fn release(&self, id: u64) {
        let mut current = self.current.lock();
        // A lease that expired and was taken over belongs to someone else.
        if current.is_some_and(|lease| lease.id == id) {
            *current = None;
        }
    }
}

/// Holds a [`LeaseLock`] until dropped.
#[derive(Debug)]
pub struct LeaseGuard<'a> {
    lock: &'a LeaseLock,
    id: u64,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_while_held() {
        let lock = LeaseLock::new(Duration::from_secs(60));
        let guard = lock.try_acquire().unwrap();
        assert!(lock.is_held());
        assert!(lock.try_acquire().is_none());

        drop(guard);
        assert!(!lock.is_held());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let lock = LeaseLock::new(Duration::ZERO);
        let stale = lock.try_acquire().unwrap();
        let fresh = lock.try_acquire().unwrap();

        // Dropping the stale guard must not release the new holder.
        drop(stale);
        assert_eq!(lock.current.lock().map(|lease| lease.id), Some(fresh.id));

        drop(fresh);
        assert!(lock.current.lock().is_none());
    }
}
