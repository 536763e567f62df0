//! Per-store registry of keys with a live session in this process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

#[derive(Clone, Default)]
pub(crate) struct ActiveSessions {
    keys: Arc<Mutex<HashMap<String, Uuid>>>,
}

impl ActiveSessions {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Uuid>> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `key`. `None` if it is already claimed.
    pub(crate) fn reserve(&self, key: &str) -> Option<PendingReservation> {
        let mut keys = self.lock();
        if keys.contains_key(key) {
            return None;
        }
        let id = Uuid::new_v4();
        keys.insert(key.to_string(), id);
        Some(PendingReservation {
            reservation: Reservation {
                active: self.clone(),
                key: key.to_string(),
                id,
            },
            confirmed: false,
        })
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// A claimed key. Releasing only clears the entry this reservation made, so
/// a stale holder cannot clear a newer session's claim.
#[derive(Clone)]
pub(crate) struct Reservation {
    active: ActiveSessions,
    key: String,
    id: Uuid,
}

impl Reservation {
    pub(crate) fn release(&self) {
        let mut keys = self.active.lock();
        if keys.get(&self.key) == Some(&self.id) {
            keys.remove(&self.key);
        }
    }
}

/// Reservation for a session start still in flight; released on drop unless
/// confirmed.
pub(crate) struct PendingReservation {
    reservation: Reservation,
    confirmed: bool,
}

impl PendingReservation {
    pub(crate) fn confirm(mut self) -> Reservation {
        self.confirmed = true;
        self.reservation.clone()
    }
}

impl Drop for PendingReservation {
    fn drop(&mut self) {
        if !self.confirmed {
            self.reservation.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_reservation_released_on_drop() {
        let active = ActiveSessions::default();
        let pending = active.reserve("Player_1").unwrap();
        assert!(active.reserve("Player_1").is_none());
        drop(pending);
        assert!(!active.contains("Player_1"));
    }

    #[test]
    fn test_stale_release_keeps_newer_claim() {
        let active = ActiveSessions::default();
        let old = active.reserve("Player_1").unwrap().confirm();
        old.release();

        let newer = active.reserve("Player_1").unwrap().confirm();
        old.release();
        assert!(active.contains("Player_1"));
        newer.release();
        assert_eq!(active.keys(), Vec::<String>::new());
    }
}
