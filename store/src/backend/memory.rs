//! Process-local backend.
//!
//! Leases expire after a TTL; a start on an expired lease takes it over and
//! revokes the previous holder. Test hooks allow injected failures, added
//! latency, forced revocation and inspection of a per-record event log.
//! Renewals bypass the hooks and are not logged.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    CancelCheck, DocumentBackend, LeaseGrant, LeaseToken, PageCursor, RangeQuery, SortedBackend,
    SortedEntry, SortedPage,
};
use crate::error::BackendError;
use crate::schema::Document;

const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(120);

/// Backend-side operations recorded per document, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendEvent {
    SessionStart,
    Write,
    SessionEnd,
    Revoked,
}

type RecordId = (String, String);

struct Lease {
    token: Uuid,
    owner: String,
    expires_at: Instant,
    revoke: watch::Sender<bool>,
}

struct StoredDocument {
    data: Document,
    user_ids: Vec<u64>,
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<RecordId, StoredDocument>,
    leases: HashMap<RecordId, Lease>,
    sorted: HashMap<String, HashMap<String, i64>>,
    events: HashMap<RecordId, Vec<BackendEvent>>,
    pending_failures: u32,
}

impl MemoryState {
    fn take_failure(&mut self) -> Result<(), BackendError> {
        if self.pending_failures > 0 {
            self.pending_failures -= 1;
            return Err(BackendError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn log(&mut self, id: &RecordId, event: BackendEvent) {
        self.events.entry(id.clone()).or_default().push(event);
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    lease_ttl: Duration,
    latency: Duration,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            lease_ttl: DEFAULT_LEASE_TTL,
            latency: Duration::ZERO,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Delay applied before every session start, write and release.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `count` backend operations fail.
    pub fn fail_next(&self, count: u32) {
        self.state().pending_failures = count;
    }

    /// Revoke the live lease on `store/key`, as another process would when
    /// taking it over. Returns whether a lease was held.
    pub fn revoke(&self, store: &str, key: &str) -> bool {
        let id = record_id(store, key);
        let mut state = self.state();
        match state.leases.remove(&id) {
            Some(lease) => {
                let _ = lease.revoke.send(true);
                state.log(&id, BackendEvent::Revoked);
                true
            }
            None => false,
        }
    }

    /// Seed a stored document, bypassing leases.
    pub fn put_document(&self, store: &str, key: &str, data: Document) {
        self.state().documents.insert(
            record_id(store, key),
            StoredDocument {
                data,
                user_ids: Vec::new(),
            },
        );
    }

    pub fn document(&self, store: &str, key: &str) -> Option<Document> {
        self.state()
            .documents
            .get(&record_id(store, key))
            .map(|d| d.data.clone())
    }

    pub fn user_ids(&self, store: &str, key: &str) -> Vec<u64> {
        self.state()
            .documents
            .get(&record_id(store, key))
            .map(|d| d.user_ids.clone())
            .unwrap_or_default()
    }

    pub fn lease_owner(&self, store: &str, key: &str) -> Option<String> {
        self.state()
            .leases
            .get(&record_id(store, key))
            .map(|l| l.owner.clone())
    }

    pub fn events(&self, store: &str, key: &str) -> Vec<BackendEvent> {
        self.state()
            .events
            .get(&record_id(store, key))
            .cloned()
            .unwrap_or_default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // Every mutation leaves the maps consistent, so a poisoned lock is
        // still safe to use.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn record_id(store: &str, key: &str) -> RecordId {
    (store.to_string(), key.to_string())
}

impl DocumentBackend for MemoryBackend {
    async fn start_session(
        &self,
        store: &str,
        key: &str,
        owner: &str,
        cancel: &CancelCheck,
    ) -> Result<Option<LeaseGrant>, BackendError> {
        self.simulate_latency().await;
        if cancel() {
            return Ok(None);
        }

        let id = record_id(store, key);
        let now = Instant::now();
        let mut guard = self.state();
        let state = &mut *guard;
        state.take_failure()?;

        if let Some(existing) = state.leases.get(&id) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        if let Some(stale) = state.leases.remove(&id) {
            tracing::info!(store, key, previous_owner = %stale.owner, "Taking over expired lease");
            let _ = stale.revoke.send(true);
            state.log(&id, BackendEvent::Revoked);
        }

        let token = LeaseToken::new(store, key);
        let (revoke, revoked) = watch::channel(false);
        state.leases.insert(
            id.clone(),
            Lease {
                token: token.id,
                owner: owner.to_string(),
                expires_at: now + self.lease_ttl,
                revoke,
            },
        );
        let (data, user_ids) = match state.documents.get(&id) {
            Some(doc) => (Some(doc.data.clone()), doc.user_ids.clone()),
            None => (None, Vec::new()),
        };
        state.log(&id, BackendEvent::SessionStart);

        Ok(Some(LeaseGrant {
            token,
            data,
            user_ids,
            revoked,
        }))
    }

    async fn write(
        &self,
        token: &LeaseToken,
        data: &Document,
        user_ids: &[u64],
    ) -> Result<(), BackendError> {
        self.simulate_latency().await;

        let id = record_id(&token.store, &token.key);
        let mut guard = self.state();
        let state = &mut *guard;
        state.take_failure()?;

        match state.leases.get_mut(&id) {
            Some(lease) if lease.token == token.id => {
                lease.expires_at = Instant::now() + self.lease_ttl;
            }
            _ => return Err(BackendError::LeaseLost(token.key.clone())),
        }
        state.documents.insert(
            id.clone(),
            StoredDocument {
                data: data.clone(),
                user_ids: user_ids.to_vec(),
            },
        );
        state.log(&id, BackendEvent::Write);
        Ok(())
    }

    async fn renew(&self, token: &LeaseToken) -> Result<(), BackendError> {
        let id = record_id(&token.store, &token.key);
        match self.state().leases.get_mut(&id) {
            Some(lease) if lease.token == token.id => {
                lease.expires_at = Instant::now() + self.lease_ttl;
                Ok(())
            }
            _ => Err(BackendError::LeaseLost(token.key.clone())),
        }
    }

    fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    async fn end_session(&self, token: &LeaseToken) -> Result<(), BackendError> {
        self.simulate_latency().await;

        let id = record_id(&token.store, &token.key);
        let mut state = self.state();
        state.take_failure()?;

        let held = matches!(state.leases.get(&id), Some(lease) if lease.token == token.id);
        if held {
            // Dropping the sender closes the channel without a revocation.
            state.leases.remove(&id);
            state.log(&id, BackendEvent::SessionEnd);
        }
        Ok(())
    }
}

impl SortedBackend for MemoryBackend {
    async fn get_value(&self, store: &str, key: &str) -> Result<Option<i64>, BackendError> {
        let mut state = self.state();
        state.take_failure()?;
        Ok(state.sorted.get(store).and_then(|m| m.get(key)).copied())
    }

    async fn set_value(&self, store: &str, key: &str, value: i64) -> Result<(), BackendError> {
        let mut state = self.state();
        state.take_failure()?;
        state
            .sorted
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn sorted_page(
        &self,
        store: &str,
        query: &RangeQuery,
        cursor: PageCursor,
    ) -> Result<SortedPage, BackendError> {
        let mut state = self.state();
        state.take_failure()?;

        let mut entries: Vec<SortedEntry> = state
            .sorted
            .get(store)
            .map(|values| {
                values
                    .iter()
                    .filter(|(_, v)| **v >= query.min && **v <= query.max)
                    .map(|(k, v)| SortedEntry {
                        key: k.clone(),
                        value: *v,
                    })
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| {
            let by_value = if query.ascending {
                a.value.cmp(&b.value)
            } else {
                b.value.cmp(&a.value)
            };
            by_value.then_with(|| a.key.cmp(&b.key))
        });

        let start = usize::try_from(cursor.0).unwrap_or(usize::MAX).min(entries.len());
        let end = start
            .saturating_add(query.page_size as usize)
            .min(entries.len());
        let next = (end < entries.len()).then_some(PageCursor(end as u64));

        Ok(SortedPage {
            entries: entries[start..end].to_vec(),
            next,
        })
    }
}
