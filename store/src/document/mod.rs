//! Session-locked document store.
//!
//! A [`Session`] is the exclusive lease this process holds on one client's
//! document plus the in-memory working copy. Reads and writes go through the
//! working copy; only [`DocumentStore::save`] and
//! [`DocumentStore::end_session`] write to the backend. A background task
//! renews the lease between writes, and releases it if the session is
//! dropped while still active.
//!
//! ```text
//!  Absent ──start_session──▶ Active ──end_session──▶ Ended
//!                              │
//!                              └──backend revokes──▶ Ended (observer fires)
//! ```

mod active;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::backend::{CancelCheck, DocumentBackend, LeaseGrant, LeaseToken};
use crate::error::{BackendError, DenyReason, StoreError};
use crate::retry::{self, RetryFailure, RetryPolicy};
use crate::schema::{self, Document};
use active::{ActiveSessions, Reservation};

const RENEWALS_PER_TTL: u32 = 3;
const MIN_RENEW_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Ended,
}

/// Passed to end observers when the backend revokes a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    pub store: String,
    pub key: String,
}

pub struct Session {
    store: String,
    token: LeaseToken,
    data: Document,
    user_ids: Vec<u64>,
    state: SessionState,
    reconciled: bool,
    revoked: watch::Receiver<bool>,
    observer: Option<JoinHandle<()>>,
    /// Signals the renewal task. Dropped without a send, the task releases
    /// the lease.
    keep_alive: Option<oneshot::Sender<()>>,
    reservation: Reservation,
}

impl Session {
    fn from_grant(store: &str, grant: LeaseGrant, reservation: Reservation) -> Self {
        Self {
            store: store.to_string(),
            token: grant.token,
            data: grant.data.unwrap_or_default(),
            user_ids: grant.user_ids,
            state: SessionState::Active,
            reconciled: false,
            revoked: grant.revoked,
            observer: None,
            keep_alive: None,
            reservation,
        }
    }

    pub fn key(&self) -> &str {
        &self.token.key
    }

    pub fn store_name(&self) -> &str {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the lease was revoked by the backend. A revoked session is
    /// treated as ended by the next store call.
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active && !self.is_revoked()
    }

    /// The working copy.
    pub fn data(&self) -> &Document {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Document {
        &mut self.data
    }

    /// Shallow-merge `patch` into the working copy without writing.
    pub fn stage(&mut self, patch: Document) {
        schema::merge_patch(&mut self.data, patch);
    }

    /// Associate a user id with the document. Persisted with the next write.
    pub fn add_user_id(&mut self, user_id: u64) {
        if !self.user_ids.contains(&user_id) {
            self.user_ids.push(user_id);
        }
    }

    pub fn user_ids(&self) -> &[u64] {
        &self.user_ids
    }

    /// Ended by us: the observer must not fire.
    fn finish_local(&mut self) {
        if let Some(observer) = self.observer.take() {
            observer.abort();
        }
        self.finish();
    }

    /// Ended by the backend: the observer is left to deliver the end.
    fn finish_forced(&mut self) {
        self.finish();
    }

    fn stop_keep_alive(&mut self) {
        if let Some(stop) = self.keep_alive.take() {
            let _ = stop.send(());
        }
    }

    fn finish(&mut self) {
        self.stop_keep_alive();
        if self.state == SessionState::Active {
            self.state = SessionState::Ended;
            self.reservation.release();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Active {
            tracing::warn!(
                store = %self.store,
                key = %self.token.key,
                "Session dropped while active; releasing its lease"
            );
            drop(self.keep_alive.take());
            self.finish_local();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store)
            .field("key", &self.token.key)
            .field("state", &self.state)
            .field("revoked", &self.is_revoked())
            .field("data", &self.data)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
enum StartFailure {
    #[error("lease is held by another session")]
    Contended,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Session-locked documents for one named store.
pub struct DocumentStore<B> {
    name: String,
    owner: String,
    template: Document,
    backend: Arc<B>,
    start_policy: RetryPolicy,
    active: ActiveSessions,
}

impl<B: DocumentBackend> DocumentStore<B> {
    /// `owner` identifies this process to the backend's lease bookkeeping.
    pub fn new(
        name: impl Into<String>,
        template: Document,
        backend: Arc<B>,
        owner: impl Into<String>,
        start_policy: RetryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            template,
            backend,
            start_policy,
            active: ActiveSessions::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Document {
        &self.template
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains(key)
    }

    /// Keys with a session started (or starting) in this store, sorted.
    pub fn active_keys(&self) -> Vec<String> {
        self.active.keys()
    }

    /// Obtain the exclusive session for `key` and reconcile its working copy.
    ///
    /// `cancel` is checked before every attempt and handed to the backend;
    /// once it returns `true` the start is abandoned.
    pub async fn start_session(
        &self,
        key: &str,
        cancel: &CancelCheck,
    ) -> Result<Session, StoreError> {
        let pending = self.active.reserve(key).ok_or_else(|| {
            StoreError::usage(format!(
                "{} already has an active session in {}",
                key, self.name
            ))
        })?;

        let context = format!("session start {}/{}", self.name, key);
        let backend = &*self.backend;
        let (store, owner) = (self.name.as_str(), self.owner.as_str());
        let last_contended = AtomicBool::new(false);
        let contended = &last_contended;
        let outcome = retry::execute(&self.start_policy, &context, move || async move {
            if cancel() {
                return Ok::<_, StartFailure>(None);
            }
            let granted = backend.start_session(store, key, owner, cancel).await;
            contended.store(matches!(granted, Ok(None)), Ordering::Relaxed);
            match granted? {
                Some(grant) => Ok(Some(grant)),
                None if cancel() => Ok(None),
                None => Err(StartFailure::Contended),
            }
        })
        .await;

        let reason = match outcome {
            Ok(Some(grant)) => {
                let mut session = Session::from_grant(&self.name, grant, pending.confirm());
                session.keep_alive = Some(self.spawn_keep_alive(session.token.clone()));
                let filled = self.reconcile(&mut session);
                tracing::info!(store = %self.name, key, filled, "Session started");
                return Ok(session);
            }
            Ok(None) => DenyReason::Cancelled,
            Err(_) if last_contended.load(Ordering::Relaxed) => DenyReason::Contended,
            Err(failure) => DenyReason::Unavailable(failure.message),
        };

        tracing::warn!(store = %self.name, key, %reason, "Session denied");
        Err(StoreError::SessionDenied {
            key: key.to_string(),
            reason,
        })
    }

    /// Fill template keys missing from the working copy. Runs once per
    /// session; later calls return 0.
    pub fn reconcile(&self, session: &mut Session) -> usize {
        if session.reconciled {
            return 0;
        }
        session.reconciled = true;
        schema::reconcile(&mut session.data, &self.template)
    }

    /// Call `callback` at most once if the backend revokes `session`.
    ///
    /// The active-session entry is cleared before the callback runs. Ending
    /// the session locally cancels the observer. Registering again replaces
    /// the previous observer.
    pub fn register_end_observer<F>(&self, session: &mut Session, callback: F)
    where
        F: FnOnce(SessionEnd) + Send + 'static,
    {
        if let Some(previous) = session.observer.take() {
            previous.abort();
        }
        if session.state == SessionState::Ended {
            return;
        }

        let mut revoked = session.revoked.clone();
        let reservation = session.reservation.clone();
        let end = SessionEnd {
            store: self.name.clone(),
            key: session.key().to_string(),
        };
        session.observer = Some(tokio::spawn(async move {
            if revoked.wait_for(|revoked| *revoked).await.is_ok() {
                reservation.release();
                tracing::warn!(store = %end.store, key = %end.key, "Session revoked by the backend");
                callback(end);
            }
        }));
    }

    /// Merge `patch` into the working copy and persist it.
    ///
    /// The working copy only changes once the write has succeeded. Not
    /// retried: a write under a confirmed lease either lands or reports.
    pub async fn save(&self, session: &mut Session, patch: Document) -> Result<(), StoreError> {
        self.ensure_live(session)?;
        let mut next = session.data.clone();
        schema::merge_patch(&mut next, patch);
        self.write(session, &next).await?;
        session.data = next;
        Ok(())
    }

    /// Flush the working copy and release the lease.
    ///
    /// Ending an ended session is a no-op. A failed flush is reported after
    /// the lease has been released.
    pub async fn end_session(&self, session: &mut Session) -> Result<(), StoreError> {
        if session.state == SessionState::Ended {
            return Ok(());
        }
        self.ensure_live(session)?;

        let data = session.data.clone();
        let flushed = self.write(session, &data).await;
        if session.state == SessionState::Ended {
            // Lease lost during the flush; nothing left to release.
            return flushed;
        }

        if let Some(observer) = session.observer.take() {
            observer.abort();
        }
        session.stop_keep_alive();
        let released = self.backend.end_session(&session.token).await;
        session.finish_local();

        if let Err(e) = &flushed {
            tracing::error!(store = %self.name, key = %session.key(), error = %e, "Final flush failed; unsaved changes are lost");
        }
        if let Err(e) = &released {
            tracing::warn!(store = %self.name, key = %session.key(), error = %e, "Lease release failed; it will expire on its own");
        }
        tracing::info!(store = %self.name, key = %session.key(), "Session ended");

        flushed?;
        released.map_err(|e| {
            RetryFailure::single(format!("session end {}/{}", self.name, session.key()), e).into()
        })
    }

    /// Renew `token` at a fraction of the lease TTL until told to stop. If the
    /// stop sender is dropped unsignalled, release the lease instead.
    fn spawn_keep_alive(&self, token: LeaseToken) -> oneshot::Sender<()> {
        let (stop_tx, mut stop) = oneshot::channel();
        let backend = self.backend.clone();
        let period = (backend.lease_ttl() / RENEWALS_PER_TTL).max(MIN_RENEW_PERIOD);

        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;

                    stopped = &mut stop => {
                        if stopped.is_err() {
                            match backend.end_session(&token).await {
                                Ok(()) => tracing::info!(store = %token.store, key = %token.key, "Released lease of dropped session"),
                                Err(e) => tracing::warn!(store = %token.store, key = %token.key, error = %e, "Could not release lease of dropped session; it will expire"),
                            }
                        }
                        return;
                    }

                    _ = ticker.tick() => match backend.renew(&token).await {
                        Ok(()) => tracing::trace!(store = %token.store, key = %token.key, "Lease renewed"),
                        Err(BackendError::LeaseLost(_)) => {
                            tracing::debug!(store = %token.store, key = %token.key, "Lease gone; renewals stopped");
                            return;
                        }
                        Err(e) => tracing::warn!(store = %token.store, key = %token.key, error = %e, "Lease renewal failed"),
                    },
                }
            }
        });
        stop_tx
    }

    fn ensure_live(&self, session: &mut Session) -> Result<(), StoreError> {
        if session.state == SessionState::Ended {
            return Err(StoreError::usage(format!(
                "session for {} in {} has ended",
                session.key(),
                self.name
            )));
        }
        if session.is_revoked() {
            session.finish_forced();
            return Err(StoreError::ForcedSessionEnd {
                key: session.key().to_string(),
            });
        }
        Ok(())
    }

    async fn write(&self, session: &mut Session, data: &Document) -> Result<(), StoreError> {
        match self
            .backend
            .write(&session.token, data, &session.user_ids)
            .await
        {
            Ok(()) => {
                tracing::debug!(store = %self.name, key = %session.key(), "Document written");
                Ok(())
            }
            Err(BackendError::LeaseLost(_)) => {
                session.finish_forced();
                tracing::warn!(store = %self.name, key = %session.key(), "Write rejected: lease lost");
                Err(StoreError::ForcedSessionEnd {
                    key: session.key().to_string(),
                })
            }
            Err(e) => Err(RetryFailure::single(
                format!("document write {}/{}", self.name, session.key()),
                e,
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, MemoryBackend, SqliteBackend};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn gold(backend: &Arc<MemoryBackend>, owner: &str) -> DocumentStore<MemoryBackend> {
        DocumentStore::new(
            "Gold",
            doc(json!({ "coins": 0, "level": 1 })),
            backend.clone(),
            owner,
            RetryPolicy::new(2, Duration::ZERO).unwrap(),
        )
    }

    fn never() -> impl Fn() -> bool + Send + Sync {
        || false
    }

    #[tokio::test]
    async fn test_loaded_document_is_reconciled() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_document("Gold", "Player_9", doc(json!({ "coins": 50 })));
        let store = gold(&backend, "a");

        let mut session = store.start_session("Player_9", &never()).await.unwrap();

        assert_eq!(session.data(), &doc(json!({ "coins": 50, "level": 1 })));
        assert!(store.is_active("Player_9"));
        store.end_session(&mut session).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_runs_once_per_session() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let mut session = store.start_session("Player_1", &never()).await.unwrap();
        assert_eq!(session.data(), store.template());

        session.data_mut().remove("level");
        assert_eq!(store.reconcile(&mut session), 0);
        assert!(!session.data().contains_key("level"));
        store.end_session(&mut session).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_keeps_lease_past_ttl() {
        let backend = Arc::new(MemoryBackend::new().with_lease_ttl(Duration::from_millis(30)));
        let a = gold(&backend, "process-a");
        let b = gold(&backend, "process-b");
        let mut session = a.start_session("Player_12", &never()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        let second = b.start_session("Player_12", &never()).await;

        assert!(matches!(
            second,
            Err(StoreError::SessionDenied {
                reason: DenyReason::Contended,
                ..
            })
        ));
        assert!(session.is_active());
        a.end_session(&mut session).await.unwrap();
        let mut next = b.start_session("Player_12", &never()).await.unwrap();
        b.end_session(&mut next).await.unwrap();
    }

    #[tokio::test]
    async fn test_one_session_across_processes_sharing_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let ttl = Duration::from_millis(300);
        let a = DocumentStore::new(
            "Gold",
            Document::new(),
            Arc::new(SqliteBackend::open(&path, ttl).await.unwrap()),
            "process-a",
            RetryPolicy::once(),
        );
        let b = DocumentStore::new(
            "Gold",
            Document::new(),
            Arc::new(SqliteBackend::open(&path, ttl).await.unwrap()),
            "process-b",
            RetryPolicy::once(),
        );

        let mut held = a.start_session("Player_1", &never()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let second = b.start_session("Player_1", &never()).await;
        assert!(matches!(
            second,
            Err(StoreError::SessionDenied {
                reason: DenyReason::Contended,
                ..
            })
        ));
        assert!(held.is_active());
        a.save(&mut held, doc(json!({ "coins": 3 }))).await.unwrap();
        a.end_session(&mut held).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_session_releases_lease() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let session = store.start_session("Player_13", &never()).await.unwrap();

        drop(session);
        assert!(!store.is_active("Player_13"));
        tokio::time::timeout(Duration::from_secs(1), async {
            while backend.lease_owner("Gold", "Player_13").is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            backend.events("Gold", "Player_13"),
            vec![BackendEvent::SessionStart, BackendEvent::SessionEnd]
        );
        let mut again = store.start_session("Player_13", &never()).await.unwrap();
        store.end_session(&mut again).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_keys_track_session_lifecycle() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        assert!(store.active_keys().is_empty());

        let mut second = store.start_session("Player_2", &never()).await.unwrap();
        let mut first = store.start_session("Player_1", &never()).await.unwrap();
        assert_eq!(store.active_keys(), vec!["Player_1", "Player_2"]);

        store.end_session(&mut first).await.unwrap();
        assert_eq!(store.active_keys(), vec!["Player_2"]);

        let (tx, rx) = tokio::sync::oneshot::channel();
        store.register_end_observer(&mut second, move |end| {
            let _ = tx.send(end);
        });
        assert!(backend.revoke("Gold", "Player_2"));
        tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(store.active_keys().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_starts_yield_one_session() {
        let backend = Arc::new(MemoryBackend::new());
        let a = gold(&backend, "process-a");
        let b = gold(&backend, "process-b");

        let (never_a, never_b) = (never(), never());
        let (ra, rb) = tokio::join!(
            a.start_session("Player_5", &never_a),
            b.start_session("Player_5", &never_b)
        );

        let granted = [ra.is_ok(), rb.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(granted, 1);
        let denied = if ra.is_ok() { rb } else { ra };
        assert!(matches!(
            denied,
            Err(StoreError::SessionDenied {
                reason: DenyReason::Contended,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_second_start_in_same_store_is_usage_error() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let mut session = store.start_session("Player_2", &never()).await.unwrap();

        let again = store.start_session("Player_2", &never()).await;
        assert!(matches!(again, Err(StoreError::Usage(_))));

        store.end_session(&mut session).await.unwrap();
        let mut fresh = store.start_session("Player_2", &never()).await.unwrap();
        store.end_session(&mut fresh).await.unwrap();
    }

    #[tokio::test]
    async fn test_saves_merge_without_dropping_fields() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let mut session = store.start_session("Player_3", &never()).await.unwrap();

        store.save(&mut session, doc(json!({ "a": 1 }))).await.unwrap();
        store.save(&mut session, doc(json!({ "b": 2 }))).await.unwrap();

        let persisted = backend.document("Gold", "Player_3").unwrap();
        assert_eq!(persisted["a"], json!(1));
        assert_eq!(persisted["b"], json!(2));
        assert_eq!(persisted["level"], json!(1));
        store.end_session(&mut session).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_save_leaves_working_copy_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let mut session = store.start_session("Player_4", &never()).await.unwrap();

        backend.fail_next(1);
        let result = store.save(&mut session, doc(json!({ "x": 1 }))).await;

        assert!(matches!(result, Err(StoreError::Transient(_))));
        assert!(!session.data().contains_key("x"));
        assert!(session.is_active());
        store.end_session(&mut session).await.unwrap();
    }

    #[tokio::test]
    async fn test_end_session_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let mut session = store.start_session("Player_6", &never()).await.unwrap();
        session.stage(doc(json!({ "coins": 7 })));
        session.add_user_id(6);

        store.end_session(&mut session).await.unwrap();
        store.end_session(&mut session).await.unwrap();

        assert_eq!(session.state(), SessionState::Ended);
        assert!(!store.is_active("Player_6"));
        assert_eq!(backend.document("Gold", "Player_6").unwrap()["coins"], json!(7));
        assert_eq!(backend.user_ids("Gold", "Player_6"), vec![6]);
        assert_eq!(
            backend.events("Gold", "Player_6"),
            vec![
                BackendEvent::SessionStart,
                BackendEvent::Write,
                BackendEvent::SessionEnd
            ]
        );

        let late = store.save(&mut session, Document::new()).await;
        assert!(matches!(late, Err(StoreError::Usage(_))));
    }

    #[tokio::test]
    async fn test_forced_end_fires_observer_once() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let mut session = store.start_session("Player_7", &never()).await.unwrap();

        let fired = Arc::new(AtomicU32::new(0));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let counter = fired.clone();
        store.register_end_observer(&mut session, move |end| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(end);
        });

        assert!(backend.revoke("Gold", "Player_7"));
        let end = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end.key, "Player_7");
        assert!(!store.is_active("Player_7"));

        let save = store.save(&mut session, doc(json!({ "coins": 1 }))).await;
        assert!(matches!(save, Err(StoreError::ForcedSessionEnd { .. })));
        store.end_session(&mut session).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_end_does_not_fire_observer() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        let mut session = store.start_session("Player_8", &never()).await.unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        store.register_end_observer(&mut session, move |_| flag.store(true, Ordering::SeqCst));

        store.end_session(&mut session).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_while_in_flight_denies() {
        let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(30)));
        let store = gold(&backend, "a");
        let cancelled = Arc::new(AtomicBool::new(false));

        let flag = cancelled.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.store(true, Ordering::SeqCst);
        });
        let check = cancelled.clone();
        let cancel = move || check.load(Ordering::SeqCst);
        let result = store.start_session("Player_10", &cancel).await;

        assert!(matches!(
            result,
            Err(StoreError::SessionDenied {
                reason: DenyReason::Cancelled,
                ..
            })
        ));
        assert!(!store.is_active("Player_10"));
        assert!(backend.lease_owner("Gold", "Player_10").is_none());
    }

    #[tokio::test]
    async fn test_unavailable_backend_denies_after_retries() {
        let backend = Arc::new(MemoryBackend::new());
        let store = gold(&backend, "a");
        backend.fail_next(2);

        let result = store.start_session("Player_11", &never()).await;
        assert!(matches!(
            result,
            Err(StoreError::SessionDenied {
                reason: DenyReason::Unavailable(_),
                ..
            })
        ));
        assert!(!store.is_active("Player_11"));
    }
}
