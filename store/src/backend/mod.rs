//! Backend interfaces consumed by the store layer, plus two adapters.
//!
//! The store never talks to storage directly. Document records go through
//! [`DocumentBackend`], which hands out exclusive, revocable leases; sorted
//! records go through [`SortedBackend`]. Methods return `impl Future + Send`
//! so stores and the autosave actor can hold a backend generically and still
//! be spawned onto the runtime.
//!
//! | Adapter | Use |
//! |---------|-----|
//! | [`MemoryBackend`] | tests, demos, single-process deployments |
//! | [`SqliteBackend`] | durable single-node deployments |

mod memory;
mod sqlite;

pub use memory::{BackendEvent, MemoryBackend};
pub use sqlite::SqliteBackend;

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::BackendError;
use crate::schema::Document;

/// Evaluated while a session start is in flight; returning `true` aborts
/// the grant.
pub type CancelCheck = dyn Fn() -> bool + Send + Sync;

/// Proof of an exclusive lease on one document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken {
    pub store: String,
    pub key: String,
    pub id: Uuid,
}

impl LeaseToken {
    pub(crate) fn new(store: &str, key: &str) -> Self {
        Self {
            store: store.to_string(),
            key: key.to_string(),
            id: Uuid::new_v4(),
        }
    }
}

/// Result of a successful session start.
#[derive(Debug)]
pub struct LeaseGrant {
    pub token: LeaseToken,
    /// The stored document, `None` for a key never written before.
    pub data: Option<Document>,
    pub user_ids: Vec<u64>,
    /// Flips to `true` when the backend revokes the lease. A closed channel
    /// without a `true` means the lease was released normally.
    pub revoked: watch::Receiver<bool>,
}

/// Session-locked document storage.
pub trait DocumentBackend: Send + Sync + 'static {
    /// Try to take the lease for `store/key` on behalf of `owner`.
    ///
    /// Returns `Ok(None)` while another holder keeps a live lease, or when
    /// `cancel` fires before the grant completes.
    fn start_session(
        &self,
        store: &str,
        key: &str,
        owner: &str,
        cancel: &CancelCheck,
    ) -> impl Future<Output = Result<Option<LeaseGrant>, BackendError>> + Send;

    /// Persist `data` under a held lease, refreshing its expiry.
    ///
    /// Fails with [`BackendError::LeaseLost`] once the token is stale.
    fn write(
        &self,
        token: &LeaseToken,
        data: &Document,
        user_ids: &[u64],
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Extend a held lease by the TTL without writing.
    ///
    /// Fails with [`BackendError::LeaseLost`] once the token is stale.
    fn renew(&self, token: &LeaseToken) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// How long a lease lives without a write or renewal.
    fn lease_ttl(&self) -> Duration;

    /// Release the lease. Releasing a lease that is already gone is a no-op.
    fn end_session(
        &self,
        token: &LeaseToken,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;
}

/// Page position inside a sorted range query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageCursor(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub ascending: bool,
    pub page_size: u32,
    /// Inclusive bounds.
    pub min: i64,
    pub max: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SortedEntry {
    pub key: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedPage {
    pub entries: Vec<SortedEntry>,
    /// `None` on the last page.
    pub next: Option<PageCursor>,
}

/// One integer per key with ordered range queries.
///
/// Entries with equal values are ordered by key ascending in both
/// directions so pagination is stable.
pub trait SortedBackend: Send + Sync + 'static {
    fn get_value(
        &self,
        store: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<i64>, BackendError>> + Send;

    fn set_value(
        &self,
        store: &str,
        key: &str,
        value: i64,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    fn sorted_page(
        &self,
        store: &str,
        query: &RangeQuery,
        cursor: PageCursor,
    ) -> impl Future<Output = Result<SortedPage, BackendError>> + Send;
}

/// A backend serving both record kinds.
pub trait Backend: DocumentBackend + SortedBackend {}

impl<T: DocumentBackend + SortedBackend> Backend for T {}

/// Milliseconds since the unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
