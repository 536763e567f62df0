//! SQLite-backed adapter.
//!
//! ## Database setup
//!
//! The pool is configured with WAL journaling (one writer, concurrent
//! readers) and embedded migrations from `store/migrations`, applied on
//! [`SqliteBackend::open`].
//!
//! ## Leases
//!
//! `session_leases` holds one row per locked document. Acquisition is a
//! single conditional upsert that only overwrites an expired row, so two
//! processes sharing the file can never both hold a live lease. Every write
//! refreshes the lease and stores the document in one transaction, and
//! [`DocumentBackend::renew`] refreshes it without writing. A write or renewal
//! whose token no longer matches fails with [`BackendError::LeaseLost`].
//!
//! Revocation is only observable locally: when this process detects that
//! one of its leases was taken over, the lease's watch channel is flipped.
//! Channels whose holder has gone are pruned on the next session start.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::sync::watch;
use uuid::Uuid;

use super::{
    now_millis, CancelCheck, DocumentBackend, LeaseGrant, LeaseToken, PageCursor, RangeQuery,
    SortedBackend, SortedEntry, SortedPage,
};
use crate::error::BackendError;
use crate::schema::Document;

pub struct SqliteBackend {
    pool: SqlitePool,
    lease_ttl: Duration,
    revokers: Mutex<HashMap<Uuid, watch::Sender<bool>>>,
}

impl SqliteBackend {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn open(path: &Path, lease_ttl: Duration) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::with_pool(pool, lease_ttl).await
    }

    /// In-memory database for tests. Migrations are applied.
    #[cfg(test)]
    pub(crate) async fn new_in_memory(lease_ttl: Duration) -> Result<Self, BackendError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, lease_ttl).await
    }

    async fn with_pool(pool: SqlitePool, lease_ttl: Duration) -> Result<Self, BackendError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| BackendError::Migration(e.to_string()))?;
        Ok(Self {
            pool,
            lease_ttl,
            revokers: Mutex::new(HashMap::new()),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn ttl_millis(&self) -> i64 {
        i64::try_from(self.lease_ttl.as_millis()).unwrap_or(i64::MAX)
    }

    fn revokers(&self) -> MutexGuard<'_, HashMap<Uuid, watch::Sender<bool>>> {
        self.revokers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop revocation channels nobody listens to any more.
    fn prune_revokers(&self) {
        self.revokers().retain(|_, revoke| !revoke.is_closed());
    }

    /// Tell a local holder its lease is gone.
    fn revoke_local(&self, id: &Uuid) {
        if let Some(revoke) = self.revokers().remove(id) {
            let _ = revoke.send(true);
        }
    }

    async fn release(&self, token: &LeaseToken) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM session_leases WHERE store = ? AND key = ? AND token = ?")
            .bind(&token.store)
            .bind(&token.key)
            .bind(token.id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_document(
        &self,
        store: &str,
        key: &str,
    ) -> Result<(Option<Document>, Vec<u64>), BackendError> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT data, user_ids FROM documents WHERE store = ? AND key = ?")
                .bind(store)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let Some((data, user_ids)) = row else {
            return Ok((None, Vec::new()));
        };
        let value: serde_json::Value = serde_json::from_str(&data)?;
        let serde_json::Value::Object(doc) = value else {
            return Err(BackendError::Corrupt {
                key: key.to_string(),
                detail: "stored value is not an object".into(),
            });
        };
        Ok((Some(doc), serde_json::from_str(&user_ids)?))
    }
}

impl DocumentBackend for SqliteBackend {
    async fn start_session(
        &self,
        store: &str,
        key: &str,
        owner: &str,
        cancel: &CancelCheck,
    ) -> Result<Option<LeaseGrant>, BackendError> {
        if cancel() {
            return Ok(None);
        }
        self.prune_revokers();

        let now = now_millis();
        let previous: Option<(String,)> = sqlx::query_as(
            "SELECT token FROM session_leases WHERE store = ? AND key = ? AND expires_at <= ?",
        )
        .bind(store)
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let token = LeaseToken::new(store, key);
        let acquired = sqlx::query(
            r#"
            INSERT INTO session_leases (store, key, token, owner, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(store, key) DO UPDATE SET
                token = excluded.token,
                owner = excluded.owner,
                expires_at = excluded.expires_at
            WHERE session_leases.expires_at <= ?
            "#,
        )
        .bind(store)
        .bind(key)
        .bind(token.id.to_string())
        .bind(owner)
        .bind(now.saturating_add(self.ttl_millis()))
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        if !acquired {
            return Ok(None);
        }
        if let Some((stale,)) = previous {
            if let Ok(stale) = Uuid::parse_str(&stale) {
                tracing::info!(store, key, "Took over expired lease");
                self.revoke_local(&stale);
            }
        }
        if cancel() {
            self.release(&token).await?;
            return Ok(None);
        }

        let (data, user_ids) = match self.load_document(store, key).await {
            Ok(loaded) => loaded,
            Err(e) => {
                let _ = self.release(&token).await;
                return Err(e);
            }
        };

        let (revoke, revoked) = watch::channel(false);
        self.revokers().insert(token.id, revoke);

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
        let now = now_millis();
        let data = serde_json::to_string(data)?;
        let user_ids = serde_json::to_string(user_ids)?;

        let mut tx = self.pool.begin().await?;
        let refreshed = sqlx::query(
            "UPDATE session_leases SET expires_at = ? WHERE store = ? AND key = ? AND token = ?",
        )
        .bind(now.saturating_add(self.ttl_millis()))
        .bind(&token.store)
        .bind(&token.key)
        .bind(token.id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if refreshed == 0 {
            tx.rollback().await?;
            self.revoke_local(&token.id);
            return Err(BackendError::LeaseLost(token.key.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO documents (store, key, data, user_ids, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(store, key) DO UPDATE SET
                data = excluded.data,
                user_ids = excluded.user_ids,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&token.store)
        .bind(&token.key)
        .bind(data)
        .bind(user_ids)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn renew(&self, token: &LeaseToken) -> Result<(), BackendError> {
        let refreshed = sqlx::query(
            "UPDATE session_leases SET expires_at = ? WHERE store = ? AND key = ? AND token = ?",
        )
        .bind(now_millis().saturating_add(self.ttl_millis()))
        .bind(&token.store)
        .bind(&token.key)
        .bind(token.id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if refreshed == 0 {
            self.revoke_local(&token.id);
            return Err(BackendError::LeaseLost(token.key.clone()));
        }
        Ok(())
    }

    fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    async fn end_session(&self, token: &LeaseToken) -> Result<(), BackendError> {
        // Dropping the sender first closes the channel without a revocation,
        // even if a renewal races the release.
        self.revokers().remove(&token.id);
        self.release(token).await
    }
}

impl SortedBackend for SqliteBackend {
    async fn get_value(&self, store: &str, key: &str) -> Result<Option<i64>, BackendError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT value FROM sorted_values WHERE store = ? AND key = ?")
                .bind(store)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(value,)| value))
    }

    async fn set_value(&self, store: &str, key: &str, value: i64) -> Result<(), BackendError> {
        sqlx::query(
            r#"
            INSERT INTO sorted_values (store, key, value) VALUES (?, ?, ?)
            ON CONFLICT(store, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(store)
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sorted_page(
        &self,
        store: &str,
        query: &RangeQuery,
        cursor: PageCursor,
    ) -> Result<SortedPage, BackendError> {
        let sql = if query.ascending {
            r#"
            SELECT key, value FROM sorted_values
            WHERE store = ? AND value >= ? AND value <= ?
            ORDER BY value ASC, key ASC
            LIMIT ? OFFSET ?
            "#
        } else {
            r#"
            SELECT key, value FROM sorted_values
            WHERE store = ? AND value >= ? AND value <= ?
            ORDER BY value DESC, key ASC
            LIMIT ? OFFSET ?
            "#
        };
        let page_size = i64::from(query.page_size);
        let offset = i64::try_from(cursor.0).unwrap_or(i64::MAX);

        // One extra row tells whether another page exists.
        let mut rows: Vec<(String, i64)> = sqlx::query_as(sql)
            .bind(store)
            .bind(query.min)
            .bind(query.max)
            .bind(page_size + 1)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let has_more = rows.len() > query.page_size as usize;
        rows.truncate(query.page_size as usize);

        Ok(SortedPage {
            entries: rows
                .into_iter()
                .map(|(key, value)| SortedEntry { key, value })
                .collect(),
            next: has_more.then_some(PageCursor(cursor.0 + u64::from(query.page_size))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn never() -> impl Fn() -> bool + Send + Sync {
        || false
    }

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let backend = SqliteBackend::new_in_memory(TTL).await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(backend.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"documents"));
        assert!(names.contains(&"session_leases"));
        assert!(names.contains(&"sorted_values"));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let backend = SqliteBackend::new_in_memory(TTL).await.unwrap();
        let first = backend
            .start_session("Gold", "Player_1", "a", &never())
            .await
            .unwrap();
        assert!(first.is_some());

        let second = backend
            .start_session("Gold", "Player_1", "b", &never())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_write_then_reload_after_release() {
        let backend = SqliteBackend::new_in_memory(TTL).await.unwrap();
        let grant = backend
            .start_session("Gold", "Player_2", "a", &never())
            .await
            .unwrap()
            .unwrap();
        assert!(grant.data.is_none());

        backend
            .write(&grant.token, &doc(json!({ "coins": 50 })), &[2])
            .await
            .unwrap();
        backend.end_session(&grant.token).await.unwrap();

        let again = backend
            .start_session("Gold", "Player_2", "b", &never())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.data, Some(doc(json!({ "coins": 50 }))));
        assert_eq!(again.user_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_takeover_revokes_and_rejects_stale_writes() {
        let backend = SqliteBackend::new_in_memory(Duration::from_millis(20))
            .await
            .unwrap();
        let old = backend
            .start_session("Gold", "Player_3", "a", &never())
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let new = backend
            .start_session("Gold", "Player_3", "b", &never())
            .await
            .unwrap();
        assert!(new.is_some());
        assert!(*old.revoked.borrow());

        let stale = backend.write(&old.token, &Document::new(), &[]).await;
        assert!(matches!(stale, Err(BackendError::LeaseLost(_))));
    }

    #[tokio::test]
    async fn test_lease_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        let first = SqliteBackend::open(&path, TTL).await.unwrap();
        let grant = first
            .start_session("Gold", "Player_4", "process-a", &never())
            .await
            .unwrap();
        assert!(grant.is_some());
        first.pool().close().await;

        // A restarted process cannot take a lease that has not expired.
        let second = SqliteBackend::open(&path, TTL).await.unwrap();
        let denied = second
            .start_session("Gold", "Player_4", "process-b", &never())
            .await
            .unwrap();
        assert!(denied.is_none());
    }

    #[tokio::test]
    async fn test_renew_extends_lease_across_processes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let ttl = Duration::from_millis(200);
        let a = SqliteBackend::open(&path, ttl).await.unwrap();
        let b = SqliteBackend::open(&path, ttl).await.unwrap();

        let grant = a
            .start_session("Gold", "Player_5", "process-a", &never())
            .await
            .unwrap()
            .unwrap();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            a.renew(&grant.token).await.unwrap();
        }
        let denied = b
            .start_session("Gold", "Player_5", "process-b", &never())
            .await
            .unwrap();
        assert!(denied.is_none());
        assert!(!*grant.revoked.borrow());
    }

    #[tokio::test]
    async fn test_renew_after_takeover_revokes_locally() {
        let backend = SqliteBackend::new_in_memory(TTL).await.unwrap();
        let mut old = backend
            .start_session("Gold", "Player_6", "a", &never())
            .await
            .unwrap()
            .unwrap();

        // Another process took the row over behind our back.
        sqlx::query("UPDATE session_leases SET token = 'other' WHERE key = 'Player_6'")
            .execute(backend.pool())
            .await
            .unwrap();

        let renewed = backend.renew(&old.token).await;
        assert!(matches!(renewed, Err(BackendError::LeaseLost(_))));
        assert!(*old.revoked.borrow_and_update());
    }

    #[tokio::test]
    async fn test_released_holders_are_pruned() {
        let backend = SqliteBackend::new_in_memory(TTL).await.unwrap();
        let grant = backend
            .start_session("Gold", "Player_7", "a", &never())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backend.revokers().len(), 1);

        // The holder went away without ending its session.
        drop(grant);
        backend
            .start_session("Gold", "Player_8", "a", &never())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(backend.revokers().len(), 1);
    }

    #[tokio::test]
    async fn test_sorted_pages() {
        let backend = SqliteBackend::new_in_memory(TTL).await.unwrap();
        for (key, value) in [("a", 5), ("b", 9), ("c", 1), ("d", 9), ("e", -2)] {
            backend.set_value("Kills", key, value).await.unwrap();
        }
        backend.set_value("Kills", "c", 2).await.unwrap();
        assert_eq!(backend.get_value("Kills", "c").await.unwrap(), Some(2));
        assert_eq!(backend.get_value("Kills", "zz").await.unwrap(), None);

        let query = RangeQuery {
            ascending: true,
            page_size: 2,
            min: 0,
            max: 100,
        };
        let first = backend
            .sorted_page("Kills", &query, PageCursor::default())
            .await
            .unwrap();
        assert_eq!(
            first.entries,
            vec![
                SortedEntry { key: "c".into(), value: 2 },
                SortedEntry { key: "a".into(), value: 5 },
            ]
        );
        let second = backend
            .sorted_page("Kills", &query, first.next.unwrap())
            .await
            .unwrap();
        let keys: Vec<_> = second.entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["b", "d"]);
        assert!(second.next.is_none());
    }
}
