//! Typed front over the two store kinds.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::autosave::{self, ClientRecord};
use crate::backend::{Backend, CancelCheck};
use crate::connection::ClientConnection;
use crate::document::{DocumentStore, Session, SessionEnd};
use crate::error::StoreError;
use crate::key::{record_key, ClientId};
use crate::schema::RecordValue;
use crate::sorted::{SortedPages, SortedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum RecordKind {
    Document,
    SortedNumeric,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Document => write!(f, "document"),
            RecordKind::SortedNumeric => write!(f, "sorted"),
        }
    }
}

/// What a load produced, owned by the client's handling logic until the
/// client leaves.
#[derive(Debug)]
pub enum LoadedRecord {
    Document(Session),
    Number { key: String, value: i64 },
}

impl LoadedRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            LoadedRecord::Document(_) => RecordKind::Document,
            LoadedRecord::Number { .. } => RecordKind::SortedNumeric,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            LoadedRecord::Document(session) => session.key(),
            LoadedRecord::Number { key, .. } => key,
        }
    }
}

/// One named store of a fixed kind. Operations that do not apply to the
/// kind fail with [`StoreError::Usage`].
pub enum RecordHandle<B> {
    Document(Arc<DocumentStore<B>>),
    SortedNumeric(Arc<SortedStore<B>>),
}

impl<B> Clone for RecordHandle<B> {
    fn clone(&self) -> Self {
        match self {
            RecordHandle::Document(store) => RecordHandle::Document(store.clone()),
            RecordHandle::SortedNumeric(store) => RecordHandle::SortedNumeric(store.clone()),
        }
    }
}

impl<B: Backend> RecordHandle<B> {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordHandle::Document(_) => RecordKind::Document,
            RecordHandle::SortedNumeric(_) => RecordKind::SortedNumeric,
        }
    }

    pub fn is_kind(&self, kind: RecordKind) -> bool {
        self.kind() == kind
    }

    pub fn name(&self) -> &str {
        match self {
            RecordHandle::Document(store) => store.name(),
            RecordHandle::SortedNumeric(store) => store.name(),
        }
    }

    /// Start the client's session (documents) or read its value (sorted).
    pub async fn load(
        &self,
        client: ClientId,
        cancel: &CancelCheck,
    ) -> Result<LoadedRecord, StoreError> {
        let key = record_key(client);
        match self {
            RecordHandle::Document(store) => {
                let mut session = store.start_session(&key, cancel).await?;
                session.add_user_id(client.0);
                Ok(LoadedRecord::Document(session))
            }
            RecordHandle::SortedNumeric(store) => {
                let value = store.get(&key).await?;
                Ok(LoadedRecord::Number { key, value })
            }
        }
    }

    /// The client-visible projection of a loaded record.
    pub fn working(&self, record: &LoadedRecord) -> RecordValue {
        match record {
            LoadedRecord::Document(session) => RecordValue::Document(session.data().clone()),
            LoadedRecord::Number { value, .. } => RecordValue::Number(*value),
        }
    }

    /// Persist `value` for a loaded record. With `end_session` a document's
    /// session is flushed and closed in one write.
    pub async fn save(
        &self,
        record: &mut LoadedRecord,
        value: &RecordValue,
        end_session: bool,
    ) -> Result<(), StoreError> {
        match (self, record, value) {
            (
                RecordHandle::Document(store),
                LoadedRecord::Document(session),
                RecordValue::Document(doc),
            ) => {
                if end_session {
                    if session.is_active() {
                        session.stage(doc.clone());
                    }
                    store.end_session(session).await
                } else {
                    store.save(session, doc.clone()).await
                }
            }
            (
                RecordHandle::SortedNumeric(store),
                LoadedRecord::Number { key, value: stored },
                RecordValue::Number(n),
            ) => {
                store.set(key, *n).await?;
                *stored = *n;
                Ok(())
            }
            (handle, record, value) => Err(StoreError::usage(format!(
                "cannot save a {} value for a {} record through {} store {}",
                value.kind(),
                record.kind(),
                handle.kind(),
                handle.name()
            ))),
        }
    }

    /// Call `callback` if the backend ends the record's session. Sorted
    /// records hold no session, so nothing is registered.
    pub fn register_end_observer<F>(&self, record: &mut LoadedRecord, callback: F)
    where
        F: FnOnce(SessionEnd) + Send + 'static,
    {
        if let (RecordHandle::Document(store), LoadedRecord::Document(session)) = (self, record) {
            store.register_end_observer(session, callback);
        }
    }

    pub async fn sorted_range(
        &self,
        ascending: bool,
        page_size: u32,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Result<SortedPages<B>, StoreError> {
        match self {
            RecordHandle::SortedNumeric(store) => {
                store.sorted_range(ascending, page_size, min, max).await
            }
            RecordHandle::Document(store) => Err(StoreError::usage(format!(
                "{} is a document store and has no sorted range",
                store.name()
            ))),
        }
    }

    /// Load the record for `connection` and hand it to an autosave actor.
    ///
    /// A denied session or failed load kicks the connection with the reason.
    pub async fn attach(
        &self,
        connection: &ClientConnection,
        interval: Option<Duration>,
    ) -> Result<ClientRecord, StoreError> {
        autosave::attach(self.clone(), connection, interval).await
    }
}

impl<B> fmt::Debug for RecordHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordHandle::Document(_) => f.write_str("RecordHandle::Document"),
            RecordHandle::SortedNumeric(_) => f.write_str("RecordHandle::SortedNumeric"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::retry::RetryPolicy;
    use serde_json::json;

    fn handles(backend: &Arc<MemoryBackend>) -> (RecordHandle<MemoryBackend>, RecordHandle<MemoryBackend>) {
        let gold = DocumentStore::new(
            "Gold",
            json!({ "coins": 0, "level": 1 }).as_object().cloned().unwrap(),
            backend.clone(),
            "test",
            RetryPolicy::once(),
        );
        let kills = SortedStore::new("Kills", backend.clone(), RetryPolicy::once(), 0, i64::MAX);
        (
            RecordHandle::Document(Arc::new(gold)),
            RecordHandle::SortedNumeric(Arc::new(kills)),
        )
    }

    fn never() -> impl Fn() -> bool + Send + Sync {
        || false
    }

    #[tokio::test]
    async fn test_kind_tags() {
        let backend = Arc::new(MemoryBackend::new());
        let (gold, kills) = handles(&backend);
        assert!(gold.is_kind(RecordKind::Document));
        assert!(!gold.is_kind(RecordKind::SortedNumeric));
        assert!(kills.is_kind(RecordKind::SortedNumeric));
        assert_eq!(kills.name(), "Kills");
    }

    #[tokio::test]
    async fn test_document_load_and_final_save() {
        let backend = Arc::new(MemoryBackend::new());
        let (gold, _) = handles(&backend);

        let mut record = gold.load(ClientId(3), &never()).await.unwrap();
        assert_eq!(record.key(), "Player_3");
        let RecordValue::Document(mut doc) = gold.working(&record) else {
            panic!("document handle produced a number");
        };
        doc.insert("coins".into(), json!(40));

        gold.save(&mut record, &RecordValue::Document(doc), true)
            .await
            .unwrap();
        let stored = backend.document("Gold", "Player_3").unwrap();
        assert_eq!(stored["coins"], json!(40));
        assert_eq!(backend.user_ids("Gold", "Player_3"), vec![3]);
        assert!(backend.lease_owner("Gold", "Player_3").is_none());
    }

    #[tokio::test]
    async fn test_sorted_load_and_save() {
        let backend = Arc::new(MemoryBackend::new());
        let (_, kills) = handles(&backend);

        let mut record = kills.load(ClientId(9), &never()).await.unwrap();
        assert_eq!(kills.working(&record), RecordValue::Number(0));
        kills
            .save(&mut record, &RecordValue::Number(7), false)
            .await
            .unwrap();
        assert_eq!(kills.working(&record), RecordValue::Number(7));

        let pages = kills.sorted_range(false, 10, Some(0), None).await.unwrap();
        assert_eq!(pages.current_page()[0].key, "Player_9");
    }

    #[tokio::test]
    async fn test_wrong_kind_operations_fail_fast() {
        let backend = Arc::new(MemoryBackend::new());
        let (gold, kills) = handles(&backend);

        assert!(matches!(
            gold.sorted_range(true, 10, None, None).await,
            Err(StoreError::Usage(_))
        ));

        let mut number = kills.load(ClientId(1), &never()).await.unwrap();
        let wrong_value = kills
            .save(&mut number, &RecordValue::Document(Default::default()), false)
            .await;
        assert!(matches!(wrong_value, Err(StoreError::Usage(_))));

        let wrong_handle = gold.save(&mut number, &RecordValue::Number(1), false).await;
        assert!(matches!(wrong_handle, Err(StoreError::Usage(_))));
    }
}
