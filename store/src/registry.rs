//! Named record handles over one shared backend.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::Backend;
use crate::config::StoreConfig;
use crate::document::DocumentStore;
use crate::error::StoreError;
use crate::record::{RecordHandle, RecordKind};
use crate::schema::Document;
use crate::sorted::SortedStore;

/// Creates and caches one [`RecordHandle`] per store name.
///
/// Every document store created here shares this registry's lease owner id,
/// so the backend sees one process.
pub struct DataStores<B> {
    backend: Arc<B>,
    config: StoreConfig,
    owner: String,
    handles: RwLock<HashMap<String, RecordHandle<B>>>,
}

impl<B: Backend> DataStores<B> {
    pub fn new(backend: Arc<B>, config: StoreConfig) -> Self {
        Self {
            backend,
            config,
            owner: Uuid::new_v4().to_string(),
            handles: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Lease owner id reported to the backend.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The handle for `name`, created on first use.
    ///
    /// Asking again for an existing name returns the cached handle; a
    /// different kind is a usage error, as is a schema default for a sorted
    /// store.
    pub async fn get_data_store(
        &self,
        name: &str,
        kind: RecordKind,
        schema_default: Option<Document>,
    ) -> Result<RecordHandle<B>, StoreError> {
        if name.is_empty() {
            return Err(StoreError::usage("store name must not be empty"));
        }
        if kind == RecordKind::SortedNumeric && schema_default.is_some() {
            return Err(StoreError::usage(format!(
                "{} is a sorted store and takes no schema default",
                name
            )));
        }

        if let Some(existing) = self.handles.read().await.get(name) {
            return self.reuse(name, existing, kind);
        }

        let mut handles = self.handles.write().await;
        if let Some(existing) = handles.get(name) {
            return self.reuse(name, existing, kind);
        }

        let handle = match kind {
            RecordKind::Document => RecordHandle::Document(Arc::new(DocumentStore::new(
                name,
                schema_default.unwrap_or_default(),
                self.backend.clone(),
                self.owner.clone(),
                self.config.session_start,
            ))),
            RecordKind::SortedNumeric => RecordHandle::SortedNumeric(Arc::new(SortedStore::new(
                name,
                self.backend.clone(),
                self.config.retry,
                self.config.sorted_min,
                self.config.sorted_max,
            ))),
        };
        handles.insert(name.to_string(), handle.clone());
        tracing::info!(store = name, %kind, "Data store created");
        Ok(handle)
    }

    /// Names of every store created so far, sorted.
    pub async fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn reuse(
        &self,
        name: &str,
        existing: &RecordHandle<B>,
        kind: RecordKind,
    ) -> Result<RecordHandle<B>, StoreError> {
        if !existing.is_kind(kind) {
            return Err(StoreError::usage(format!(
                "{} already exists as a {} store, not {}",
                name,
                existing.kind(),
                kind
            )));
        }
        Ok(existing.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::key::ClientId;
    use serde_json::json;

    fn stores() -> DataStores<MemoryBackend> {
        DataStores::new(Arc::new(MemoryBackend::new()), StoreConfig::default())
    }

    #[tokio::test]
    async fn test_handles_are_cached_per_name() {
        let stores = stores();
        let schema = json!({ "coins": 0 }).as_object().cloned();
        let first = stores
            .get_data_store("Gold", RecordKind::Document, schema)
            .await
            .unwrap();
        let again = stores
            .get_data_store("Gold", RecordKind::Document, None)
            .await
            .unwrap();

        match (first, again) {
            (RecordHandle::Document(a), RecordHandle::Document(b)) => {
                assert!(Arc::ptr_eq(&a, &b));
                assert_eq!(b.template()["coins"], json!(0));
            }
            other => panic!("expected document handles, got {:?}", other),
        }
        assert_eq!(stores.store_names().await, vec!["Gold".to_string()]);
    }

    #[tokio::test]
    async fn test_document_leases_carry_registry_owner() {
        let stores = stores();
        let other = DataStores::new(stores.backend().clone(), StoreConfig::default());
        assert_ne!(stores.owner(), other.owner());

        let gold = stores
            .get_data_store("Gold", RecordKind::Document, None)
            .await
            .unwrap();
        let mut record = gold.load(ClientId(5), &|| false).await.unwrap();
        assert_eq!(
            stores.backend().lease_owner("Gold", "Player_5").as_deref(),
            Some(stores.owner())
        );

        let value = gold.working(&record);
        gold.save(&mut record, &value, true).await.unwrap();
        assert!(stores.backend().lease_owner("Gold", "Player_5").is_none());
    }

    #[tokio::test]
    async fn test_kind_conflict_is_usage_error() {
        let stores = stores();
        stores
            .get_data_store("Kills", RecordKind::SortedNumeric, None)
            .await
            .unwrap();
        let conflict = stores
            .get_data_store("Kills", RecordKind::Document, None)
            .await;
        assert!(matches!(conflict, Err(StoreError::Usage(_))));
    }

    #[tokio::test]
    async fn test_sorted_store_rejects_schema() {
        let stores = stores();
        let result = stores
            .get_data_store("Kills", RecordKind::SortedNumeric, Some(Document::new()))
            .await;
        assert!(matches!(result, Err(StoreError::Usage(_))));
        assert!(stores.store_names().await.is_empty());
    }
}
