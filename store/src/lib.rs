//! Session-locked per-client persistence.
//!
//! `playerstore` keeps one durable record per connected client and per named
//! store. Two record kinds exist:
//!
//! - **Document** records are structured maps guarded by an exclusive,
//!   revocable session lease. A process must hold the lease before it writes,
//!   loaded documents are reconciled against a schema default, and the lease
//!   is released by a final save when the client leaves.
//! - **SortedNumeric** records hold a single integer per client and support
//!   paginated, ordered range queries (rankings).
//!
//! The moving parts, leaves first:
//!
//! | Module | Role |
//! |--------|------|
//! | [`retry`] | bounded fixed-delay retry around backend calls |
//! | [`sorted`] | façade over the sorted numeric key space |
//! | [`document`] | session-locked documents and reconciliation |
//! | [`record`] | kind-tagged handle dispatching to either store |
//! | [`autosave`] | per-client actor: periodic save plus final save on disconnect |
//! | [`backend`] | consumed backend traits plus in-memory and SQLite adapters |
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use playerstore::backend::MemoryBackend;
//! use playerstore::{ClientConnection, ClientId, DataStores, RecordKind, StoreConfig};
//!
//! # async fn run() -> Result<(), playerstore::StoreError> {
//! let stores = DataStores::new(Arc::new(MemoryBackend::new()), StoreConfig::default());
//! let schema = serde_json::json!({ "coins": 0, "level": 1 });
//! let gold = stores
//!     .get_data_store("Gold", RecordKind::Document, schema.as_object().cloned())
//!     .await?;
//!
//! let connection = ClientConnection::new(ClientId(9));
//! let record = gold.attach(&connection, Some(Duration::from_secs(30))).await?;
//! println!("{:?}", record.snapshot().await?);
//!
//! connection.disconnect();
//! record.wait_stopped().await;
//! # Ok(())
//! # }
//! ```

pub mod autosave;
pub mod backend;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod key;
pub mod record;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod sorted;

pub use autosave::{ClientRecord, SchedulerPhase};
pub use config::StoreConfig;
pub use connection::{ClientConnection, ConnectionState};
pub use document::{DocumentStore, Session, SessionEnd, SessionState};
pub use error::{BackendError, DenyReason, StoreError};
pub use key::{record_key, ClientId};
pub use record::{LoadedRecord, RecordHandle, RecordKind};
pub use registry::DataStores;
pub use retry::{RetryFailure, RetryPolicy};
pub use schema::{Document, RecordValue};
pub use sorted::{SortedEntry, SortedPages, SortedStore};
