use tokio::sync::watch;

use super::commands::SchedulerPhase;
use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::error::StoreError;
use crate::key::ClientId;
use crate::record::{LoadedRecord, RecordHandle};
use crate::schema::{self, Document, RecordValue};

/// Everything one attachment owns. Only the actor touches it.
pub(crate) struct AttachmentState<B> {
    pub handle: RecordHandle<B>,
    pub record: LoadedRecord,
    pub working: RecordValue,
    pub client: ClientId,
    phase_tx: watch::Sender<SchedulerPhase>,
    finished: bool,
}

impl<B: Backend> AttachmentState<B> {
    pub fn new(
        handle: RecordHandle<B>,
        record: LoadedRecord,
        client: ClientId,
        phase_tx: watch::Sender<SchedulerPhase>,
    ) -> Self {
        let working = handle.working(&record);
        Self {
            handle,
            record,
            working,
            client,
            phase_tx,
            finished: false,
        }
    }

    pub fn set_phase(&self, phase: SchedulerPhase) {
        self.phase_tx.send_replace(phase);
    }

    pub fn update(&mut self, patch: Document) -> Result<RecordValue, StoreError> {
        match &mut self.working {
            RecordValue::Document(doc) => {
                schema::merge_patch(doc, patch);
                Ok(self.working.clone())
            }
            RecordValue::Number(_) => Err(StoreError::usage(format!(
                "{} holds a number; use set_number",
                self.handle.name()
            ))),
        }
    }

    pub fn set_number(&mut self, value: i64) -> Result<(), StoreError> {
        match &mut self.working {
            RecordValue::Number(n) => {
                *n = value;
                Ok(())
            }
            RecordValue::Document(_) => Err(StoreError::usage(format!(
                "{} holds a document; use update",
                self.handle.name()
            ))),
        }
    }

    /// Non-final save. A client-fatal failure drops the client; anything else
    /// is left for the next tick.
    pub async fn save(&mut self, connection: &ClientConnection) -> Result<(), StoreError> {
        let result = self
            .handle
            .save(&mut self.record, &self.working, false)
            .await;
        match &result {
            Ok(()) => tracing::debug!("Working copy saved"),
            Err(e) if e.is_client_fatal() => {
                tracing::warn!(error = %e, "Save hit a lost session");
                connection.kick(e.to_string());
            }
            Err(e) => tracing::warn!(error = %e, "Save failed; client kept"),
        }
        result
    }

    /// The final save. Runs once; later calls return `Ok`.
    pub async fn finish(&mut self, cause: &str) -> Result<(), StoreError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let result = self
            .handle
            .save(&mut self.record, &self.working, true)
            .await;
        match &result {
            Ok(()) => tracing::info!(cause, "Final save complete"),
            Err(StoreError::ForcedSessionEnd { .. }) => {
                tracing::warn!(cause, "Session already ended by the backend; final save skipped")
            }
            Err(e) => {
                tracing::error!(cause, error = %e, "Final save failed; unsaved changes are lost")
            }
        }
        self.set_phase(SchedulerPhase::Stopped);
        result
    }
}
