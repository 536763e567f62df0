use tokio::sync::{mpsc, oneshot, watch};

use super::commands::*;
use crate::error::StoreError;
use crate::key::ClientId;
use crate::record::RecordKind;
use crate::schema::{Document, RecordValue};

/// Cheap, cloneable handle to one client's attached record.
///
/// Dropping every clone detaches the record the same way [`detach`] does.
///
/// [`detach`]: ClientRecord::detach
#[derive(Clone)]
pub struct ClientRecord {
    store: String,
    client: ClientId,
    kind: RecordKind,
    cmd_tx: mpsc::Sender<AttachmentCommand>,
    phase: watch::Receiver<SchedulerPhase>,
}

impl ClientRecord {
    pub(crate) fn new(
        store: String,
        client: ClientId,
        kind: RecordKind,
        cmd_tx: mpsc::Sender<AttachmentCommand>,
        phase: watch::Receiver<SchedulerPhase>,
    ) -> Self {
        Self {
            store,
            client,
            kind,
            cmd_tx,
            phase,
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.borrow()
    }

    /// Current working representation.
    pub async fn snapshot(&self) -> Result<RecordValue, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(AttachmentCommand::Snapshot { reply: tx }).await?;
        rx.await.map_err(|_| self.detached())
    }

    /// Merge `patch` into a document's working copy. Written by the next save.
    pub async fn update(&self, patch: Document) -> Result<RecordValue, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(AttachmentCommand::Update { patch, reply: tx })
            .await?;
        rx.await.map_err(|_| self.detached())?
    }

    /// Replace a sorted record's working value. Written by the next save.
    pub async fn set_number(&self, value: i64) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(AttachmentCommand::SetNumber { value, reply: tx })
            .await?;
        rx.await.map_err(|_| self.detached())?
    }

    /// Save the working representation now, without ending the session.
    pub async fn save(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(AttachmentCommand::SaveNow { reply: tx }).await?;
        rx.await.map_err(|_| self.detached())?
    }

    /// Run the final save and stop the actor. Returns `Ok` when the record
    /// already stopped for another reason.
    pub async fn detach(&self) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(AttachmentCommand::Detach { reply: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Resolves once the final save has run.
    pub async fn wait_stopped(&self) {
        let mut phase = self.phase.clone();
        let _ = phase
            .wait_for(|phase| *phase == SchedulerPhase::Stopped)
            .await;
    }

    async fn send(&self, cmd: AttachmentCommand) -> Result<(), StoreError> {
        self.cmd_tx.send(cmd).await.map_err(|_| self.detached())
    }

    fn detached(&self) -> StoreError {
        StoreError::usage(format!(
            "{} record for client {} is detached",
            self.store, self.client
        ))
    }
}

impl std::fmt::Debug for ClientRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRecord")
            .field("store", &self.store)
            .field("client", &self.client)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish()
    }
}
