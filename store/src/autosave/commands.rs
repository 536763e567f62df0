use tokio::sync::oneshot;

use crate::error::StoreError;
use crate::schema::{Document, RecordValue};

/// Lifecycle of an attachment's save loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// No timer; the caller saves explicitly.
    Idle,
    /// Periodic saves are running.
    Scheduled,
    /// The final save ran; nothing else will be written.
    Stopped,
}

/// Commands sent to the attachment actor. Each embeds a oneshot for the reply.
pub(crate) enum AttachmentCommand {
    Snapshot {
        reply: oneshot::Sender<RecordValue>,
    },
    Update {
        patch: Document,
        reply: oneshot::Sender<Result<RecordValue, StoreError>>,
    },
    SetNumber {
        value: i64,
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    SaveNow {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
    Detach {
        reply: oneshot::Sender<Result<(), StoreError>>,
    },
}
