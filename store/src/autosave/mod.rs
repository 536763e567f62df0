//! Per-client autosave.
//!
//! [`attach`] loads a client's record and spawns one actor that owns it for
//! the rest of the connection. The actor serialises every save: periodic
//! ticks, explicit saves and the single final save triggered by disconnect,
//! [`ClientRecord::detach`] or dropping the last handle.
//!
//! ```text
//!  attach ──▶ Scheduled (interval) ─┐
//!        └──▶ Idle (no interval) ───┴─ disconnect / detach ──▶ final save ──▶ Stopped
//! ```

mod actor;
mod commands;
mod handle;
mod state;

use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::backend::Backend;
use crate::connection::ClientConnection;
use crate::error::StoreError;
use crate::record::RecordHandle;
use actor::run_attachment_actor;
pub use commands::SchedulerPhase;
pub use handle::ClientRecord;
use state::AttachmentState;

/// Load `handle`'s record for `connection` and start its autosave actor.
///
/// The load is cancelled once the client leaves. A denied session or a load
/// that exhausts its retries kicks the client with the reason. If the
/// backend later revokes the session, the client is kicked and the actor
/// stops without writing.
pub(crate) async fn attach<B: Backend>(
    handle: RecordHandle<B>,
    connection: &ClientConnection,
    interval: Option<Duration>,
) -> Result<ClientRecord, StoreError> {
    if interval.is_some_and(|period| period.is_zero()) {
        return Err(StoreError::usage("autosave interval must be positive"));
    }
    let client = connection.id();

    let watcher = connection.clone();
    let cancel = move || !watcher.is_connected();
    let mut record = match handle.load(client, &cancel).await {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(store = %handle.name(), %client, error = %e, "Attach failed");
            connection.kick(format!("{} could not be loaded: {}", handle.name(), e));
            return Err(e);
        }
    };

    let kicker = connection.clone();
    handle.register_end_observer(&mut record, move |end| {
        kicker.kick(format!("{} session for {} ended by the backend", end.store, end.key));
    });

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let (phase_tx, phase_rx) = watch::channel(match interval {
        Some(_) => SchedulerPhase::Scheduled,
        None => SchedulerPhase::Idle,
    });
    let store = handle.name().to_string();
    let kind = handle.kind();
    let state = AttachmentState::new(handle, record, client, phase_tx);

    tokio::spawn(run_attachment_actor(
        state,
        cmd_rx,
        connection.clone(),
        interval,
    ));

    Ok(ClientRecord::new(store, client, kind, cmd_tx, phase_rx))
}
