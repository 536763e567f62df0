use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval};
use tracing::Instrument;

use super::commands::*;
use super::state::AttachmentState;
use crate::backend::Backend;
use crate::connection::ClientConnection;

/// The attachment actor loop.
/// Owns the loaded record and working copy; every save goes through here.
pub(crate) async fn run_attachment_actor<B: Backend>(
    state: AttachmentState<B>,
    cmd_rx: mpsc::Receiver<AttachmentCommand>,
    connection: ClientConnection,
    interval: Option<Duration>,
) {
    let span = tracing::info_span!(
        "attachment",
        store = %state.handle.name(),
        client = %state.client
    );
    run_attachment_actor_inner(state, cmd_rx, connection, interval)
        .instrument(span)
        .await;
}

async fn run_attachment_actor_inner<B: Backend>(
    mut state: AttachmentState<B>,
    mut cmd_rx: mpsc::Receiver<AttachmentCommand>,
    connection: ClientConnection,
    interval: Option<Duration>,
) {
    let mut ticker = interval.map(|period| {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        ticker
    });
    tracing::info!(interval = ?interval, "Attachment actor started");

    // A disconnect is seen before any further command, however busy the
    // handles are.
    let (cause, detach_reply) = loop {
        tokio::select! {
            biased;

            _ = connection.closed() => break ("client disconnected", None),

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(AttachmentCommand::Detach { reply }) => break ("detached", Some(reply)),
                    None => break ("all handles dropped", None),
                    Some(cmd) => handle_command(&mut state, cmd, &connection).await,
                }
            }

            _ = next_tick(&mut ticker) => {
                let _ = state.save(&connection).await;
            }
        }
    };

    // New commands fail fast from here on.
    cmd_rx.close();
    let result = state.finish(cause).await;
    if let Some(reply) = detach_reply {
        let _ = reply.send(result);
    }

    // Queued detaches see the record stopped; anything else is rejected by
    // dropping its reply.
    while let Some(cmd) = cmd_rx.recv().await {
        if let AttachmentCommand::Detach { reply } = cmd {
            let _ = reply.send(Ok(()));
        }
    }
    tracing::info!("Attachment actor exited");
}

async fn handle_command<B: Backend>(
    state: &mut AttachmentState<B>,
    cmd: AttachmentCommand,
    connection: &ClientConnection,
) {
    match cmd {
        AttachmentCommand::Snapshot { reply } => {
            let _ = reply.send(state.working.clone());
        }
        AttachmentCommand::Update { patch, reply } => {
            let _ = reply.send(state.update(patch));
        }
        AttachmentCommand::SetNumber { value, reply } => {
            let _ = reply.send(state.set_number(value));
        }
        AttachmentCommand::SaveNow { reply } => {
            let result = state.save(connection).await;
            let _ = reply.send(result);
        }
        AttachmentCommand::Detach { .. } => unreachable!(),
    }
}

/// Next autosave tick; never resolves without a timer.
async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
