//! Liveness signal for one connected client.

use std::sync::Arc;

use tokio::sync::watch;

use crate::key::ClientId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// `reason` is set when the server dropped the client rather than the
    /// client leaving on its own.
    Disconnected { reason: Option<String> },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Cloneable membership signal for a connected client.
///
/// The transition to `Disconnected` happens once; later calls keep the
/// first reason.
#[derive(Clone)]
pub struct ClientConnection {
    id: ClientId,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl ClientConnection {
    pub fn new(id: ClientId) -> Self {
        let (tx, _) = watch::channel(ConnectionState::Connected);
        Self {
            id,
            state: Arc::new(tx),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    /// The client left.
    pub fn disconnect(&self) -> bool {
        self.transition(None)
    }

    /// The server drops the client with an explanatory reason.
    pub fn kick(&self, reason: impl Into<String>) -> bool {
        self.transition(Some(reason.into()))
    }

    /// Resolves once the client is no longer connected.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|state| !state.is_connected()).await;
    }

    fn transition(&self, reason: Option<String>) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_connected() {
                *state = ConnectionState::Disconnected {
                    reason: reason.clone(),
                };
                true
            } else {
                false
            }
        });
        if changed {
            match &reason {
                Some(reason) => tracing::info!(client = %self.id, %reason, "Client dropped"),
                None => tracing::debug!(client = %self.id, "Client disconnected"),
            }
        }
        changed
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_first_reason_wins() {
        let conn = ClientConnection::new(ClientId(1));
        assert!(conn.is_connected());
        assert!(conn.kick("session lost"));
        assert!(!conn.kick("second"));
        assert!(!conn.disconnect());
        assert_eq!(
            conn.state(),
            ConnectionState::Disconnected {
                reason: Some("session lost".into())
            }
        );
    }

    #[tokio::test]
    async fn test_closed_resolves_on_disconnect() {
        let conn = ClientConnection::new(ClientId(2));
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.closed().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        conn.disconnect();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_resolves_immediately_when_already_gone() {
        let conn = ClientConnection::new(ClientId(3));
        conn.disconnect();
        tokio::time::timeout(Duration::from_millis(100), conn.closed())
            .await
            .unwrap();
    }
}
