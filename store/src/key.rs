use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace tag prefixed to every client key.
///
/// Changing it orphans every record saved under the old template.
pub const KEY_PREFIX: &str = "Player_";

/// Numeric identity of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backend key for a client, shared by both record kinds.
pub fn record_key(client: ClientId) -> String {
    format!("{}{}", KEY_PREFIX, client.0)
}

/// Inverse of [`record_key`]. Returns `None` for keys outside the template.
pub fn client_from_key(key: &str) -> Option<ClientId> {
    key.strip_prefix(KEY_PREFIX)?.parse().ok().map(ClientId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key_template() {
        assert_eq!(record_key(ClientId(9)), "Player_9");
        assert_eq!(record_key(ClientId(0)), "Player_0");
    }

    #[test]
    fn test_client_from_key() {
        assert_eq!(client_from_key("Player_1234"), Some(ClientId(1234)));
        assert_eq!(client_from_key("Player_"), None);
        assert_eq!(client_from_key("User_5"), None);
    }
}
