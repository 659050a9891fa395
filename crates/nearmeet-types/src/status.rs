//! Connection and presence states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Client connection state machine:
/// `Disconnected -> Connecting -> Connected -> Disconnected`, with
/// `Reconnecting` entered after a transport failure when a reconnect
/// policy is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// Listener state machine: `Stopped -> Starting -> Listening -> Stopped`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ts_rs::TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    #[default]
    Stopped,
    Starting,
    Listening,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
        assert_eq!(ServerState::default(), ServerState::Stopped);
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert!(ConnectionState::Connected.is_connected());
    }

    #[test]
    fn test_serialized_names() {
        let value = serde_json::to_value(ConnectionState::Reconnecting).expect("serialize");
        assert_eq!(value, "reconnecting");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
