//! Network connectivity as seen by the host.

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    None,
    Wifi,
    Cellular,
    Ethernet,
    Unknown,
}

/// Snapshot of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityState {
    pub connected: bool,
    pub connection_type: ConnectionType,
    /// Whether the internet is reachable, when the host knows
    pub reachable: Option<bool>,
}

impl ConnectivityState {
    pub fn online() -> Self {
        Self {
            connected: true,
            connection_type: ConnectionType::Unknown,
            reachable: Some(true),
        }
    }

    pub fn offline() -> Self {
        Self {
            connected: false,
            connection_type: ConnectionType::None,
            reachable: Some(false),
        }
    }

    /// Connected, and not known to be unreachable.
    pub fn is_online(&self) -> bool {
        self.connected && self.reachable != Some(false)
    }
}

/// Source of connectivity state and transitions.
pub trait ConnectivityProvider: Send + Sync + fmt::Debug {
    fn current(&self) -> ConnectivityState;

    /// Receiver that sees every state change from now on.
    fn subscribe(&self) -> watch::Receiver<ConnectivityState>;
}

/// Connectivity driven by explicit calls from the host (or a test).
#[derive(Debug)]
pub struct ManualConnectivity {
    sender: watch::Sender<ConnectivityState>,
}

impl ManualConnectivity {
    pub fn new(initial: ConnectivityState) -> Self {
        let (sender, _receiver) = watch::channel(initial);
        Self { sender }
    }

    pub fn online() -> Self {
        Self::new(ConnectivityState::online())
    }

    pub fn offline() -> Self {
        Self::new(ConnectivityState::offline())
    }

    pub fn set(&self, state: ConnectivityState) {
        let previous = self.sender.send_replace(state);
        if previous != state {
            tracing::debug!(
                connected = state.connected,
                reachable = ?state.reachable,
                "Connectivity changed"
            );
        }
    }

    pub fn set_online(&self, online: bool) {
        self.set(if online {
            ConnectivityState::online()
        } else {
            ConnectivityState::offline()
        });
    }
}

impl ConnectivityProvider for ManualConnectivity {
    fn current(&self) -> ConnectivityState {
        *self.sender.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_counts_as_offline() {
        let state = ConnectivityState {
            connected: true,
            connection_type: ConnectionType::Wifi,
            reachable: Some(false),
        };
        assert!(!state.is_online());

        let unknown = ConnectivityState {
            reachable: None,
            ..state
        };
        assert!(unknown.is_online());
    }

    #[tokio::test]
    async fn subscribers_see_transitions() {
        let connectivity = ManualConnectivity::offline();
        let mut rx = connectivity.subscribe();

        connectivity.set_online(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().is_online());
        assert!(connectivity.current().is_online());
    }
}
