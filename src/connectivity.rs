//! Connectivity Monitor - explicit online/offline event source
//!
//! The device engine subscribes to link transitions instead of polling a
//! flag, which keeps its suspension points explicit and lets tests inject
//! synthetic transitions.

use tokio::sync::watch;
use tracing::info;

/// Link state reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Online,
    Offline,
}

impl LinkState {
    pub fn is_online(&self) -> bool {
        matches!(self, LinkState::Online)
    }
}

/// Broadcasts link transitions to subscribers over a watch channel
pub struct ConnectivityMonitor {
    tx: watch::Sender<LinkState>,
}

impl ConnectivityMonitor {
    /// Create a monitor in the given initial state
    pub fn new(initial: LinkState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Subscribe to link transitions
    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.tx.subscribe()
    }

    /// Current state
    pub fn state(&self) -> LinkState {
        *self.tx.borrow()
    }

    /// Report that connectivity was restored
    pub fn set_online(&self) {
        if self.tx.send_replace(LinkState::Online) == LinkState::Offline {
            info!("Connectivity restored");
        }
    }

    /// Report that connectivity was lost
    pub fn set_offline(&self) {
        if self.tx.send_replace(LinkState::Offline) == LinkState::Online {
            info!("Connectivity lost");
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(LinkState::Offline)
    }
}
