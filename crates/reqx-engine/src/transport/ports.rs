//! Panel port registry: zero or one connected panel per tab.

use super::messages::EngineEvent;
use crate::host::TabId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Receiving half handed to a panel when it connects.
pub struct PanelPort {
    pub id: u64,
    pub tab_id: TabId,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

struct PortEntry {
    id: u64,
    sender: mpsc::UnboundedSender<EngineEvent>,
}

#[derive(Default)]
pub struct PanelRouter {
    ports: RwLock<HashMap<TabId, PortEntry>>,
    next_id: AtomicU64,
}

impl PanelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a panel for `tab_id`. A newer port replaces an older one.
    pub fn connect(&self, tab_id: TabId) -> PanelPort {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, events) = mpsc::unbounded_channel();
        self.ports.write().insert(tab_id, PortEntry { id, sender });
        info!("Panel connected for tab {}", tab_id);
        PanelPort { id, tab_id, events }
    }

    /// Drop the mapping only if `port_id` is still the current port for the tab.
    ///
    /// Returns true when the caller should run its disconnect cleanup. A stale
    /// port closing after a newer one connected returns false.
    pub fn disconnect(&self, tab_id: TabId, port_id: u64) -> bool {
        let mut ports = self.ports.write();
        match ports.get(&tab_id) {
            Some(entry) if entry.id == port_id => {
                ports.remove(&tab_id);
                info!("Panel disconnected for tab {}", tab_id);
                true
            }
            _ => {
                debug!(
                    "Ignoring disconnect of stale port {} for tab {}",
                    port_id, tab_id
                );
                false
            }
        }
    }

    /// Deliver an event to the tab's panel. No panel, no delivery.
    pub fn send(&self, tab_id: TabId, event: EngineEvent) {
        let failed = {
            let ports = self.ports.read();
            match ports.get(&tab_id) {
                Some(entry) => entry.sender.send(event).is_err().then_some(entry.id),
                None => None,
            }
        };

        if let Some(port_id) = failed {
            debug!("Panel receiver for tab {} is gone, evicting port", tab_id);
            let mut ports = self.ports.write();
            if ports.get(&tab_id).map(|e| e.id) == Some(port_id) {
                ports.remove(&tab_id);
            }
        }
    }

    pub fn is_connected(&self, tab_id: TabId) -> bool {
        self.ports.read().contains_key(&tab_id)
    }
}
