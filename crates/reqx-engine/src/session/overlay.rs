//! Per-tab overlay visibility.
//!
//! Kept apart from the sessions: a panel disconnect tears the session down
//! but the user's overlay choice survives until the tab closes.

use crate::host::TabId;
use parking_lot::RwLock;
use std::collections::HashMap;

pub struct OverlayRegistry {
    state: RwLock<HashMap<TabId, bool>>,
    default_enabled: bool,
}

impl OverlayRegistry {
    pub fn new(default_enabled: bool) -> Self {
        Self {
            state: RwLock::new(HashMap::new()),
            default_enabled,
        }
    }

    pub fn is_enabled(&self, tab_id: TabId) -> bool {
        self.state
            .read()
            .get(&tab_id)
            .copied()
            .unwrap_or(self.default_enabled)
    }

    pub fn set_enabled(&self, tab_id: TabId, enabled: bool) {
        self.state.write().insert(tab_id, enabled);
    }

    pub fn remove(&self, tab_id: TabId) {
        self.state.write().remove(&tab_id);
    }
}

impl Default for OverlayRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}
