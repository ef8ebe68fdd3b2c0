//! Command/event transport between the engine and its consumers.
//!
//! - `messages`: panel commands, engine events, page messages, log entries
//! - `ports`: the per-tab panel port registry

mod messages;
mod ports;

pub use messages::{
    EngineEvent, FeatureStatus, MatchType, NetworkEntry, PageMessage, PanelCommand,
};
pub use ports::{PanelPort, PanelRouter};
