//! Per-tab session state.
//!
//! ## Module Structure
//!
//! - `registry`: `SessionRegistry`, the attachment state machine
//!   (`Unattached → Attaching → Attached`), rule sets and feature flags
//! - `overlay`: `OverlayRegistry`, on-page overlay visibility per tab

mod overlay;
mod registry;

pub use overlay::OverlayRegistry;
pub use registry::{AttachState, Feature, SessionRegistry, SessionSnapshot, TabSession};
