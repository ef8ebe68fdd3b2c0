//! Seams to the browser host.
//!
//! The engine never talks to the browser directly. Three traits cover what it
//! needs:
//!
//! - [`DebuggerHost`]: the debugging attachment and the `Fetch` domain used to
//!   resolve paused requests
//! - [`DeclarativeTable`]: the declarative rule layer (dynamic and session rules)
//! - [`TabMessenger`]: fire-and-forget messages to the page and the action badge
//!
//! [`RecordingHost`] implements all three in memory. The CLI dry run and the
//! test suites drive the engine through it.

mod recording;

use crate::fast_path::DeclarativeRule;
use crate::pipeline::Headers;
use crate::transport::PageMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use recording::{HostCall, RecordingHost, Resolution};

/// Browser tab identifier.
pub type TabId = i64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    #[error("Request {0} was already resolved or cancelled")]
    AlreadyResolved(String),
    #[error("Debugger is not attached to tab {0}")]
    NotAttached(TabId),
    #[error("Another debugger is already attached to tab {0}")]
    AlreadyAttached(TabId),
    #[error("Host rejected command: {0}")]
    Rejected(String),
    #[error("Host channel closed: {0}")]
    Transport(String),
}

impl HostError {
    /// The paused request no longer exists on the host side.
    pub fn is_already_resolved(&self) -> bool {
        match self {
            HostError::AlreadyResolved(_) => true,
            HostError::Rejected(msg) => msg.contains("Invalid InterceptionId"),
            _ => false,
        }
    }

    /// The attachment is already gone; detaching again is a no-op.
    pub fn is_already_detached(&self) -> bool {
        matches!(self, HostError::NotAttached(_))
    }
}

/// A network request held by the host until the engine resolves it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedRequest {
    pub request_id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Headers,
}

impl PausedRequest {
    pub fn new(request_id: impl Into<String>, method: &str, url: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            url: url.into(),
            method: method.to_string(),
            headers: Headers::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }
}

/// Events delivered by the debugging channel for an attached tab.
#[derive(Debug, Clone, PartialEq)]
pub enum DebuggerEvent {
    RequestPaused(PausedRequest),
    /// The host dropped the attachment (navigation, user dismissed the bar, ...)
    Detached { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum RequestStage {
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPattern {
    pub url_pattern: String,
    pub request_stage: RequestStage,
}

impl RequestPattern {
    /// Every request, paused before it is sent.
    pub fn all_requests() -> Self {
        Self {
            url_pattern: "*".to_string(),
            request_stage: RequestStage::Request,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ErrorReason {
    BlockedByClient,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueParams {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,
}

impl ContinueParams {
    /// Continue unmodified.
    pub fn unmodified(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            url: None,
            headers: None,
        }
    }

    pub fn is_unmodified(&self) -> bool {
        self.url.is_none() && self.headers.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillParams {
    pub request_id: String,
    pub response_code: u16,
    pub response_headers: Headers,
    /// Base64-encoded body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Toolbar badge for one tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadgeState {
    pub text: String,
    pub title: String,
    pub color: Option<String>,
}

impl BadgeState {
    pub const ACTIVE_COLOR: &'static str = "#F97316";

    pub fn for_active_features(count: usize) -> Self {
        if count > 0 {
            Self {
                text: count.to_string(),
                title: format!("ReqX - {count} active"),
                color: Some(Self::ACTIVE_COLOR.to_string()),
            }
        } else {
            Self::cleared()
        }
    }

    pub fn cleared() -> Self {
        Self {
            text: String::new(),
            title: "ReqX".to_string(),
            color: None,
        }
    }
}

/// The debugging attachment and the `Fetch` domain commands.
#[async_trait]
pub trait DebuggerHost: Send + Sync {
    async fn attach(&self, tab_id: TabId, protocol_version: &str) -> Result<(), HostError>;

    async fn detach(&self, tab_id: TabId) -> Result<(), HostError>;

    async fn enable_fetch(
        &self,
        tab_id: TabId,
        patterns: Vec<RequestPattern>,
    ) -> Result<(), HostError>;

    async fn continue_request(
        &self,
        tab_id: TabId,
        params: ContinueParams,
    ) -> Result<(), HostError>;

    async fn fail_request(
        &self,
        tab_id: TabId,
        request_id: &str,
        reason: ErrorReason,
    ) -> Result<(), HostError>;

    async fn fulfill_request(&self, tab_id: TabId, params: FulfillParams)
        -> Result<(), HostError>;
}

/// The browser's declarative rule layer.
#[async_trait]
pub trait DeclarativeTable: Send + Sync {
    /// Ids of all currently installed dynamic rules.
    async fn dynamic_rule_ids(&self) -> Result<Vec<u32>, HostError>;

    /// Remove then add, applied atomically by the host.
    async fn update_dynamic_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<DeclarativeRule>,
    ) -> Result<(), HostError>;

    async fn update_session_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<DeclarativeRule>,
    ) -> Result<(), HostError>;
}

/// Page-side notifier (content script) and toolbar badge.
pub trait TabMessenger: Send + Sync {
    /// Best effort: the page may not have a listener yet.
    fn send_to_tab(&self, tab_id: TabId, message: PageMessage) -> Result<(), HostError>;

    fn set_badge(&self, tab_id: TabId, badge: BadgeState);
}
