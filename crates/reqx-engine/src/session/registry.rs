//! SessionRegistry: per-tab debugging attachment and rule state.

use crate::config::{HeaderOverrideRule, InterceptRule, MockRule};
use crate::host::{DebuggerHost, RequestPattern, TabId};
use crate::metrics;
use crate::transport::{EngineEvent, FeatureStatus, PanelRouter};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Unattached,
    /// Attach in flight; a second attach request is a no-op
    Attaching,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    Intercept,
    Mock,
    HeaderOverride,
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Feature::Intercept => write!(f, "intercept"),
            Feature::Mock => write!(f, "mock"),
            Feature::HeaderOverride => write!(f, "header-override"),
        }
    }
}

/// Everything the engine knows about one tab.
#[derive(Debug, Clone)]
pub struct TabSession {
    pub tab_id: TabId,
    pub attach_state: AttachState,
    pub intercept_rules: Arc<Vec<InterceptRule>>,
    pub mock_rules: Arc<Vec<MockRule>>,
    pub header_override_rules: Arc<Vec<HeaderOverrideRule>>,
    pub intercept_enabled: bool,
    pub mock_enabled: bool,
    pub header_override_enabled: bool,
}

impl TabSession {
    fn new(tab_id: TabId) -> Self {
        Self {
            tab_id,
            attach_state: AttachState::Unattached,
            intercept_rules: Arc::new(Vec::new()),
            mock_rules: Arc::new(Vec::new()),
            header_override_rules: Arc::new(Vec::new()),
            intercept_enabled: false,
            mock_enabled: false,
            header_override_enabled: false,
        }
    }

    pub fn feature_status(&self) -> FeatureStatus {
        FeatureStatus {
            intercept: self.intercept_enabled,
            mock: self.mock_enabled,
            headers: self.header_override_enabled,
        }
    }

    fn set_flag(&mut self, feature: Feature, enabled: bool) {
        match feature {
            Feature::Intercept => self.intercept_enabled = enabled,
            Feature::Mock => self.mock_enabled = enabled,
            Feature::HeaderOverride => self.header_override_enabled = enabled,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            tab_id: self.tab_id,
            intercept_enabled: self.intercept_enabled,
            mock_enabled: self.mock_enabled,
            header_override_enabled: self.header_override_enabled,
            intercept_rules: Arc::clone(&self.intercept_rules),
            mock_rules: Arc::clone(&self.mock_rules),
            header_override_rules: Arc::clone(&self.header_override_rules),
        }
    }
}

/// Flags and rule handles captured when a pipeline run starts. Later syncs
/// swap the session's handles and leave this copy alone.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub tab_id: TabId,
    pub intercept_enabled: bool,
    pub mock_enabled: bool,
    pub header_override_enabled: bool,
    pub intercept_rules: Arc<Vec<InterceptRule>>,
    pub mock_rules: Arc<Vec<MockRule>>,
    pub header_override_rules: Arc<Vec<HeaderOverrideRule>>,
}

/// Manages the debugging attachment of every tab with engine state.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<TabId, TabSession>>,
    host: Arc<dyn DebuggerHost>,
    router: Arc<PanelRouter>,
    protocol_version: String,
}

impl SessionRegistry {
    pub fn new(
        host: Arc<dyn DebuggerHost>,
        router: Arc<PanelRouter>,
        protocol_version: impl Into<String>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            host,
            router,
            protocol_version: protocol_version.into(),
        }
    }

    /// Create the tab's session with every feature off if it does not exist.
    pub fn get_or_create(&self, tab_id: TabId) -> TabSession {
        self.sessions
            .write()
            .entry(tab_id)
            .or_insert_with(|| TabSession::new(tab_id))
            .clone()
    }

    pub fn contains(&self, tab_id: TabId) -> bool {
        self.sessions.read().contains_key(&tab_id)
    }

    pub fn snapshot(&self, tab_id: TabId) -> Option<SessionSnapshot> {
        self.sessions.read().get(&tab_id).map(TabSession::snapshot)
    }

    pub fn attach_state(&self, tab_id: TabId) -> AttachState {
        self.sessions
            .read()
            .get(&tab_id)
            .map(|s| s.attach_state)
            .unwrap_or(AttachState::Unattached)
    }

    /// Feature flags, all off for a tab without a session.
    pub fn feature_status(&self, tab_id: TabId) -> FeatureStatus {
        self.sessions
            .read()
            .get(&tab_id)
            .map(TabSession::feature_status)
            .unwrap_or_default()
    }

    pub fn update_intercept_rules(&self, tab_id: TabId, rules: Vec<InterceptRule>) {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(tab_id)
            .or_insert_with(|| TabSession::new(tab_id));
        debug!("Tab {}: {} intercept rules", tab_id, rules.len());
        session.intercept_rules = Arc::new(rules);
    }

    pub fn update_mock_rules(&self, tab_id: TabId, rules: Vec<MockRule>) {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(tab_id)
            .or_insert_with(|| TabSession::new(tab_id));
        debug!("Tab {}: {} mock rules", tab_id, rules.len());
        session.mock_rules = Arc::new(rules);
    }

    pub fn update_header_override_rules(&self, tab_id: TabId, rules: Vec<HeaderOverrideRule>) {
        let mut sessions = self.sessions.write();
        let session = sessions
            .entry(tab_id)
            .or_insert_with(|| TabSession::new(tab_id));
        debug!("Tab {}: {} header override rules", tab_id, rules.len());
        session.header_override_rules = Arc::new(rules);
    }

    /// Attach the debugger and enable request interception for the tab.
    ///
    /// No-op while attached or attaching. Returns whether the tab ended up
    /// attached. Failures are logged and leave the session unattached so the
    /// next toggle or navigation retries.
    ///
    /// An attach that lands after the tab was detached releases itself, then
    /// tries again if a feature was re-enabled in the meantime.
    pub async fn attach(&self, tab_id: TabId) -> bool {
        loop {
            {
                let mut sessions = self.sessions.write();
                let session = sessions
                    .entry(tab_id)
                    .or_insert_with(|| TabSession::new(tab_id));
                match session.attach_state {
                    AttachState::Attached => return true,
                    AttachState::Attaching => return false,
                    AttachState::Unattached => session.attach_state = AttachState::Attaching,
                }
            }

            let result = match self.host.attach(tab_id, &self.protocol_version).await {
                Ok(()) => {
                    let enabled = self
                        .host
                        .enable_fetch(tab_id, vec![RequestPattern::all_requests()])
                        .await;
                    if enabled.is_err() {
                        // Half-open attachment would block the next attach
                        self.release_attachment(tab_id).await;
                    }
                    enabled
                }
                Err(e) => Err(e),
            };

            let outcome = {
                let mut sessions = self.sessions.write();
                match sessions.get_mut(&tab_id) {
                    Some(session) if session.attach_state == AttachState::Attaching => {
                        session.attach_state = if result.is_ok() {
                            AttachState::Attached
                        } else {
                            AttachState::Unattached
                        };
                        Some(result.is_ok())
                    }
                    // Session was cleaned up or detached while the attach was in flight
                    _ => None,
                }
            };

            return match (outcome, result) {
                (Some(true), _) => {
                    info!("Debugger attached for tab {}", tab_id);
                    self.router.send(tab_id, EngineEvent::DebuggerAttached);
                    true
                }
                (Some(false), Err(e)) => {
                    error!("Failed to attach debugger to tab {}: {}", tab_id, e);
                    metrics::record_host_failure("attach");
                    false
                }
                (None, Ok(())) => {
                    debug!("Tab {} detached during attach, releasing attachment", tab_id);
                    self.release_attachment(tab_id).await;
                    if self.wants_attachment(tab_id) {
                        debug!("Tab {} re-enabled during attach, attaching again", tab_id);
                        continue;
                    }
                    false
                }
                _ => false,
            };
        }
    }

    /// Unattached with at least one feature on.
    fn wants_attachment(&self, tab_id: TabId) -> bool {
        self.sessions
            .read()
            .get(&tab_id)
            .map(|s| s.attach_state == AttachState::Unattached && s.feature_status().any())
            .unwrap_or(false)
    }

    async fn release_attachment(&self, tab_id: TabId) {
        if let Err(e) = self.host.detach(tab_id).await {
            debug!("Releasing attachment for tab {} failed: {}", tab_id, e);
        }
    }

    /// Drop any stale attachment and attach again.
    ///
    /// The host silently drops the attachment on navigation, so the session may
    /// still believe it is attached.
    pub async fn reattach(&self, tab_id: TabId) -> bool {
        {
            let mut sessions = self.sessions.write();
            let session = sessions
                .entry(tab_id)
                .or_insert_with(|| TabSession::new(tab_id));
            session.attach_state = AttachState::Unattached;
        }
        if let Err(e) = self.host.detach(tab_id).await {
            debug!("Stale detach for tab {}: {}", tab_id, e);
        }
        self.attach(tab_id).await
    }

    /// Release the attachment. Idempotent.
    pub async fn detach(&self, tab_id: TabId) {
        let previous = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(&tab_id) {
                Some(session) => {
                    std::mem::replace(&mut session.attach_state, AttachState::Unattached)
                }
                None => AttachState::Unattached,
            }
        };
        match previous {
            AttachState::Unattached => return,
            // The in-flight attach sees the state change and releases itself
            AttachState::Attaching => return,
            AttachState::Attached => {}
        }

        match self.host.detach(tab_id).await {
            Ok(()) => info!("Debugger detached from tab {}", tab_id),
            Err(e) if e.is_already_detached() => debug!("Tab {} already detached", tab_id),
            Err(e) => {
                error!("Failed to detach debugger from tab {}: {}", tab_id, e);
                metrics::record_host_failure("detach");
            }
        }
        self.router.send(tab_id, EngineEvent::DebuggerDetached);
    }

    /// The host dropped the attachment on its own.
    pub fn mark_detached(&self, tab_id: TabId) {
        let known = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(&tab_id) {
                Some(session) => {
                    session.attach_state = AttachState::Unattached;
                    true
                }
                None => false,
            }
        };
        if known {
            info!("Debugger for tab {} detached by host", tab_id);
            self.router.send(tab_id, EngineEvent::DebuggerDetached);
        }
    }

    /// Flip one feature flag. Enabling attaches; turning off the last active
    /// feature releases the attachment.
    pub async fn set_enabled(&self, tab_id: TabId, feature: Feature, enabled: bool) -> FeatureStatus {
        let status = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .entry(tab_id)
                .or_insert_with(|| TabSession::new(tab_id));
            session.set_flag(feature, enabled);
            session.feature_status()
        };
        info!("Tab {}: {} {}", tab_id, feature, if enabled { "enabled" } else { "disabled" });

        if enabled {
            self.attach(tab_id).await;
        } else if !status.any() {
            self.detach(tab_id).await;
        }
        status
    }

    /// Detach and forget the tab.
    pub async fn cleanup(&self, tab_id: TabId) {
        self.detach(tab_id).await;
        if self.sessions.write().remove(&tab_id).is_some() {
            debug!("Session for tab {} removed", tab_id);
        }
    }

    /// Intercept rules of every tab with intercept enabled, first occurrence
    /// of each rule id kept, in ascending tab order.
    pub fn active_intercept_rules(&self) -> Vec<InterceptRule> {
        let sessions = self.sessions.read();
        let mut tabs: Vec<&TabSession> = sessions
            .values()
            .filter(|s| s.intercept_enabled)
            .collect();
        tabs.sort_by_key(|s| s.tab_id);

        let mut seen = std::collections::HashSet::new();
        tabs.iter()
            .flat_map(|s| s.intercept_rules.iter())
            .filter(|r| seen.insert(r.id.clone()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{
        ContinueParams, ErrorReason, FulfillParams, HostCall, HostError, RecordingHost,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Notify;

    /// Holds the first attach open after the host accepted it, until released.
    #[derive(Default)]
    struct SlowAttachHost {
        inner: RecordingHost,
        attach_done: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DebuggerHost for SlowAttachHost {
        async fn attach(&self, tab_id: TabId, protocol_version: &str) -> Result<(), HostError> {
            let result = self.inner.attach(tab_id, protocol_version).await;
            if !self.attach_done.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            result
        }

        async fn detach(&self, tab_id: TabId) -> Result<(), HostError> {
            self.inner.detach(tab_id).await
        }

        async fn enable_fetch(
            &self,
            tab_id: TabId,
            patterns: Vec<RequestPattern>,
        ) -> Result<(), HostError> {
            self.inner.enable_fetch(tab_id, patterns).await
        }

        async fn continue_request(
            &self,
            tab_id: TabId,
            params: ContinueParams,
        ) -> Result<(), HostError> {
            self.inner.continue_request(tab_id, params).await
        }

        async fn fail_request(
            &self,
            tab_id: TabId,
            request_id: &str,
            reason: ErrorReason,
        ) -> Result<(), HostError> {
            self.inner.fail_request(tab_id, request_id, reason).await
        }

        async fn fulfill_request(
            &self,
            tab_id: TabId,
            params: FulfillParams,
        ) -> Result<(), HostError> {
            self.inner.fulfill_request(tab_id, params).await
        }
    }

    fn registry() -> (Arc<RecordingHost>, Arc<PanelRouter>, SessionRegistry) {
        let host = Arc::new(RecordingHost::new());
        let router = Arc::new(PanelRouter::new());
        let registry = SessionRegistry::new(host.clone(), router.clone(), "1.3");
        (host, router, registry)
    }

    #[test]
    fn test_new_session_has_everything_off() {
        let (_, _, registry) = registry();
        let session = registry.get_or_create(1);
        assert_eq!(session.attach_state, AttachState::Unattached);
        assert!(!session.feature_status().any());
        assert!(session.intercept_rules.is_empty());
    }

    #[tokio::test]
    async fn test_attach_enables_fetch_and_notifies_panel() {
        let (host, router, registry) = registry();
        let mut port = router.connect(1);

        assert!(registry.attach(1).await);
        assert_eq!(registry.attach_state(1), AttachState::Attached);
        assert!(host.is_attached(1));
        assert!(host
            .calls()
            .contains(&HostCall::EnableFetch(1, vec![RequestPattern::all_requests()])));
        assert_eq!(port.events.recv().await, Some(EngineEvent::DebuggerAttached));

        // Second attach is a no-op
        assert!(registry.attach(1).await);
        assert_eq!(host.count_calls(|c| matches!(c, HostCall::Attach(1))), 1);
    }

    #[tokio::test]
    async fn test_attach_failure_reverts_to_unattached() {
        let (host, _, registry) = registry();
        host.fail_attach(Some("Another debugger is already attached"));

        assert!(!registry.attach(1).await);
        assert_eq!(registry.attach_state(1), AttachState::Unattached);

        host.fail_attach(None);
        assert!(registry.attach(1).await);
    }

    #[tokio::test]
    async fn test_detach_is_idempotent() {
        let (host, router, registry) = registry();
        registry.attach(1).await;
        let mut port = router.connect(1);

        registry.detach(1).await;
        registry.detach(1).await;
        assert!(!host.is_attached(1));
        assert_eq!(port.events.recv().await, Some(EngineEvent::DebuggerDetached));
        assert!(port.events.try_recv().is_err());
        assert_eq!(host.count_calls(|c| matches!(c, HostCall::Detach(1))), 1);
    }

    #[tokio::test]
    async fn test_reattach_after_host_dropped_attachment() {
        let (host, _, registry) = registry();
        registry.attach(1).await;

        host.drop_attachment(1);
        assert_eq!(registry.attach_state(1), AttachState::Attached);

        assert!(registry.reattach(1).await);
        assert!(host.is_attached(1));
        assert_eq!(host.count_calls(|c| matches!(c, HostCall::Attach(1))), 2);
    }

    #[tokio::test]
    async fn test_disabling_last_feature_detaches() {
        let (host, _, registry) = registry();

        registry.set_enabled(1, Feature::Mock, true).await;
        registry.set_enabled(1, Feature::Intercept, true).await;
        assert!(host.is_attached(1));

        let status = registry.set_enabled(1, Feature::Mock, false).await;
        assert!(status.intercept && !status.mock);
        assert!(host.is_attached(1));

        let status = registry.set_enabled(1, Feature::Intercept, false).await;
        assert!(!status.any());
        assert!(!host.is_attached(1));
        assert_eq!(registry.attach_state(1), AttachState::Unattached);
    }

    #[tokio::test]
    async fn test_reenable_during_attach_ends_attached() {
        let host = Arc::new(SlowAttachHost::default());
        let registry = Arc::new(SessionRegistry::new(
            host.clone(),
            Arc::new(PanelRouter::new()),
            "1.3",
        ));

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.set_enabled(1, Feature::Mock, true).await }
        });
        host.entered.notified().await;

        // Off then on again while the first attach is still in flight. The
        // host still holds the first attachment, so this attach fails.
        registry.set_enabled(1, Feature::Mock, false).await;
        registry.set_enabled(1, Feature::Mock, true).await;
        assert_eq!(registry.attach_state(1), AttachState::Unattached);

        host.release.notify_one();
        first.await.unwrap();

        assert_eq!(registry.attach_state(1), AttachState::Attached);
        assert!(host.inner.is_attached(1));
    }

    #[tokio::test]
    async fn test_disable_during_attach_releases_attachment() {
        let host = Arc::new(SlowAttachHost::default());
        let registry = Arc::new(SessionRegistry::new(
            host.clone(),
            Arc::new(PanelRouter::new()),
            "1.3",
        ));

        let first = tokio::spawn({
            let registry = registry.clone();
            async move { registry.set_enabled(1, Feature::Mock, true).await }
        });
        host.entered.notified().await;
        registry.set_enabled(1, Feature::Mock, false).await;

        host.release.notify_one();
        first.await.unwrap();

        assert_eq!(registry.attach_state(1), AttachState::Unattached);
        assert!(!host.inner.is_attached(1));
    }

    #[tokio::test]
    async fn test_mark_detached() {
        let (_, router, registry) = registry();
        registry.attach(1).await;
        let mut port = router.connect(1);

        registry.mark_detached(1);
        assert_eq!(registry.attach_state(1), AttachState::Unattached);
        assert_eq!(port.events.recv().await, Some(EngineEvent::DebuggerDetached));

        // Unknown tab: nothing to report
        registry.mark_detached(99);
        assert!(!registry.contains(99));
    }

    #[tokio::test]
    async fn test_cleanup_removes_session() {
        let (host, _, registry) = registry();
        registry.set_enabled(1, Feature::HeaderOverride, true).await;
        registry.cleanup(1).await;
        assert!(!registry.contains(1));
        assert!(!host.is_attached(1));
    }

    #[test]
    fn test_snapshot_keeps_captured_rules() {
        use crate::config::{InterceptAction, MatchOperator, MatchSpec};

        let (_, _, registry) = registry();
        let rule = InterceptRule::new(
            "r1",
            MatchSpec::new(MatchOperator::Contains, "a"),
            InterceptAction::block(),
        );
        registry.update_intercept_rules(1, vec![rule]);
        let snapshot = registry.snapshot(1).unwrap();

        registry.update_intercept_rules(1, Vec::new());
        assert_eq!(snapshot.intercept_rules.len(), 1);
        assert!(registry.snapshot(1).unwrap().intercept_rules.is_empty());
    }
}
