//! Background controller.
//!
//! Routes panel commands, tab lifecycle notifications and debugger events to
//! the session registry, the interception pipeline and the declarative fast
//! path, and keeps the toolbar badge and the page's status view in step.

use crate::config::EngineConfig;
use crate::cookie::CookieInjector;
use crate::error::EngineError;
use crate::fast_path::FastPathCompiler;
use crate::host::{
    BadgeState, DebuggerEvent, DebuggerHost, DeclarativeTable, PausedRequest, RecordingHost,
    TabId, TabMessenger,
};
use crate::pipeline::Pipeline;
use crate::session::{Feature, OverlayRegistry, SessionRegistry};
use crate::transport::{FeatureStatus, PageMessage, PanelCommand, PanelPort, PanelRouter};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Engine {
    config: EngineConfig,
    table: Arc<dyn DeclarativeTable>,
    messenger: Arc<dyn TabMessenger>,
    router: Arc<PanelRouter>,
    sessions: Arc<SessionRegistry>,
    overlay: Arc<OverlayRegistry>,
    pipeline: Arc<Pipeline>,
    fast_path: FastPathCompiler,
    cookies: CookieInjector,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn DebuggerHost>,
        table: Arc<dyn DeclarativeTable>,
        messenger: Arc<dyn TabMessenger>,
    ) -> Self {
        let router = Arc::new(PanelRouter::new());
        let sessions = Arc::new(SessionRegistry::new(
            host.clone(),
            router.clone(),
            config.debugger.protocol_version.clone(),
        ));
        let overlay = Arc::new(OverlayRegistry::new(config.overlay.default_enabled));
        let pipeline = Arc::new(Pipeline::new(
            host,
            messenger.clone(),
            router.clone(),
            sessions.clone(),
            overlay.clone(),
        ));
        let fast_path = FastPathCompiler::new(&config.fast_path, config.cookie_rules.base_id);
        let cookies = CookieInjector::new(table.clone(), &config.cookie_rules);

        Self {
            config,
            table,
            messenger,
            router,
            sessions,
            overlay,
            pipeline,
            fast_path,
            cookies,
        }
    }

    /// Engine wired to a single in-memory host for every seam.
    pub fn with_recording_host(config: EngineConfig, host: Arc<RecordingHost>) -> Self {
        Self::new(config, host.clone(), host.clone(), host)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn overlay(&self) -> &Arc<OverlayRegistry> {
        &self.overlay
    }

    pub fn router(&self) -> &Arc<PanelRouter> {
        &self.router
    }

    pub fn cookies(&self) -> &CookieInjector {
        &self.cookies
    }

    pub fn connect_panel(&self, tab_id: TabId) -> PanelPort {
        self.router.connect(tab_id)
    }

    /// Parse and dispatch a raw JSON command from the panel.
    pub async fn handle_message(&self, tab_id: TabId, message: &str) -> Result<(), EngineError> {
        let command: PanelCommand = serde_json::from_str(message)?;
        self.handle_command(tab_id, command).await;
        Ok(())
    }

    pub async fn handle_command(&self, tab_id: TabId, command: PanelCommand) {
        match command {
            PanelCommand::Init { tab_id: panel_tab } => {
                info!("Panel initialized for tab {}", panel_tab);
            }
            PanelCommand::InterceptorRulesSync { rules } => {
                self.sessions.update_intercept_rules(tab_id, rules);
                if self.sessions.feature_status(tab_id).intercept {
                    self.refresh_fast_path().await;
                }
            }
            PanelCommand::InterceptorToggle { enabled } => {
                self.toggle(tab_id, Feature::Intercept, enabled).await;
                self.refresh_fast_path().await;
            }
            PanelCommand::MockRulesSync { rules } => {
                self.sessions.update_mock_rules(tab_id, rules);
            }
            PanelCommand::MockToggle { enabled } => {
                self.toggle(tab_id, Feature::Mock, enabled).await;
            }
            PanelCommand::HeaderOverridesSync { rules } => {
                self.sessions.update_header_override_rules(tab_id, rules);
            }
            PanelCommand::HeaderOverridesToggle { enabled } => {
                self.toggle(tab_id, Feature::HeaderOverride, enabled).await;
            }
            PanelCommand::OverlayToggle { enabled } => {
                self.overlay.set_enabled(tab_id, enabled);
                self.send_to_page(tab_id, PageMessage::OverlayToggle { enabled });
            }
            PanelCommand::Unhandled => {
                debug!("Ignoring command outside the engine's scope for tab {}", tab_id);
            }
        }
    }

    async fn toggle(&self, tab_id: TabId, feature: Feature, enabled: bool) {
        let status = self.sessions.set_enabled(tab_id, feature, enabled).await;
        self.update_badge(tab_id, status);
        self.notify_status(tab_id, status);
    }

    /// The panel's port closed. Stale ports (already replaced by a newer
    /// connection) are ignored.
    pub async fn on_panel_disconnect(&self, tab_id: TabId, port_id: u64) {
        if !self.router.disconnect(tab_id, port_id) {
            return;
        }
        info!("Panel closed for tab {}, disabling all features", tab_id);
        let had_intercept = self.sessions.feature_status(tab_id).intercept;
        self.sessions.cleanup(tab_id).await;

        // No overlay field: the page keeps the user's overlay choice for next time
        self.send_to_page(
            tab_id,
            PageMessage::StatusUpdate {
                features: FeatureStatus::default(),
                overlay: None,
            },
        );
        self.messenger.set_badge(tab_id, BadgeState::cleared());
        if had_intercept {
            self.refresh_fast_path().await;
        }
    }

    /// Tab finished loading. The host drops the attachment on navigation, so
    /// reattach if anything is active and resend the status.
    pub async fn on_tab_updated(&self, tab_id: TabId, complete: bool) {
        if !complete || !self.sessions.contains(tab_id) {
            return;
        }
        let status = self.sessions.feature_status(tab_id);
        if status.any() {
            info!("Page loaded, re-attaching debugger for tab {}", tab_id);
            self.sessions.reattach(tab_id).await;
        }
        self.notify_status(tab_id, status);
    }

    pub async fn on_tab_removed(&self, tab_id: TabId) {
        let had_intercept = self.sessions.feature_status(tab_id).intercept;
        self.sessions.cleanup(tab_id).await;
        self.overlay.remove(tab_id);
        if had_intercept {
            self.refresh_fast_path().await;
        }
    }

    /// Dispatch a debugger event. Paused requests each get their own task.
    pub fn on_debugger_event(&self, tab_id: TabId, event: DebuggerEvent) -> Option<JoinHandle<()>> {
        match event {
            DebuggerEvent::RequestPaused(request) => {
                let pipeline = self.pipeline.clone();
                Some(tokio::spawn(async move {
                    pipeline.handle_request_paused(tab_id, request).await;
                }))
            }
            DebuggerEvent::Detached { reason } => {
                debug!("Debugger detached from tab {}: {}", tab_id, reason);
                self.sessions.mark_detached(tab_id);
                None
            }
        }
    }

    /// Run the pipeline for one request on the caller's task.
    pub async fn process_paused(&self, tab_id: TabId, request: PausedRequest) {
        self.pipeline.handle_request_paused(tab_id, request).await;
    }

    /// Rebuild the declarative table from every tab with intercept enabled.
    pub async fn sync_fast_path(&self) -> Result<usize, EngineError> {
        if !self.config.fast_path.enabled {
            return Err(EngineError::FastPathDisabled);
        }
        let rules = self.sessions.active_intercept_rules();
        if rules.is_empty() {
            self.fast_path.clear(self.table.as_ref()).await?;
            return Ok(0);
        }
        Ok(self.fast_path.sync(self.table.as_ref(), &rules).await?)
    }

    async fn refresh_fast_path(&self) {
        match self.sync_fast_path().await {
            Ok(installed) => debug!("Fast path holds {} rules", installed),
            Err(EngineError::FastPathDisabled) => {}
            Err(e) => warn!("Fast-path sync failed, pipeline still enforces rules: {}", e),
        }
    }

    fn update_badge(&self, tab_id: TabId, status: FeatureStatus) {
        self.messenger
            .set_badge(tab_id, BadgeState::for_active_features(status.active_count()));
    }

    fn notify_status(&self, tab_id: TabId, status: FeatureStatus) {
        self.send_to_page(
            tab_id,
            PageMessage::StatusUpdate {
                features: status,
                overlay: Some(self.overlay.is_enabled(tab_id)),
            },
        );
    }

    fn send_to_page(&self, tab_id: TabId, message: PageMessage) {
        if let Err(e) = self.messenger.send_to_tab(tab_id, message) {
            debug!("No page listener in tab {}: {}", tab_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InterceptAction, InterceptRule, MatchOperator, MatchSpec};

    fn engine() -> (Arc<RecordingHost>, Engine) {
        let host = Arc::new(RecordingHost::new());
        let engine = Engine::with_recording_host(EngineConfig::default(), host.clone());
        (host, engine)
    }

    fn block(id: &str, value: &str) -> InterceptRule {
        InterceptRule::new(
            id,
            MatchSpec::new(MatchOperator::Contains, value),
            InterceptAction::block(),
        )
    }

    #[tokio::test]
    async fn test_toggle_updates_badge_and_status() {
        let (host, engine) = engine();
        engine
            .handle_command(1, PanelCommand::MockToggle { enabled: true })
            .await;
        engine
            .handle_command(1, PanelCommand::HeaderOverridesToggle { enabled: true })
            .await;

        assert_eq!(host.badge(1), Some(BadgeState::for_active_features(2)));
        assert_eq!(
            host.page_messages(1).last(),
            Some(&PageMessage::StatusUpdate {
                features: FeatureStatus {
                    intercept: false,
                    mock: true,
                    headers: true
                },
                overlay: Some(true),
            })
        );
        assert!(host.is_attached(1));
    }

    #[tokio::test]
    async fn test_fast_path_follows_intercept_state() {
        let (host, engine) = engine();
        engine
            .handle_command(
                1,
                PanelCommand::InterceptorRulesSync {
                    rules: vec![block("b1", "ads")],
                },
            )
            .await;
        // Intercept still off: nothing installed
        assert!(host.dynamic_rules().is_empty());

        engine
            .handle_command(1, PanelCommand::InterceptorToggle { enabled: true })
            .await;
        assert_eq!(host.dynamic_rules().len(), 1);

        engine
            .handle_command(
                1,
                PanelCommand::InterceptorRulesSync {
                    rules: vec![block("b1", "ads"), block("b2", "tracker")],
                },
            )
            .await;
        assert_eq!(host.dynamic_rules().len(), 2);

        engine
            .handle_command(1, PanelCommand::InterceptorToggle { enabled: false })
            .await;
        assert!(host.dynamic_rules().is_empty());
    }

    #[tokio::test]
    async fn test_fast_path_dedupes_rules_across_tabs() {
        let (host, engine) = engine();
        for tab in [1, 2] {
            engine
                .handle_command(
                    tab,
                    PanelCommand::InterceptorRulesSync {
                        rules: vec![block("shared", "ads")],
                    },
                )
                .await;
            engine
                .handle_command(tab, PanelCommand::InterceptorToggle { enabled: true })
                .await;
        }
        assert_eq!(host.dynamic_rules().len(), 1);

        engine.on_tab_removed(1).await;
        assert_eq!(host.dynamic_rules().len(), 1);
        engine.on_tab_removed(2).await;
        assert!(host.dynamic_rules().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_fast_path() {
        let host = Arc::new(RecordingHost::new());
        let mut config = EngineConfig::default();
        config.fast_path.enabled = false;
        let engine = Engine::with_recording_host(config, host.clone());

        let sync = PanelCommand::InterceptorRulesSync {
            rules: vec![block("b1", "a")],
        };
        engine.handle_command(1, sync).await;
        engine
            .handle_command(1, PanelCommand::InterceptorToggle { enabled: true })
            .await;
        assert!(host.dynamic_rules().is_empty());
        assert!(matches!(
            engine.sync_fast_path().await,
            Err(EngineError::FastPathDisabled)
        ));
    }

    #[tokio::test]
    async fn test_overlay_toggle_is_forwarded() {
        let (host, engine) = engine();
        engine
            .handle_command(1, PanelCommand::OverlayToggle { enabled: false })
            .await;
        assert!(!engine.overlay().is_enabled(1));
        assert_eq!(
            host.page_messages(1),
            vec![PageMessage::OverlayToggle { enabled: false }]
        );
    }

    #[tokio::test]
    async fn test_handle_message_rejects_malformed_json() {
        let (_, engine) = engine();
        let err = engine.handle_message(1, "not json").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidCommand(_)));

        engine
            .handle_message(1, r#"{"type":"MOCK_TOGGLE","enabled":true}"#)
            .await
            .unwrap();
        assert!(engine.sessions().feature_status(1).mock);
    }

    #[tokio::test]
    async fn test_detached_event_marks_session() {
        let (_, engine) = engine();
        engine
            .handle_command(1, PanelCommand::MockToggle { enabled: true })
            .await;
        let handle = engine.on_debugger_event(
            1,
            DebuggerEvent::Detached {
                reason: "target_closed".into(),
            },
        );
        assert!(handle.is_none());
        assert_eq!(
            engine.sessions().attach_state(1),
            crate::session::AttachState::Unattached
        );
    }
}
