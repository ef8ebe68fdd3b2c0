//! Interception pipeline.
//!
//! Every paused request runs through five phases in a fixed order, each
//! reporting whether it resolved the request:
//!
//! 1. header overrides are pre-evaluated; every matching rule applies and is
//!    announced before anything else happens
//! 2. mocks: CORS preflight short-circuit, then first matching mock fulfills
//! 3. intercepts: first matching rule blocks, delays, redirects or rewrites
//! 4. header overrides alone: continue with the rewritten headers
//! 5. pass-through: continue unmodified
//!
//! Header overrides are cumulative while mocks and intercepts are first-match.
//! The rule sets and flags are captured once when the request enters the
//! pipeline, so a sync racing with a slow mock delay does not change the
//! outcome of a request already in flight.
//!
//! ## Module Structure
//!
//! - `headers`: ordered header list and header rewrite operations
//! - `cors`: CORS headers for preflights and mocked responses
//! - `entry`: synthetic network log entries

mod cors;
mod entry;
mod headers;


use crate::config::{InterceptActionType, InterceptRule, MockRule};
use crate::host::{
    ContinueParams, DebuggerHost, ErrorReason, FulfillParams, HostError, PausedRequest, TabId,
    TabMessenger,
};
use crate::matcher::{build_redirect_target, find_matching_rule, matches};
use crate::metrics;
use crate::session::{OverlayRegistry, SessionRegistry, SessionSnapshot};
use crate::transport::{EngineEvent, MatchType, NetworkEntry, PageMessage, PanelRouter};
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use cors::{mock_response_headers, preflight_headers};
pub use headers::{apply_header_mods, apply_override_modifications, HeaderEntry, Headers};

/// Result of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// The request got its single resolution
    Resolved,
    /// Hand the request to the next phase
    Continue,
}

/// Output of phase 1, consumed by phases 3 and 4.
#[derive(Debug, Clone)]
struct HeaderOverrideResult {
    headers: Headers,
    matched_rule_ids: Vec<String>,
}

pub struct Pipeline {
    host: Arc<dyn DebuggerHost>,
    messenger: Arc<dyn TabMessenger>,
    router: Arc<PanelRouter>,
    sessions: Arc<SessionRegistry>,
    overlay: Arc<OverlayRegistry>,
}

impl Pipeline {
    pub fn new(
        host: Arc<dyn DebuggerHost>,
        messenger: Arc<dyn TabMessenger>,
        router: Arc<PanelRouter>,
        sessions: Arc<SessionRegistry>,
        overlay: Arc<OverlayRegistry>,
    ) -> Self {
        Self {
            host,
            messenger,
            router,
            sessions,
            overlay,
        }
    }

    /// Evaluate one paused request and issue exactly one resolution.
    ///
    /// Requests for a tab without a session are dropped with a warning.
    pub async fn handle_request_paused(&self, tab_id: TabId, request: PausedRequest) {
        let Some(snapshot) = self.sessions.snapshot(tab_id) else {
            warn!(
                "No session for tab {}, dropping paused request {}",
                tab_id, request.request_id
            );
            return;
        };

        metrics::record_paused_request(&request.method);
        debug!(
            "requestPaused tab={} {} {} mock={} intercept={} headers={}",
            tab_id,
            request.method,
            request.url,
            snapshot.mock_enabled,
            snapshot.intercept_enabled,
            snapshot.header_override_enabled
        );

        let overrides = self.evaluate_header_overrides(tab_id, &request, &snapshot);

        if self.mock_phase(tab_id, &request, &snapshot).await == PhaseOutcome::Resolved {
            return;
        }
        if self
            .intercept_phase(tab_id, &request, &snapshot, overrides.as_ref())
            .await
            == PhaseOutcome::Resolved
        {
            return;
        }
        if self
            .header_override_phase(tab_id, &request, overrides.as_ref())
            .await
            == PhaseOutcome::Resolved
        {
            return;
        }
        self.continue_request(tab_id, ContinueParams::unmodified(&request.request_id))
            .await;
    }

    /// Phase 1: apply every matching header override to a working copy and
    /// announce each match.
    fn evaluate_header_overrides(
        &self,
        tab_id: TabId,
        request: &PausedRequest,
        snapshot: &SessionSnapshot,
    ) -> Option<HeaderOverrideResult> {
        if !snapshot.header_override_enabled || snapshot.header_override_rules.is_empty() {
            return None;
        }

        let mut headers = request.headers.clone();
        let mut matched = Vec::new();
        for rule in snapshot.header_override_rules.iter() {
            if !rule.enabled || !rule.match_spec.matches_request(&request.url, &request.method) {
                continue;
            }
            apply_override_modifications(&mut headers, &rule.modifications);
            matched.push(rule);
        }

        if matched.is_empty() {
            return None;
        }

        for rule in &matched {
            metrics::record_rule_match("header-override", "header-override");
            self.router.send(
                tab_id,
                EngineEvent::RequestHeaderOverridden {
                    rule_id: rule.id.clone(),
                    url: request.url.clone(),
                },
            );
        }
        for rule in &matched {
            self.notify_page(
                tab_id,
                MatchType::HeaderOverridden,
                &rule.name,
                &request.url,
                "header-override",
            );
        }

        Some(HeaderOverrideResult {
            headers,
            matched_rule_ids: matched.iter().map(|r| r.id.clone()).collect(),
        })
    }

    /// Phase 2: preflight short-circuit, then first matching mock.
    async fn mock_phase(
        &self,
        tab_id: TabId,
        request: &PausedRequest,
        snapshot: &SessionSnapshot,
    ) -> PhaseOutcome {
        if !snapshot.mock_enabled {
            return PhaseOutcome::Continue;
        }

        if request.method.eq_ignore_ascii_case("OPTIONS") {
            // Any mocked URL answers its preflight, whatever the rule's method filter
            let preflight_match = snapshot
                .mock_rules
                .iter()
                .filter(|r| r.enabled)
                .any(|r| matches(&request.url, &r.match_spec.value, r.match_spec.operator));
            if preflight_match {
                debug!("Answering CORS preflight for {}", request.url);
                self.fulfill_request(
                    tab_id,
                    FulfillParams {
                        request_id: request.request_id.clone(),
                        response_code: 204,
                        response_headers: preflight_headers(&request.headers),
                        body: None,
                    },
                )
                .await;
                return PhaseOutcome::Resolved;
            }
        }

        let mock_rules = snapshot.mock_rules.as_slice();
        let Some(rule) = find_matching_rule(mock_rules, &request.url, &request.method) else {
            return PhaseOutcome::Continue;
        };
        self.fulfill_mock(tab_id, request, rule).await;
        PhaseOutcome::Resolved
    }

    async fn fulfill_mock(&self, tab_id: TabId, request: &PausedRequest, rule: &MockRule) {
        let response_headers = mock_response_headers(&request.headers, &rule.response.headers);
        metrics::record_rule_match("mock", "fulfill");

        if rule.response.delay_ms > 0 {
            metrics::record_delay("mock", rule.response.delay_ms);
            tokio::time::sleep(Duration::from_millis(rule.response.delay_ms)).await;
        }

        info!(
            "Fulfilling mock rule={} status={} url={}",
            rule.name, rule.response.status_code, request.url
        );
        self.fulfill_request(
            tab_id,
            FulfillParams {
                request_id: request.request_id.clone(),
                response_code: rule.response.status_code,
                response_headers: response_headers.clone(),
                body: Some(base64::engine::general_purpose::STANDARD.encode(&rule.response.body)),
            },
        )
        .await;

        self.router.send(
            tab_id,
            EngineEvent::RequestMocked {
                rule_id: rule.id.clone(),
                url: request.url.clone(),
            },
        );
        self.notify_page(tab_id, MatchType::Mocked, &rule.name, &request.url, "mock");
        self.router.send(
            tab_id,
            EngineEvent::NetworkRequest {
                entry: NetworkEntry::mocked(request, rule, &response_headers),
            },
        );
    }

    /// Phase 3: first matching intercept rule.
    async fn intercept_phase(
        &self,
        tab_id: TabId,
        request: &PausedRequest,
        snapshot: &SessionSnapshot,
        overrides: Option<&HeaderOverrideResult>,
    ) -> PhaseOutcome {
        if !snapshot.intercept_enabled {
            return PhaseOutcome::Continue;
        }
        let intercept_rules = snapshot.intercept_rules.as_slice();
        let Some(rule) = find_matching_rule(intercept_rules, &request.url, &request.method) else {
            return PhaseOutcome::Continue;
        };

        let action_type = rule.action.action_type;
        metrics::record_rule_match("intercept", action_type.as_str());

        if action_type == InterceptActionType::Block {
            self.fail_request(tab_id, &request.request_id, ErrorReason::BlockedByClient)
                .await;
            self.announce_intercept(tab_id, request, rule);
            self.router.send(
                tab_id,
                EngineEvent::NetworkRequest {
                    entry: NetworkEntry::intercepted(request, &rule.id, "Blocked", 0),
                },
            );
            return PhaseOutcome::Resolved;
        }

        let delay = rule.action.delay();
        if delay > 0 {
            metrics::record_delay("intercept", delay);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let params = build_continue_params(request, rule, overrides);
        if params.is_unmodified() {
            // Delay only: announce before letting the request go
            self.announce_intercept(tab_id, request, rule);
            self.continue_request(tab_id, params).await;
            self.router.send(
                tab_id,
                EngineEvent::NetworkRequest {
                    entry: NetworkEntry::intercepted(request, &rule.id, "Delayed", delay),
                },
            );
        } else {
            self.continue_request(tab_id, params).await;
            self.announce_intercept(tab_id, request, rule);
            self.router.send(
                tab_id,
                EngineEvent::NetworkRequest {
                    entry: NetworkEntry::intercepted(
                        request,
                        &rule.id,
                        action_type.as_str(),
                        delay,
                    ),
                },
            );
        }
        PhaseOutcome::Resolved
    }

    /// Phase 4: only header overrides matched.
    async fn header_override_phase(
        &self,
        tab_id: TabId,
        request: &PausedRequest,
        overrides: Option<&HeaderOverrideResult>,
    ) -> PhaseOutcome {
        let Some(overrides) = overrides else {
            return PhaseOutcome::Continue;
        };

        debug!(
            "Continuing {} with overrides from {:?}",
            request.url, overrides.matched_rule_ids
        );
        self.continue_request(
            tab_id,
            ContinueParams {
                request_id: request.request_id.clone(),
                url: None,
                headers: Some(overrides.headers.clone()),
            },
        )
        .await;
        self.router.send(
            tab_id,
            EngineEvent::NetworkRequest {
                entry: NetworkEntry::header_overridden(request, &overrides.headers),
            },
        );
        PhaseOutcome::Resolved
    }

    fn announce_intercept(&self, tab_id: TabId, request: &PausedRequest, rule: &InterceptRule) {
        self.router.send(
            tab_id,
            EngineEvent::RequestIntercepted {
                rule_id: rule.id.clone(),
                url: request.url.clone(),
            },
        );
        self.notify_page(
            tab_id,
            MatchType::Intercepted,
            &rule.name,
            &request.url,
            rule.action.action_type.as_str(),
        );
    }

    /// Overlay toast; skipped when the tab's overlay is off.
    fn notify_page(
        &self,
        tab_id: TabId,
        match_type: MatchType,
        rule_name: &str,
        url: &str,
        action: &str,
    ) {
        if !self.overlay.is_enabled(tab_id) {
            return;
        }
        let message = PageMessage::RuleMatched {
            match_type,
            rule_name: rule_name.to_string(),
            url: url.to_string(),
            action: action.to_string(),
        };
        if let Err(e) = self.messenger.send_to_tab(tab_id, message) {
            debug!("Page notification for tab {} not delivered: {}", tab_id, e);
        }
    }

    async fn continue_request(&self, tab_id: TabId, params: ContinueParams) {
        let request_id = params.request_id.clone();
        let result = self.host.continue_request(tab_id, params).await;
        self.settle("continue", &request_id, result);
    }

    async fn fail_request(&self, tab_id: TabId, request_id: &str, reason: ErrorReason) {
        let result = self.host.fail_request(tab_id, request_id, reason).await;
        self.settle("fail", request_id, result);
    }

    async fn fulfill_request(&self, tab_id: TabId, params: FulfillParams) {
        let request_id = params.request_id.clone();
        let result = self.host.fulfill_request(tab_id, params).await;
        self.settle("fulfill", &request_id, result);
    }

    /// Resolution errors never escape the pipeline.
    fn settle(&self, kind: &str, request_id: &str, result: Result<(), HostError>) {
        match result {
            Ok(()) => metrics::record_resolution(kind),
            Err(e) if e.is_already_resolved() => {
                debug!("Request {} already resolved or cancelled ({})", request_id, kind);
            }
            Err(e) => {
                error!("Failed to {} request {}: {}", kind, request_id, e);
                metrics::record_host_failure(kind);
            }
        }
    }
}

/// Continue parameters for a non-block intercept: redirect target and
/// rewritten headers, each only when there is something to change.
fn build_continue_params(
    request: &PausedRequest,
    rule: &InterceptRule,
    overrides: Option<&HeaderOverrideResult>,
) -> ContinueParams {
    let url = rule.action.redirect_target().map(|target| {
        if rule.action.preserves_path() {
            build_redirect_target(
                &request.url,
                &rule.match_spec.value,
                target,
                rule.match_spec.operator,
            )
        } else {
            target.to_string()
        }
    });

    let mods = rule.action.request_header_mods();
    let headers = if !mods.is_empty() || overrides.is_some() {
        let mut headers = overrides
            .map(|o| o.headers.clone())
            .unwrap_or_else(|| request.headers.clone());
        apply_header_mods(&mut headers, mods);
        Some(headers)
    } else {
        None
    };

    ContinueParams {
        request_id: request.request_id.clone(),
        url,
        headers,
    }
}
