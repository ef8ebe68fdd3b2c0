//! In-memory host that records every call.
//!
//! Behaves like the browser where the engine depends on it: a tab accepts one
//! attachment, a paused request accepts one resolution, and the dynamic rule
//! table applies remove-then-add atomically.

use super::{
    BadgeState, ContinueParams, DebuggerHost, DeclarativeTable, ErrorReason, FulfillParams,
    HostError, RequestPattern, TabId, TabMessenger,
};
use crate::fast_path::DeclarativeRule;
use crate::transport::PageMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    Attach(TabId),
    Detach(TabId),
    EnableFetch(TabId, Vec<RequestPattern>),
    Continue(TabId, ContinueParams),
    Fail(TabId, String, ErrorReason),
    Fulfill(TabId, FulfillParams),
    UpdateDynamicRules { remove: Vec<u32>, add: Vec<u32> },
    UpdateSessionRules { remove: Vec<u32>, add: Vec<u32> },
    SendToTab(TabId, PageMessage),
    SetBadge(TabId, BadgeState),
}

/// How a paused request was finally resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Resolution {
    Continued(ContinueParams),
    Failed(ErrorReason),
    Fulfilled(FulfillParams),
}

#[derive(Default)]
struct State {
    calls: Vec<HostCall>,
    attached: HashSet<TabId>,
    resolutions: HashMap<String, Vec<Resolution>>,
    cancelled: HashSet<String>,
    dynamic_rules: BTreeMap<u32, DeclarativeRule>,
    session_rules: BTreeMap<u32, DeclarativeRule>,
    page_messages: HashMap<TabId, Vec<PageMessage>>,
    badges: HashMap<TabId, BadgeState>,
    fail_attach: Option<String>,
    fail_fulfill: Option<String>,
    fail_page_messages: bool,
}

#[derive(Default)]
pub struct RecordingHost {
    state: Mutex<State>,
}

impl RecordingHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent attach fail with `message`.
    pub fn fail_attach(&self, message: Option<&str>) {
        self.state.lock().fail_attach = message.map(str::to_string);
    }

    /// Make every subsequent fulfill fail with `message`.
    pub fn fail_fulfill(&self, message: Option<&str>) {
        self.state.lock().fail_fulfill = message.map(str::to_string);
    }

    /// Simulate a page without a content-script listener.
    pub fn fail_page_messages(&self, fail: bool) {
        self.state.lock().fail_page_messages = fail;
    }

    /// The host cancels a paused request (tab navigated, request aborted).
    pub fn cancel_request(&self, request_id: &str) {
        self.state.lock().cancelled.insert(request_id.to_string());
    }

    /// The host drops the attachment on its own.
    pub fn drop_attachment(&self, tab_id: TabId) {
        self.state.lock().attached.remove(&tab_id);
    }

    pub fn is_attached(&self, tab_id: TabId) -> bool {
        self.state.lock().attached.contains(&tab_id)
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// Count of recorded calls matching `pred`.
    pub fn count_calls(&self, pred: impl Fn(&HostCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn resolutions(&self, request_id: &str) -> Vec<Resolution> {
        self.state
            .lock()
            .resolutions
            .get(request_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Every continue, fail or fulfill issued for `request_id`, including the
    /// ones the host rejected.
    pub fn resolution_attempts(&self, request_id: &str) -> usize {
        self.count_calls(|call| match call {
            HostCall::Continue(_, params) => params.request_id == request_id,
            HostCall::Fail(_, id, _) => id == request_id,
            HostCall::Fulfill(_, params) => params.request_id == request_id,
            _ => false,
        })
    }

    pub fn page_messages(&self, tab_id: TabId) -> Vec<PageMessage> {
        self.state
            .lock()
            .page_messages
            .get(&tab_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn badge(&self, tab_id: TabId) -> Option<BadgeState> {
        self.state.lock().badges.get(&tab_id).cloned()
    }

    pub fn dynamic_rules(&self) -> Vec<DeclarativeRule> {
        self.state.lock().dynamic_rules.values().cloned().collect()
    }

    pub fn session_rules(&self) -> Vec<DeclarativeRule> {
        self.state.lock().session_rules.values().cloned().collect()
    }

    fn resolve(
        &self,
        tab_id: TabId,
        request_id: &str,
        call: HostCall,
        resolution: Resolution,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if !state.attached.contains(&tab_id) {
            return Err(HostError::NotAttached(tab_id));
        }
        if state.cancelled.contains(request_id) || state.resolutions.contains_key(request_id) {
            return Err(HostError::AlreadyResolved(request_id.to_string()));
        }
        state
            .resolutions
            .entry(request_id.to_string())
            .or_default()
            .push(resolution);
        Ok(())
    }
}

fn replace_rules(
    table: &mut BTreeMap<u32, DeclarativeRule>,
    remove_rule_ids: &[u32],
    add_rules: Vec<DeclarativeRule>,
) -> Result<(), HostError> {
    let mut next = table.clone();
    for id in remove_rule_ids {
        next.remove(id);
    }
    for rule in add_rules {
        if next.contains_key(&rule.id) {
            return Err(HostError::Rejected(format!(
                "Rule with id {} already exists",
                rule.id
            )));
        }
        next.insert(rule.id, rule);
    }
    *table = next;
    Ok(())
}

#[async_trait]
impl DebuggerHost for RecordingHost {
    async fn attach(&self, tab_id: TabId, _protocol_version: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::Attach(tab_id));
        if let Some(message) = &state.fail_attach {
            return Err(HostError::Rejected(message.clone()));
        }
        if !state.attached.insert(tab_id) {
            return Err(HostError::AlreadyAttached(tab_id));
        }
        Ok(())
    }

    async fn detach(&self, tab_id: TabId) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::Detach(tab_id));
        if state.attached.remove(&tab_id) {
            Ok(())
        } else {
            Err(HostError::NotAttached(tab_id))
        }
    }

    async fn enable_fetch(
        &self,
        tab_id: TabId,
        patterns: Vec<RequestPattern>,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::EnableFetch(tab_id, patterns));
        if state.attached.contains(&tab_id) {
            Ok(())
        } else {
            Err(HostError::NotAttached(tab_id))
        }
    }

    async fn continue_request(
        &self,
        tab_id: TabId,
        params: ContinueParams,
    ) -> Result<(), HostError> {
        let request_id = params.request_id.clone();
        self.resolve(
            tab_id,
            &request_id,
            HostCall::Continue(tab_id, params.clone()),
            Resolution::Continued(params),
        )
    }

    async fn fail_request(
        &self,
        tab_id: TabId,
        request_id: &str,
        reason: ErrorReason,
    ) -> Result<(), HostError> {
        self.resolve(
            tab_id,
            request_id,
            HostCall::Fail(tab_id, request_id.to_string(), reason),
            Resolution::Failed(reason),
        )
    }

    async fn fulfill_request(
        &self,
        tab_id: TabId,
        params: FulfillParams,
    ) -> Result<(), HostError> {
        {
            let mut state = self.state.lock();
            if let Some(message) = state.fail_fulfill.clone() {
                state.calls.push(HostCall::Fulfill(tab_id, params));
                return Err(HostError::Rejected(message));
            }
        }
        let request_id = params.request_id.clone();
        self.resolve(
            tab_id,
            &request_id,
            HostCall::Fulfill(tab_id, params.clone()),
            Resolution::Fulfilled(params),
        )
    }
}

#[async_trait]
impl DeclarativeTable for RecordingHost {
    async fn dynamic_rule_ids(&self) -> Result<Vec<u32>, HostError> {
        Ok(self.state.lock().dynamic_rules.keys().copied().collect())
    }

    async fn update_dynamic_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<DeclarativeRule>,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::UpdateDynamicRules {
            remove: remove_rule_ids.clone(),
            add: add_rules.iter().map(|r| r.id).collect(),
        });
        replace_rules(&mut state.dynamic_rules, &remove_rule_ids, add_rules)
    }

    async fn update_session_rules(
        &self,
        remove_rule_ids: Vec<u32>,
        add_rules: Vec<DeclarativeRule>,
    ) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::UpdateSessionRules {
            remove: remove_rule_ids.clone(),
            add: add_rules.iter().map(|r| r.id).collect(),
        });
        replace_rules(&mut state.session_rules, &remove_rule_ids, add_rules)
    }
}

impl TabMessenger for RecordingHost {
    fn send_to_tab(&self, tab_id: TabId, message: PageMessage) -> Result<(), HostError> {
        let mut state = self.state.lock();
        state.calls.push(HostCall::SendToTab(tab_id, message.clone()));
        if state.fail_page_messages {
            return Err(HostError::Transport(
                "Could not establish connection. Receiving end does not exist.".to_string(),
            ));
        }
        state.page_messages.entry(tab_id).or_default().push(message);
        Ok(())
    }

    fn set_badge(&self, tab_id: TabId, badge: BadgeState) {
        let mut state = self.state.lock();
        state.calls.push(HostCall::SetBadge(tab_id, badge.clone()));
        state.badges.insert(tab_id, badge);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_attachment_per_tab() {
        let host = RecordingHost::new();
        host.attach(1, "1.3").await.unwrap();
        assert_eq!(
            host.attach(1, "1.3").await,
            Err(HostError::AlreadyAttached(1))
        );
        host.detach(1).await.unwrap();
        assert!(host.detach(1).await.unwrap_err().is_already_detached());
    }

    #[tokio::test]
    async fn test_second_resolution_is_rejected() {
        let host = RecordingHost::new();
        host.attach(1, "1.3").await.unwrap();
        host.continue_request(1, ContinueParams::unmodified("r1"))
            .await
            .unwrap();
        let err = host
            .fail_request(1, "r1", ErrorReason::BlockedByClient)
            .await
            .unwrap_err();
        assert!(err.is_already_resolved());
        assert_eq!(host.resolution_attempts("r1"), 2);
        assert_eq!(
            host.resolutions("r1"),
            vec![Resolution::Continued(ContinueParams::unmodified("r1"))]
        );
    }

    #[tokio::test]
    async fn test_cancelled_request_cannot_be_resolved() {
        let host = RecordingHost::new();
        host.attach(1, "1.3").await.unwrap();
        host.cancel_request("r1");
        let err = host
            .continue_request(1, ContinueParams::unmodified("r1"))
            .await
            .unwrap_err();
        assert!(err.is_already_resolved());
        assert!(host.resolutions("r1").is_empty());
    }

    #[tokio::test]
    async fn test_rule_update_is_atomic() {
        let host = RecordingHost::new();
        let rule = |id| DeclarativeRule {
            id,
            priority: 1,
            action: crate::fast_path::RuleAction::Block,
            condition: Default::default(),
        };
        host.update_dynamic_rules(vec![], vec![rule(1), rule(2)])
            .await
            .unwrap();

        // Duplicate id without removing it first: nothing changes
        assert!(host
            .update_dynamic_rules(vec![2], vec![rule(3), rule(1)])
            .await
            .is_err());
        assert_eq!(host.dynamic_rule_ids().await.unwrap(), vec![1, 2]);

        host.update_dynamic_rules(vec![1, 2], vec![rule(3)])
            .await
            .unwrap();
        assert_eq!(host.dynamic_rule_ids().await.unwrap(), vec![3]);
    }

    #[test]
    fn test_resolution_wire_format() {
        let json = serde_json::to_value(Resolution::Failed(ErrorReason::BlockedByClient)).unwrap();
        assert_eq!(json, serde_json::json!({ "failed": "BlockedByClient" }));
    }
}
