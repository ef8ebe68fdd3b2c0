//! Wire types exchanged with the panel and the page.

use crate::config::{HeaderOverrideRule, InterceptRule, MockRule};
use crate::host::TabId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Panel → engine. Every command is an idempotent re-send of full state.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PanelCommand {
    Init {
        #[serde(rename = "tabId")]
        tab_id: TabId,
    },
    InterceptorRulesSync {
        rules: Vec<InterceptRule>,
    },
    InterceptorToggle {
        enabled: bool,
    },
    MockRulesSync {
        rules: Vec<MockRule>,
    },
    MockToggle {
        enabled: bool,
    },
    HeaderOverridesSync {
        rules: Vec<HeaderOverrideRule>,
    },
    HeaderOverridesToggle {
        enabled: bool,
    },
    OverlayToggle {
        enabled: bool,
    },
    /// API client and cookie commands belong to sibling services
    #[serde(other)]
    Unhandled,
}

/// Engine → panel.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    NetworkRequest {
        entry: NetworkEntry,
    },
    RequestIntercepted {
        #[serde(rename = "ruleId")]
        rule_id: String,
        url: String,
    },
    RequestMocked {
        #[serde(rename = "ruleId")]
        rule_id: String,
        url: String,
    },
    RequestHeaderOverridden {
        #[serde(rename = "ruleId")]
        rule_id: String,
        url: String,
    },
    DebuggerAttached,
    DebuggerDetached,
}

/// Synthetic network log entry for a request the engine resolved.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    pub id: String,
    pub url: String,
    pub method: String,
    /// 0 when the request continued to the network
    pub status_code: u16,
    pub status_text: String,
    pub request_headers: BTreeMap<String, String>,
    pub response_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub mime_type: String,
    /// Epoch milliseconds
    pub start_time: i64,
    /// Milliseconds
    pub duration: u64,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intercepted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mocked_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchType {
    Intercepted,
    Mocked,
    HeaderOverridden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct FeatureStatus {
    pub intercept: bool,
    pub mock: bool,
    pub headers: bool,
}

impl FeatureStatus {
    pub fn active_count(&self) -> usize {
        [self.intercept, self.mock, self.headers]
            .iter()
            .filter(|on| **on)
            .count()
    }

    pub fn any(&self) -> bool {
        self.active_count() > 0
    }
}

/// Engine → on-page notifier (content script).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
    #[serde(rename_all = "camelCase")]
    RuleMatched {
        match_type: MatchType,
        rule_name: String,
        url: String,
        action: String,
    },
    StatusUpdate {
        features: FeatureStatus,
        /// Omitted on panel disconnect so the page keeps its last overlay choice
        #[serde(default, skip_serializing_if = "Option::is_none")]
        overlay: Option<bool>,
    },
    OverlayToggle {
        enabled: bool,
    },
}

impl PageMessage {
    pub const SOURCE: &'static str = "reqx";

    /// JSON as posted to the page, stamped with the `source` marker the
    /// content script filters on.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "source".to_string(),
                serde_json::Value::String(Self::SOURCE.to_string()),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_panel_command_parsing() {
        let cmd: PanelCommand = serde_json::from_value(json!({ "type": "INIT", "tabId": 42 })).unwrap();
        assert_eq!(cmd, PanelCommand::Init { tab_id: 42 });

        let cmd: PanelCommand =
            serde_json::from_value(json!({ "type": "MOCK_TOGGLE", "enabled": true })).unwrap();
        assert_eq!(cmd, PanelCommand::MockToggle { enabled: true });

        let cmd: PanelCommand = serde_json::from_value(json!({
            "type": "INTERCEPTOR_RULES_SYNC",
            "rules": [{
                "id": "r1",
                "match": { "operator": "contains", "value": "ads" },
                "action": { "type": "block" }
            }]
        }))
        .unwrap();
        match cmd {
            PanelCommand::InterceptorRulesSync { rules } => assert_eq!(rules[0].id, "r1"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_sibling_commands_are_unhandled() {
        let cmd: PanelCommand =
            serde_json::from_value(json!({ "type": "API_REQUEST_CANCEL", "requestId": "x" }))
                .unwrap();
        assert_eq!(cmd, PanelCommand::Unhandled);
    }

    #[test]
    fn test_event_wire_format() {
        let event = EngineEvent::RequestMocked {
            rule_id: "m1".into(),
            url: "https://a".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "type": "REQUEST_MOCKED", "ruleId": "m1", "url": "https://a" })
        );
        assert_eq!(
            serde_json::to_value(EngineEvent::DebuggerAttached).unwrap(),
            json!({ "type": "DEBUGGER_ATTACHED" })
        );
    }

    #[test]
    fn test_page_message_wire_format() {
        let msg = PageMessage::RuleMatched {
            match_type: MatchType::HeaderOverridden,
            rule_name: "Auth".into(),
            url: "https://a".into(),
            action: "header-override".into(),
        };
        assert_eq!(
            msg.to_wire(),
            json!({
                "source": "reqx",
                "type": "RULE_MATCHED",
                "matchType": "header-overridden",
                "ruleName": "Auth",
                "url": "https://a",
                "action": "header-override"
            })
        );

        let status = PageMessage::StatusUpdate {
            features: FeatureStatus::default(),
            overlay: None,
        };
        assert!(status.to_wire().get("overlay").is_none());
    }

    #[test]
    fn test_feature_status_count() {
        let status = FeatureStatus {
            intercept: true,
            mock: false,
            headers: true,
        };
        assert_eq!(status.active_count(), 2);
        assert!(status.any());
        assert!(!FeatureStatus::default().any());
    }
}
