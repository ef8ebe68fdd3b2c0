//! Synthetic network log entries for requests the engine resolved.

use super::headers::Headers;
use crate::config::MockRule;
use crate::host::PausedRequest;
use crate::transport::NetworkEntry;
use std::collections::BTreeMap;

impl NetworkEntry {
    fn for_request(request: &PausedRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: request.url.clone(),
            method: request.method.clone(),
            status_code: 0,
            status_text: String::new(),
            request_headers: request.headers.to_map(),
            response_headers: BTreeMap::new(),
            response_body: None,
            mime_type: String::new(),
            start_time: chrono::Utc::now().timestamp_millis(),
            duration: 0,
            size: 0,
            intercepted_by: None,
            mocked_by: None,
        }
    }

    pub fn mocked(request: &PausedRequest, rule: &MockRule, response_headers: &Headers) -> Self {
        Self {
            status_code: rule.response.status_code,
            status_text: "Mocked".to_string(),
            response_headers: response_headers.to_map(),
            response_body: Some(rule.response.body.clone()),
            mime_type: rule.response.body_type.mime_type().to_string(),
            duration: rule.response.delay_ms,
            size: rule.response.body.len(),
            mocked_by: Some(rule.id.clone()),
            ..Self::for_request(request)
        }
    }

    /// `status_text` is `Blocked`, `Delayed` or the action type.
    pub fn intercepted(
        request: &PausedRequest,
        rule_id: &str,
        status_text: &str,
        duration: u64,
    ) -> Self {
        Self {
            status_text: status_text.to_string(),
            duration,
            intercepted_by: Some(rule_id.to_string()),
            ..Self::for_request(request)
        }
    }

    /// Request continued with override headers; no other rule applied.
    pub fn header_overridden(request: &PausedRequest, modified_headers: &Headers) -> Self {
        Self {
            request_headers: modified_headers.to_map(),
            ..Self::for_request(request)
        }
    }
}
