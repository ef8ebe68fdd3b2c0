//! Rule definitions synced from the panel.
//!
//! Every rule is a plain value object. A sync command replaces the whole list
//! for its category; nothing in the engine edits a rule in place.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Method name in the lower-case form used by declarative rule conditions.
    pub fn as_lowercase(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            other => Err(format!("unsupported HTTP method: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchOperator {
    #[default]
    Contains,
    Equals,
    Regex,
    Wildcard,
}

/// URL + method filter shared by all three rule categories.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct MatchSpec {
    #[serde(default)]
    pub operator: MatchOperator,
    #[serde(default)]
    pub value: String,
    /// Empty or absent means any method
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<HttpMethod>>,
}

impl MatchSpec {
    pub fn new(operator: MatchOperator, value: impl Into<String>) -> Self {
        Self {
            operator,
            value: value.into(),
            methods: None,
        }
    }

    pub fn with_methods(mut self, methods: Vec<HttpMethod>) -> Self {
        self.methods = Some(methods);
        self
    }

    /// Method filters that actually constrain the match (empty slice = any).
    pub fn method_filter(&self) -> &[HttpMethod] {
        self.methods.as_deref().unwrap_or(&[])
    }

    pub fn allows_method(&self, method: &str) -> bool {
        let filter = self.method_filter();
        filter.is_empty() || filter.iter().any(|m| m.as_str().eq_ignore_ascii_case(method))
    }

    /// Method filter first, then the URL predicate.
    pub fn matches_request(&self, url: &str, method: &str) -> bool {
        self.allows_method(method) && crate::matcher::matches(url, &self.value, self.operator)
    }
}

/// Implemented by rule types that take part in first-match-wins lookups.
pub trait MatchableRule {
    fn is_enabled(&self) -> bool;
    fn match_spec(&self) -> &MatchSpec;
}

// ===== Intercept rules =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InterceptActionType {
    Block,
    Delay,
    Redirect,
    ModifyHeaders,
}

impl InterceptActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterceptActionType::Block => "block",
            InterceptActionType::Delay => "delay",
            InterceptActionType::Redirect => "redirect",
            InterceptActionType::ModifyHeaders => "modify-headers",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderModOperation {
    Set,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HeaderMod {
    pub operation: HeaderModOperation,
    pub header: String,
    #[serde(default)]
    pub value: String,
}

/// Primary action type plus optional extras. The panel lets one rule carry a
/// delay, a redirect and header mods at the same time.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptAction {
    #[serde(rename = "type")]
    pub action_type: InterceptActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preserve_path: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Vec<HeaderMod>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<HeaderMod>>,
}

impl InterceptAction {
    pub fn new(action_type: InterceptActionType) -> Self {
        Self {
            action_type,
            delay_ms: None,
            redirect_url: None,
            preserve_path: None,
            request_headers: None,
            response_headers: None,
        }
    }

    pub fn block() -> Self {
        Self::new(InterceptActionType::Block)
    }

    pub fn delay_only(ms: u64) -> Self {
        Self {
            delay_ms: Some(ms),
            ..Self::new(InterceptActionType::Delay)
        }
    }

    pub fn redirect(url: impl Into<String>, preserve_path: bool) -> Self {
        Self {
            redirect_url: Some(url.into()),
            preserve_path: Some(preserve_path),
            ..Self::new(InterceptActionType::Redirect)
        }
    }

    /// Configured delay, zero when absent.
    pub fn delay(&self) -> u64 {
        self.delay_ms.unwrap_or(0)
    }

    /// Redirect target if one is configured and non-empty.
    pub fn redirect_target(&self) -> Option<&str> {
        self.redirect_url.as_deref().filter(|u| !u.is_empty())
    }

    pub fn preserves_path(&self) -> bool {
        self.preserve_path.unwrap_or(false)
    }

    pub fn request_header_mods(&self) -> &[HeaderMod] {
        self.request_headers.as_deref().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Display hint only; list position decides evaluation order
    #[serde(default)]
    pub order: i64,
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    pub action: InterceptAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl InterceptRule {
    pub fn new(id: impl Into<String>, match_spec: MatchSpec, action: InterceptAction) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            order: 0,
            match_spec,
            action,
            created_at: None,
            updated_at: None,
        }
    }
}

impl MatchableRule for InterceptRule {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn match_spec(&self) -> &MatchSpec {
        &self.match_spec
    }
}

// ===== Mock rules =====

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct KeyValuePair {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl KeyValuePair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MockBodyType {
    #[default]
    Json,
    Text,
    Html,
}

impl MockBodyType {
    pub fn mime_type(&self) -> &'static str {
        match self {
            MockBodyType::Json => "application/json",
            MockBodyType::Text => "text/plain",
            MockBodyType::Html => "text/html",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    #[serde(default = "default_status_code")]
    pub status_code: u16,
    #[serde(default)]
    pub headers: Vec<KeyValuePair>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub body_type: MockBodyType,
    #[serde(default)]
    pub delay_ms: u64,
}

impl Default for MockResponse {
    fn default() -> Self {
        Self {
            status_code: default_status_code(),
            headers: Vec::new(),
            body: String::new(),
            body_type: MockBodyType::default(),
            delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub order: i64,
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    pub response: MockResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl MockRule {
    pub fn new(id: impl Into<String>, match_spec: MatchSpec, response: MockResponse) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            order: 0,
            match_spec,
            response,
            created_at: None,
            updated_at: None,
        }
    }
}

impl MatchableRule for MockRule {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn match_spec(&self) -> &MatchSpec {
        &self.match_spec
    }
}

// ===== Header override rules =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderTarget {
    Request,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOperation {
    Set,
    Remove,
    Append,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HeaderModification {
    pub target: HeaderTarget,
    pub operation: HeaderOperation,
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl HeaderModification {
    pub fn request(operation: HeaderOperation, name: &str, value: &str) -> Self {
        Self {
            target: HeaderTarget::Request,
            operation,
            name: name.to_string(),
            value: value.to_string(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderOverrideRule {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    #[serde(default)]
    pub modifications: Vec<HeaderModification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
}

impl HeaderOverrideRule {
    pub fn new(
        id: impl Into<String>,
        match_spec: MatchSpec,
        modifications: Vec<HeaderModification>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            enabled: true,
            match_spec,
            modifications,
            created_at: None,
            updated_at: None,
        }
    }
}

impl MatchableRule for HeaderOverrideRule {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn match_spec(&self) -> &MatchSpec {
        &self.match_spec
    }
}

/// All three rule categories in one document, as exported by the panel.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    #[serde(default)]
    pub intercept: Vec<InterceptRule>,
    #[serde(default)]
    pub mocks: Vec<MockRule>,
    #[serde(default)]
    pub header_overrides: Vec<HeaderOverrideRule>,
}

impl RuleSet {
    /// Load a rule set from a YAML or JSON file (JSON is valid YAML).
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, anyhow::Error> {
        use anyhow::Context;
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rule file {}", path.display()))?;
        let rules: RuleSet = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse rule file {}", path.display()))?;
        Ok(rules)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_status_code() -> u16 {
    200
}
