//! Configuration types for the ReqX engine.

mod rules;

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

// Re-export all rule types for library consumers
pub use rules::{
    HeaderMod, HeaderModOperation, HeaderModification, HeaderOperation, HeaderOverrideRule,
    HeaderTarget, HttpMethod, InterceptAction, InterceptActionType, InterceptRule, KeyValuePair,
    MatchOperator, MatchSpec, MatchableRule, MockBodyType, MockResponse, MockRule, RuleSet,
};

/// First id handed to cookie-injection session rules. Fast-path ids stay below it.
pub const DEFAULT_COOKIE_RULE_BASE_ID: u32 = 900_000;
pub const DEFAULT_COOKIE_RULE_SLOTS: u32 = 1000;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub debugger: DebuggerConfig,
    #[serde(default)]
    pub fast_path: FastPathConfig,
    #[serde(default)]
    pub cookie_rules: CookieRuleConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    /// Default tracing filter when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debugger: DebuggerConfig::default(),
            fast_path: FastPathConfig::default(),
            cookie_rules: CookieRuleConfig::default(),
            overlay: OverlayConfig::default(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebuggerConfig {
    /// Remote debugging protocol version requested on attach
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FastPathConfig {
    /// Mirror block/redirect intercept rules into the declarative rule table
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: u32,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: default_priority(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieRuleConfig {
    #[serde(default = "default_cookie_base_id")]
    pub base_id: u32,
    #[serde(default = "default_cookie_slots")]
    pub slots: u32,
}

impl Default for CookieRuleConfig {
    fn default() -> Self {
        Self {
            base_id: DEFAULT_COOKIE_RULE_BASE_ID,
            slots: DEFAULT_COOKIE_RULE_SLOTS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayConfig {
    /// Overlay visibility for tabs that never sent an overlay toggle
    #[serde(default = "default_true")]
    pub default_enabled: bool,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl EngineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.debugger.protocol_version.trim().is_empty() {
            anyhow::bail!("debugger.protocolVersion must not be empty");
        }

        if self.fast_path.priority == 0 {
            anyhow::bail!("fastPath.priority must be at least 1");
        }

        if self.cookie_rules.slots == 0 {
            anyhow::bail!("cookieRules.slots must be at least 1");
        }

        // Fast-path ids count up from 1, so the cookie range needs headroom below it
        if self.cookie_rules.base_id < 1000 {
            anyhow::bail!(
                "cookieRules.baseId {} is too low: fast-path rule ids would collide with cookie rules",
                self.cookie_rules.base_id
            );
        }

        if self
            .cookie_rules
            .base_id
            .checked_add(self.cookie_rules.slots)
            .is_none()
        {
            anyhow::bail!(
                "cookieRules range {}+{} overflows the rule id space",
                self.cookie_rules.base_id,
                self.cookie_rules.slots
            );
        }

        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_protocol_version() -> String {
    "1.3".to_string()
}

fn default_priority() -> u32 {
    1
}

fn default_cookie_base_id() -> u32 {
    DEFAULT_COOKIE_RULE_BASE_ID
}

fn default_cookie_slots() -> u32 {
    DEFAULT_COOKIE_RULE_SLOTS
}

fn default_true() -> bool {
    true
}
