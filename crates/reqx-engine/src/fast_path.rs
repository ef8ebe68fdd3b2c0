//! Declarative fast path.
//!
//! Block and full-URL redirect intercept rules can be enforced by the
//! browser's declarative rule layer without pausing the request at all. The
//! compiler translates eligible rules into that layer's rule grammar; `sync`
//! replaces the whole installed table in a single update.
//!
//! This is an independent consumer of the intercept rules: the interception
//! pipeline still evaluates the same rules for requests that do get paused.

use crate::config::{FastPathConfig, InterceptActionType, InterceptRule, MatchOperator, MatchSpec};
use crate::host::{DeclarativeTable, HostError};
use crate::matcher::is_valid_regex;
use crate::metrics;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeclarativeRule {
    pub id: u32,
    pub priority: u32,
    pub action: RuleAction,
    pub condition: RuleCondition,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    Block,
    Redirect {
        redirect: RedirectTarget,
    },
    ModifyHeaders {
        #[serde(rename = "requestHeaders")]
        request_headers: Vec<ModifyHeaderInfo>,
    },
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RedirectTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_substitution: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOperation {
    Set,
    Remove,
    Append,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ModifyHeaderInfo {
    pub header: String,
    pub operation: HeaderOperation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Xmlhttprequest,
    Other,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_types: Option<Vec<ResourceType>>,
}

/// True if the rule can be enforced declaratively.
///
/// Disabled rules, blank patterns, uncompilable regexes and anything that needs
/// the pipeline (delays, header mods, delay/modify-headers actions) are left out.
pub fn is_eligible(rule: &InterceptRule) -> bool {
    if !rule.enabled || rule.match_spec.value.trim().is_empty() {
        return false;
    }
    if rule.match_spec.operator == MatchOperator::Regex && !is_valid_regex(&rule.match_spec.value) {
        return false;
    }
    match rule.action.action_type {
        InterceptActionType::Block => true,
        InterceptActionType::Redirect => {
            rule.action.redirect_target().is_some()
                && rule.action.delay() == 0
                && rule.action.request_header_mods().is_empty()
        }
        InterceptActionType::Delay | InterceptActionType::ModifyHeaders => false,
    }
}

/// Escape the characters a JavaScript-style regex treats as syntax.
pub fn escape_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 2);
    for c in value.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn method_filter(spec: &MatchSpec) -> Option<Vec<String>> {
    let methods = spec.method_filter();
    if methods.is_empty() {
        None
    } else {
        Some(methods.iter().map(|m| m.as_lowercase()).collect())
    }
}

/// Translate a match spec into the declarative condition grammar.
pub fn build_condition(spec: &MatchSpec) -> RuleCondition {
    let mut condition = RuleCondition {
        request_methods: method_filter(spec),
        ..Default::default()
    };
    match spec.operator {
        MatchOperator::Contains => condition.url_filter = Some(format!("*{}*", spec.value)),
        MatchOperator::Equals => condition.url_filter = Some(spec.value.clone()),
        MatchOperator::Regex => condition.regex_filter = Some(spec.value.clone()),
        // The url filter grammar already understands * and ?
        MatchOperator::Wildcard => condition.url_filter = Some(spec.value.clone()),
    }
    condition
}

pub struct FastPathCompiler {
    next_id: AtomicU32,
    /// Ids stay below this value (start of the cookie-injection range)
    id_ceiling: u32,
    priority: u32,
}

impl FastPathCompiler {
    pub fn new(config: &FastPathConfig, id_ceiling: u32) -> Self {
        Self {
            next_id: AtomicU32::new(1),
            id_ceiling,
            priority: config.priority,
        }
    }

    fn allocate_id(&self) -> u32 {
        let ceiling = self.id_ceiling;
        let previous = self
            .next_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id + 1 >= ceiling { 1 } else { id + 1 })
            })
            .unwrap_or(1);
        previous.min(ceiling.saturating_sub(1)).max(1)
    }

    /// Compile one rule, or `None` if it is not eligible.
    pub fn compile_rule(&self, rule: &InterceptRule) -> Option<DeclarativeRule> {
        if !is_eligible(rule) {
            return None;
        }

        let (action, condition) = match rule.action.action_type {
            InterceptActionType::Block => (RuleAction::Block, build_condition(&rule.match_spec)),
            InterceptActionType::Redirect => {
                let target = rule.action.redirect_target()?.to_string();
                if rule.action.preserves_path() {
                    let condition = RuleCondition {
                        regex_filter: Some(format!(
                            "^(.*?){}(.*)$",
                            escape_pattern(&rule.match_spec.value)
                        )),
                        request_methods: method_filter(&rule.match_spec),
                        ..Default::default()
                    };
                    let action = RuleAction::Redirect {
                        redirect: RedirectTarget {
                            regex_substitution: Some(format!("\\1{target}\\2")),
                            ..Default::default()
                        },
                    };
                    (action, condition)
                } else {
                    let action = RuleAction::Redirect {
                        redirect: RedirectTarget {
                            url: Some(target),
                            ..Default::default()
                        },
                    };
                    (action, build_condition(&rule.match_spec))
                }
            }
            _ => return None,
        };

        Some(DeclarativeRule {
            id: self.allocate_id(),
            priority: self.priority,
            action,
            condition,
        })
    }

    /// Compile the eligible subset of `rules`, preserving list order.
    pub fn compile(&self, rules: &[InterceptRule]) -> Vec<DeclarativeRule> {
        let compiled: Vec<DeclarativeRule> =
            rules.iter().filter_map(|r| self.compile_rule(r)).collect();
        debug!(
            "Compiled {} of {} intercept rules for the fast path",
            compiled.len(),
            rules.len()
        );
        compiled
    }

    /// Replace the installed dynamic rule table with the compiled `rules`.
    ///
    /// Returns the number of rules installed.
    pub async fn sync(
        &self,
        table: &dyn DeclarativeTable,
        rules: &[InterceptRule],
    ) -> Result<usize, HostError> {
        let remove_ids = table.dynamic_rule_ids().await?;
        let add_rules = self.compile(rules);
        let installed = add_rules.len();
        match table.update_dynamic_rules(remove_ids, add_rules).await {
            Ok(()) => {
                info!("Fast-path rule table replaced ({} rules)", installed);
                metrics::record_fast_path_sync(installed);
                Ok(installed)
            }
            Err(e) => {
                warn!("Failed to replace fast-path rule table: {}", e);
                metrics::record_host_failure("update_dynamic_rules");
                Err(e)
            }
        }
    }

    /// Remove every installed dynamic rule.
    pub async fn clear(&self, table: &dyn DeclarativeTable) -> Result<(), HostError> {
        let remove_ids = table.dynamic_rule_ids().await?;
        if remove_ids.is_empty() {
            return Ok(());
        }
        if let Err(e) = table.update_dynamic_rules(remove_ids, Vec::new()).await {
            metrics::record_host_failure("update_dynamic_rules");
            return Err(e);
        }
        metrics::record_fast_path_sync(0);
        info!("Fast-path rule table cleared");
        Ok(())
    }
}
