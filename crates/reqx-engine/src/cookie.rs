//! Cookie injection for the API-client executor.
//!
//! Scripted fetches may not set a `Cookie` header themselves, so the executor
//! asks for a short-lived declarative session rule that sets it at the network
//! layer for one URL. Rule ids cycle through a fixed range above every id the
//! fast path can hand out.

use crate::config::CookieRuleConfig;
use crate::fast_path::{
    DeclarativeRule, HeaderOperation, ModifyHeaderInfo, ResourceType, RuleAction, RuleCondition,
};
use crate::host::{DeclarativeTable, HostError};
use crate::metrics;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const COOKIE_RULE_PRIORITY: u32 = 1;

/// Installed cookie rule. Pass back to [`CookieInjector::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookieRuleHandle {
    pub rule_id: u32,
}

/// Removes the cookie rule when dropped unless disarmed first. Covers the
/// caller dropping the request future before it completes.
struct ReleaseGuard {
    table: Arc<dyn DeclarativeTable>,
    rule_id: u32,
    armed: bool,
}

impl ReleaseGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let table = self.table.clone();
        let rule_id = self.rule_id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match table.update_session_rules(vec![rule_id], Vec::new()).await {
                        Ok(()) => debug!("Released cookie rule {} after cancellation", rule_id),
                        Err(e) => debug!("Cookie rule {} release failed: {}", rule_id, e),
                    }
                });
            }
            Err(_) => warn!("No runtime to release cookie rule {}", rule_id),
        }
    }
}

pub struct CookieInjector {
    table: Arc<dyn DeclarativeTable>,
    base_id: u32,
    slots: u32,
    counter: AtomicU32,
}

impl CookieInjector {
    pub fn new(table: Arc<dyn DeclarativeTable>, config: &CookieRuleConfig) -> Self {
        Self {
            table,
            base_id: config.base_id,
            slots: config.slots.max(1),
            counter: AtomicU32::new(0),
        }
    }

    fn next_rule_id(&self) -> u32 {
        let n = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        self.base_id.saturating_add(n % self.slots)
    }

    /// Install a session rule setting `Cookie: <cookie_header>` for requests to `url`.
    ///
    /// A stale rule holding the same id is replaced in the same update.
    pub async fn inject(
        &self,
        url: &str,
        cookie_header: &str,
    ) -> Result<CookieRuleHandle, HostError> {
        let rule_id = self.next_rule_id();
        let rule = DeclarativeRule {
            id: rule_id,
            priority: COOKIE_RULE_PRIORITY,
            action: RuleAction::ModifyHeaders {
                request_headers: vec![ModifyHeaderInfo {
                    header: "Cookie".to_string(),
                    operation: HeaderOperation::Set,
                    value: Some(cookie_header.to_string()),
                }],
            },
            condition: RuleCondition {
                url_filter: Some(url.to_string()),
                resource_types: Some(vec![ResourceType::Xmlhttprequest, ResourceType::Other]),
                ..Default::default()
            },
        };

        if let Err(e) = self
            .table
            .update_session_rules(vec![rule_id], vec![rule])
            .await
        {
            warn!("Failed to install cookie rule {} for {}: {}", rule_id, url, e);
            metrics::record_host_failure("update_session_rules");
            return Err(e);
        }
        debug!("Installed cookie rule {} for {}", rule_id, url);
        Ok(CookieRuleHandle { rule_id })
    }

    pub async fn release(&self, handle: CookieRuleHandle) -> Result<(), HostError> {
        self.table
            .update_session_rules(vec![handle.rule_id], Vec::new())
            .await?;
        debug!("Released cookie rule {}", handle.rule_id);
        Ok(())
    }

    /// Run `fut` with cookies injected for `url`, releasing the rule afterwards
    /// whatever the outcome of `fut`, including when this future is dropped
    /// before `fut` completes.
    ///
    /// A blank `cookie_header` runs `fut` without installing anything. Release
    /// failures are logged, not returned.
    pub async fn with_injected_cookies<F, T>(
        &self,
        url: &str,
        cookie_header: &str,
        fut: F,
    ) -> Result<T, HostError>
    where
        F: Future<Output = T>,
    {
        if cookie_header.trim().is_empty() {
            return Ok(fut.await);
        }

        let handle = self.inject(url, cookie_header).await?;
        let guard = ReleaseGuard {
            table: self.table.clone(),
            rule_id: handle.rule_id,
            armed: true,
        };
        let output = fut.await;
        if let Err(e) = self.release(handle).await {
            debug!("Cookie rule {} release failed: {}", handle.rule_id, e);
        }
        guard.disarm();
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostCall, RecordingHost};
    use std::time::Duration;

    fn injector(host: &Arc<RecordingHost>) -> CookieInjector {
        CookieInjector::new(host.clone(), &CookieRuleConfig::default())
    }

    #[tokio::test]
    async fn test_inject_installs_session_rule() {
        let host = Arc::new(RecordingHost::new());
        let injector = injector(&host);

        let handle = injector
            .inject("https://api.example.com/me", "sid=abc; theme=dark")
            .await
            .unwrap();
        assert_eq!(handle.rule_id, 900_001);

        let rules = host.session_rules();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.priority, 1);
        assert_eq!(
            rule.condition.url_filter.as_deref(),
            Some("https://api.example.com/me")
        );
        assert_eq!(
            rule.condition.resource_types,
            Some(vec![ResourceType::Xmlhttprequest, ResourceType::Other])
        );
        match &rule.action {
            RuleAction::ModifyHeaders { request_headers } => {
                assert_eq!(request_headers[0].header, "Cookie");
                assert_eq!(request_headers[0].operation, HeaderOperation::Set);
                assert_eq!(request_headers[0].value.as_deref(), Some("sid=abc; theme=dark"));
            }
            other => panic!("unexpected action {other:?}"),
        }

        // Stale id removal travels with the add
        assert!(host.calls().contains(&HostCall::UpdateSessionRules {
            remove: vec![900_001],
            add: vec![900_001],
        }));

        injector.release(handle).await.unwrap();
        assert!(host.session_rules().is_empty());
    }

    #[tokio::test]
    async fn test_ids_wrap_within_slots() {
        let host = Arc::new(RecordingHost::new());
        let config = CookieRuleConfig {
            base_id: 900_000,
            slots: 3,
        };
        let injector = CookieInjector::new(host.clone(), &config);

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(injector.inject("https://a", "x=1").await.unwrap().rule_id);
        }
        assert_eq!(ids, vec![900_001, 900_002, 900_000, 900_001]);
        // Reused id replaced the stale rule instead of failing
        assert_eq!(host.session_rules().len(), 3);
    }

    #[tokio::test]
    async fn test_with_injected_cookies_always_releases() {
        let host = Arc::new(RecordingHost::new());
        let injector = injector(&host);

        let result: Result<Result<u16, String>, HostError> = injector
            .with_injected_cookies("https://a", "sid=1", async {
                assert_eq!(host.session_rules().len(), 1);
                Err("network error".to_string())
            })
            .await;
        assert_eq!(result.unwrap(), Err("network error".to_string()));
        assert!(host.session_rules().is_empty());
    }

    #[tokio::test]
    async fn test_blank_cookie_header_skips_injection() {
        let host = Arc::new(RecordingHost::new());
        let injector = injector(&host);

        let value = injector
            .with_injected_cookies("https://a", "  ", async { 7 })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(host.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_request_still_releases() {
        let host = Arc::new(RecordingHost::new());
        let injector = injector(&host);

        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            injector.with_injected_cookies("https://a", "sid=1", std::future::pending::<()>()),
        )
        .await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(host.session_rules().is_empty());
    }

    #[tokio::test]
    async fn test_completed_request_releases_once() {
        let host = Arc::new(RecordingHost::new());
        let injector = injector(&host);

        injector
            .with_injected_cookies("https://a", "sid=1", async {})
            .await
            .unwrap();
        tokio::task::yield_now().await;
        let releases = host.count_calls(|c| {
            matches!(c, HostCall::UpdateSessionRules { add, .. } if add.is_empty())
        });
        assert_eq!(releases, 1);
    }

    #[tokio::test]
    async fn test_ids_saturate_at_top_of_range() {
        let host = Arc::new(RecordingHost::new());
        let config = CookieRuleConfig {
            base_id: u32::MAX - 1,
            slots: 3,
        };
        let injector = CookieInjector::new(host.clone(), &config);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(injector.inject("https://a", "x=1").await.unwrap().rule_id);
        }
        assert_eq!(ids, vec![u32::MAX, u32::MAX, u32::MAX - 1]);
    }
}
