//! URL matching for rule patterns.
//!
//! Pure functions: no state, no caching. A pattern that cannot be compiled
//! simply never matches.

use crate::config::{MatchOperator, MatchableRule};
use regex::{NoExpand, Regex, RegexBuilder};

/// Returns true if `url` matches `pattern` under `operator`.
///
/// A blank pattern never matches, whatever the operator.
pub fn matches(url: &str, pattern: &str, operator: MatchOperator) -> bool {
    if pattern.trim().is_empty() {
        return false;
    }

    match operator {
        MatchOperator::Contains => url.to_lowercase().contains(&pattern.to_lowercase()),
        MatchOperator::Equals => url == pattern,
        MatchOperator::Regex => match case_insensitive(pattern) {
            Some(re) => re.is_match(url),
            None => false,
        },
        MatchOperator::Wildcard => {
            let anchored = format!("^{}$", wildcard_to_regex(pattern));
            match case_insensitive(&anchored) {
                Some(re) => re.is_match(url),
                None => false,
            }
        }
    }
}

/// Replace the first span of `url` matched by `pattern` with `replacement`.
///
/// Used for "preserve path" redirects. `equals` has no partial span, so the
/// replacement is returned as-is; so is any pattern that fails to compile.
/// The replacement is inserted literally (`$1` is not expanded).
pub fn build_redirect_target(
    url: &str,
    pattern: &str,
    replacement: &str,
    operator: MatchOperator,
) -> String {
    let compiled = match operator {
        MatchOperator::Contains => case_insensitive(&regex::escape(pattern)),
        MatchOperator::Regex => case_insensitive(pattern),
        MatchOperator::Wildcard => case_insensitive(&wildcard_to_regex(pattern)),
        MatchOperator::Equals => None,
    };

    match compiled {
        Some(re) => re.replacen(url, 1, NoExpand(replacement)).into_owned(),
        None => replacement.to_string(),
    }
}

/// Translate a wildcard pattern into an unanchored regex source.
///
/// `*` is zero or more characters, `?` exactly one; everything else is literal.
pub fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() * 2);
    let mut buf = [0u8; 4];
    for c in pattern.chars() {
        match c {
            '*' => out.push_str("(.*)"),
            '?' => out.push_str("(.)"),
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    out
}

/// True if a `regex` operator pattern compiles. Used by the fast-path compiler
/// to skip rules the declarative layer would reject.
pub fn is_valid_regex(pattern: &str) -> bool {
    case_insensitive(pattern).is_some()
}

fn case_insensitive(source: &str) -> Option<Regex> {
    RegexBuilder::new(source).case_insensitive(true).build().ok()
}

/// First enabled rule (in list order) whose method filter and URL pattern both match.
pub fn find_matching_rule<'a, R: MatchableRule>(
    rules: &'a [R],
    url: &str,
    method: &str,
) -> Option<&'a R> {
    rules
        .iter()
        .filter(|r| r.is_enabled())
        .find(|r| r.match_spec().matches_request(url, method))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpMethod, InterceptAction, InterceptRule, MatchSpec};

    const ALL_OPERATORS: [MatchOperator; 4] = [
        MatchOperator::Contains,
        MatchOperator::Equals,
        MatchOperator::Regex,
        MatchOperator::Wildcard,
    ];

    #[test]
    fn test_empty_pattern_never_matches() {
        for op in ALL_OPERATORS {
            assert!(!matches("https://a.com/x", "", op), "{op:?} matched empty");
            assert!(!matches("https://a.com/x", "   ", op), "{op:?} matched blank");
            assert!(!matches("", "", op));
        }
    }

    #[test]
    fn test_contains() {
        assert!(matches("https://a.com/x", "a.com", MatchOperator::Contains));
        assert!(matches("https://A.COM/x", "a.com", MatchOperator::Contains));
        assert!(matches("https://a.com/x", "A.Com", MatchOperator::Contains));
        assert!(!matches("https://b.com/x", "a.com", MatchOperator::Contains));
    }

    #[test]
    fn test_equals_is_exact() {
        assert!(matches(
            "https://a.com/x",
            "https://a.com/x",
            MatchOperator::Equals
        ));
        assert!(!matches(
            "https://a.com/x/",
            "https://a.com/x",
            MatchOperator::Equals
        ));
        assert!(!matches(
            "https://A.com/x",
            "https://a.com/x",
            MatchOperator::Equals
        ));
    }

    #[test]
    fn test_regex() {
        assert!(matches(
            "https://api.example.com/v2/users",
            r"/v\d+/users",
            MatchOperator::Regex
        ));
        assert!(matches(
            "https://API.example.com/",
            "^https://api\\.",
            MatchOperator::Regex
        ));
        assert!(!matches(
            "https://example.com/users",
            r"/v\d+/users",
            MatchOperator::Regex
        ));
    }

    #[test]
    fn test_invalid_regex_never_matches() {
        assert!(!matches("https://a.com/(", "(", MatchOperator::Regex));
        assert!(!matches("anything", "[unclosed", MatchOperator::Regex));
        assert!(!is_valid_regex("[unclosed"));
        assert!(is_valid_regex("^https://.*"));
    }

    #[test]
    fn test_wildcard() {
        assert!(matches(
            "https://api.example.com/v1",
            "*api.example.com*",
            MatchOperator::Wildcard
        ));
        assert!(!matches(
            "https://example.com/v1",
            "*api.example.com*",
            MatchOperator::Wildcard
        ));
        // Anchored at both ends
        assert!(!matches(
            "https://api.example.com/v1",
            "api.example.com*",
            MatchOperator::Wildcard
        ));
        // ? is exactly one character
        assert!(matches(
            "https://a.com/v1",
            "https://a.com/v?",
            MatchOperator::Wildcard
        ));
        assert!(!matches(
            "https://a.com/v12",
            "https://a.com/v?",
            MatchOperator::Wildcard
        ));
        // Dots are literal
        assert!(!matches(
            "https://aXcom/",
            "https://a.com/",
            MatchOperator::Wildcard
        ));
        // Case-insensitive
        assert!(matches(
            "HTTPS://A.COM/",
            "https://a.com/*",
            MatchOperator::Wildcard
        ));
    }

    #[test]
    fn test_wildcard_escapes_metacharacters() {
        assert!(matches(
            "https://a.com/search?q=(x)+[y]",
            "*q=(x)+[y]",
            MatchOperator::Wildcard
        ));
    }

    #[test]
    fn test_redirect_preserves_rest_of_url() {
        assert_eq!(
            build_redirect_target("https://h/old/tail", "old", "new", MatchOperator::Contains),
            "https://h/new/tail"
        );
        // Only the first occurrence is replaced
        assert_eq!(
            build_redirect_target("https://h/old/old", "OLD", "new", MatchOperator::Contains),
            "https://h/new/old"
        );
    }

    #[test]
    fn test_redirect_regex_and_wildcard() {
        assert_eq!(
            build_redirect_target(
                "https://prod.example.com/api/v1",
                r"prod\.example\.com",
                "localhost:3000",
                MatchOperator::Regex
            ),
            "https://localhost:3000/api/v1"
        );
        assert_eq!(
            build_redirect_target(
                "https://prod.example.com/api/v1",
                "prod.*.com",
                "staging.test",
                MatchOperator::Wildcard
            ),
            "https://staging.test/api/v1"
        );
    }

    #[test]
    fn test_redirect_replacement_is_literal() {
        assert_eq!(
            build_redirect_target("https://h/old", "old", "$1new", MatchOperator::Contains),
            "https://h/$1new"
        );
    }

    #[test]
    fn test_redirect_fallbacks() {
        assert_eq!(
            build_redirect_target("https://h/old", "https://h/old", "https://h2", MatchOperator::Equals),
            "https://h2"
        );
        assert_eq!(
            build_redirect_target("https://h/old", "(", "https://fallback", MatchOperator::Regex),
            "https://fallback"
        );
    }

    #[test]
    fn test_find_matching_rule_first_enabled_in_list_order() {
        let mut disabled = InterceptRule::new(
            "disabled",
            MatchSpec::new(MatchOperator::Contains, "api"),
            InterceptAction::block(),
        );
        disabled.enabled = false;
        let mut post_only = InterceptRule::new(
            "post-only",
            MatchSpec::new(MatchOperator::Contains, "api").with_methods(vec![HttpMethod::Post]),
            InterceptAction::block(),
        );
        post_only.order = -10;
        let first = InterceptRule::new(
            "first",
            MatchSpec::new(MatchOperator::Contains, "api"),
            InterceptAction::delay_only(10),
        );
        let second = InterceptRule::new(
            "second",
            MatchSpec::new(MatchOperator::Contains, "api"),
            InterceptAction::block(),
        );
        let rules = vec![disabled, post_only, first, second];

        let hit = find_matching_rule(&rules, "https://x/api", "GET").unwrap();
        assert_eq!(hit.id, "first");

        let hit = find_matching_rule(&rules, "https://x/api", "POST").unwrap();
        assert_eq!(hit.id, "post-only");

        assert!(find_matching_rule(&rules, "https://x/other", "GET").is_none());
    }
}
