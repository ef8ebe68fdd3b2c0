//! CORS headers for mocked responses.

use super::headers::Headers;
use crate::config::KeyValuePair;

const ALLOW_METHODS: &str = "GET, POST, PUT, DELETE, PATCH, OPTIONS, HEAD";
const PREFLIGHT_MAX_AGE: &str = "86400";

/// The request's `Origin`, or `*` when it has none.
fn request_origin(request_headers: &Headers) -> &str {
    request_headers
        .get_ignore_case("Origin")
        .filter(|o| !o.is_empty())
        .unwrap_or("*")
}

/// Response headers for a synthetic `204` answer to a CORS preflight.
pub fn preflight_headers(request_headers: &Headers) -> Headers {
    let allow_headers = request_headers
        .get_ignore_case("Access-Control-Request-Headers")
        .filter(|h| !h.is_empty())
        .unwrap_or("*");

    [
        ("Access-Control-Allow-Origin", request_origin(request_headers)),
        ("Access-Control-Allow-Methods", ALLOW_METHODS),
        ("Access-Control-Allow-Headers", allow_headers),
        ("Access-Control-Allow-Credentials", "true"),
        ("Access-Control-Max-Age", PREFLIGHT_MAX_AGE),
    ]
    .into_iter()
    .collect()
}

/// Mock response headers: permissive CORS defaults the user did not set
/// (checked case-insensitively), followed by the user's enabled headers.
pub fn mock_response_headers(request_headers: &Headers, user_headers: &[KeyValuePair]) -> Headers {
    let user: Headers = user_headers
        .iter()
        .filter(|h| h.enabled)
        .map(|h| (h.key.as_str(), h.value.as_str()))
        .collect();

    let defaults = [
        ("Access-Control-Allow-Origin", request_origin(request_headers)),
        ("Access-Control-Allow-Methods", ALLOW_METHODS),
        ("Access-Control-Allow-Headers", "*"),
        ("Access-Control-Allow-Credentials", "true"),
        ("Access-Control-Expose-Headers", "*"),
    ];

    let mut headers: Headers = defaults
        .into_iter()
        .filter(|(name, _)| !user.contains_ignore_case(name))
        .collect();
    headers.extend(user);
    headers
}
