use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

/// Header carrying the shared secret of the event bridge
pub const RELAY_SECRET_HEADER: &str = "x-relay-secret";

/// Header carrying the admin API key for link management
pub const API_KEY_HEADER: &str = "x-api-key";

/// Constant-time string comparison to prevent timing attacks
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// True if `header` is present and matches `expected`. An empty expected
/// value never matches.
pub fn header_matches(headers: &HeaderMap, header: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    headers
        .get(header)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|provided| constant_time_compare(provided, expected))
}
