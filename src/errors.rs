//! Global WeCom/WeChat errcode helpers for credential-related failures
//!
//! Purpose
//! - Map well-known errcode values returned by token and suite endpoints to categories and hints
//! - Tell callers when a provider error means "force a token refresh, then retry once"
//!
//! Notes
//! - Always make program logic depend on `errcode` rather than `errmsg`.
//! - Unknown codes are categorized as `Unknown` with a conservative policy: no retry,
//!   no token refresh recommendation.

/// High-level classification for an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Success (errcode = 0)
    Success,
    /// Temporary/system busy (retryable)
    TemporarySystem,
    /// Credential problem that a fresh token fixes
    TokenExpired,
    /// Wrong ids/secrets/tickets; refreshing will not help
    Credential,
    /// Rate limit or quota
    Limit,
    /// Caller not allowed (ip whitelist, missing authorization)
    Forbidden,
    /// Unknown/Uncategorized
    Unknown,
}

/// Classify errcode into a category.
pub fn category_for(code: i64) -> ErrorCategory {
    match code {
        0 => ErrorCategory::Success,
        -1 => ErrorCategory::TemporarySystem,
        40014 | 40082 | 42001 | 42009 => ErrorCategory::TokenExpired,
        40001 | 40013 | 40083 | 40084 | 40085 | 40086 | 40125 => ErrorCategory::Credential,
        45009 | 45033 => ErrorCategory::Limit,
        48001 | 60020 => ErrorCategory::Forbidden,
        _ => ErrorCategory::Unknown,
    }
}

/// Returns a friendly hint for a known errcode.
pub fn hint_for(code: i64) -> &'static str {
    match code {
        -1 => "System busy; retry with backoff.",
        0 => "Success.",
        40001 => "Invalid secret or token; verify the secret matches the id it is paired with.",
        40013 => "Invalid corpid; corp ids start with 'ww'.",
        40014 => "Invalid access_token; force a refresh and retry once.",
        40082 => "Invalid suite_access_token; force a refresh and retry once.",
        40083 => "Invalid suite_id; check the suite configuration.",
        40084 => "Invalid permanent_code; the authorization may have been revoked.",
        40085 => {
            "Invalid suite_ticket; wait for the next suite_ticket push (every 10 minutes) before refreshing."
        }
        40086 => "Invalid third-party app id.",
        40125 => "Invalid secret; do not mix OA/MP appsecret with WeCom ids.",
        42001 => "access_token expired; force a refresh and retry once.",
        42009 => "suite_access_token expired; force a refresh and retry once.",
        45009 => "API call frequency limit exceeded; slow down and cache tokens.",
        45033 => "Concurrent call limit exceeded; reduce parallelism.",
        48001 => "API not authorized for this app.",
        60020 => "Caller IP not in the trusted list; update the allow-list in the admin console.",
        _ => "Unknown code; refer to official docs and logs for details.",
    }
}

/// Whether to refresh/reacquire the token for this code.
pub fn should_refresh_token(code: i64) -> bool {
    matches!(category_for(code), ErrorCategory::TokenExpired)
}

/// Return true if this error looks temporary (safe to retry with backoff).
pub fn is_temporary(code: i64) -> bool {
    matches!(category_for(code), ErrorCategory::TemporarySystem)
}

/// Produce a concise, human-readable explanation string.
pub fn explain(errcode: i64, errmsg: &str) -> String {
    let mut parts = vec![
        format!("errcode={} ({:?})", errcode, category_for(errcode)),
        format!("hint: {}", hint_for(errcode)),
    ];
    if should_refresh_token(errcode) {
        parts.push("refresh_token: yes".to_string());
    } else {
        parts.push("refresh_token: no".to_string());
    }
    if !errmsg.is_empty() {
        parts.push(format!("errmsg: {}", errmsg));
    }
    parts.join(" | ")
}
