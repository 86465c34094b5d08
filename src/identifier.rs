//! Resolution of the caller identity that quotas are tracked against.

use axum::http::HeaderMap;

/// Shared bucket for callers with no usable identity.
pub const ANONYMOUS: &str = "anonymous";

pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
pub const REAL_IP_HEADER: &str = "x-real-ip";

/// Derive a stable identifier for the caller.
///
/// Precedence, first match wins:
/// 1. a non-empty `user_id` gives `user:{user_id}`
/// 2. the first comma-separated token of `forwarded_for`, trimmed, gives `ip:{token}`
/// 3. a non-empty `real_ip` gives `ip:{real_ip}`
/// 4. otherwise [`ANONYMOUS`]
pub fn resolve_identifier(
    user_id: Option<&str>,
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
) -> String {
    if let Some(user_id) = user_id.filter(|id| !id.is_empty()) {
        return format!("user:{}", user_id);
    }

    let first_hop = forwarded_for
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = first_hop {
        return format!("ip:{}", ip);
    }

    if let Some(ip) = real_ip.filter(|ip| !ip.is_empty()) {
        return format!("ip:{}", ip);
    }

    ANONYMOUS.to_string()
}

/// [`resolve_identifier`] over the forwarding headers of a request.
///
/// Header values that are not valid UTF-8 are treated as absent.
pub fn identifier_from_headers(user_id: Option<&str>, headers: &HeaderMap) -> String {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    resolve_identifier(user_id, header(FORWARDED_FOR_HEADER), header(REAL_IP_HEADER))
}

/// Storage key of the bucket for `identifier` under `policy`.
pub fn bucket_key(policy: &str, identifier: &str) -> String {
    format!("{}:{}", policy, identifier)
}
