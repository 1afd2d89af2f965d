//! Shared HTTP client construction and header plumbing for the Ingest Client.
//!
//! Client construction follows `cooprefr-bettersys::scrapers::dome_rest::DomeRestClient::new`
//! (timeout, pool tuning, default headers built once). Headers themselves
//! are the set spec.md §6 names.

use crate::auth::AccessToken;
use crate::config::EsiConfig;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Client;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
}

/// Builds the common request headers, per spec.md §6. `etag` is the
/// previously-seen `ETag` for conditional requests; `token` is present only
/// for authenticated endpoints.
pub fn common_headers(esi: &EsiConfig, etag: Option<&str>, token: Option<&AccessToken>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("Accept", HeaderValue::from_static("application/json"));
    headers.insert("Accept-Language", HeaderValue::from_static("en"));
    headers.insert(
        "X-Compatibility-Date",
        HeaderValue::from_str(&esi.compatibility_date).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(
        "X-Tenant",
        HeaderValue::from_str(&esi.tenant).unwrap_or_else(|_| HeaderValue::from_static("tranquility")),
    );
    headers.insert(
        "User-Agent",
        HeaderValue::from_str(&esi.user_agent).unwrap_or_else(|_| HeaderValue::from_static("mkts-core")),
    );
    if let Some(etag) = etag {
        if let Ok(v) = HeaderValue::from_str(etag) {
            headers.insert("If-None-Match", v);
        }
    }
    if let Some(token) = token {
        if let Ok(v) = HeaderValue::from_str(&token.bearer_header()) {
            headers.insert(reqwest::header::AUTHORIZATION, v);
        }
    }
    headers
}

/// `X-Pages` response header, defaulting to 1 when absent (single-page response).
pub fn read_x_pages(resp: &reqwest::Response) -> u32 {
    resp.headers()
        .get("X-Pages")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(1)
}

pub fn read_etag(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `X-Esi-Error-Limit-Remain` response header: remaining error budget before
/// the upstream starts throttling, per spec.md §6.
pub fn read_error_limit_remain(resp: &reqwest::Response) -> Option<u32> {
    resp.headers()
        .get("X-Esi-Error-Limit-Remain")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

pub fn read_retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_carry_the_configured_compatibility_date() {
        let esi = EsiConfig {
            base_url: "https://example.invalid".into(),
            compatibility_date: "2025-08-26".into(),
            user_agent: "mkts-core/0.1".into(),
            tenant: "tranquility".into(),
        };
        let headers = common_headers(&esi, None, None);
        assert_eq!(
            headers.get("X-Compatibility-Date").unwrap(),
            "2025-08-26"
        );
        assert!(!headers.contains_key(reqwest::header::AUTHORIZATION));
    }
}
