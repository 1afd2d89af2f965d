//! Paginated market-order ingest (spec.md §4.5.1, §4.5.3).
//!
//! Pagination and error-budget shape follow
//! `cooprefr-bettersys::scrapers::dome_rest`'s paginated-search style
//! (loop on a page counter, bail on a bounded error count) and
//! `original_source/esi_requests.py::fetch_market_orders`'s `X-Pages`-driven
//! loop bound and 3-consecutive-failure give-up.

use crate::auth::AccessToken;
use crate::config::EsiConfig;
use crate::error::CoreError;
use crate::ingest::http::{build_client, common_headers, read_error_limit_remain, read_etag, read_retry_after, read_x_pages};
use crate::ingest::ratelimit::Backoff;
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

const ERROR_BUDGET: u32 = 3;

/// Result of a conditional paginated fetch, per spec.md §6's `304 Not
/// Modified` contract: "treated as 'no change'; skip writes for that fetch".
#[derive(Debug)]
pub enum OrderFetchOutcome {
    /// The ETag sent still matches; the caller must leave its prior
    /// snapshot untouched and perform no writes.
    Unchanged,
    /// A fresh page set, plus the `ETag` to send as `If-None-Match` on the
    /// next fetch of this same resource (`None` when upstream didn't send one).
    Fetched {
        orders: Vec<RawMarketOrder>,
        etag: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawMarketOrder {
    pub order_id: i64,
    pub is_buy_order: bool,
    pub type_id: i64,
    pub duration: i64,
    pub issued: String,
    pub price: f64,
    pub volume_remain: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Sell,
    Buy,
    All,
}

impl OrderType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Sell => "sell",
            Self::Buy => "buy",
            Self::All => "all",
        }
    }
}

/// Fetches every page of `GET /markets/structures/{structure_id}`
/// (authenticated, primary source), per spec.md §4.5.1. `prior_etag` is the
/// `ETag` persisted from the previous fetch of this same structure, sent as
/// `If-None-Match`; a `304` response yields `OrderFetchOutcome::Unchanged`.
pub async fn fetch_structure_orders(
    esi: &EsiConfig,
    structure_id: i64,
    token: &AccessToken,
    prior_etag: Option<&str>,
    debug_dump_path: Option<&Path>,
) -> Result<OrderFetchOutcome, CoreError> {
    let url = esi.market_orders_structure_url(structure_id);
    fetch_paginated(esi, &url, &[], Some(token), prior_etag, debug_dump_path).await
}

/// Fetches every page of `GET /markets/{region_id}/orders` (unauthenticated,
/// secondary source), per spec.md §4.5.3. See `fetch_structure_orders` for
/// the `prior_etag`/`304` contract.
pub async fn fetch_region_orders(
    esi: &EsiConfig,
    region_id: i64,
    order_type: OrderType,
    prior_etag: Option<&str>,
) -> Result<OrderFetchOutcome, CoreError> {
    let url = esi.market_orders_region_url(region_id);
    let query = [("order_type", order_type.as_str())];
    fetch_paginated(esi, &url, &query, None, prior_etag, None).await
}

async fn fetch_paginated(
    esi: &EsiConfig,
    url: &str,
    query: &[(&str, &str)],
    token: Option<&AccessToken>,
    prior_etag: Option<&str>,
    debug_dump_path: Option<&Path>,
) -> Result<OrderFetchOutcome, CoreError> {
    let client = build_client().map_err(|e| CoreError::TransientFetch(e.to_string()))?;

    let mut page = 1u32;
    let mut max_pages = 1u32;
    let mut orders = Vec::new();
    let mut consecutive_failures = 0u32;
    let mut backoff = Backoff::new();
    let mut raw_bodies = Vec::new();
    let mut new_etag = None;

    while page <= max_pages {
        // The conditional request only makes sense against the first page:
        // that's the one response whose ETag is persisted and re-sent.
        let etag_for_request = if page == 1 { prior_etag } else { None };
        let headers = common_headers(esi, etag_for_request, token);
        let mut req = client.get(url).headers(headers).query(query);
        req = req.query(&[("page", page.to_string())]);

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures > ERROR_BUDGET {
                    return Err(CoreError::PermanentFetch(format!(
                        "{url}: transport error budget exhausted: {e}"
                    )));
                }
                match backoff.next_delay() {
                    Some(d) => {
                        tokio::time::sleep(d).await;
                        continue;
                    }
                    None => {
                        return Err(CoreError::PermanentFetch(format!(
                            "{url}: backoff budget exhausted: {e}"
                        )))
                    }
                }
            }
        };

        let status = resp.status();

        if page == 1 && status.as_u16() == 304 {
            info!(url, "304 Not Modified, no change since last fetch");
            return Ok(OrderFetchOutcome::Unchanged);
        }

        if status.as_u16() == 429 {
            let wait = read_retry_after(&resp).or_else(|| backoff.next_delay());
            match wait {
                Some(d) => {
                    warn!(url, seconds = d.as_secs(), "429 received, sleeping");
                    tokio::time::sleep(d).await;
                    continue;
                }
                None => return Err(CoreError::PermanentFetch(format!("{url}: rate limited past backoff budget"))),
            }
        }

        if status.is_server_error() {
            consecutive_failures += 1;
            if consecutive_failures > ERROR_BUDGET {
                return Err(CoreError::PermanentFetch(format!(
                    "{url}: server error budget exhausted, last status {status}"
                )));
            }
            if let Some(d) = backoff.next_delay() {
                tokio::time::sleep(d).await;
                continue;
            }
            return Err(CoreError::PermanentFetch(format!("{url}: 5xx past backoff budget")));
        }

        if status.is_client_error() {
            return Err(CoreError::PermanentFetch(format!(
                "{url}: permanent client error {status}"
            )));
        }

        consecutive_failures = 0;
        backoff = Backoff::new();
        // X-Pages may change mid-run; honour the latest value (spec.md §4.5.1).
        max_pages = read_x_pages(&resp);
        let error_limit_remain = read_error_limit_remain(&resp);
        if page == 1 {
            new_etag = read_etag(&resp);
        }

        let body = resp
            .text()
            .await
            .map_err(|e| CoreError::TransientFetch(format!("{url}: body read failed: {e}")))?;
        let page_orders: Vec<RawMarketOrder> = serde_json::from_str(&body)
            .map_err(|e| CoreError::PermanentFetch(format!("{url}: malformed page {page} body: {e}")))?;
        raw_bodies.push(body);
        orders.extend(page_orders);

        info!(url, page, max_pages, error_limit_remain = ?error_limit_remain, rows = orders.len(), "fetched order page");
        page += 1;
    }

    if let Some(path) = debug_dump_path {
        let combined = format!("[{}]", raw_bodies.join(","));
        let _ = std::fs::write(path, combined);
    }

    Ok(OrderFetchOutcome::Fetched { orders, etag: new_etag })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_type_query_values_match_spec() {
        assert_eq!(OrderType::Sell.as_str(), "sell");
        assert_eq!(OrderType::Buy.as_str(), "buy");
        assert_eq!(OrderType::All.as_str(), "all");
    }
}
