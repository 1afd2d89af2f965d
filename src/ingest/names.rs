//! Batched name resolution (spec.md §6, `POST /universe/names/`).
//!
//! Market orders and history records carry raw `type_id`s that must be
//! joined to `type_name` before they match the schema in spec.md §3; this
//! module is that join. Chunking at 1000 ids follows the same
//! chunked-pagination texture as `cooprefr-bettersys::scrapers::dome_rest`,
//! and the join itself is grounded in
//! `original_source/utils.py::get_type_names_from_esi`.

use crate::config::EsiConfig;
use crate::error::CoreError;
use crate::ingest::http::{build_client, common_headers};
use serde::Deserialize;
use std::collections::HashMap;

const CHUNK_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
struct ResolvedName {
    id: i64,
    name: String,
}

/// Resolves every id in `ids` to its display name, chunked at 1000 ids per
/// request. Ids the upstream doesn't recognise are simply absent from the
/// returned map.
pub async fn resolve_names(esi: &EsiConfig, ids: &[i64]) -> Result<HashMap<i64, String>, CoreError> {
    let client = build_client().map_err(|e| CoreError::TransientFetch(e.to_string()))?;
    let url = esi.universe_names_url();
    let headers = common_headers(esi, None, None);

    let mut out = HashMap::with_capacity(ids.len());
    for chunk in ids.chunks(CHUNK_SIZE) {
        let resp = client
            .post(&url)
            .headers(headers.clone())
            .json(chunk)
            .send()
            .await
            .map_err(|e| CoreError::TransientFetch(format!("POST /universe/names/: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::PermanentFetch(format!(
                "POST /universe/names/ returned {}",
                resp.status()
            )));
        }

        let resolved: Vec<ResolvedName> = resp
            .json()
            .await
            .map_err(|e| CoreError::PermanentFetch(format!("malformed names response: {e}")))?;

        for entry in resolved {
            out.insert(entry.id, entry.name);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_respects_the_thousand_id_cap() {
        let ids: Vec<i64> = (0..2500).collect();
        let chunks: Vec<_> = ids.chunks(CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[2].len(), 500);
    }
}
