//! Credential Store (spec.md §4.2).
//!
//! Grounded in `original_source/ESI_OAUTH_FLOW.py`: `load_cached_token`,
//! `save_token` (which stamps `expires_at = now + expires_in` at save time,
//! not re-derived at load time), and `get_token`'s two branches — bootstrap
//! from `REFRESH_TOKEN` when no cache exists, otherwise auto-refresh once
//! `expires_at` has passed. Atomic persistence follows the
//! write-temp-then-rename pattern used for sidecar files in
//! `store::replicated`.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub expires_at: u64,
    pub token_type: String,
    pub scope: String,
}

impl AccessToken {
    pub fn is_expired(&self, now_unix: u64) -> bool {
        self.expires_at <= now_unix
    }

    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// OAuth2 client-credentials+refresh-token identity for authenticated calls.
pub struct CredentialStore {
    token_path: PathBuf,
    client_id: String,
    secret_key: String,
    bootstrap_refresh_token: String,
    http: reqwest::Client,
    token_url: String,
}

impl CredentialStore {
    pub fn new(
        token_path: impl Into<PathBuf>,
        client_id: String,
        secret_key: String,
        bootstrap_refresh_token: String,
        token_url: String,
    ) -> Self {
        Self {
            token_path: token_path.into(),
            client_id,
            secret_key,
            bootstrap_refresh_token,
            http: reqwest::Client::new(),
            token_url,
        }
    }

    /// Loads the cached token if present and still valid; otherwise
    /// refreshes (bootstrapping from the env-provided refresh token if no
    /// cache exists at all), persists the result, and returns it.
    pub async fn get_token(&self, requested_scope: &str) -> CoreResult<AccessToken> {
        if let Some(cached) = self.load_cached() {
            if !cached.is_expired(now_unix()) {
                return Ok(cached);
            }
            return self.refresh(&cached.refresh_token, requested_scope).await;
        }
        self.refresh(&self.bootstrap_refresh_token, requested_scope).await
    }

    fn load_cached(&self) -> Option<AccessToken> {
        let contents = std::fs::read_to_string(&self.token_path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    async fn refresh(&self, refresh_token: &str, requested_scope: &str) -> CoreResult<AccessToken> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
            refresh_token: String,
            expires_in: u64,
            token_type: String,
            #[serde(default)]
            scope: Option<String>,
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let resp = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.secret_key))
            .form(&params)
            .send()
            .await
            .map_err(|e| CoreError::Auth(format!("token refresh request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(CoreError::Auth(format!(
                "token refresh rejected: HTTP {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::Auth(format!("token refresh response malformed: {e}")))?;

        let token = AccessToken {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_in: body.expires_in,
            expires_at: now_unix() + body.expires_in,
            token_type: body.token_type,
            scope: body.scope.unwrap_or_else(|| requested_scope.to_string()),
        };

        self.save(&token)?;
        info!(expires_in = token.expires_in, "refreshed access token");
        Ok(token)
    }

    fn save(&self, token: &AccessToken) -> CoreResult<()> {
        atomic_write_json(&self.token_path, token)
            .map_err(|e| CoreError::Auth(format!("persist token: {e}")))
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_expiry_is_checked_against_absolute_timestamp() {
        let token = AccessToken {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_in: 1200,
            expires_at: 1_000_000,
            token_type: "Bearer".into(),
            scope: "esi-markets.structure_markets.v1".into(),
        };
        assert!(token.is_expired(1_000_001));
        assert!(!token.is_expired(999_999));
    }

    #[test]
    fn cached_token_round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let token = AccessToken {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_in: 1200,
            expires_at: now_unix() + 1200,
            token_type: "Bearer".into(),
            scope: "esi-markets.structure_markets.v1".into(),
        };
        atomic_write_json(&path, &token).unwrap();

        let store = CredentialStore::new(
            path,
            "client".into(),
            "secret".into(),
            "bootstrap".into(),
            "https://login.eveonline.com/v2/oauth/token".into(),
        );
        let loaded = store.load_cached().unwrap();
        assert_eq!(loaded.access_token, "a");
    }
}
