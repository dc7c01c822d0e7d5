//! OAuth2 token lifecycle: storage, exchange, and refresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use medbridge_core::{CrmConfig, Result, SyncError};
pub use medbridge_core::TokenStore;

use crate::types::TokenResponse;

const ACCESS_TOKEN_KEY: &str = "crm:access_token";
const REFRESH_TOKEN_KEY: &str = "crm:refresh_token";

/// Access tokens are considered stale this long before the server-reported
/// expiry, so a token never dies mid-request.
const EXPIRY_MARGIN_SECS: u64 = 300;

/// Process-local token store. Sufficient for a single long-running service;
/// tokens are re-seeded from configuration after a restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, Some(deadline))) if Instant::now() >= *deadline => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }
}

/// Owns the OAuth2 flow against the CRM token endpoint.
///
/// All refreshes are serialized through an internal lock, so concurrent
/// 401s from parallel requests produce one refresh, not a stampede that
/// invalidates its own tokens.
pub struct TokenManager {
    http: reqwest::Client,
    config: CrmConfig,
    store: Arc<dyn TokenStore>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(http: reqwest::Client, config: CrmConfig, store: Arc<dyn TokenStore>) -> Self {
        Self {
            http,
            config,
            store,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Seed the store from the bootstrap tokens in configuration, if the
    /// store has no refresh token yet. Called once at startup.
    pub async fn load(&self) -> Result<()> {
        if self.store.get(REFRESH_TOKEN_KEY).await?.is_some() {
            debug!("token store already holds a refresh token");
            return Ok(());
        }
        let Some(refresh) = self.config.refresh_token.as_deref() else {
            warn!("no stored or bootstrap refresh token; run the auth command before syncing");
            return Ok(());
        };
        self.store.set(REFRESH_TOKEN_KEY, refresh, None).await?;
        if let Some(access) = self.config.access_token.as_deref() {
            // Bootstrap access tokens have unknown remaining lifetime; store
            // without TTL and let the first 401 force a refresh.
            self.store.set(ACCESS_TOKEN_KEY, access, None).await?;
        }
        info!("seeded token store from bootstrap configuration");
        Ok(())
    }

    /// Current access token, refreshing through the OAuth endpoint if the
    /// stored one has expired.
    pub async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.store.get(ACCESS_TOKEN_KEY).await? {
            return Ok(token);
        }
        self.refresh().await
    }

    /// Exchange an authorization code for a token pair (initial setup).
    pub async fn exchange_code(&self, code: &str) -> Result<()> {
        let body = serde_json::json!({
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret,
            "grant_type": "authorization_code",
            "code": code,
            "redirect_uri": self.config.redirect_uri,
        });
        let tokens = self.token_request(&body).await?;
        self.store_pair(&tokens).await?;
        info!("exchanged authorization code for token pair");
        Ok(())
    }

    /// Refresh the token pair and return the new access token.
    pub async fn refresh(&self) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while this one waited.
        if let Some(token) = self.store.get(ACCESS_TOKEN_KEY).await? {
            return Ok(token);
        }
        self.force_refresh().await
    }

    /// Refresh unconditionally, discarding any stored access token. Used
    /// when the server has already rejected the current token.
    pub async fn force_refresh(&self) -> Result<String> {
        let refresh_token = self
            .store
            .get(REFRESH_TOKEN_KEY)
            .await?
            .or_else(|| self.config.refresh_token.clone())
            .ok_or_else(|| {
                SyncError::Auth("no refresh token available; run the auth flow first".to_string())
            })?;

        let body = serde_json::json!({
            "client_id": self.config.client_id,
            "client_secret": self.config.client_secret,
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        });
        let tokens = self.token_request(&body).await?;
        let access = tokens.access_token.clone();
        self.store_pair(&tokens).await?;
        info!(expires_in = tokens.expires_in, "refreshed access token");
        Ok(access)
    }

    async fn token_request(&self, body: &serde_json::Value) -> Result<TokenResponse> {
        let response = self
            .http
            .post(self.config.oauth_url())
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Transport {
                message: "token endpoint unreachable".to_string(),
                source: Some(Box::new(e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "token request rejected");
            return Err(SyncError::Auth(format!(
                "token request failed with status {status}: {body}"
            )));
        }
        response.json().await.map_err(|e| SyncError::Transport {
            message: "malformed token response".to_string(),
            source: Some(Box::new(e)),
        })
    }

    async fn store_pair(&self, tokens: &TokenResponse) -> Result<()> {
        let ttl_secs = (tokens.expires_in as u64).saturating_sub(EXPIRY_MARGIN_SECS);
        self.store
            .set(
                ACCESS_TOKEN_KEY,
                &tokens.access_token,
                Some(Duration::from_secs(ttl_secs)),
            )
            .await?;
        self.store
            .set(REFRESH_TOKEN_KEY, &tokens.refresh_token, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn memory_store_expires_entries() {
        let store = MemoryTokenStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_store_keeps_entries_without_ttl() {
        let store = MemoryTokenStore::new();
        store.set("refresh", "r1", None).await.unwrap();
        assert_eq!(store.get("refresh").await.unwrap().as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn load_seeds_bootstrap_tokens_once() {
        let config = CrmConfig {
            subdomain: "clinic".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            redirect_uri: "http://localhost:8080/callback".into(),
            access_token: Some("boot-access".into()),
            refresh_token: Some("boot-refresh".into()),
            base_url_override: None,
            oauth_url_override: None,
        };
        let store = Arc::new(MemoryTokenStore::new());
        let manager = TokenManager::new(reqwest::Client::new(), config, store.clone());

        manager.load().await.unwrap();
        assert_eq!(
            store.get(REFRESH_TOKEN_KEY).await.unwrap().as_deref(),
            Some("boot-refresh")
        );

        // A second load must not clobber rotated tokens.
        store.set(REFRESH_TOKEN_KEY, "rotated", None).await.unwrap();
        manager.load().await.unwrap();
        assert_eq!(
            store.get(REFRESH_TOKEN_KEY).await.unwrap().as_deref(),
            Some("rotated")
        );
    }
}
