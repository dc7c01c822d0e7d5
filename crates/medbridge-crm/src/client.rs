//! HTTP client for the CRM REST API.
//!
//! Every request flows through the same pipeline: rate-limiter slot, bearer
//! token, send. A 401 response triggers exactly one token refresh and one
//! retry; a second 401 is a configuration problem, not a transient, and is
//! surfaced as [`SyncError::Auth`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use medbridge_core::{CrmConfig, RateLimitSettings, Result, SyncError};

use crate::rate_limit::RateLimiter;
use crate::token::TokenManager;
use crate::types::{
    Contact, ContactDraft, ContactsPage, CustomFieldDef, CustomFieldsPage, Deal, DealDraft,
    DealsPage, EntityKind,
};

/// Counters for the `stats` CLI command and for pass-level logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub requests: u64,
    pub auth_retries: u64,
}

/// Everything the sync engine needs from the CRM, behind a trait so tests
/// can swap in an in-memory double.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Full-text search over contacts. An empty result is `Ok(vec![])`.
    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>>;

    /// Full-text search over deals.
    async fn search_deals(&self, query: &str) -> Result<Vec<Deal>>;

    /// All deals linked to a contact, fully hydrated.
    async fn contact_deals(&self, contact_id: i64) -> Result<Vec<Deal>>;

    /// Create a contact; returns its id.
    async fn create_contact(&self, draft: &ContactDraft) -> Result<i64>;

    /// Patch an existing contact; `draft.id` must be set.
    async fn update_contact(&self, draft: &ContactDraft) -> Result<()>;

    /// Create a deal; returns its id.
    async fn create_deal(&self, draft: &DealDraft) -> Result<i64>;

    /// Patch an existing deal; `draft.id` must be set.
    async fn update_deal(&self, draft: &DealDraft) -> Result<()>;

    /// Custom field definitions for one entity collection.
    async fn list_custom_fields(&self, entity: EntityKind) -> Result<Vec<CustomFieldDef>>;

    fn stats(&self) -> ClientStats;
}

pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    limiter: RateLimiter,
    requests: AtomicU64,
    auth_retries: AtomicU64,
}

impl CrmClient {
    pub fn new(
        http: reqwest::Client,
        config: &CrmConfig,
        rate_limit: &RateLimitSettings,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            http,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            tokens,
            limiter: RateLimiter::new(rate_limit),
            requests: AtomicU64::new(0),
            auth_retries: AtomicU64::new(0),
        }
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
        token: &str,
    ) -> Result<reqwest::Response> {
        self.limiter.acquire().await;
        self.requests.fetch_add(1, Ordering::Relaxed);
        let url = format!("{}/{}", self.base_url, path);
        let mut request = self.http.request(method.clone(), &url).bearer_auth(token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        request.send().await.map_err(|e| SyncError::Transport {
            message: format!("request to {path} failed"),
            source: Some(Box::new(e)),
        })
    }

    /// One request with the single-refresh retry rule.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Option<Value>> {
        let token = self.tokens.bearer().await?;
        let response = self.send(&method, path, query, body.as_ref(), &token).await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return handle_response(path, response).await;
        }

        debug!(path, "access token rejected, refreshing once");
        self.auth_retries.fetch_add(1, Ordering::Relaxed);
        let token = self.tokens.force_refresh().await?;
        let response = self.send(&method, path, query, body.as_ref(), &token).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "refreshed token rejected as well");
            return Err(SyncError::Auth(
                "request rejected after token refresh; check integration credentials".to_string(),
            ));
        }
        handle_response(path, response).await
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> Result<Option<Value>> {
        self.request(Method::GET, path, query, None).await
    }

    async fn post_batch<T: serde::Serialize>(&self, path: &str, draft: &T) -> Result<Option<Value>> {
        let body = encode_batch(path, draft)?;
        self.request(Method::POST, path, &[], Some(body)).await
    }

    async fn patch_batch<T: serde::Serialize>(&self, path: &str, draft: &T) -> Result<()> {
        let body = encode_batch(path, draft)?;
        self.request(Method::PATCH, path, &[], Some(body)).await?;
        Ok(())
    }
}

/// The CRM's create/update endpoints take arrays even for single entities.
fn encode_batch<T: serde::Serialize>(path: &str, draft: &T) -> Result<Value> {
    serde_json::to_value(std::slice::from_ref(draft)).map_err(|e| SyncError::Transport {
        message: format!("serializing payload for {path} failed"),
        source: Some(Box::new(e)),
    })
}

/// Map terminal statuses: 2xx parses the body (204 and empty bodies become
/// `None`), anything else is a remote API error carrying the body text.
async fn handle_response(path: &str, response: reqwest::Response) -> Result<Option<Value>> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }
    if status.is_success() {
        let text = response.text().await.map_err(|e| SyncError::Transport {
            message: format!("reading response body from {path} failed"),
            source: Some(Box::new(e)),
        })?;
        if text.is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&text).map_err(|e| SyncError::Transport {
            message: format!("malformed JSON from {path}"),
            source: Some(Box::new(e)),
        })?;
        return Ok(Some(value));
    }
    let body = response.text().await.unwrap_or_default();
    warn!(path, status = status.as_u16(), "CRM request failed");
    Err(SyncError::RemoteApi {
        status: status.as_u16(),
        body,
    })
}

fn parse<T: serde::de::DeserializeOwned>(path: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| SyncError::Transport {
        message: format!("unexpected response shape from {path}"),
        source: Some(Box::new(e)),
    })
}

fn first_created_id(ids: Vec<i64>, entity: EntityKind) -> Result<i64> {
    ids.into_iter().next().ok_or_else(|| {
        SyncError::transport(format!(
            "create response for {} carried no entity id",
            entity.path()
        ))
    })
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>> {
        match self
            .get_json("contacts", &[("query", query), ("with", "leads")])
            .await?
        {
            Some(value) => Ok(parse::<ContactsPage>("contacts", value)?.embedded.contacts),
            None => Ok(Vec::new()),
        }
    }

    async fn search_deals(&self, query: &str) -> Result<Vec<Deal>> {
        match self
            .get_json("leads", &[("query", query), ("with", "contacts")])
            .await?
        {
            Some(value) => Ok(parse::<DealsPage>("leads", value)?.embedded.leads),
            None => Ok(Vec::new()),
        }
    }

    async fn contact_deals(&self, contact_id: i64) -> Result<Vec<Deal>> {
        let path = format!("contacts/{contact_id}");
        let contact: Contact = match self.get_json(&path, &[("with", "leads")]).await? {
            Some(value) => parse(&path, value)?,
            None => return Ok(Vec::new()),
        };
        let mut deals = Vec::new();
        for deal_id in contact.deal_ids() {
            let path = format!("leads/{deal_id}");
            if let Some(value) = self.get_json(&path, &[("with", "contacts")]).await? {
                deals.push(parse::<Deal>(&path, value)?);
            }
        }
        Ok(deals)
    }

    async fn create_contact(&self, draft: &ContactDraft) -> Result<i64> {
        let value = self
            .post_batch("contacts", draft)
            .await?
            .ok_or_else(|| SyncError::transport("empty response creating contact"))?;
        let page: ContactsPage = parse("contacts", value)?;
        first_created_id(
            page.embedded.contacts.iter().map(|c| c.id).collect(),
            EntityKind::Contacts,
        )
    }

    async fn update_contact(&self, draft: &ContactDraft) -> Result<()> {
        self.patch_batch("contacts", draft).await
    }

    async fn create_deal(&self, draft: &DealDraft) -> Result<i64> {
        let value = self
            .post_batch("leads", draft)
            .await?
            .ok_or_else(|| SyncError::transport("empty response creating deal"))?;
        let page: DealsPage = parse("leads", value)?;
        first_created_id(
            page.embedded.leads.iter().map(|d| d.id).collect(),
            EntityKind::Deals,
        )
    }

    async fn update_deal(&self, draft: &DealDraft) -> Result<()> {
        self.patch_batch("leads", draft).await
    }

    async fn list_custom_fields(&self, entity: EntityKind) -> Result<Vec<CustomFieldDef>> {
        let path = format!("{}/custom_fields", entity.path());
        match self.get_json(&path, &[]).await? {
            Some(value) => Ok(parse::<CustomFieldsPage>(&path, value)?
                .embedded
                .custom_fields),
            None => Ok(Vec::new()),
        }
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            requests: self.requests.load(Ordering::Relaxed),
            auth_retries: self.auth_retries.load(Ordering::Relaxed),
        }
    }
}
