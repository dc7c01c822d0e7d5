//! Persistence seam for the CRM OAuth2 token pair.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Key-value storage for the token pair.
///
/// The access token carries a TTL; the refresh token is stored without one
/// and only ever replaced by a newer pair. Implementations live next to
/// whatever storage the process already holds open.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
}
