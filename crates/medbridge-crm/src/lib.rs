//! Rate-limited, token-refreshing client for the CRM HTTP API.
//!
//! The entry point is [`CrmClient`], which implements [`CrmApi`]; the engine
//! crate depends only on the trait, so tests run against [`MockCrm`].

pub mod client;
pub mod mock;
pub mod rate_limit;
pub mod token;
pub mod types;

pub use client::{ClientStats, CrmApi, CrmClient};
pub use mock::MockCrm;
pub use rate_limit::RateLimiter;
pub use token::{MemoryTokenStore, TokenManager, TokenStore};
pub use types::{
    Contact, ContactDraft, CustomFieldDef, CustomFieldValues, Deal, DealDraft, DealDraftEmbedded,
    DealEmbedded, EntityKind, FieldValue, LinkedContact, TokenResponse,
};
