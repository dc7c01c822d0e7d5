//! Shared domain model, configuration, and error taxonomy for medbridge.
//!
//! This crate holds everything the other medbridge crates agree on:
//! the patient/reception domain types, the outcome types produced by a
//! reconciliation pass, the closed custom-field mapping, and the error
//! taxonomy used across the HTTP client, the source store, and the engine.

pub mod config;
pub mod error;
pub mod model;
pub mod phone;
pub mod token;

pub use config::{AppConfig, CrmConfig, FieldMap, FunnelConfig, RateLimitSettings, SyncSettings};
pub use error::{Result, SyncError};
pub use model::{
    ContactMatch, FunnelType, Gender, MatchedKey, Patient, PatientStatus, Person, Reception,
    ReceptionStatus, SearchKey, SyncAction, SyncOutcome,
};
pub use token::TokenStore;
