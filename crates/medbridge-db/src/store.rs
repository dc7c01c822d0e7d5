//! The read side of the pipeline: what the engine needs from the clinic
//! database, behind a trait so tests run against an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use medbridge_core::{Patient, Reception, Result};

/// Watermark keys recorded after successful passes.
pub mod watermark {
    /// Last completed patient pass.
    pub const PATIENTS: &str = "patients";
    /// Last completed reception pass.
    pub const RECEPTIONS: &str = "receptions";
}

/// Durable record of one patient's last successful sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateRow {
    pub patient_id: i64,
    pub contact_id: Option<i64>,
    pub status: String,
    pub synced_at: DateTime<Utc>,
}

/// Read-mostly access to the clinic system plus sync bookkeeping.
///
/// Patient and reception rows are reconstructed fresh on every call; the
/// only things this trait ever writes are the per-patient sync-state rows
/// and the pass watermarks.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Patients whose record (or linked person) changed after `since`;
    /// `None` means all patients.
    async fn patients_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Patient>>;

    /// One patient by id, with aggregates computed.
    async fn patient(&self, id: i64) -> Result<Option<Patient>>;

    /// Receptions relevant to a pass: completed ones changed after `since`
    /// plus upcoming scheduled ones. Cancelled receptions are never
    /// returned.
    async fn receptions_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Reception>>;

    /// One reception by id.
    async fn reception(&self, id: i64) -> Result<Option<Reception>>;

    /// Record a patient's successful sync, creating or replacing its row.
    async fn upsert_sync_state(
        &self,
        patient_id: i64,
        contact_id: Option<i64>,
        status: &str,
    ) -> Result<()>;

    /// Whether any patient has ever been synced. Drives the initial full
    /// pass decision.
    async fn has_sync_state(&self) -> Result<bool>;

    /// All per-patient sync-state rows.
    async fn sync_states(&self) -> Result<Vec<SyncStateRow>>;

    /// Watermark for the given pass key, if one has ever been recorded.
    async fn watermark(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// Record a pass watermark, creating or replacing the row.
    async fn set_watermark(&self, key: &str, at: DateTime<Utc>) -> Result<()>;

    /// Connectivity probe for the `check-db` command.
    async fn ping(&self) -> Result<()>;
}
