//! In-memory [`SourceStore`] for engine and scheduler tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use medbridge_core::{Patient, Reception, ReceptionStatus, Result};

use crate::store::{SourceStore, SyncStateRow};

#[derive(Default)]
struct MemoryState {
    patients: Vec<Patient>,
    receptions: Vec<Reception>,
    sync_states: HashMap<i64, SyncStateRow>,
    watermarks: HashMap<String, DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemorySourceStore {
    state: Mutex<MemoryState>,
}

impl MemorySourceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_patient(&self, patient: Patient) {
        self.lock().patients.push(patient);
    }

    pub fn push_reception(&self, reception: Reception) {
        self.lock().receptions.push(reception);
    }

    pub fn watermarks(&self) -> HashMap<String, DateTime<Utc>> {
        self.lock().watermarks.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl SourceStore for MemorySourceStore {
    async fn patients_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Patient>> {
        Ok(self
            .lock()
            .patients
            .iter()
            .filter(|p| match since {
                None => true,
                Some(since) => p.last_updated.is_some_and(|at| at > since),
            })
            .cloned()
            .collect())
    }

    async fn patient(&self, id: i64) -> Result<Option<Patient>> {
        Ok(self.lock().patients.iter().find(|p| p.id == id).cloned())
    }

    async fn receptions_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Reception>> {
        Ok(self
            .lock()
            .receptions
            .iter()
            .filter(|r| match r.status {
                ReceptionStatus::Cancelled | ReceptionStatus::NoShow => false,
                ReceptionStatus::Scheduled => true,
                ReceptionStatus::Completed => match since {
                    None => true,
                    Some(since) => r.date_changed.is_some_and(|at| at > since),
                },
            })
            .cloned()
            .collect())
    }

    async fn reception(&self, id: i64) -> Result<Option<Reception>> {
        Ok(self
            .lock()
            .receptions
            .iter()
            .find(|r| r.id == Some(id))
            .cloned())
    }

    async fn upsert_sync_state(
        &self,
        patient_id: i64,
        contact_id: Option<i64>,
        status: &str,
    ) -> Result<()> {
        self.lock().sync_states.insert(
            patient_id,
            SyncStateRow {
                patient_id,
                contact_id,
                status: status.to_string(),
                synced_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn has_sync_state(&self) -> Result<bool> {
        Ok(!self.lock().sync_states.is_empty())
    }

    async fn sync_states(&self) -> Result<Vec<SyncStateRow>> {
        let mut rows: Vec<SyncStateRow> = self.lock().sync_states.values().cloned().collect();
        rows.sort_by_key(|r| r.patient_id);
        Ok(rows)
    }

    async fn watermark(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.lock().watermarks.get(key).copied())
    }

    async fn set_watermark(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.lock().watermarks.insert(key.to_string(), at);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
