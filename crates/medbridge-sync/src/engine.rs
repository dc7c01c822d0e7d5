//! The reconciliation engine: pulls changed records from the clinic store
//! and drives each one to its CRM counterpart.
//!
//! A pass never aborts on a single bad record; failures are captured as
//! outcomes and the pass keeps going. The watermark is only advanced after
//! the pass completes, so a crashed pass is simply re-run.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use medbridge_core::{
    FieldMap, FunnelConfig, FunnelType, Patient, Reception, Result, SyncAction, SyncError,
    SyncOutcome, SyncSettings,
};
use medbridge_crm::{ClientStats, CrmApi};
use medbridge_db::{watermark, SourceStore};

use crate::funnel;
use crate::mapper;
use crate::matcher::Matcher;

/// When no watermark exists yet, an incremental pass reaches this far back.
const FIRST_RUN_LOOKBACK_HOURS: i64 = 24;

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub created_deals: usize,
    pub found: usize,
    pub failed: usize,
    pub primary: usize,
    pub secondary: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &SyncOutcome) {
        self.total += 1;
        if !outcome.success {
            self.failed += 1;
            return;
        }
        match outcome.action {
            Some(SyncAction::Created) => self.created += 1,
            Some(SyncAction::Updated) => self.updated += 1,
            Some(SyncAction::CreatedDeal) => self.created_deals += 1,
            Some(SyncAction::Found) | None => self.found += 1,
        }
        match outcome.funnel {
            Some(FunnelType::Primary) => self.primary += 1,
            Some(FunnelType::Secondary) => self.secondary += 1,
            None => {}
        }
    }
}

/// Snapshot for the `stats` command.
#[derive(Debug, Clone)]
pub struct SyncStatistics {
    pub patients_tracked: usize,
    pub patients_watermark: Option<DateTime<Utc>>,
    pub receptions_watermark: Option<DateTime<Utc>>,
    pub client: ClientStats,
}

pub struct SyncEngine<S, C> {
    store: Arc<S>,
    crm: Arc<C>,
    fields: FieldMap,
    funnels: FunnelConfig,
    settings: SyncSettings,
}

impl<S: SourceStore, C: CrmApi> SyncEngine<S, C> {
    pub fn new(
        store: Arc<S>,
        crm: Arc<C>,
        fields: FieldMap,
        funnels: FunnelConfig,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            crm,
            fields,
            funnels,
            settings,
        }
    }

    fn matcher(&self) -> Matcher<'_, C> {
        Matcher::new(self.crm.as_ref(), &self.fields, &self.funnels)
    }

    /// Sync all patients changed after `since` (`None` means everyone),
    /// in batches. The watermark is set to the pass start time so changes
    /// landing mid-pass are picked up next time.
    pub async fn sync_patients(&self, since: Option<DateTime<Utc>>) -> Result<PassReport> {
        let started = Utc::now();
        let patients = self.store.patients_changed_since(since).await?;
        info!(count = patients.len(), "starting patient pass");

        let mut report = PassReport::default();
        for batch in patients.chunks(self.settings.batch_size.max(1)) {
            for patient in batch {
                let outcome = match self.reconcile_patient(patient).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(patient_id = patient.id, error = %e, "patient sync failed");
                        SyncOutcome::failure(patient.id, None, e.to_string())
                    }
                };
                report.record(&outcome);
            }
            info!(
                processed = report.total,
                created = report.created,
                updated = report.updated,
                failed = report.failed,
                "patient batch done"
            );
        }

        self.store.set_watermark(watermark::PATIENTS, started).await?;
        info!(
            total = report.total,
            primary = report.primary,
            secondary = report.secondary,
            failed = report.failed,
            "patient pass done"
        );
        Ok(report)
    }

    /// Incremental patient pass: from the watermark, or 24 hours back on
    /// the very first run.
    pub async fn sync_patients_incremental(&self) -> Result<PassReport> {
        let since = match self.store.watermark(watermark::PATIENTS).await? {
            Some(at) => at,
            None => Utc::now() - Duration::hours(FIRST_RUN_LOOKBACK_HOURS),
        };
        self.sync_patients(Some(since)).await
    }

    /// Whether any patient has ever been synced.
    pub async fn has_synced_before(&self) -> Result<bool> {
        self.store.has_sync_state().await
    }

    /// Sync one patient by id; the `test-patient` command.
    pub async fn sync_patient(&self, patient_id: i64) -> Result<SyncOutcome> {
        let patient = self
            .store
            .patient(patient_id)
            .await?
            .ok_or(SyncError::NotFoundLocal {
                kind: "patient",
                id: patient_id,
            })?;
        self.reconcile_patient(&patient).await
    }

    /// Create-or-update for one patient's contact, recording the durable
    /// per-patient sync state on success.
    async fn reconcile_patient(&self, patient: &Patient) -> Result<SyncOutcome> {
        let (contact_id, action) = match self.matcher().contact_for_patient(patient).await? {
            Some(contact_id) => {
                let draft =
                    mapper::contact_draft(patient, Some(contact_id), &self.fields, &self.funnels);
                self.crm.update_contact(&draft).await?;
                (contact_id, SyncAction::Updated)
            }
            None => {
                let draft = mapper::contact_draft(patient, None, &self.fields, &self.funnels);
                let contact_id = self.crm.create_contact(&draft).await?;
                info!(patient_id = patient.id, contact_id, "created contact");
                (contact_id, SyncAction::Created)
            }
        };

        self.store
            .upsert_sync_state(patient.id, Some(contact_id), &action.to_string())
            .await?;

        let mut outcome = SyncOutcome::patient_success(patient.id, contact_id, action);
        outcome.funnel = Some(funnel::route(patient, &self.funnels).funnel);
        Ok(outcome)
    }

    /// Sync receptions changed since the reception watermark (24 hours back
    /// on the first run), plus all upcoming scheduled ones.
    pub async fn sync_receptions(&self) -> Result<PassReport> {
        let started = Utc::now();
        let since = match self.store.watermark(watermark::RECEPTIONS).await? {
            Some(at) => at,
            None => started - Duration::hours(FIRST_RUN_LOOKBACK_HOURS),
        };
        let receptions = self.store.receptions_changed_since(Some(since)).await?;
        info!(count = receptions.len(), "starting reception pass");

        let mut report = PassReport::default();
        for reception in &receptions {
            let outcome = match self.reconcile_reception(reception).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(
                        reception_id = reception.id,
                        patient_id = reception.patient_id,
                        error = %e,
                        "reception sync failed"
                    );
                    SyncOutcome::failure(reception.patient_id, reception.id, e.to_string())
                }
            };
            report.record(&outcome);
        }

        self.store.set_watermark(watermark::RECEPTIONS, started).await?;
        Ok(report)
    }

    /// Sync one reception by id; the `test-reception` command.
    pub async fn sync_reception(&self, reception_id: i64) -> Result<SyncOutcome> {
        let reception =
            self.store
                .reception(reception_id)
                .await?
                .ok_or(SyncError::NotFoundLocal {
                    kind: "reception",
                    id: reception_id,
                })?;
        self.reconcile_reception(&reception).await
    }

    async fn reconcile_reception(&self, reception: &Reception) -> Result<SyncOutcome> {
        // Funnel routing and field mapping both need the patient row; a
        // reception whose patient vanished between listing and processing
        // is a failed record, never a write against guessed data.
        let Some(patient) = self.store.patient(reception.patient_id).await? else {
            warn!(
                reception_id = reception.id,
                patient_id = reception.patient_id,
                "patient for reception not found locally"
            );
            return Ok(SyncOutcome::failure(
                reception.patient_id,
                reception.id,
                "patient not found locally",
            ));
        };
        let funnel = Some(funnel::route(&patient, &self.funnels).funnel);

        let outcome = match self.matcher().match_for_reception(reception).await? {
            // A deal exists for this reception (or is waiting for it):
            // refresh its fields in place, and the contact's alongside.
            Some(found) if found.deal_id.is_some() => {
                let draft = mapper::deal_draft(
                    reception,
                    &patient,
                    found.deal_id,
                    &self.fields,
                    &self.funnels,
                );
                self.crm.update_deal(&draft).await?;
                if let Some(contact_id) = found.contact_id {
                    self.refresh_contact(&patient, contact_id).await;
                }
                SyncOutcome {
                    success: true,
                    patient_id: reception.patient_id,
                    reception_id: reception.id,
                    contact_id: found.contact_id,
                    deal_id: found.deal_id,
                    funnel,
                    action: Some(SyncAction::Updated),
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            // Contact matched by phone but has no open deal in the target
            // pipelines: open one for it.
            Some(found) => {
                let contact_id = found.contact_id.ok_or_else(|| {
                    SyncError::transport("match carried neither deal nor contact")
                })?;
                let deal_id = self
                    .create_deal_for(reception, &patient, contact_id)
                    .await?;
                SyncOutcome {
                    success: true,
                    patient_id: reception.patient_id,
                    reception_id: reception.id,
                    contact_id: Some(contact_id),
                    deal_id: Some(deal_id),
                    funnel,
                    action: Some(SyncAction::CreatedDeal),
                    error: None,
                    timestamp: Utc::now(),
                }
            }
            // Nothing matched: establish the contact first, then its deal.
            None => {
                let contact_outcome = self.reconcile_patient(&patient).await?;
                let contact_id = contact_outcome.contact_id.ok_or_else(|| {
                    SyncError::transport("patient reconciliation yielded no contact id")
                })?;
                let deal_id = self
                    .create_deal_for(reception, &patient, contact_id)
                    .await?;
                SyncOutcome {
                    success: true,
                    patient_id: reception.patient_id,
                    reception_id: reception.id,
                    contact_id: Some(contact_id),
                    deal_id: Some(deal_id),
                    funnel,
                    action: Some(SyncAction::Created),
                    error: None,
                    timestamp: Utc::now(),
                }
            }
        };
        Ok(outcome)
    }

    /// Best-effort contact refresh during a reception update; a failure
    /// here must not fail the reception.
    async fn refresh_contact(&self, patient: &Patient, contact_id: i64) {
        let draft = mapper::contact_draft(patient, Some(contact_id), &self.fields, &self.funnels);
        if let Err(e) = self.crm.update_contact(&draft).await {
            warn!(
                patient_id = patient.id,
                contact_id,
                error = %e,
                "contact refresh alongside reception failed"
            );
        }
    }

    async fn create_deal_for(
        &self,
        reception: &Reception,
        patient: &Patient,
        contact_id: i64,
    ) -> Result<i64> {
        let draft = mapper::deal_draft(reception, patient, None, &self.fields, &self.funnels)
            .with_contact(contact_id);
        let deal_id = self.crm.create_deal(&draft).await?;
        info!(
            reception_id = reception.id,
            contact_id, deal_id, "created deal"
        );
        Ok(deal_id)
    }

    pub async fn statistics(&self) -> Result<SyncStatistics> {
        Ok(SyncStatistics {
            patients_tracked: self.store.sync_states().await?.len(),
            patients_watermark: self.store.watermark(watermark::PATIENTS).await?,
            receptions_watermark: self.store.watermark(watermark::RECEPTIONS).await?,
            client: self.crm.stats(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::{Gender, PatientStatus, Person, ReceptionStatus};
    use medbridge_crm::{Contact, CustomFieldValues, MockCrm};
    use medbridge_db::MemorySourceStore;

    fn patient(id: i64, phone: &str, completed: i64) -> Patient {
        Patient {
            id,
            person_id: id,
            first_visit: None,
            card_number: None,
            comment: None,
            patient_number: Some(format!("A-{id}")),
            status: PatientStatus::Active,
            archive_reason: None,
            branch: None,
            person: Some(Person {
                id,
                surname: "Ivanova".into(),
                name: "Anna".into(),
                patronymic: None,
                sex: Gender::Female,
                mobile_phone: Some(phone.into()),
                ..Person::default()
            }),
            last_updated: Some(Utc::now()),
            discount: 0.0,
            total_visits: completed,
            advance: 0.0,
            debt: 0.0,
            completed_receptions_count: completed,
        }
    }

    fn reception(id: i64, patient_id: i64, phone: &str) -> Reception {
        Reception {
            id: Some(id),
            patient_id,
            patient_number: Some(format!("A-{patient_id}")),
            phone: Some(phone.into()),
            staff_id: None,
            staff_name: None,
            appointment_date: Some(Utc::now() + Duration::days(1)),
            duration: Some(30),
            comment: None,
            status: ReceptionStatus::Scheduled,
            date_added: Some(Utc::now()),
            date_changed: Some(Utc::now()),
        }
    }

    fn engine(
        store: Arc<MemorySourceStore>,
        crm: Arc<MockCrm>,
    ) -> SyncEngine<MemorySourceStore, MockCrm> {
        SyncEngine::new(
            store,
            crm,
            FieldMap::default(),
            FunnelConfig {
                primary_pipeline_id: 10,
                secondary_pipeline_id: 20,
                default_stage_id: 11,
                excluded_stages: vec![90],
                responsible_user_id: None,
            },
            SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn patient_sync_is_idempotent() {
        let store = Arc::new(MemorySourceStore::new());
        let crm = Arc::new(MockCrm::new());
        store.push_patient(patient(100, "+79161234567", 0));
        let engine = engine(store.clone(), crm.clone());

        let first = engine.sync_patient(100).await.unwrap();
        assert_eq!(first.action, Some(SyncAction::Created));
        assert_eq!(first.funnel, Some(FunnelType::Primary));

        let second = engine.sync_patient(100).await.unwrap();
        assert_eq!(second.action, Some(SyncAction::Updated));
        assert_eq!(second.contact_id, first.contact_id);
        assert_eq!(crm.contacts().len(), 1);

        let states = store.sync_states().await.unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].contact_id, first.contact_id);
        assert_eq!(states[0].status, "updated");
    }

    #[tokio::test]
    async fn reception_creates_then_updates_same_deal() {
        let store = Arc::new(MemorySourceStore::new());
        let crm = Arc::new(MockCrm::new());
        store.push_patient(patient(100, "+79161234567", 0));
        store.push_reception(reception(12345, 100, "+79161234567"));
        let engine = engine(store, crm.clone());

        let first = engine.sync_reception(12345).await.unwrap();
        assert_eq!(first.action, Some(SyncAction::Created));
        assert_eq!(crm.contacts().len(), 1);
        assert_eq!(crm.deals().len(), 1);

        // Second run must find the deal through its reception id.
        let second = engine.sync_reception(12345).await.unwrap();
        assert_eq!(second.action, Some(SyncAction::Updated));
        assert_eq!(second.deal_id, first.deal_id);
        assert_eq!(crm.deals().len(), 1);
        assert_eq!(crm.contacts().len(), 1);
    }

    #[tokio::test]
    async fn reception_for_known_contact_opens_deal_only() {
        let store = Arc::new(MemorySourceStore::new());
        let crm = Arc::new(MockCrm::new());
        store.push_patient(patient(100, "+79161234567", 2));
        store.push_reception(reception(500, 100, "+79161234567"));
        let engine = engine(store.clone(), crm.clone());

        // Contact exists from an earlier patient pass.
        engine.sync_patient(100).await.unwrap();
        assert_eq!(crm.contacts().len(), 1);

        let outcome = engine.sync_reception(500).await.unwrap();
        assert_eq!(outcome.action, Some(SyncAction::CreatedDeal));
        assert_eq!(crm.contacts().len(), 1);
        let deals = crm.deals();
        assert_eq!(deals.len(), 1);
        // Two completed receptions: the deal lands in the secondary funnel.
        assert_eq!(deals[0].pipeline_id, Some(20));
        assert_eq!(deals[0].status_id, Some(11));
    }

    #[tokio::test]
    async fn passes_advance_watermarks_and_distribution() {
        let store = Arc::new(MemorySourceStore::new());
        let crm = Arc::new(MockCrm::new());
        store.push_patient(patient(100, "+79161234567", 0));
        store.push_patient(patient(101, "+79160000001", 4));
        let engine = engine(store.clone(), crm);

        assert!(!engine.has_synced_before().await.unwrap());
        let report = engine.sync_patients(None).await.unwrap();
        assert_eq!(report.created, 2);
        assert_eq!(report.primary, 1);
        assert_eq!(report.secondary, 1);
        assert!(engine.has_synced_before().await.unwrap());
        assert!(store.watermarks().contains_key(watermark::PATIENTS));

        engine.sync_receptions().await.unwrap();
        assert!(store.watermarks().contains_key(watermark::RECEPTIONS));

        let stats = engine.statistics().await.unwrap();
        assert_eq!(stats.patients_tracked, 2);
        assert!(stats.patients_watermark.is_some());
    }

    #[tokio::test]
    async fn reception_without_patient_row_fails_and_writes_nothing() {
        let store = Arc::new(MemorySourceStore::new());
        let crm = Arc::new(MockCrm::new());
        // The CRM side already knows this phone; the local patient row is
        // gone, so the record must fail instead of riding the phone match.
        crm.seed_contact(Contact {
            id: 42,
            name: "Ivanova Anna".into(),
            custom_fields_values: Some(vec![CustomFieldValues::text(
                FieldMap::default().phone,
                "+79161234567",
            )]),
            ..Contact::default()
        });
        store.push_reception(reception(600, 999, "+79161234567"));
        let engine = engine(store, crm.clone());

        let outcome = engine.sync_reception(600).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.patient_id, 999);
        assert_eq!(outcome.reception_id, Some(600));
        assert!(outcome.error.is_some());
        assert!(crm.deals().is_empty());
        assert_eq!(crm.contacts().len(), 1);
    }

    #[tokio::test]
    async fn missing_patient_is_a_local_not_found() {
        let store = Arc::new(MemorySourceStore::new());
        let crm = Arc::new(MockCrm::new());
        let engine = engine(store, crm);
        let err = engine.sync_patient(404).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::NotFoundLocal {
                kind: "patient",
                id: 404
            }
        ));
    }
}
