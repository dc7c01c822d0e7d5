//! Pass scheduling for the long-running service.
//!
//! Cadences, all driven from a one-second tick:
//! - incremental patient pass every `incremental_minutes`
//! - reception pass every `reception_interval_secs`
//! - full (deep) pass once per configured hour of day, local clock
//! - a full pass at startup if no pass has ever completed
//!
//! A failed pass logs, backs off for `cooldown_secs`, and leaves the
//! watermark untouched, so the next attempt covers the same span.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Timelike, Utc};
use tracing::{error, info};

use medbridge_core::{Result, SyncSettings};
use medbridge_crm::CrmApi;
use medbridge_db::SourceStore;

use crate::engine::SyncEngine;

/// A deep-sync slot: one configured hour on one date. Each slot fires at
/// most once.
type DeepSlot = (NaiveDate, u32);

/// Which slot, if any, is due right now given the last slot that ran.
fn due_deep_slot(
    today: NaiveDate,
    hour: u32,
    hours: [u32; 2],
    last: Option<DeepSlot>,
) -> Option<DeepSlot> {
    if !hours.contains(&hour) {
        return None;
    }
    let slot = (today, hour);
    if last == Some(slot) {
        return None;
    }
    Some(slot)
}

/// Next-due deadlines for the periodic passes. A full pass covers both
/// spans, so it defers both.
struct Cadence {
    incremental_every: chrono::Duration,
    receptions_every: chrono::Duration,
    next_incremental: DateTime<Utc>,
    next_receptions: DateTime<Utc>,
}

impl Cadence {
    fn new(settings: &SyncSettings, now: DateTime<Utc>) -> Self {
        let incremental_every = chrono::Duration::minutes(settings.incremental_minutes as i64);
        let receptions_every = chrono::Duration::seconds(settings.reception_interval_secs as i64);
        Self {
            incremental_every,
            receptions_every,
            next_incremental: now + incremental_every,
            next_receptions: now + receptions_every,
        }
    }

    fn incremental_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_incremental
    }

    fn receptions_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_receptions
    }

    fn defer_incremental(&mut self, now: DateTime<Utc>) {
        self.next_incremental = now + self.incremental_every;
    }

    fn defer_receptions(&mut self, now: DateTime<Utc>) {
        self.next_receptions = now + self.receptions_every;
    }

    fn defer_all(&mut self, now: DateTime<Utc>) {
        self.defer_incremental(now);
        self.defer_receptions(now);
    }
}

pub struct Scheduler<S, C> {
    engine: Arc<SyncEngine<S, C>>,
    settings: SyncSettings,
}

impl<S: SourceStore, C: CrmApi> Scheduler<S, C> {
    pub fn new(engine: Arc<SyncEngine<S, C>>, settings: SyncSettings) -> Self {
        Self { engine, settings }
    }

    /// Drive passes forever. Runs until the surrounding task is dropped.
    pub async fn run(&self) -> Result<()> {
        if !self.engine.has_synced_before().await? {
            info!("no previous pass recorded, running initial full sync");
            self.run_full().await;
        }

        let mut cadence = Cadence::new(&self.settings, Utc::now());
        let mut last_deep: Option<DeepSlot> = None;

        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let now = Utc::now();
            let local: DateTime<Local> = Local::now();

            if let Some(slot) = due_deep_slot(
                local.date_naive(),
                local.hour(),
                self.settings.deep_sync_hours,
                last_deep,
            ) {
                info!(hour = slot.1, "deep sync window reached");
                self.run_full().await;
                last_deep = Some(slot);
                // The full pass already covered both spans.
                cadence.defer_all(Utc::now());
                continue;
            }

            if cadence.incremental_due(now) {
                match self.engine.sync_patients_incremental().await {
                    Ok(report) => {
                        info!(
                            total = report.total,
                            created = report.created,
                            updated = report.updated,
                            failed = report.failed,
                            "incremental patient pass done"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "incremental patient pass failed");
                        self.cooldown().await;
                    }
                }
                cadence.defer_incremental(Utc::now());
            }

            if cadence.receptions_due(now) {
                match self.engine.sync_receptions().await {
                    Ok(report) => {
                        info!(
                            total = report.total,
                            created = report.created,
                            updated = report.updated,
                            created_deals = report.created_deals,
                            failed = report.failed,
                            "reception pass done"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "reception pass failed");
                        self.cooldown().await;
                    }
                }
                cadence.defer_receptions(Utc::now());
            }
        }
    }

    async fn run_full(&self) {
        match self.engine.sync_patients(None).await {
            Ok(report) => info!(
                total = report.total,
                created = report.created,
                updated = report.updated,
                failed = report.failed,
                "full patient pass done"
            ),
            Err(e) => {
                error!(error = %e, "full patient pass failed");
                self.cooldown().await;
                return;
            }
        }
        match self.engine.sync_receptions().await {
            Ok(report) => info!(total = report.total, "reception pass done"),
            Err(e) => {
                error!(error = %e, "reception pass failed");
                self.cooldown().await;
            }
        }
    }

    async fn cooldown(&self) {
        tokio::time::sleep(Duration::from_secs(self.settings.cooldown_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, d).unwrap()
    }

    #[test]
    fn deep_slot_fires_only_in_configured_hours() {
        assert_eq!(due_deep_slot(date(30), 7, [8, 20], None), None);
        assert_eq!(due_deep_slot(date(30), 8, [8, 20], None), Some((date(30), 8)));
        assert_eq!(due_deep_slot(date(30), 20, [8, 20], None), Some((date(30), 20)));
    }

    #[test]
    fn deep_slot_fires_once_per_hour_window() {
        let first = due_deep_slot(date(30), 8, [8, 20], None);
        assert!(first.is_some());
        // Same hour again: already ran.
        assert_eq!(due_deep_slot(date(30), 8, [8, 20], first), None);
        // Evening window is a new slot.
        assert_eq!(due_deep_slot(date(30), 20, [8, 20], first), Some((date(30), 20)));
    }

    #[test]
    fn full_pass_defers_both_periodic_cadences() {
        let start = Utc::now();
        let mut cadence = Cadence::new(&SyncSettings::default(), start);
        let after_full = start + chrono::Duration::minutes(30);
        assert!(cadence.incremental_due(after_full));
        assert!(cadence.receptions_due(after_full));

        cadence.defer_all(after_full);
        assert!(!cadence.incremental_due(after_full));
        assert!(!cadence.receptions_due(after_full));
    }

    #[test]
    fn deferring_one_cadence_leaves_the_other_due() {
        let start = Utc::now();
        let mut cadence = Cadence::new(&SyncSettings::default(), start);
        let later = start + chrono::Duration::minutes(30);

        cadence.defer_incremental(later);
        assert!(!cadence.incremental_due(later));
        assert!(cadence.receptions_due(later));
    }

    #[test]
    fn deep_slot_fires_again_next_day() {
        let yesterday = Some((date(29), 8));
        assert_eq!(
            due_deep_slot(date(30), 8, [8, 20], yesterday),
            Some((date(30), 8))
        );
    }
}
