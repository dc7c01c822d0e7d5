//! Postgres-backed [`SourceStore`] and token store.
//!
//! Queries are written with runtime binding rather than the compile-time
//! macros; the clinic schema is not available at build time.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use medbridge_core::{
    Gender, Patient, PatientStatus, Person, Reception, ReceptionStatus, Result, SyncError,
};
use medbridge_core::TokenStore;

use crate::store::{SourceStore, SyncStateRow};

fn db_err(context: &str, e: sqlx::Error) -> SyncError {
    SyncError::Database(format!("{context}: {e}"))
}

const PATIENT_COLUMNS: &str = r"
    p.id, p.person_id, p.first_visit, p.card_number, p.comment,
    p.patient_number, p.status, p.archive_reason, p.branch, p.discount,
    p.last_updated,
    pr.surname, pr.name AS given_name, pr.patronymic, pr.sex, pr.birthday,
    pr.phone, pr.mobile_phone, pr.email, pr.city, pr.tax_id,
    pr.insurance_number, pr.changed_at,
    date_part('year', age(pr.birthday))::int AS age,
    (SELECT count(*) FROM receptions r
      WHERE r.patient_id = p.id AND r.status = 'completed') AS completed_count,
    (SELECT count(DISTINCT r.appointment_date::date) FROM receptions r
      WHERE r.patient_id = p.id AND r.status = 'completed') AS total_visits,
    COALESCE((SELECT sum(a.amount) FROM account_entries a
      WHERE a.patient_id = p.id AND a.amount > 0), 0)::float8 AS advance,
    COALESCE((SELECT -sum(a.amount) FROM account_entries a
      WHERE a.patient_id = p.id AND a.amount < 0), 0)::float8 AS debt
";

const RECEPTION_COLUMNS: &str = r"
    r.id, r.patient_id, r.staff_id, r.appointment_date, r.duration,
    r.comment, r.status, r.date_added, r.date_changed,
    p.patient_number,
    COALESCE(pr.mobile_phone, pr.phone) AS phone,
    s.full_name AS staff_name
";

fn patient_from_row(row: &PgRow) -> std::result::Result<Patient, sqlx::Error> {
    let person = Person {
        id: row.try_get("person_id")?,
        surname: row.try_get::<Option<String>, _>("surname")?.unwrap_or_default(),
        name: row
            .try_get::<Option<String>, _>("given_name")?
            .unwrap_or_default(),
        patronymic: row.try_get("patronymic")?,
        sex: Gender::from_code(row.try_get::<Option<i16>, _>("sex")?.unwrap_or(0)),
        birthday: row.try_get("birthday")?,
        phone: row.try_get("phone")?,
        mobile_phone: row.try_get("mobile_phone")?,
        email: row.try_get("email")?,
        city: row.try_get("city")?,
        tax_id: row.try_get("tax_id")?,
        insurance_number: row.try_get("insurance_number")?,
        age: row.try_get("age")?,
        changed_at: row.try_get("changed_at")?,
    };
    Ok(Patient {
        id: row.try_get("id")?,
        person_id: row.try_get("person_id")?,
        first_visit: row.try_get("first_visit")?,
        card_number: row.try_get("card_number")?,
        comment: row.try_get("comment")?,
        patient_number: row.try_get("patient_number")?,
        status: PatientStatus::from_code(row.try_get::<Option<i16>, _>("status")?.unwrap_or(1)),
        archive_reason: row.try_get("archive_reason")?,
        branch: row.try_get("branch")?,
        person: Some(person),
        last_updated: row.try_get("last_updated")?,
        discount: row.try_get::<Option<f64>, _>("discount")?.unwrap_or(0.0),
        total_visits: row.try_get("total_visits")?,
        advance: row.try_get("advance")?,
        debt: row.try_get("debt")?,
        completed_receptions_count: row.try_get("completed_count")?,
    })
}

fn reception_status(raw: &str) -> ReceptionStatus {
    match raw {
        "completed" => ReceptionStatus::Completed,
        "cancelled" => ReceptionStatus::Cancelled,
        "no_show" => ReceptionStatus::NoShow,
        _ => ReceptionStatus::Scheduled,
    }
}

fn reception_from_row(row: &PgRow) -> std::result::Result<Reception, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Reception {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        patient_number: row.try_get("patient_number")?,
        phone: row.try_get("phone")?,
        staff_id: row.try_get("staff_id")?,
        staff_name: row.try_get("staff_name")?,
        appointment_date: row.try_get("appointment_date")?,
        duration: row.try_get("duration")?,
        comment: row.try_get("comment")?,
        status: reception_status(&status),
        date_added: row.try_get("date_added")?,
        date_changed: row.try_get("date_changed")?,
    })
}

/// Open the shared connection pool for the source database.
pub async fn connect_pool(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|e| db_err("connecting to source database", e))?;
    info!("connected to source database");
    Ok(pool)
}

pub struct PgSourceStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgSourceStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::from_pool(connect_pool(database_url).await?))
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    /// The bookkeeping tables live alongside the clinic schema and are
    /// created on first use instead of requiring a migration step.
    async fn ensure_bookkeeping(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS sync_state (
                         patient_id BIGINT PRIMARY KEY,
                         contact_id BIGINT,
                         status TEXT NOT NULL,
                         synced_at TIMESTAMPTZ NOT NULL
                     )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("creating sync_state table", e))?;
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS sync_watermarks (
                         key TEXT PRIMARY KEY,
                         last_run TIMESTAMPTZ NOT NULL
                     )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("creating sync_watermarks table", e))?;
                debug!("sync bookkeeping tables ready");
                Ok::<(), SyncError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn patients_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Patient>> {
        let sql = format!(
            "SELECT {PATIENT_COLUMNS}
             FROM patients p
             JOIN persons pr ON pr.id = p.person_id
             WHERE $1::timestamptz IS NULL
                OR p.last_updated > $1
                OR pr.changed_at > $1
             ORDER BY p.id"
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("loading changed patients", e))?;
        rows.iter()
            .map(|r| patient_from_row(r).map_err(|e| db_err("decoding patient row", e)))
            .collect()
    }

    async fn patient(&self, id: i64) -> Result<Option<Patient>> {
        let sql = format!(
            "SELECT {PATIENT_COLUMNS}
             FROM patients p
             JOIN persons pr ON pr.id = p.person_id
             WHERE p.id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("loading patient", e))?;
        row.as_ref()
            .map(|r| patient_from_row(r).map_err(|e| db_err("decoding patient row", e)))
            .transpose()
    }

    async fn receptions_changed_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Reception>> {
        let sql = format!(
            "SELECT {RECEPTION_COLUMNS}
             FROM receptions r
             JOIN patients p ON p.id = r.patient_id
             JOIN persons pr ON pr.id = p.person_id
             LEFT JOIN staff s ON s.id = r.staff_id
             WHERE (r.status = 'completed'
                    AND ($1::timestamptz IS NULL OR r.date_changed > $1))
                OR (r.status = 'scheduled' AND r.appointment_date >= now())
             ORDER BY r.date_changed NULLS LAST, r.id"
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("loading changed receptions", e))?;
        rows.iter()
            .map(|r| reception_from_row(r).map_err(|e| db_err("decoding reception row", e)))
            .collect()
    }

    async fn reception(&self, id: i64) -> Result<Option<Reception>> {
        let sql = format!(
            "SELECT {RECEPTION_COLUMNS}
             FROM receptions r
             JOIN patients p ON p.id = r.patient_id
             JOIN persons pr ON pr.id = p.person_id
             LEFT JOIN staff s ON s.id = r.staff_id
             WHERE r.id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("loading reception", e))?;
        row.as_ref()
            .map(|r| reception_from_row(r).map_err(|e| db_err("decoding reception row", e)))
            .transpose()
    }

    async fn upsert_sync_state(
        &self,
        patient_id: i64,
        contact_id: Option<i64>,
        status: &str,
    ) -> Result<()> {
        self.ensure_bookkeeping().await?;
        sqlx::query(
            "INSERT INTO sync_state (patient_id, contact_id, status, synced_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (patient_id) DO UPDATE
             SET contact_id = EXCLUDED.contact_id,
                 status = EXCLUDED.status,
                 synced_at = EXCLUDED.synced_at",
        )
        .bind(patient_id)
        .bind(contact_id)
        .bind(status)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("upserting sync state", e))?;
        Ok(())
    }

    async fn has_sync_state(&self) -> Result<bool> {
        self.ensure_bookkeeping().await?;
        let row = sqlx::query("SELECT EXISTS (SELECT 1 FROM sync_state) AS present")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_err("checking sync state", e))?;
        row.try_get("present").map_err(|e| db_err("decoding sync state", e))
    }

    async fn sync_states(&self) -> Result<Vec<SyncStateRow>> {
        self.ensure_bookkeeping().await?;
        let rows = sqlx::query(
            "SELECT patient_id, contact_id, status, synced_at
             FROM sync_state ORDER BY patient_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("listing sync states", e))?;
        rows.iter()
            .map(|r| {
                Ok(SyncStateRow {
                    patient_id: r.try_get("patient_id").map_err(|e| db_err("decoding sync state", e))?,
                    contact_id: r.try_get("contact_id").map_err(|e| db_err("decoding sync state", e))?,
                    status: r.try_get("status").map_err(|e| db_err("decoding sync state", e))?,
                    synced_at: r.try_get("synced_at").map_err(|e| db_err("decoding sync state", e))?,
                })
            })
            .collect()
    }

    async fn watermark(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.ensure_bookkeeping().await?;
        let row = sqlx::query("SELECT last_run FROM sync_watermarks WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("reading watermark", e))?;
        row.map(|r| r.try_get("last_run").map_err(|e| db_err("decoding watermark", e)))
            .transpose()
    }

    async fn set_watermark(&self, key: &str, at: DateTime<Utc>) -> Result<()> {
        self.ensure_bookkeeping().await?;
        sqlx::query(
            "INSERT INTO sync_watermarks (key, last_run) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET last_run = EXCLUDED.last_run",
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("writing watermark", e))?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("pinging source database", e))?;
        Ok(())
    }
}

/// Token persistence shared by alternating service instances.
pub struct PgTokenStore {
    pool: PgPool,
    schema_ready: OnceCell<()>,
}

impl PgTokenStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    async fn ensure_table(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    "CREATE TABLE IF NOT EXISTS crm_tokens (
                         key TEXT PRIMARY KEY,
                         value TEXT NOT NULL,
                         expires_at TIMESTAMPTZ
                     )",
                )
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("creating crm_tokens table", e))?;
                Ok::<(), SyncError>(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for PgTokenStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.ensure_table().await?;
        let row = sqlx::query(
            "SELECT value FROM crm_tokens
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("reading token", e))?;
        row.map(|r| r.try_get("value").map_err(|e| db_err("decoding token", e)))
            .transpose()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.ensure_table().await?;
        let expires_at = match ttl {
            Some(ttl) => Some(
                Utc::now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| SyncError::Config(format!("token ttl out of range: {e}")))?,
            ),
            None => None,
        };
        sqlx::query(
            "INSERT INTO crm_tokens (key, value, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("writing token", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reception_status_decoding() {
        assert_eq!(reception_status("completed"), ReceptionStatus::Completed);
        assert_eq!(reception_status("cancelled"), ReceptionStatus::Cancelled);
        assert_eq!(reception_status("no_show"), ReceptionStatus::NoShow);
        assert_eq!(reception_status("scheduled"), ReceptionStatus::Scheduled);
        assert_eq!(reception_status("anything"), ReceptionStatus::Scheduled);
    }
}
