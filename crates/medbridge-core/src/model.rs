//! Domain model: patients, receptions, and reconciliation outcomes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Patient sex as recorded in the clinic system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    #[default]
    Unknown,
    Male,
    Female,
}

impl Gender {
    /// Decode the clinic system's integer encoding; anything unexpected maps
    /// to [`Gender::Unknown`].
    #[must_use]
    pub fn from_code(code: i16) -> Self {
        match code {
            1 => Self::Male,
            2 => Self::Female,
            _ => Self::Unknown,
        }
    }

    /// The integer encoding written to the CRM gender field.
    #[must_use]
    pub fn as_code(self) -> i16 {
        match self {
            Self::Unknown => 0,
            Self::Male => 1,
            Self::Female => 2,
        }
    }
}

/// Patient record lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientStatus {
    #[default]
    Active,
    Archived,
    Draft,
}

impl PatientStatus {
    #[must_use]
    pub fn from_code(code: i16) -> Self {
        match code {
            2 => Self::Archived,
            3 => Self::Draft,
            _ => Self::Active,
        }
    }

    #[must_use]
    pub fn as_code(self) -> i16 {
        match self {
            Self::Active => 1,
            Self::Archived => 2,
            Self::Draft => 3,
        }
    }
}

/// Appointment status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceptionStatus {
    #[default]
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

/// Which funnel (pipeline) a patient belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelType {
    /// First-time patient: zero completed receptions.
    Primary,
    /// Returning patient: at least one completed reception.
    Secondary,
}

impl std::fmt::Display for FunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// Demographic record joined to a patient.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub surname: String,
    pub name: String,
    pub patronymic: Option<String>,
    pub sex: Gender,
    pub birthday: Option<NaiveDate>,
    pub phone: Option<String>,
    pub mobile_phone: Option<String>,
    pub email: Option<String>,
    pub city: Option<String>,
    pub tax_id: Option<String>,
    pub insurance_number: Option<String>,
    pub age: Option<i32>,
    pub changed_at: Option<DateTime<Utc>>,
}

/// A patient enrolled at the clinic, with the computed aggregates the CRM
/// contact representation needs.
///
/// Read fresh from the source store on every pass; this engine never mutates
/// a patient beyond assembling the computed fields in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: i64,
    pub person_id: i64,
    pub first_visit: Option<DateTime<Utc>>,
    pub card_number: Option<String>,
    pub comment: Option<String>,
    /// External sequence number in the clinic system; a matching key.
    pub patient_number: Option<String>,
    pub status: PatientStatus,
    pub archive_reason: Option<String>,
    pub branch: Option<String>,
    pub person: Option<Person>,
    pub last_updated: Option<DateTime<Utc>>,

    // Computed aggregates.
    pub discount: f64,
    pub total_visits: i64,
    pub advance: f64,
    pub debt: f64,
    pub completed_receptions_count: i64,
}

impl Patient {
    /// "Surname Name Patronymic" with absent parts skipped; falls back to a
    /// synthetic label when no person record is linked.
    #[must_use]
    pub fn full_name(&self) -> String {
        let Some(person) = &self.person else {
            return format!("Patient {}", self.id);
        };
        let mut parts: Vec<&str> = Vec::with_capacity(3);
        if !person.surname.is_empty() {
            parts.push(&person.surname);
        }
        if !person.name.is_empty() {
            parts.push(&person.name);
        }
        if let Some(patronymic) = person.patronymic.as_deref() {
            if !patronymic.is_empty() {
                parts.push(patronymic);
            }
        }
        if parts.is_empty() {
            format!("Patient {}", self.id)
        } else {
            parts.join(" ")
        }
    }

    /// Primary contact phone, preferring mobile over landline.
    #[must_use]
    pub fn primary_phone(&self) -> Option<&str> {
        let person = self.person.as_ref()?;
        person
            .mobile_phone
            .as_deref()
            .or(person.phone.as_deref())
            .filter(|p| !p.is_empty())
    }

    /// Funnel membership, derived from the completed-receptions count.
    ///
    /// The count is monotonically non-decreasing, so this must be recomputed
    /// on every pass rather than cached.
    #[must_use]
    pub fn funnel(&self) -> FunnelType {
        if self.completed_receptions_count == 0 {
            FunnelType::Primary
        } else {
            FunnelType::Secondary
        }
    }
}

/// An appointment, completed or scheduled, reconstructed each pass from the
/// two source tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reception {
    /// Absent for newly scheduled receptions that have no finalized id yet.
    pub id: Option<i64>,
    pub patient_id: i64,
    pub patient_number: Option<String>,
    pub phone: Option<String>,
    pub staff_id: Option<i64>,
    pub staff_name: Option<String>,
    pub appointment_date: Option<DateTime<Utc>>,
    /// Minutes.
    pub duration: Option<i32>,
    pub comment: Option<String>,
    pub status: ReceptionStatus,
    pub date_added: Option<DateTime<Utc>>,
    pub date_changed: Option<DateTime<Utc>>,
}

impl Reception {
    /// Matching keys in descending confidence order.
    ///
    /// An explicit appointment reference is authoritative; the clinic
    /// sequence number is next; a phone number is a weak, possibly-shared
    /// identifier. Keys with no value on this record are omitted, not
    /// substituted.
    #[must_use]
    pub fn search_keys(&self) -> Vec<SearchKey> {
        let mut keys = Vec::with_capacity(3);
        if let Some(id) = self.id {
            keys.push(SearchKey::ReceptionId(id));
        }
        if let Some(number) = self.patient_number.as_deref() {
            if !number.is_empty() {
                keys.push(SearchKey::PatientNumber(number.to_string()));
            }
        }
        if let Some(phone) = self.phone.as_deref() {
            if !phone.is_empty() {
                keys.push(SearchKey::Phone(phone.to_string()));
            }
        }
        keys
    }
}

/// One matching key extracted from a reception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchKey {
    ReceptionId(i64),
    PatientNumber(String),
    Phone(String),
}

/// Which tier of the search hierarchy produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedKey {
    ReceptionId,
    PatientNumber,
    Phone,
}

/// Transient result of the entity matcher; lives only within one matching
/// operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactMatch {
    /// Absent only when a deal matched without any linked contact.
    pub contact_id: Option<i64>,
    pub deal_id: Option<i64>,
    pub pipeline_id: Option<i64>,
    pub stage_id: Option<i64>,
    pub matched_by: MatchedKey,
}

/// What the engine did with one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// New contact (and deal, for receptions) created.
    Created,
    /// Existing contact/deal updated.
    Updated,
    /// Existing contact found, new deal created for it.
    CreatedDeal,
    /// Resolved without any write.
    Found,
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::CreatedDeal => write!(f, "created_deal"),
            Self::Found => write!(f, "found"),
        }
    }
}

/// Outcome of reconciling one local record. Produced once per record per
/// pass and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub patient_id: i64,
    pub reception_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub deal_id: Option<i64>,
    pub funnel: Option<FunnelType>,
    pub action: Option<SyncAction>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl SyncOutcome {
    /// Successful outcome for a patient-level upsert.
    #[must_use]
    pub fn patient_success(patient_id: i64, contact_id: i64, action: SyncAction) -> Self {
        Self {
            success: true,
            patient_id,
            reception_id: None,
            contact_id: Some(contact_id),
            deal_id: None,
            funnel: None,
            action: Some(action),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Failed outcome; records the error without aborting the pass.
    #[must_use]
    pub fn failure(patient_id: i64, reception_id: Option<i64>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            patient_id,
            reception_id,
            contact_id: None,
            deal_id: None,
            funnel: None,
            action: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }
}
