//! Configuration for the reconciliation service.
//!
//! One immutable [`AppConfig`] value is built at startup and passed explicitly
//! into the components that need it — the matcher, the router, and the
//! serializers never reach for ambient global state.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// CRM connection and OAuth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmConfig {
    /// CRM account subdomain, e.g. `clinic` for `clinic.example-crm.com`.
    pub subdomain: String,

    /// OAuth client id.
    pub client_id: String,

    /// OAuth client secret.
    pub client_secret: String,

    /// Redirect URI registered with the CRM integration.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Bootstrap access token used when the token store is empty.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Bootstrap refresh token used when the token store is empty.
    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Override for the API base URL; mainly for tests against a mock server.
    #[serde(default)]
    pub base_url_override: Option<String>,

    /// Override for the OAuth token endpoint; mainly for tests.
    #[serde(default)]
    pub oauth_url_override: Option<String>,
}

fn default_redirect_uri() -> String {
    "http://localhost:8080/callback".to_string()
}

impl CrmConfig {
    /// REST API base URL, v4 namespace.
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url_override
            .clone()
            .unwrap_or_else(|| format!("https://{}.amocrm.ru/api/v4", self.subdomain))
    }

    /// OAuth token endpoint.
    #[must_use]
    pub fn oauth_url(&self) -> String {
        self.oauth_url_override
            .clone()
            .unwrap_or_else(|| format!("https://{}.amocrm.ru/oauth2/access_token", self.subdomain))
    }
}

/// Closed enumeration of every CRM custom field the integration writes.
///
/// Field ids are CRM-account-specific, so each is configurable, but the set
/// of recognized fields is fixed — there is no dynamic get-or-default lookup
/// that could silently absorb a typo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMap {
    /// Primary correlation key: local patient id.
    #[serde(default = "d_patient_id")]
    pub patient_id: i64,
    /// Secondary correlation key: phone number.
    #[serde(default = "d_phone")]
    pub phone: i64,
    #[serde(default = "d_email")]
    pub email: i64,
    #[serde(default = "d_age")]
    pub age: i64,
    #[serde(default = "d_gender")]
    pub gender: i64,
    #[serde(default = "d_total_visits")]
    pub total_visits: i64,
    #[serde(default = "d_card_number")]
    pub card_number: i64,
    #[serde(default = "d_birthdate")]
    pub birthdate: i64,
    #[serde(default = "d_comment")]
    pub comment: i64,
    #[serde(default = "d_discount")]
    pub discount: i64,
    #[serde(default = "d_status")]
    pub status: i64,
    #[serde(default = "d_insurance_number")]
    pub insurance_number: i64,
    #[serde(default = "d_tax_id")]
    pub tax_id: i64,
    #[serde(default = "d_branch")]
    pub branch: i64,
    /// External patient sequence number in the clinic system.
    #[serde(default = "d_patient_number")]
    pub patient_number: i64,
    #[serde(default = "d_advance")]
    pub advance: i64,
    #[serde(default = "d_debt")]
    pub debt: i64,
    #[serde(default = "d_completed_receptions")]
    pub completed_receptions: i64,
    /// Deal-side correlation key: reception id.
    #[serde(default = "d_reception_id")]
    pub reception_id: i64,
    #[serde(default = "d_appointment_date")]
    pub appointment_date: i64,
    #[serde(default = "d_staff")]
    pub staff: i64,
    #[serde(default = "d_duration")]
    pub duration: i64,
}

fn d_patient_id() -> i64 {
    25
}
fn d_phone() -> i64 {
    2
}
fn d_email() -> i64 {
    1
}
fn d_age() -> i64 {
    3
}
fn d_gender() -> i64 {
    4
}
fn d_total_visits() -> i64 {
    6
}
fn d_card_number() -> i64 {
    7
}
fn d_birthdate() -> i64 {
    8
}
fn d_comment() -> i64 {
    9
}
fn d_discount() -> i64 {
    10
}
fn d_status() -> i64 {
    13
}
fn d_insurance_number() -> i64 {
    14
}
fn d_tax_id() -> i64 {
    15
}
fn d_branch() -> i64 {
    16
}
fn d_patient_number() -> i64 {
    17
}
fn d_advance() -> i64 {
    18
}
fn d_debt() -> i64 {
    19
}
fn d_completed_receptions() -> i64 {
    20
}
fn d_reception_id() -> i64 {
    26
}
fn d_appointment_date() -> i64 {
    30
}
fn d_staff() -> i64 {
    31
}
fn d_duration() -> i64 {
    32
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            patient_id: d_patient_id(),
            phone: d_phone(),
            email: d_email(),
            age: d_age(),
            gender: d_gender(),
            total_visits: d_total_visits(),
            card_number: d_card_number(),
            birthdate: d_birthdate(),
            comment: d_comment(),
            discount: d_discount(),
            status: d_status(),
            insurance_number: d_insurance_number(),
            tax_id: d_tax_id(),
            branch: d_branch(),
            patient_number: d_patient_number(),
            advance: d_advance(),
            debt: d_debt(),
            completed_receptions: d_completed_receptions(),
            reception_id: d_reception_id(),
            appointment_date: d_appointment_date(),
            staff: d_staff(),
            duration: d_duration(),
        }
    }
}

/// Pipeline/stage routing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelConfig {
    /// Pipeline for first-time patients (zero completed receptions).
    pub primary_pipeline_id: i64,

    /// Pipeline for returning patients.
    pub secondary_pipeline_id: i64,

    /// Entry stage for newly created deals.
    pub default_stage_id: i64,

    /// Terminal stages excluded from every matching tier.
    #[serde(default)]
    pub excluded_stages: Vec<i64>,

    /// Responsible CRM user assigned to created records, if any.
    #[serde(default)]
    pub responsible_user_id: Option<i64>,
}

impl FunnelConfig {
    /// Both pipelines the integration routes into.
    #[must_use]
    pub fn target_pipelines(&self) -> [i64; 2] {
        [self.primary_pipeline_id, self.secondary_pipeline_id]
    }

    /// Whether a stage is terminal and therefore never matchable.
    #[must_use]
    pub fn is_excluded_stage(&self, stage_id: i64) -> bool {
        self.excluded_stages.contains(&stage_id)
    }
}

/// Outbound request budget for the CRM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Maximum requests per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_max_requests() -> usize {
    7
}

fn default_window_secs() -> u64 {
    1
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

/// Scheduling cadence and batching for reconciliation passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Interval between incremental patient passes, in minutes.
    #[serde(default = "default_incremental_minutes")]
    pub incremental_minutes: u64,

    /// Interval between reception passes, in seconds.
    #[serde(default = "default_reception_interval_secs")]
    pub reception_interval_secs: u64,

    /// Hours of day (local clock) at which the two deep syncs run.
    #[serde(default = "default_deep_sync_hours")]
    pub deep_sync_hours: [u32; 2],

    /// Patient batch size; bounds memory and gives progress checkpoints.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause after an unexpected tick failure, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_incremental_minutes() -> u64 {
    2
}

fn default_reception_interval_secs() -> u64 {
    60
}

fn default_deep_sync_hours() -> [u32; 2] {
    [8, 20]
}

fn default_batch_size() -> usize {
    100
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            incremental_minutes: default_incremental_minutes(),
            reception_interval_secs: default_reception_interval_secs(),
            deep_sync_hours: default_deep_sync_hours(),
            batch_size: default_batch_size(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Source database connection URL.
    pub database_url: String,

    pub crm: CrmConfig,

    pub funnels: FunnelConfig,

    #[serde(default)]
    pub fields: FieldMap,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub sync: SyncSettings,
}

impl AppConfig {
    /// Validate cross-field consistency. Fatal at startup on failure.
    pub fn validate(&self) -> Result<()> {
        if self.funnels.primary_pipeline_id == self.funnels.secondary_pipeline_id {
            return Err(SyncError::Config(
                "primary and secondary pipelines must differ".to_string(),
            ));
        }
        if self
            .funnels
            .is_excluded_stage(self.funnels.default_stage_id)
        {
            return Err(SyncError::Config(format!(
                "default stage {} is listed as an excluded stage",
                self.funnels.default_stage_id
            )));
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            return Err(SyncError::Config(
                "rate limit budget and window must be non-zero".to_string(),
            ));
        }
        if self.sync.batch_size == 0 {
            return Err(SyncError::Config("batch size must be non-zero".to_string()));
        }
        let [morning, evening] = self.sync.deep_sync_hours;
        if morning > 23 || evening > 23 {
            return Err(SyncError::Config(
                "deep sync hours must be within 0..=23".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "postgres://localhost/clinic".into(),
            crm: CrmConfig {
                subdomain: "clinic".into(),
                client_id: "id".into(),
                client_secret: "secret".into(),
                redirect_uri: default_redirect_uri(),
                access_token: None,
                refresh_token: None,
                base_url_override: None,
                oauth_url_override: None,
            },
            funnels: FunnelConfig {
                primary_pipeline_id: 1,
                secondary_pipeline_id: 2,
                default_stage_id: 10,
                excluded_stages: vec![50, 60],
                responsible_user_id: None,
            },
            fields: FieldMap::default(),
            rate_limit: RateLimitSettings::default(),
            sync: SyncSettings::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn same_pipelines_rejected() {
        let mut cfg = base_config();
        cfg.funnels.secondary_pipeline_id = cfg.funnels.primary_pipeline_id;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn excluded_default_stage_rejected() {
        let mut cfg = base_config();
        cfg.funnels.default_stage_id = 50;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn urls_derive_from_subdomain() {
        let cfg = base_config();
        assert_eq!(cfg.crm.base_url(), "https://clinic.amocrm.ru/api/v4");
        assert_eq!(
            cfg.crm.oauth_url(),
            "https://clinic.amocrm.ru/oauth2/access_token"
        );
    }

    #[test]
    fn overrides_win() {
        let mut cfg = base_config();
        cfg.crm.base_url_override = Some("http://127.0.0.1:9999/api/v4".into());
        assert_eq!(cfg.crm.base_url(), "http://127.0.0.1:9999/api/v4");
    }

    #[test]
    fn field_map_defaults_cover_correlation_keys() {
        let fields = FieldMap::default();
        assert_eq!(fields.patient_id, 25);
        assert_eq!(fields.phone, 2);
        assert_eq!(fields.reception_id, 26);
    }

    #[test]
    fn excluded_stage_lookup() {
        let cfg = base_config();
        assert!(cfg.funnels.is_excluded_stage(50));
        assert!(!cfg.funnels.is_excluded_stage(10));
        assert_eq!(cfg.funnels.target_pipelines(), [1, 2]);
    }
}
