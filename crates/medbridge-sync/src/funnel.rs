//! Funnel routing: which pipeline and entry stage a patient's deals belong
//! in. Recomputed on every pass; the completed-receptions count only grows,
//! so a patient can migrate from primary to secondary but never back.

use medbridge_core::{FunnelConfig, FunnelType, Patient};

/// Resolved routing decision for one patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunnelRoute {
    pub funnel: FunnelType,
    pub pipeline_id: i64,
    pub stage_id: i64,
}

/// Route a patient by visit history. First-time patients (zero completed
/// receptions) go to the primary funnel; everyone else to the secondary.
#[must_use]
pub fn route(patient: &Patient, config: &FunnelConfig) -> FunnelRoute {
    let funnel = patient.funnel();
    FunnelRoute {
        funnel,
        pipeline_id: match funnel {
            FunnelType::Primary => config.primary_pipeline_id,
            FunnelType::Secondary => config.secondary_pipeline_id,
        },
        stage_id: config.default_stage_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::PatientStatus;

    fn patient(completed: i64) -> Patient {
        Patient {
            id: 1,
            person_id: 1,
            first_visit: None,
            card_number: None,
            comment: None,
            patient_number: None,
            status: PatientStatus::Active,
            archive_reason: None,
            branch: None,
            person: None,
            last_updated: None,
            discount: 0.0,
            total_visits: 0,
            advance: 0.0,
            debt: 0.0,
            completed_receptions_count: completed,
        }
    }

    fn config() -> FunnelConfig {
        FunnelConfig {
            primary_pipeline_id: 10,
            secondary_pipeline_id: 20,
            default_stage_id: 11,
            excluded_stages: vec![],
            responsible_user_id: None,
        }
    }

    #[test]
    fn boundary_is_exactly_one_completed_reception() {
        assert_eq!(route(&patient(0), &config()).funnel, FunnelType::Primary);
        assert_eq!(route(&patient(1), &config()).funnel, FunnelType::Secondary);
        assert_eq!(route(&patient(7), &config()).funnel, FunnelType::Secondary);
    }

    #[test]
    fn pipeline_and_stage_follow_funnel() {
        let primary = route(&patient(0), &config());
        assert_eq!(primary.pipeline_id, 10);
        assert_eq!(primary.stage_id, 11);
        let secondary = route(&patient(3), &config());
        assert_eq!(secondary.pipeline_id, 20);
        assert_eq!(secondary.stage_id, 11);
    }
}
