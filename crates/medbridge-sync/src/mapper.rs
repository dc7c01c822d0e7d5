//! Domain-to-CRM field mapping.
//!
//! Every write goes through these two functions, so the custom-field layout
//! lives in exactly one place. Fields with no local value are omitted from
//! the draft rather than written as empty strings; the CRM keeps whatever
//! it already has.

use medbridge_core::{FieldMap, FunnelConfig, Gender, Patient, PatientStatus, Reception};
use medbridge_crm::{ContactDraft, CustomFieldValues, DealDraft};

use crate::funnel;

fn push_text(fields: &mut Vec<CustomFieldValues>, field_id: i64, value: Option<&str>) {
    if let Some(value) = value {
        if !value.is_empty() {
            fields.push(CustomFieldValues::text(field_id, value));
        }
    }
}

fn push_number(fields: &mut Vec<CustomFieldValues>, field_id: i64, value: i64) {
    fields.push(CustomFieldValues::number(field_id, value));
}

fn gender_label(gender: Gender) -> Option<&'static str> {
    match gender {
        Gender::Male => Some("male"),
        Gender::Female => Some("female"),
        Gender::Unknown => None,
    }
}

fn status_label(status: PatientStatus) -> &'static str {
    match status {
        PatientStatus::Active => "active",
        PatientStatus::Archived => "archived",
        PatientStatus::Draft => "draft",
    }
}

/// Build the contact draft for a patient. `contact_id` turns the draft into
/// an update payload.
#[must_use]
pub fn contact_draft(
    patient: &Patient,
    contact_id: Option<i64>,
    fields: &FieldMap,
    funnels: &FunnelConfig,
) -> ContactDraft {
    let mut cf = Vec::new();
    push_number(&mut cf, fields.patient_id, patient.id);
    push_text(&mut cf, fields.phone, patient.primary_phone());
    push_number(&mut cf, fields.total_visits, patient.total_visits);
    push_number(&mut cf, fields.completed_receptions, patient.completed_receptions_count);
    push_text(&mut cf, fields.card_number, patient.card_number.as_deref());
    push_text(&mut cf, fields.comment, patient.comment.as_deref());
    push_text(&mut cf, fields.patient_number, patient.patient_number.as_deref());
    push_text(&mut cf, fields.branch, patient.branch.as_deref());
    push_text(&mut cf, fields.status, Some(status_label(patient.status)));
    cf.push(CustomFieldValues::text(
        fields.discount,
        patient.discount.to_string(),
    ));
    cf.push(CustomFieldValues::text(
        fields.advance,
        patient.advance.to_string(),
    ));
    cf.push(CustomFieldValues::text(fields.debt, patient.debt.to_string()));

    if let Some(person) = &patient.person {
        push_text(&mut cf, fields.email, person.email.as_deref());
        push_text(&mut cf, fields.gender, gender_label(person.sex));
        push_text(&mut cf, fields.tax_id, person.tax_id.as_deref());
        push_text(&mut cf, fields.insurance_number, person.insurance_number.as_deref());
        if let Some(age) = person.age {
            push_number(&mut cf, fields.age, i64::from(age));
        }
        if let Some(birthday) = person.birthday {
            push_text(
                &mut cf,
                fields.birthdate,
                Some(&birthday.format("%Y-%m-%d").to_string()),
            );
        }
    }

    ContactDraft {
        id: contact_id,
        name: patient.full_name(),
        responsible_user_id: funnels.responsible_user_id,
        custom_fields_values: cf,
    }
}

/// Build the deal draft for a reception. `deal_id` turns the draft into an
/// update; `pipeline` is only set on creation so existing deals are never
/// yanked between funnels.
#[must_use]
pub fn deal_draft(
    reception: &Reception,
    patient: &Patient,
    deal_id: Option<i64>,
    fields: &FieldMap,
    funnels: &FunnelConfig,
) -> DealDraft {
    let mut cf = Vec::new();
    if let Some(id) = reception.id {
        push_number(&mut cf, fields.reception_id, id);
    }
    push_text(&mut cf, fields.patient_number, reception.patient_number.as_deref());
    push_text(&mut cf, fields.phone, reception.phone.as_deref());
    push_text(&mut cf, fields.staff, reception.staff_name.as_deref());
    if let Some(at) = reception.appointment_date {
        push_number(&mut cf, fields.appointment_date, at.timestamp());
    }
    if let Some(minutes) = reception.duration {
        push_number(&mut cf, fields.duration, i64::from(minutes));
    }
    push_text(&mut cf, fields.comment, reception.comment.as_deref());

    let name = match reception.id {
        Some(id) => format!("Reception #{id}"),
        None => "Reception #NEW".to_string(),
    };

    let (pipeline_id, status_id) = if deal_id.is_none() {
        let r = funnel::route(patient, funnels);
        (Some(r.pipeline_id), Some(r.stage_id))
    } else {
        (None, None)
    };

    DealDraft {
        id: deal_id,
        name,
        pipeline_id,
        status_id,
        responsible_user_id: funnels.responsible_user_id,
        custom_fields_values: cf,
        embedded: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use medbridge_core::{Person, ReceptionStatus};

    fn fields() -> FieldMap {
        FieldMap::default()
    }

    fn funnels() -> FunnelConfig {
        FunnelConfig {
            primary_pipeline_id: 10,
            secondary_pipeline_id: 20,
            default_stage_id: 11,
            excluded_stages: vec![],
            responsible_user_id: Some(7),
        }
    }

    fn patient() -> Patient {
        Patient {
            id: 100,
            person_id: 1,
            first_visit: None,
            card_number: Some("K-9".into()),
            comment: None,
            patient_number: Some("A-17".into()),
            status: PatientStatus::Active,
            archive_reason: None,
            branch: None,
            person: Some(Person {
                id: 1,
                surname: "Ivanova".into(),
                name: "Anna".into(),
                patronymic: None,
                sex: Gender::Female,
                birthday: NaiveDate::from_ymd_opt(1990, 5, 14),
                mobile_phone: Some("+79161234567".into()),
                email: Some("anna@example.com".into()),
                age: Some(36),
                ..Person::default()
            }),
            last_updated: None,
            discount: 5.0,
            total_visits: 3,
            advance: 0.0,
            debt: 150.0,
            completed_receptions_count: 3,
        }
    }

    fn field(draft_fields: &[CustomFieldValues], id: i64) -> Option<String> {
        draft_fields
            .iter()
            .find(|f| f.field_id == id)
            .and_then(CustomFieldValues::first_as_str)
    }

    #[test]
    fn contact_draft_maps_identity_and_aggregates() {
        let draft = contact_draft(&patient(), None, &fields(), &funnels());
        assert_eq!(draft.name, "Ivanova Anna");
        assert_eq!(draft.responsible_user_id, Some(7));
        let f = fields();
        assert_eq!(field(&draft.custom_fields_values, f.patient_id).as_deref(), Some("100"));
        assert_eq!(
            field(&draft.custom_fields_values, f.phone).as_deref(),
            Some("+79161234567")
        );
        assert_eq!(
            field(&draft.custom_fields_values, f.birthdate).as_deref(),
            Some("1990-05-14")
        );
        assert_eq!(field(&draft.custom_fields_values, f.debt).as_deref(), Some("150"));
    }

    #[test]
    fn absent_values_are_omitted_not_blanked() {
        let mut p = patient();
        if let Some(person) = &mut p.person {
            person.email = None;
        }
        let draft = contact_draft(&p, None, &fields(), &funnels());
        assert!(field(&draft.custom_fields_values, fields().email).is_none());
    }

    #[test]
    fn new_deal_gets_pipeline_and_stage_updates_do_not() {
        let reception = Reception {
            id: Some(12345),
            patient_id: 100,
            patient_number: Some("A-17".into()),
            phone: Some("+79161234567".into()),
            staff_id: None,
            staff_name: Some("Dr. Orlova".into()),
            appointment_date: Some(Utc.with_ymd_and_hms(2026, 9, 1, 10, 0, 0).unwrap()),
            duration: Some(30),
            comment: None,
            status: ReceptionStatus::Scheduled,
            date_added: None,
            date_changed: None,
        };
        let p = patient();

        let created = deal_draft(&reception, &p, None, &fields(), &funnels());
        // Three completed receptions puts the patient in the secondary funnel.
        assert_eq!(created.pipeline_id, Some(20));
        assert_eq!(created.status_id, Some(11));
        assert_eq!(
            field(&created.custom_fields_values, fields().reception_id).as_deref(),
            Some("12345")
        );

        let updated = deal_draft(&reception, &p, Some(555), &fields(), &funnels());
        assert_eq!(updated.id, Some(555));
        assert_eq!(updated.pipeline_id, None);
        assert_eq!(updated.status_id, None);
    }
}
