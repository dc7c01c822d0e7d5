//! Entity matching against the CRM.
//!
//! Matching is tiered by key confidence: an explicit reception id beats the
//! clinic patient number, which beats a phone number. Each tier runs one
//! search and filters the hits locally, because the CRM's full-text search
//! matches across every field and returns false positives.

use tracing::debug;

use medbridge_core::phone;
use medbridge_core::{ContactMatch, FieldMap, FunnelConfig, MatchedKey, Patient, Reception, Result};
use medbridge_crm::{Contact, CrmApi, Deal};

pub struct Matcher<'a, C: CrmApi + ?Sized> {
    crm: &'a C,
    fields: &'a FieldMap,
    funnels: &'a FunnelConfig,
}

impl<'a, C: CrmApi + ?Sized> Matcher<'a, C> {
    pub fn new(crm: &'a C, fields: &'a FieldMap, funnels: &'a FunnelConfig) -> Self {
        Self {
            crm,
            fields,
            funnels,
        }
    }

    /// A deal counts as matchable only inside the two target pipelines and
    /// outside the excluded (terminal) stages.
    fn deal_qualifies(&self, deal: &Deal) -> bool {
        let in_target = deal
            .pipeline_id
            .is_some_and(|p| self.funnels.target_pipelines().contains(&p));
        let excluded = deal
            .status_id
            .is_some_and(|s| self.funnels.is_excluded_stage(s));
        in_target && !excluded
    }

    fn contact_phone_matches(&self, contact: &Contact, wanted: &str) -> bool {
        contact
            .field_value(self.fields.phone)
            .is_some_and(|have| phone::matches(&have, wanted))
    }

    /// Find the CRM contact for a patient: exact patient-id field match
    /// first, normalized phone second.
    pub async fn contact_for_patient(&self, patient: &Patient) -> Result<Option<i64>> {
        let id_text = patient.id.to_string();
        let hits = self.crm.search_contacts(&id_text).await?;
        if let Some(contact) = hits
            .iter()
            .find(|c| c.field_value(self.fields.patient_id).as_deref() == Some(id_text.as_str()))
        {
            debug!(patient_id = patient.id, contact_id = contact.id, "matched contact by patient id");
            return Ok(Some(contact.id));
        }

        let Some(raw_phone) = patient.primary_phone() else {
            return Ok(None);
        };
        let normalized = phone::normalize(raw_phone);
        if normalized.is_empty() {
            return Ok(None);
        }
        let hits = self.crm.search_contacts(&normalized).await?;
        if let Some(contact) = hits.iter().find(|c| self.contact_phone_matches(c, raw_phone)) {
            debug!(patient_id = patient.id, contact_id = contact.id, "matched contact by phone");
            return Ok(Some(contact.id));
        }
        Ok(None)
    }

    /// Find the CRM deal (and contact) a reception should land on, walking
    /// the key tiers in confidence order. Stops at the first tier that
    /// yields a hit.
    pub async fn match_for_reception(&self, reception: &Reception) -> Result<Option<ContactMatch>> {
        if let Some(found) = self.by_reception_id(reception).await? {
            return Ok(Some(found));
        }
        if let Some(found) = self.by_patient_number(reception).await? {
            return Ok(Some(found));
        }
        self.by_phone(reception).await
    }

    async fn by_reception_id(&self, reception: &Reception) -> Result<Option<ContactMatch>> {
        let Some(reception_id) = reception.id else {
            return Ok(None);
        };
        let id_text = reception_id.to_string();
        let deals = self.crm.search_deals(&id_text).await?;
        let Some(deal) = deals.iter().find(|d| {
            d.field_value(self.fields.reception_id).as_deref() == Some(id_text.as_str())
                && self.deal_qualifies(d)
        }) else {
            return Ok(None);
        };
        debug!(reception_id, deal_id = deal.id, "matched deal by reception id");
        Ok(Some(ContactMatch {
            contact_id: deal.contact_ids().first().copied(),
            deal_id: Some(deal.id),
            pipeline_id: deal.pipeline_id,
            stage_id: deal.status_id,
            matched_by: MatchedKey::ReceptionId,
        }))
    }

    /// Patient-number tier only considers deals that carry no reception id:
    /// those were created by the patient pass and are waiting for their
    /// first reception to claim them.
    async fn by_patient_number(&self, reception: &Reception) -> Result<Option<ContactMatch>> {
        let Some(number) = reception.patient_number.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let deals = self.crm.search_deals(number).await?;
        let Some(deal) = deals.iter().find(|d| {
            d.field_value(self.fields.patient_number).as_deref() == Some(number)
                && d.field_value(self.fields.reception_id).is_none()
                && self.deal_qualifies(d)
        }) else {
            return Ok(None);
        };
        debug!(
            patient_number = number,
            deal_id = deal.id,
            "matched deal by patient number"
        );
        Ok(Some(ContactMatch {
            contact_id: deal.contact_ids().first().copied(),
            deal_id: Some(deal.id),
            pipeline_id: deal.pipeline_id,
            stage_id: deal.status_id,
            matched_by: MatchedKey::PatientNumber,
        }))
    }

    /// Phone tier: resolve the contact first, then take the first of its
    /// deals (in CRM listing order) that qualifies. A contact hit without
    /// any qualifying deal is still a match; the engine creates the deal.
    async fn by_phone(&self, reception: &Reception) -> Result<Option<ContactMatch>> {
        let Some(raw_phone) = reception.phone.as_deref() else {
            return Ok(None);
        };
        let normalized = phone::normalize(raw_phone);
        if normalized.is_empty() {
            return Ok(None);
        }
        let contacts = self.crm.search_contacts(&normalized).await?;
        let Some(contact) = contacts.iter().find(|c| self.contact_phone_matches(c, raw_phone))
        else {
            return Ok(None);
        };

        let deals = self.crm.contact_deals(contact.id).await?;
        let deal = deals.iter().find(|d| self.deal_qualifies(d));
        debug!(
            contact_id = contact.id,
            deal_id = deal.map(|d| d.id),
            "matched by phone"
        );
        Ok(Some(ContactMatch {
            contact_id: Some(contact.id),
            deal_id: deal.map(|d| d.id),
            pipeline_id: deal.and_then(|d| d.pipeline_id),
            stage_id: deal.and_then(|d| d.status_id),
            matched_by: MatchedKey::Phone,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::ReceptionStatus;
    use medbridge_crm::{CustomFieldValues, DealEmbedded, LinkedContact, MockCrm};

    fn fields() -> FieldMap {
        FieldMap::default()
    }

    fn funnels() -> FunnelConfig {
        FunnelConfig {
            primary_pipeline_id: 10,
            secondary_pipeline_id: 20,
            default_stage_id: 11,
            excluded_stages: vec![90],
            responsible_user_id: None,
        }
    }

    fn reception() -> Reception {
        Reception {
            id: Some(12345),
            patient_id: 100,
            patient_number: Some("A-17".into()),
            phone: Some("+7 (916) 123-45-67".into()),
            staff_id: None,
            staff_name: None,
            appointment_date: None,
            duration: None,
            comment: None,
            status: ReceptionStatus::Scheduled,
            date_added: None,
            date_changed: None,
        }
    }

    fn deal(id: i64, pipeline: i64, stage: i64, fields: Vec<CustomFieldValues>) -> Deal {
        Deal {
            id,
            name: "Visit".into(),
            pipeline_id: Some(pipeline),
            status_id: Some(stage),
            responsible_user_id: None,
            custom_fields_values: Some(fields),
            embedded: Some(DealEmbedded {
                contacts: vec![LinkedContact { id: 42 }],
            }),
        }
    }

    fn phone_contact(id: i64, phone: &str) -> Contact {
        Contact {
            id,
            name: "Ivanova Anna".into(),
            custom_fields_values: Some(vec![CustomFieldValues::text(fields().phone, phone)]),
            ..Contact::default()
        }
    }

    #[tokio::test]
    async fn reception_id_tier_wins_over_everything() {
        let crm = MockCrm::new();
        let f = fields();
        crm.seed_deal(deal(
            501,
            10,
            11,
            vec![CustomFieldValues::number(f.reception_id, 12345)],
        ));
        // A patient-number deal that would match tier two.
        crm.seed_deal(deal(502, 10, 11, vec![CustomFieldValues::text(f.patient_number, "A-17")]));

        let fu = funnels();
        let matcher = Matcher::new(&crm, &f, &fu);
        let found = matcher.match_for_reception(&reception()).await.unwrap().unwrap();
        assert_eq!(found.deal_id, Some(501));
        assert_eq!(found.contact_id, Some(42));
        assert_eq!(found.matched_by, MatchedKey::ReceptionId);
    }

    #[tokio::test]
    async fn reception_id_tier_ignores_terminal_stage_deals() {
        let crm = MockCrm::new();
        let f = fields();
        crm.seed_deal(deal(
            501,
            10,
            90,
            vec![CustomFieldValues::number(f.reception_id, 12345)],
        ));

        let fu = funnels();
        let matcher = Matcher::new(&crm, &f, &fu);
        let mut r = reception();
        r.patient_number = None;
        r.phone = None;
        assert!(matcher.match_for_reception(&r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patient_number_tier_skips_deals_with_reception_ids() {
        let crm = MockCrm::new();
        let f = fields();
        // Already claimed by another reception.
        crm.seed_deal(deal(
            501,
            10,
            11,
            vec![
                CustomFieldValues::text(f.patient_number, "A-17"),
                CustomFieldValues::number(f.reception_id, 99999),
            ],
        ));
        crm.seed_deal(deal(502, 10, 11, vec![CustomFieldValues::text(f.patient_number, "A-17")]));

        let fu = funnels();
        let matcher = Matcher::new(&crm, &f, &fu);
        let mut r = reception();
        r.id = None;
        r.phone = None;
        let found = matcher.match_for_reception(&r).await.unwrap().unwrap();
        assert_eq!(found.deal_id, Some(502));
        assert_eq!(found.matched_by, MatchedKey::PatientNumber);
    }

    #[tokio::test]
    async fn phone_tier_takes_first_qualifying_deal_in_listing_order() {
        let crm = MockCrm::new();
        let f = fields();
        crm.seed_contact(phone_contact(42, "+79161234567"));
        // Excluded stage, then a foreign pipeline, then the winner.
        crm.seed_deal(deal(601, 10, 90, vec![]));
        crm.seed_deal(deal(602, 77, 11, vec![]));
        crm.seed_deal(deal(603, 20, 21, vec![]));

        let fu = funnels();
        let matcher = Matcher::new(&crm, &f, &fu);
        let mut r = reception();
        r.id = None;
        r.patient_number = None;
        let found = matcher.match_for_reception(&r).await.unwrap().unwrap();
        assert_eq!(found.contact_id, Some(42));
        assert_eq!(found.deal_id, Some(603));
        assert_eq!(found.matched_by, MatchedKey::Phone);
    }

    #[tokio::test]
    async fn phone_tier_matches_contact_without_deal() {
        let crm = MockCrm::new();
        let f = fields();
        crm.seed_contact(phone_contact(42, "8 (916) 123-45-67"));

        let fu = funnels();
        let matcher = Matcher::new(&crm, &f, &fu);
        let mut r = reception();
        r.id = None;
        r.patient_number = None;
        r.phone = Some("89161234567".into());
        let found = matcher.match_for_reception(&r).await.unwrap().unwrap();
        assert_eq!(found.contact_id, Some(42));
        assert_eq!(found.deal_id, None);
    }

    #[tokio::test]
    async fn no_keys_no_match() {
        let crm = MockCrm::new();
        let f = fields();
        let fu = funnels();
        let matcher = Matcher::new(&crm, &f, &fu);
        let mut r = reception();
        r.id = None;
        r.patient_number = None;
        r.phone = None;
        assert!(matcher.match_for_reception(&r).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn patient_matched_by_id_field_not_substring() {
        let crm = MockCrm::new();
        let f = fields();
        // Full-text hit whose patient-id field holds a different value.
        crm.seed_contact(Contact {
            id: 1,
            name: "100 Years Clinic".into(),
            custom_fields_values: Some(vec![CustomFieldValues::number(f.patient_id, 9100)]),
            ..Contact::default()
        });
        crm.seed_contact(Contact {
            id: 2,
            name: "Ivanova Anna".into(),
            custom_fields_values: Some(vec![CustomFieldValues::number(f.patient_id, 100)]),
            ..Contact::default()
        });

        let fu = funnels();
        let matcher = Matcher::new(&crm, &f, &fu);
        let patient = Patient {
            id: 100,
            person_id: 1,
            first_visit: None,
            card_number: None,
            comment: None,
            patient_number: None,
            status: medbridge_core::PatientStatus::Active,
            archive_reason: None,
            branch: None,
            person: None,
            last_updated: None,
            discount: 0.0,
            total_visits: 0,
            advance: 0.0,
            debt: 0.0,
            completed_receptions_count: 0,
        };
        assert_eq!(matcher.contact_for_patient(&patient).await.unwrap(), Some(2));
    }
}
