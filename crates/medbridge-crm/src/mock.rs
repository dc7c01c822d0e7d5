//! In-memory [`CrmApi`] double for engine and matcher tests.
//!
//! Behaves like a tiny CRM: full-text search over names and custom field
//! values, id assignment on create, field-level merge on update. Every call
//! is appended to a log so tests can assert on write counts.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use medbridge_core::Result;

use crate::client::{ClientStats, CrmApi};
use crate::types::{
    Contact, ContactDraft, CustomFieldDef, CustomFieldValues, Deal, DealDraft, EntityKind,
};

#[derive(Default)]
struct MockState {
    contacts: Vec<Contact>,
    deals: Vec<Deal>,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct MockCrm {
    state: Mutex<MockState>,
    next_id: AtomicI64,
}

impl MockCrm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicI64::new(1000),
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn seed_contact(&self, contact: Contact) {
        self.lock().contacts.push(contact);
    }

    pub fn seed_deal(&self, deal: Deal) {
        self.lock().deals.push(deal);
    }

    /// Snapshot of the call log, e.g. `["search_contacts:100", "create_contact"]`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.lock().contacts.clone()
    }

    pub fn deals(&self) -> Vec<Deal> {
        self.lock().deals.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Substring match, plus a digits-only comparison so formatted phone values
/// are found by digit queries, the way the real full-text search behaves.
fn value_matches(value: &str, query: &str) -> bool {
    if value.contains(query) {
        return true;
    }
    let digits = medbridge_core::phone::normalize(value);
    !digits.is_empty() && digits.contains(query)
}

fn contact_matches(contact: &Contact, query: &str) -> bool {
    if value_matches(&contact.name, query) {
        return true;
    }
    contact
        .custom_fields_values
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(CustomFieldValues::first_as_str)
        .any(|v| value_matches(&v, query))
}

fn deal_matches(deal: &Deal, query: &str) -> bool {
    if value_matches(&deal.name, query) {
        return true;
    }
    deal.custom_fields_values
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(CustomFieldValues::first_as_str)
        .any(|v| value_matches(&v, query))
}

fn merge_fields(existing: &mut Option<Vec<CustomFieldValues>>, incoming: &[CustomFieldValues]) {
    let fields = existing.get_or_insert_with(Vec::new);
    for field in incoming {
        match fields.iter_mut().find(|f| f.field_id == field.field_id) {
            Some(slot) => slot.values = field.values.clone(),
            None => fields.push(field.clone()),
        }
    }
}

#[async_trait]
impl CrmApi for MockCrm {
    async fn search_contacts(&self, query: &str) -> Result<Vec<Contact>> {
        let mut state = self.lock();
        state.calls.push(format!("search_contacts:{query}"));
        Ok(state
            .contacts
            .iter()
            .filter(|c| contact_matches(c, query))
            .cloned()
            .collect())
    }

    async fn search_deals(&self, query: &str) -> Result<Vec<Deal>> {
        let mut state = self.lock();
        state.calls.push(format!("search_deals:{query}"));
        Ok(state
            .deals
            .iter()
            .filter(|d| deal_matches(d, query))
            .cloned()
            .collect())
    }

    async fn contact_deals(&self, contact_id: i64) -> Result<Vec<Deal>> {
        let mut state = self.lock();
        state.calls.push(format!("contact_deals:{contact_id}"));
        Ok(state
            .deals
            .iter()
            .filter(|d| d.contact_ids().contains(&contact_id))
            .cloned()
            .collect())
    }

    async fn create_contact(&self, draft: &ContactDraft) -> Result<i64> {
        let id = self.alloc_id();
        let mut state = self.lock();
        state.calls.push("create_contact".to_string());
        state.contacts.push(Contact {
            id,
            name: draft.name.clone(),
            responsible_user_id: draft.responsible_user_id,
            custom_fields_values: if draft.custom_fields_values.is_empty() {
                None
            } else {
                Some(draft.custom_fields_values.clone())
            },
            embedded: None,
        });
        Ok(id)
    }

    async fn update_contact(&self, draft: &ContactDraft) -> Result<()> {
        let mut state = self.lock();
        state.calls.push("update_contact".to_string());
        if let Some(id) = draft.id {
            if let Some(contact) = state.contacts.iter_mut().find(|c| c.id == id) {
                if !draft.name.is_empty() {
                    contact.name = draft.name.clone();
                }
                merge_fields(&mut contact.custom_fields_values, &draft.custom_fields_values);
            }
        }
        Ok(())
    }

    async fn create_deal(&self, draft: &DealDraft) -> Result<i64> {
        let id = self.alloc_id();
        let mut state = self.lock();
        state.calls.push("create_deal".to_string());
        state.deals.push(Deal {
            id,
            name: draft.name.clone(),
            pipeline_id: draft.pipeline_id,
            status_id: draft.status_id,
            responsible_user_id: draft.responsible_user_id,
            custom_fields_values: if draft.custom_fields_values.is_empty() {
                None
            } else {
                Some(draft.custom_fields_values.clone())
            },
            embedded: draft.embedded.as_ref().map(|e| crate::types::DealEmbedded {
                contacts: e.contacts.clone(),
            }),
        });
        Ok(id)
    }

    async fn update_deal(&self, draft: &DealDraft) -> Result<()> {
        let mut state = self.lock();
        state.calls.push("update_deal".to_string());
        if let Some(id) = draft.id {
            if let Some(deal) = state.deals.iter_mut().find(|d| d.id == id) {
                if !draft.name.is_empty() {
                    deal.name = draft.name.clone();
                }
                if draft.pipeline_id.is_some() {
                    deal.pipeline_id = draft.pipeline_id;
                }
                if draft.status_id.is_some() {
                    deal.status_id = draft.status_id;
                }
                merge_fields(&mut deal.custom_fields_values, &draft.custom_fields_values);
            }
        }
        Ok(())
    }

    async fn list_custom_fields(&self, _entity: EntityKind) -> Result<Vec<CustomFieldDef>> {
        self.lock().calls.push("list_custom_fields".to_string());
        Ok(Vec::new())
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            requests: self.lock().calls.len() as u64,
            auth_retries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_search_finds_by_field_value() {
        let crm = MockCrm::new();
        let id = crm
            .create_contact(&ContactDraft {
                name: "Ivanova Anna".into(),
                custom_fields_values: vec![CustomFieldValues::text(2, "79161234567")],
                ..ContactDraft::default()
            })
            .await
            .unwrap();

        let hits = crm.search_contacts("79161234567").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert!(crm.search_contacts("79990000000").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_merges_fields_in_place() {
        let crm = MockCrm::new();
        let id = crm
            .create_contact(&ContactDraft {
                name: "Ivanova Anna".into(),
                custom_fields_values: vec![CustomFieldValues::number(6, 1)],
                ..ContactDraft::default()
            })
            .await
            .unwrap();

        crm.update_contact(&ContactDraft {
            id: Some(id),
            name: String::new(),
            custom_fields_values: vec![
                CustomFieldValues::number(6, 2),
                CustomFieldValues::text(9, "note"),
            ],
            ..ContactDraft::default()
        })
        .await
        .unwrap();

        let contact = &crm.contacts()[0];
        assert_eq!(contact.name, "Ivanova Anna");
        assert_eq!(contact.field_value(6).as_deref(), Some("2"));
        assert_eq!(contact.field_value(9).as_deref(), Some("note"));
    }
}
