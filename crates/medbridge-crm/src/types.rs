//! Wire types for the CRM v4 JSON API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One custom-field slot on a contact or deal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomFieldValues {
    pub field_id: i64,
    pub values: Vec<FieldValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enum_id: Option<i64>,
}

impl CustomFieldValues {
    #[must_use]
    pub fn text(field_id: i64, value: impl Into<String>) -> Self {
        Self {
            field_id,
            values: vec![FieldValue {
                value: Value::String(value.into()),
                enum_id: None,
            }],
        }
    }

    #[must_use]
    pub fn number(field_id: i64, value: i64) -> Self {
        Self {
            field_id,
            values: vec![FieldValue {
                value: Value::Number(value.into()),
                enum_id: None,
            }],
        }
    }

    /// First value rendered as a string, numbers included.
    #[must_use]
    pub fn first_as_str(&self) -> Option<String> {
        match self.values.first().map(|v| &v.value) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// CRM contact as returned by `GET /contacts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub responsible_user_id: Option<i64>,
    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomFieldValues>>,
    #[serde(default, rename = "_embedded")]
    pub embedded: Option<ContactEmbedded>,
}

impl Contact {
    /// First value of the given custom field, if present.
    #[must_use]
    pub fn field_value(&self, field_id: i64) -> Option<String> {
        self.custom_fields_values
            .as_deref()?
            .iter()
            .find(|f| f.field_id == field_id)
            .and_then(CustomFieldValues::first_as_str)
    }

    /// Linked deal ids from the embedded block (`?with=leads`).
    #[must_use]
    pub fn deal_ids(&self) -> Vec<i64> {
        self.embedded
            .as_ref()
            .map(|e| e.leads.iter().map(|l| l.id).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactEmbedded {
    #[serde(default)]
    pub leads: Vec<LinkedDeal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedDeal {
    pub id: i64,
}

/// CRM deal (lead) as returned by `GET /leads`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Deal {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pipeline_id: Option<i64>,
    #[serde(default)]
    pub status_id: Option<i64>,
    #[serde(default)]
    pub responsible_user_id: Option<i64>,
    #[serde(default)]
    pub custom_fields_values: Option<Vec<CustomFieldValues>>,
    #[serde(default, rename = "_embedded")]
    pub embedded: Option<DealEmbedded>,
}

impl Deal {
    #[must_use]
    pub fn field_value(&self, field_id: i64) -> Option<String> {
        self.custom_fields_values
            .as_deref()?
            .iter()
            .find(|f| f.field_id == field_id)
            .and_then(CustomFieldValues::first_as_str)
    }

    /// Linked contact ids from the embedded block.
    #[must_use]
    pub fn contact_ids(&self) -> Vec<i64> {
        self.embedded
            .as_ref()
            .map(|e| e.contacts.iter().map(|c| c.id).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealEmbedded {
    #[serde(default)]
    pub contacts: Vec<LinkedContact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedContact {
    pub id: i64,
}

/// Paged list envelope for contacts.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactsPage {
    #[serde(default, rename = "_embedded")]
    pub embedded: ContactsEmbedded,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContactsEmbedded {
    #[serde(default)]
    pub contacts: Vec<Contact>,
}

/// Paged list envelope for deals.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DealsPage {
    #[serde(default, rename = "_embedded")]
    pub embedded: DealsEmbedded,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DealsEmbedded {
    #[serde(default)]
    pub leads: Vec<Deal>,
}

/// Outbound contact payload; serialized as one element of the batch array
/// the CRM expects on create/update.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContactDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible_user_id: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields_values: Vec<CustomFieldValues>,
}

/// Outbound deal payload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DealDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responsible_user_id: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub custom_fields_values: Vec<CustomFieldValues>,
    #[serde(rename = "_embedded", skip_serializing_if = "Option::is_none")]
    pub embedded: Option<DealDraftEmbedded>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DealDraftEmbedded {
    pub contacts: Vec<LinkedContact>,
}

impl DealDraft {
    /// Link the deal to a contact.
    #[must_use]
    pub fn with_contact(mut self, contact_id: i64) -> Self {
        self.embedded = Some(DealDraftEmbedded {
            contacts: vec![LinkedContact { id: contact_id }],
        });
        self
    }
}

/// OAuth2 token exchange response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Custom field definition, from `GET /{entity}/custom_fields`.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomFieldDef {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomFieldsPage {
    #[serde(default, rename = "_embedded")]
    pub embedded: CustomFieldsEmbedded,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomFieldsEmbedded {
    #[serde(default)]
    pub custom_fields: Vec<CustomFieldDef>,
}

/// Which entity collection an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Contacts,
    Deals,
}

impl EntityKind {
    #[must_use]
    pub fn path(self) -> &'static str {
        match self {
            Self::Contacts => "contacts",
            Self::Deals => "leads",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_field_value_by_id() {
        let contact = Contact {
            id: 1,
            name: "Test".into(),
            custom_fields_values: Some(vec![
                CustomFieldValues::text(2, "+79161234567"),
                CustomFieldValues::number(25, 100),
            ]),
            ..Contact::default()
        };
        assert_eq!(contact.field_value(2).as_deref(), Some("+79161234567"));
        assert_eq!(contact.field_value(25).as_deref(), Some("100"));
        assert_eq!(contact.field_value(99), None);
    }

    #[test]
    fn deals_page_parses_leads_envelope() {
        let body = serde_json::json!({
            "_embedded": {
                "leads": [
                    {"id": 501, "name": "Visit", "pipeline_id": 10, "status_id": 11,
                     "_embedded": {"contacts": [{"id": 42}]}}
                ]
            }
        });
        let page: DealsPage = serde_json::from_value(body).unwrap();
        assert_eq!(page.embedded.leads.len(), 1);
        assert_eq!(page.embedded.leads[0].contact_ids(), vec![42]);
    }

    #[test]
    fn draft_omits_absent_fields() {
        let draft = DealDraft {
            name: "Visit".into(),
            pipeline_id: Some(10),
            ..DealDraft::default()
        };
        let json = serde_json::to_value(&draft).unwrap();
        assert!(json.get("status_id").is_none());
        assert!(json.get("_embedded").is_none());
        assert!(json.get("custom_fields_values").is_none());
    }
}
