use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::common::{merge_field, NullableField};

/// A recipient. The (normalized) email is the primary identity inside a
/// workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow, Validate)]
pub struct Contact {
    #[validate(email)]
    pub email: String,
    pub external_id: Option<String>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub country: Option<String>,
    pub postcode: Option<String>,
    pub state: Option<String>,
    pub job_title: Option<String>,

    pub custom_string_1: Option<String>,
    pub custom_string_2: Option<String>,
    pub custom_string_3: Option<String>,
    pub custom_string_4: Option<String>,
    pub custom_string_5: Option<String>,
    pub custom_number_1: Option<f64>,
    pub custom_number_2: Option<f64>,
    pub custom_number_3: Option<f64>,
    pub custom_number_4: Option<f64>,
    pub custom_number_5: Option<f64>,
    pub custom_datetime_1: Option<DateTime<Utc>>,
    pub custom_datetime_2: Option<DateTime<Utc>>,
    pub custom_datetime_3: Option<DateTime<Utc>>,
    pub custom_datetime_4: Option<DateTime<Utc>>,
    pub custom_datetime_5: Option<DateTime<Utc>>,
    pub custom_json_1: Option<serde_json::Value>,
    pub custom_json_2: Option<serde_json::Value>,
    pub custom_json_3: Option<serde_json::Value>,
    pub custom_json_4: Option<serde_json::Value>,
    pub custom_json_5: Option<serde_json::Value>,

    /// Raised after hard bounces on two or more lists; such contacts are
    /// excluded from every audience.
    #[serde(default)]
    pub deliverability_flagged: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

/// Partial contact update. Absent fields leave the contact untouched;
/// `{"is_null": true}` clears.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactPatch {
    pub external_id: Option<NullableField<String>>,
    pub timezone: Option<NullableField<String>>,
    pub language: Option<NullableField<String>>,
    pub first_name: Option<NullableField<String>>,
    pub last_name: Option<NullableField<String>>,
    pub phone: Option<NullableField<String>>,
    pub address_line_1: Option<NullableField<String>>,
    pub address_line_2: Option<NullableField<String>>,
    pub country: Option<NullableField<String>>,
    pub postcode: Option<NullableField<String>>,
    pub state: Option<NullableField<String>>,
    pub job_title: Option<NullableField<String>>,

    pub custom_string_1: Option<NullableField<String>>,
    pub custom_string_2: Option<NullableField<String>>,
    pub custom_string_3: Option<NullableField<String>>,
    pub custom_string_4: Option<NullableField<String>>,
    pub custom_string_5: Option<NullableField<String>>,
    pub custom_number_1: Option<NullableField<f64>>,
    pub custom_number_2: Option<NullableField<f64>>,
    pub custom_number_3: Option<NullableField<f64>>,
    pub custom_number_4: Option<NullableField<f64>>,
    pub custom_number_5: Option<NullableField<f64>>,
    pub custom_datetime_1: Option<NullableField<DateTime<Utc>>>,
    pub custom_datetime_2: Option<NullableField<DateTime<Utc>>>,
    pub custom_datetime_3: Option<NullableField<DateTime<Utc>>>,
    pub custom_datetime_4: Option<NullableField<DateTime<Utc>>>,
    pub custom_datetime_5: Option<NullableField<DateTime<Utc>>>,
    pub custom_json_1: Option<NullableField<serde_json::Value>>,
    pub custom_json_2: Option<NullableField<serde_json::Value>>,
    pub custom_json_3: Option<NullableField<serde_json::Value>>,
    pub custom_json_4: Option<NullableField<serde_json::Value>>,
    pub custom_json_5: Option<NullableField<serde_json::Value>>,
}

impl Contact {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            ..Default::default()
        }
    }

    pub fn apply_patch(&mut self, patch: ContactPatch) {
        merge_field(patch.external_id, &mut self.external_id);
        merge_field(patch.timezone, &mut self.timezone);
        merge_field(patch.language, &mut self.language);
        merge_field(patch.first_name, &mut self.first_name);
        merge_field(patch.last_name, &mut self.last_name);
        merge_field(patch.phone, &mut self.phone);
        merge_field(patch.address_line_1, &mut self.address_line_1);
        merge_field(patch.address_line_2, &mut self.address_line_2);
        merge_field(patch.country, &mut self.country);
        merge_field(patch.postcode, &mut self.postcode);
        merge_field(patch.state, &mut self.state);
        merge_field(patch.job_title, &mut self.job_title);

        merge_field(patch.custom_string_1, &mut self.custom_string_1);
        merge_field(patch.custom_string_2, &mut self.custom_string_2);
        merge_field(patch.custom_string_3, &mut self.custom_string_3);
        merge_field(patch.custom_string_4, &mut self.custom_string_4);
        merge_field(patch.custom_string_5, &mut self.custom_string_5);
        merge_field(patch.custom_number_1, &mut self.custom_number_1);
        merge_field(patch.custom_number_2, &mut self.custom_number_2);
        merge_field(patch.custom_number_3, &mut self.custom_number_3);
        merge_field(patch.custom_number_4, &mut self.custom_number_4);
        merge_field(patch.custom_number_5, &mut self.custom_number_5);
        merge_field(patch.custom_datetime_1, &mut self.custom_datetime_1);
        merge_field(patch.custom_datetime_2, &mut self.custom_datetime_2);
        merge_field(patch.custom_datetime_3, &mut self.custom_datetime_3);
        merge_field(patch.custom_datetime_4, &mut self.custom_datetime_4);
        merge_field(patch.custom_datetime_5, &mut self.custom_datetime_5);
        merge_field(patch.custom_json_1, &mut self.custom_json_1);
        merge_field(patch.custom_json_2, &mut self.custom_json_2);
        merge_field(patch.custom_json_3, &mut self.custom_json_3);
        merge_field(patch.custom_json_4, &mut self.custom_json_4);
        merge_field(patch.custom_json_5, &mut self.custom_json_5);

        self.updated_at = Utc::now();
    }

    pub fn full_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.clone()),
            (None, Some(last)) => Some(last.clone()),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_patch_merge_semantics() {
        let mut contact = Contact::new("a@b.test");
        contact.first_name = Some("Ada".to_string());
        contact.timezone = Some("UTC".to_string());

        contact.apply_patch(ContactPatch {
            first_name: Some(NullableField::set("Grace".to_string())),
            timezone: Some(NullableField::null()),
            last_name: None,
            ..Default::default()
        });

        assert_eq!(contact.first_name.as_deref(), Some("Grace"));
        assert_eq!(contact.timezone, None);
        assert_eq!(contact.last_name, None);
    }

    #[test]
    fn test_email_validation() {
        assert!(Contact::new("a@b.test").validate().is_ok());
        assert!(Contact::new("not-an-email").validate().is_err());
    }

    #[test]
    fn test_full_name() {
        let mut contact = Contact::new("a@b.test");
        assert_eq!(contact.full_name(), None);
        contact.last_name = Some("Lovelace".to_string());
        assert_eq!(contact.full_name().as_deref(), Some("Lovelace"));
        contact.first_name = Some("Ada".to_string());
        assert_eq!(contact.full_name().as_deref(), Some("Ada Lovelace"));
    }
}
