use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::Contact;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct List {
    pub id: String,
    pub name: String,
    /// Double-opt-in lists start memberships as `pending` until confirmed.
    #[serde(default)]
    pub is_double_optin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMembership {
    pub contact_email: String,
    pub list_id: String,
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Pending,
    Unsubscribed,
    Bounced,
    Complained,
}

impl MembershipStatus {
    /// Statuses that exclude a contact from any audience on that list.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Unsubscribed | Self::Bounced | Self::Complained)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Pending => "pending",
            Self::Unsubscribed => "unsubscribed",
            Self::Bounced => "bounced",
            Self::Complained => "complained",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "pending" => Some(Self::Pending),
            "unsubscribed" => Some(Self::Unsubscribed),
            "bounced" => Some(Self::Bounced),
            "complained" => Some(Self::Complained),
            _ => None,
        }
    }
}

impl std::fmt::Display for MembershipStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A computed audience: a predicate over contact fields, with membership
/// refreshed periodically rather than on every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    pub name: String,
    pub predicate: SegmentPredicate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentPredicate {
    And { predicates: Vec<SegmentPredicate> },
    Or { predicates: Vec<SegmentPredicate> },
    Condition(SegmentCondition),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentCondition {
    /// Contact field name, e.g. "country" or "custom_number_1".
    pub field: String,
    pub op: SegmentOp,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentOp {
    Eq,
    Neq,
    Contains,
    Gt,
    Lt,
    IsSet,
    IsNotSet,
}

impl SegmentPredicate {
    pub fn matches(&self, contact: &Contact) -> bool {
        match self {
            Self::And { predicates } => predicates.iter().all(|p| p.matches(contact)),
            Self::Or { predicates } => predicates.iter().any(|p| p.matches(contact)),
            Self::Condition(cond) => cond.matches(contact),
        }
    }
}

impl SegmentCondition {
    pub fn matches(&self, contact: &Contact) -> bool {
        let field = contact_field_value(contact, &self.field);

        match self.op {
            SegmentOp::IsSet => !field.is_null(),
            SegmentOp::IsNotSet => field.is_null(),
            SegmentOp::Eq => field == self.value,
            SegmentOp::Neq => field != self.value,
            SegmentOp::Contains => match (field.as_str(), self.value.as_str()) {
                (Some(haystack), Some(needle)) => haystack.contains(needle),
                _ => false,
            },
            SegmentOp::Gt => {
                compare_values(&field, &self.value) == Some(std::cmp::Ordering::Greater)
            }
            SegmentOp::Lt => compare_values(&field, &self.value) == Some(std::cmp::Ordering::Less),
        }
    }
}

/// Ordering for Gt/Lt conditions: numeric when both sides are numbers,
/// lexicographic when both are strings. Datetime fields surface as RFC 3339
/// UTC strings, which order chronologically under string comparison.
fn compare_values(a: &serde_json::Value, b: &serde_json::Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn contact_field_value(contact: &Contact, field: &str) -> serde_json::Value {
    fn opt_str(value: &Option<String>) -> serde_json::Value {
        value
            .as_deref()
            .map(Into::into)
            .unwrap_or(serde_json::Value::Null)
    }
    fn opt_num(value: &Option<f64>) -> serde_json::Value {
        value.map(Into::into).unwrap_or(serde_json::Value::Null)
    }
    fn opt_datetime(value: &Option<DateTime<Utc>>) -> serde_json::Value {
        value
            .map(|t| t.to_rfc3339().into())
            .unwrap_or(serde_json::Value::Null)
    }
    fn opt_json(value: &Option<serde_json::Value>) -> serde_json::Value {
        value.clone().unwrap_or(serde_json::Value::Null)
    }

    match field {
        "email" => contact.email.as_str().into(),
        "external_id" => opt_str(&contact.external_id),
        "timezone" => opt_str(&contact.timezone),
        "language" => opt_str(&contact.language),
        "first_name" => opt_str(&contact.first_name),
        "last_name" => opt_str(&contact.last_name),
        "phone" => opt_str(&contact.phone),
        "country" => opt_str(&contact.country),
        "postcode" => opt_str(&contact.postcode),
        "state" => opt_str(&contact.state),
        "job_title" => opt_str(&contact.job_title),
        "custom_string_1" => opt_str(&contact.custom_string_1),
        "custom_string_2" => opt_str(&contact.custom_string_2),
        "custom_string_3" => opt_str(&contact.custom_string_3),
        "custom_string_4" => opt_str(&contact.custom_string_4),
        "custom_string_5" => opt_str(&contact.custom_string_5),
        "custom_number_1" => opt_num(&contact.custom_number_1),
        "custom_number_2" => opt_num(&contact.custom_number_2),
        "custom_number_3" => opt_num(&contact.custom_number_3),
        "custom_number_4" => opt_num(&contact.custom_number_4),
        "custom_number_5" => opt_num(&contact.custom_number_5),
        "custom_datetime_1" => opt_datetime(&contact.custom_datetime_1),
        "custom_datetime_2" => opt_datetime(&contact.custom_datetime_2),
        "custom_datetime_3" => opt_datetime(&contact.custom_datetime_3),
        "custom_datetime_4" => opt_datetime(&contact.custom_datetime_4),
        "custom_datetime_5" => opt_datetime(&contact.custom_datetime_5),
        "custom_json_1" => opt_json(&contact.custom_json_1),
        "custom_json_2" => opt_json(&contact.custom_json_2),
        "custom_json_3" => opt_json(&contact.custom_json_3),
        "custom_json_4" => opt_json(&contact.custom_json_4),
        "custom_json_5" => opt_json(&contact.custom_json_5),
        _ => serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppressed_statuses() {
        assert!(MembershipStatus::Bounced.is_suppressed());
        assert!(MembershipStatus::Complained.is_suppressed());
        assert!(MembershipStatus::Unsubscribed.is_suppressed());
        assert!(!MembershipStatus::Active.is_suppressed());
        assert!(!MembershipStatus::Pending.is_suppressed());
    }

    #[test]
    fn test_segment_predicate_eval() {
        let mut contact = Contact::new("a@b.test");
        contact.country = Some("DE".to_string());
        contact.custom_number_1 = Some(41.5);

        let predicate = SegmentPredicate::And {
            predicates: vec![
                SegmentPredicate::Condition(SegmentCondition {
                    field: "country".to_string(),
                    op: SegmentOp::Eq,
                    value: "DE".into(),
                }),
                SegmentPredicate::Condition(SegmentCondition {
                    field: "custom_number_1".to_string(),
                    op: SegmentOp::Gt,
                    value: 40.into(),
                }),
            ],
        };
        assert!(predicate.matches(&contact));

        contact.custom_number_1 = Some(12.0);
        assert!(!predicate.matches(&contact));
    }

    #[test]
    fn test_segment_is_set() {
        let contact = Contact::new("a@b.test");
        let set = SegmentPredicate::Condition(SegmentCondition {
            field: "first_name".to_string(),
            op: SegmentOp::IsSet,
            value: serde_json::Value::Null,
        });
        assert!(!set.matches(&contact));
    }

    #[test]
    fn test_segment_datetime_conditions() {
        let mut contact = Contact::new("a@b.test");
        contact.custom_datetime_1 =
            Some("2024-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap());

        let after_may = SegmentPredicate::Condition(SegmentCondition {
            field: "custom_datetime_1".to_string(),
            op: SegmentOp::Gt,
            value: "2024-05-01T00:00:00+00:00".into(),
        });
        assert!(after_may.matches(&contact));

        let before_may = SegmentPredicate::Condition(SegmentCondition {
            field: "custom_datetime_1".to_string(),
            op: SegmentOp::Lt,
            value: "2024-05-01T00:00:00+00:00".into(),
        });
        assert!(!before_may.matches(&contact));

        let set = SegmentPredicate::Condition(SegmentCondition {
            field: "custom_datetime_2".to_string(),
            op: SegmentOp::IsSet,
            value: serde_json::Value::Null,
        });
        assert!(!set.matches(&contact));
    }

    #[test]
    fn test_segment_json_conditions() {
        let mut contact = Contact::new("a@b.test");
        contact.custom_json_1 = Some(serde_json::json!({"plan": "pro"}));

        let set = SegmentPredicate::Condition(SegmentCondition {
            field: "custom_json_1".to_string(),
            op: SegmentOp::IsSet,
            value: serde_json::Value::Null,
        });
        assert!(set.matches(&contact));

        let equals = SegmentPredicate::Condition(SegmentCondition {
            field: "custom_json_1".to_string(),
            op: SegmentOp::Eq,
            value: serde_json::json!({"plan": "pro"}),
        });
        assert!(equals.matches(&contact));

        let unset = SegmentPredicate::Condition(SegmentCondition {
            field: "custom_json_2".to_string(),
            op: SegmentOp::IsSet,
            value: serde_json::Value::Null,
        });
        assert!(!unset.matches(&contact));
    }
}
