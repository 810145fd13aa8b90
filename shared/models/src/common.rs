use serde::{Deserialize, Serialize};

/// A patchable field value.
///
/// Serialized as `{"value": ..., "is_null": false}` to set, `{"is_null":
/// true}` to clear. A field that is absent from the enclosing patch
/// (`Option::None`) means "no change on merge".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullableField<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(default)]
    pub is_null: bool,
}

impl<T> NullableField<T> {
    pub fn set(value: T) -> Self {
        Self {
            value: Some(value),
            is_null: false,
        }
    }

    pub fn null() -> Self {
        Self {
            value: None,
            is_null: true,
        }
    }

    /// Merge this patch field into a target `Option`.
    pub fn apply_to(self, target: &mut Option<T>) {
        if self.is_null {
            *target = None;
        } else if let Some(value) = self.value {
            *target = Some(value);
        }
    }
}

/// Merge an optional patch field; `None` leaves the target untouched.
pub fn merge_field<T>(patch: Option<NullableField<T>>, target: &mut Option<T>) {
    if let Some(field) = patch {
        field.apply_to(target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_semantics() {
        let mut target = Some("old".to_string());

        merge_field(None, &mut target);
        assert_eq!(target.as_deref(), Some("old"));

        merge_field(Some(NullableField::set("new".to_string())), &mut target);
        assert_eq!(target.as_deref(), Some("new"));

        merge_field(Some(NullableField::null()), &mut target);
        assert_eq!(target, None);
    }

    #[test]
    fn test_wire_format() {
        let set: NullableField<i64> = serde_json::from_str(r#"{"value": 3, "is_null": false}"#).unwrap();
        assert_eq!(set.value, Some(3));
        assert!(!set.is_null);

        let cleared: NullableField<i64> = serde_json::from_str(r#"{"is_null": true}"#).unwrap();
        assert!(cleared.is_null);
        assert_eq!(serde_json::to_string(&cleared).unwrap(), r#"{"is_null":true}"#);
    }
}
