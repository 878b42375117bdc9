//! The projected User document.

use serde::{Deserialize, Serialize};

use crate::field::UserField;

/// Aggregate identifier of the User aggregate.
///
/// Event streams for this aggregate are keyed `<stream>.<AGGREGATE_ID>`.
pub const AGGREGATE_ID: i8 = 1;

/// User read model document.
///
/// Every field may be absent; absent fields are omitted on the wire and in
/// the store. `user_id` and `user_name` are unique across live documents,
/// which the store enforces through its indexes. Keys outside the seven
/// fields are dropped when decoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(rename = "email", default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "firstName", default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(rename = "userName", default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(rename = "password", default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "role", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl User {
    /// Value of a single field, if present.
    pub fn get(&self, field: UserField) -> Option<&str> {
        self.slot(field).as_deref()
    }

    /// Overwrite a single field.
    pub fn set(&mut self, field: UserField, value: impl Into<String>) {
        *self.slot_mut(field) = Some(value.into());
    }

    fn slot(&self, field: UserField) -> &Option<String> {
        match field {
            UserField::UserId => &self.user_id,
            UserField::Email => &self.email,
            UserField::FirstName => &self.first_name,
            UserField::LastName => &self.last_name,
            UserField::UserName => &self.user_name,
            UserField::Password => &self.password,
            UserField::Role => &self.role,
        }
    }

    fn slot_mut(&mut self, field: UserField) -> &mut Option<String> {
        match field {
            UserField::UserId => &mut self.user_id,
            UserField::Email => &mut self.email,
            UserField::FirstName => &mut self.first_name,
            UserField::LastName => &mut self.last_name,
            UserField::UserName => &mut self.user_name,
            UserField::Password => &mut self.password,
            UserField::Role => &mut self.role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_fields_are_omitted_on_the_wire() {
        let user = User {
            user_id: Some("u1".to_string()),
            email: Some("e@x".to_string()),
            ..User::default()
        };

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json, serde_json::json!({ "userID": "u1", "email": "e@x" }));
    }

    #[test]
    fn decodes_the_registration_payload_shape() {
        let payload = br#"{"userID":"u9","userName":"n9","email":"e@x","role":null}"#;
        let user: User = serde_json::from_slice(payload).unwrap();

        assert_eq!(user.get(UserField::UserId), Some("u9"));
        assert_eq!(user.get(UserField::UserName), Some("n9"));
        assert_eq!(user.get(UserField::Email), Some("e@x"));
        assert_eq!(user.role, None);
    }

    #[test]
    fn unknown_fields_are_dropped() {
        let payload = br#"{"userID":"u1","nickname":"nick","createdAt":"2024-01-01"}"#;
        let user: User = serde_json::from_slice(payload).unwrap();

        assert_eq!(user.get(UserField::UserId), Some("u1"));
        assert_eq!(
            serde_json::to_value(&user).unwrap(),
            serde_json::json!({ "userID": "u1" })
        );
    }

    #[test]
    fn set_overwrites_a_single_field() {
        let mut user = User::default();
        user.set(UserField::FirstName, "A");
        user.set(UserField::FirstName, "C");
        assert_eq!(user.get(UserField::FirstName), Some("C"));
        assert_eq!(user.get(UserField::LastName), None);
    }
}
