//! Typed field matchers and patches over the User schema.
//!
//! Update filters, update patches and delete filters arrive as JSON objects.
//! Decoding them into a [`FieldMap`] restricts keys to the known User fields,
//! so a misspelled field is a decode error instead of a filter that silently
//! matches nothing (or a patch that writes a stray key into the document).

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::error::{ModelError, ModelResult, json_kind};
use crate::user::User;

/// The closed set of User fields, by wire name.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserField {
    UserId,
    Email,
    FirstName,
    LastName,
    UserName,
    Password,
    Role,
}

impl UserField {
    pub const ALL: [UserField; 7] = [
        UserField::UserId,
        UserField::Email,
        UserField::FirstName,
        UserField::LastName,
        UserField::UserName,
        UserField::Password,
        UserField::Role,
    ];

    /// Wire/store name of the field.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserField::UserId => "userID",
            UserField::Email => "email",
            UserField::FirstName => "firstName",
            UserField::LastName => "lastName",
            UserField::UserName => "userName",
            UserField::Password => "password",
            UserField::Role => "role",
        }
    }
}

impl core::fmt::Display for UserField {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserField {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UserField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ModelError::unknown_field(s))
    }
}

/// Partial, User-shaped mapping of field → value.
///
/// Used both as a matcher (every listed field must equal the document's
/// value; an empty map matches every document) and as a patch (only listed
/// fields are overwritten).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    fields: BTreeMap<UserField, String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, field: UserField, value: impl Into<String>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: UserField, value: impl Into<String>) {
        self.fields.insert(field, value.into());
    }

    pub fn get(&self, field: UserField) -> Option<&str> {
        self.fields.get(&field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (UserField, &str)> {
        self.fields.iter().map(|(f, v)| (*f, v.as_str()))
    }

    /// True when every listed field equals the document's value.
    pub fn matches(&self, user: &User) -> bool {
        self.iter().all(|(field, value)| user.get(field) == Some(value))
    }

    /// Overwrite the listed fields on `user`. Returns whether anything changed.
    pub fn apply_to(&self, user: &mut User) -> bool {
        let mut changed = false;
        for (field, value) in self.iter() {
            if user.get(field) != Some(value) {
                user.set(field, value);
                changed = true;
            }
        }
        changed
    }

    /// Decode from a JSON object.
    ///
    /// `null` values are treated as absent fields.
    pub fn from_json(value: JsonValue) -> ModelResult<Self> {
        let object = match value {
            JsonValue::Object(map) => map,
            other => return Err(ModelError::NotAnObject(json_kind(&other))),
        };

        let mut fields = BTreeMap::new();
        for (key, value) in object {
            let field: UserField = key.parse()?;
            match value {
                JsonValue::Null => {}
                JsonValue::String(s) => {
                    fields.insert(field, s);
                }
                other => {
                    return Err(ModelError::NonStringValue {
                        field: field.as_str(),
                        found: json_kind(&other),
                    });
                }
            }
        }

        Ok(Self { fields })
    }

    /// Encode as a JSON object keyed by wire names.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(
            self.iter()
                .map(|(f, v)| (f.as_str().to_string(), JsonValue::String(v.to_string())))
                .collect(),
        )
    }
}

impl FromIterator<(UserField, String)> for FieldMap {
    fn from_iter<I: IntoIterator<Item = (UserField, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl Serialize for FieldMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field.as_str(), value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for FieldMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        FieldMap::from_json(value).map_err(D::Error::custom)
    }
}
