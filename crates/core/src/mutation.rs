//! Decoded per-action mutation parameters.
//!
//! - `UserRegistered` carries a full [`User`](crate::User).
//! - `UserUpdated` carries [`UpdateParams`].
//! - `UserDeleted` carries a bare [`FieldMap`] filter.

use serde::{Deserialize, Serialize};

use crate::field::{FieldMap, UserField};

/// Payload of a `UserUpdated` event.
///
/// Both maps default to empty when omitted. An empty filter matches every
/// document (multi-document update).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateParams {
    #[serde(default)]
    pub filter: FieldMap,
    #[serde(default)]
    pub update: FieldMap,
}

impl UpdateParams {
    /// The `userID` the filter targets, if it pins one.
    pub fn target_user_id(&self) -> Option<&str> {
        self.filter.get(UserField::UserId)
    }
}
