//! Users projection: applies User events to the User collection.
//!
//! Each recognized envelope becomes exactly one store operation:
//!
//! | action           | payload                       | store call      |
//! |------------------|-------------------------------|-----------------|
//! | `UserRegistered` | full User document            | `insert`        |
//! | `UserUpdated`    | `{"filter": {..}, "update": {..}}` | `update_many` |
//! | `UserDeleted`    | field filter                  | `delete_many`   |
//!
//! The end-of-stream token is skipped without touching the store. Anything
//! else is an unrecognized-action error scoped to that envelope.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use readmodel_core::{FieldMap, UpdateParams, User, UserField};
use readmodel_events::{
    Action, Applied, EndOfStreamToken, Envelope, EnvelopeHandler, HandlerError, Route,
    USER_DELETED, USER_REGISTERED, USER_UPDATED,
};

use crate::read_model::{StoreError, UserStore};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProjectionError {
    /// Missing store handle or end-of-stream token. Only raised while building.
    #[error("projection misconfigured: {0}")]
    Configuration(String),

    #[error("error unmarshalling {action} payload: {source}")]
    Decode {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("unregistered action: {0}")]
    UnrecognizedAction(String),

    #[error("error processing {action} in the read model: {source}")]
    Store {
        action: &'static str,
        #[source]
        source: StoreError,
    },
}

impl ProjectionError {
    pub fn stage(&self) -> &'static str {
        match self {
            ProjectionError::Configuration(_) => "configure",
            ProjectionError::Decode { .. } => "decode",
            ProjectionError::UnrecognizedAction(_) => "dispatch",
            ProjectionError::Store { .. } => "store",
        }
    }

    fn store(action: &'static str) -> impl FnOnce(StoreError) -> Self {
        move |source| ProjectionError::Store { action, source }
    }
}

impl HandlerError for ProjectionError {
    fn stage(&self) -> &'static str {
        ProjectionError::stage(self)
    }
}

fn decode<T: DeserializeOwned>(action: &'static str, payload: &[u8]) -> Result<T, ProjectionError> {
    serde_json::from_slice(payload).map_err(|source| ProjectionError::Decode { action, source })
}

// ─────────────────────────────────────────────────────────────────────────────
// Projection
// ─────────────────────────────────────────────────────────────────────────────

/// Projection that keeps the User collection in sync with the event stream.
pub struct UsersProjection<S> {
    store: S,
    end_of_stream: EndOfStreamToken,
}

/// Builder for [`UsersProjection`]; both parts are required.
pub struct UsersProjectionBuilder<S> {
    store: Option<S>,
    end_of_stream: Option<String>,
}

impl<S> UsersProjectionBuilder<S>
where
    S: UserStore,
{
    pub fn store(mut self, store: S) -> Self {
        self.store = Some(store);
        self
    }

    pub fn end_of_stream(mut self, token: impl Into<String>) -> Self {
        self.end_of_stream = Some(token.into());
        self
    }

    pub fn build(self) -> Result<UsersProjection<S>, ProjectionError> {
        let store = self
            .store
            .ok_or_else(|| ProjectionError::Configuration("store cannot be absent".to_string()))?;
        let token = self.end_of_stream.ok_or_else(|| {
            ProjectionError::Configuration("end-of-stream token cannot be absent".to_string())
        })?;
        let end_of_stream =
            EndOfStreamToken::new(token).map_err(|e| ProjectionError::Configuration(e.to_string()))?;

        Ok(UsersProjection {
            store,
            end_of_stream,
        })
    }
}

impl<S> UsersProjection<S>
where
    S: UserStore,
{
    pub fn builder() -> UsersProjectionBuilder<S> {
        UsersProjectionBuilder {
            store: None,
            end_of_stream: None,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn end_of_stream(&self) -> &EndOfStreamToken {
        &self.end_of_stream
    }

    /// Apply one envelope to the read model.
    pub async fn apply_envelope(&self, envelope: &Envelope) -> Result<Applied, ProjectionError> {
        match Action::classify(envelope.action(), &self.end_of_stream) {
            Action::EndOfStream => Ok(Applied::Skipped),
            Action::UserRegistered => self.apply_registered(envelope.payload()).await,
            Action::UserUpdated => self.apply_updated(envelope.payload()).await,
            Action::UserDeleted => self.apply_deleted(envelope.payload()).await,
            Action::Unrecognized(tag) => Err(ProjectionError::UnrecognizedAction(tag.to_string())),
        }
    }

    async fn apply_registered(&self, payload: &[u8]) -> Result<Applied, ProjectionError> {
        let user: User = decode(USER_REGISTERED, payload)?;
        let id = self
            .store
            .insert(user)
            .await
            .map_err(ProjectionError::store(USER_REGISTERED))?;
        Ok(Applied::Inserted(id))
    }

    async fn apply_updated(&self, payload: &[u8]) -> Result<Applied, ProjectionError> {
        let params: UpdateParams = decode(USER_UPDATED, payload)?;
        let res = self
            .store
            .update_many(&params.filter, &params.update)
            .await
            .map_err(ProjectionError::store(USER_UPDATED))?;
        Ok(Applied::Updated {
            matched: res.matched,
            modified: res.modified,
        })
    }

    async fn apply_deleted(&self, payload: &[u8]) -> Result<Applied, ProjectionError> {
        let filter: FieldMap = decode(USER_DELETED, payload)?;
        let deleted = self
            .store
            .delete_many(&filter)
            .await
            .map_err(ProjectionError::store(USER_DELETED))?;
        Ok(Applied::Deleted(deleted))
    }

    /// First document matching `filter`.
    pub async fn find_one(&self, filter: &FieldMap) -> Result<Option<User>, StoreError> {
        self.store.find_one(filter).await
    }

    /// Get a single user by `userID`.
    pub async fn get(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        self.find_one(&FieldMap::new().with(UserField::UserId, user_id))
            .await
    }

    /// Ordering constraint for an envelope, from its payload.
    ///
    /// - Registration, update or delete pinned to a `userID`: keyed by it
    /// - Any other mutation (filter on `userName`, empty filter, registration
    ///   without `userID`): exclusive, since it may touch any document
    /// - End-of-stream, unrecognized actions and undecodable payloads never
    ///   reach the store: unordered
    pub fn route_for(&self, envelope: &Envelope) -> Route {
        let user_id = match Action::classify(envelope.action(), &self.end_of_stream) {
            Action::UserRegistered => serde_json::from_slice::<User>(envelope.payload())
                .map(|user| user.user_id),
            Action::UserUpdated => serde_json::from_slice::<UpdateParams>(envelope.payload())
                .map(|params| params.target_user_id().map(str::to_string)),
            Action::UserDeleted => serde_json::from_slice::<FieldMap>(envelope.payload())
                .map(|filter| filter.get(UserField::UserId).map(str::to_string)),
            Action::EndOfStream | Action::Unrecognized(_) => return Route::Unordered,
        };

        match user_id {
            Ok(Some(user_id)) => Route::Keyed(user_id),
            Ok(None) => Route::Exclusive,
            Err(_) => Route::Unordered,
        }
    }
}

#[async_trait]
impl<S> EnvelopeHandler for UsersProjection<S>
where
    S: UserStore + 'static,
{
    type Error = ProjectionError;

    async fn handle(&self, envelope: &Envelope) -> Result<Applied, Self::Error> {
        self.apply_envelope(envelope).await
    }

    /// Transport ordering key first, then the payload.
    fn route(&self, envelope: &Envelope) -> Route {
        match envelope.ordering_key() {
            Some(key) => Route::Keyed(key.to_string()),
            None => self.route_for(envelope),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
