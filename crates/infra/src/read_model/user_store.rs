use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use readmodel_core::{DocumentId, FieldMap, User, UserField};

/// Unique index on a single User field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UniqueIndex {
    pub name: &'static str,
    pub field: UserField,
}

/// Indexes every User collection carries. Absent values are not indexed.
pub const USER_INDEXES: [UniqueIndex; 2] = [
    UniqueIndex {
        name: "userID_index",
        field: UserField::UserId,
    },
    UniqueIndex {
        name: "userName_index",
        field: UserField::UserName,
    },
];

/// Result of a multi-document update.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Documents the filter matched.
    pub matched: u64,
    /// Documents whose contents actually changed.
    pub modified: u64,
}

/// Read model store operation error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key on index {index}")]
    DuplicateKey { index: String },

    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Document store holding one collection of User documents.
///
/// Each call is a single store operation; atomicity is whatever the backend
/// gives a single insert / update-many / delete-many. Implementations are
/// shared across concurrently running handlers.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn insert(&self, user: User) -> Result<DocumentId, StoreError>;

    /// Delete every matching document. Zero matches is not an error.
    async fn delete_many(&self, filter: &FieldMap) -> Result<u64, StoreError>;

    /// Patch every matching document with the same field values.
    async fn update_many(
        &self,
        filter: &FieldMap,
        update: &FieldMap,
    ) -> Result<UpdateResult, StoreError>;

    async fn find_one(&self, filter: &FieldMap) -> Result<Option<User>, StoreError>;
}

#[async_trait]
impl<S> UserStore for Arc<S>
where
    S: UserStore + ?Sized,
{
    async fn insert(&self, user: User) -> Result<DocumentId, StoreError> {
        (**self).insert(user).await
    }

    async fn delete_many(&self, filter: &FieldMap) -> Result<u64, StoreError> {
        (**self).delete_many(filter).await
    }

    async fn update_many(
        &self,
        filter: &FieldMap,
        update: &FieldMap,
    ) -> Result<UpdateResult, StoreError> {
        (**self).update_many(filter, update).await
    }

    async fn find_one(&self, filter: &FieldMap) -> Result<Option<User>, StoreError> {
        (**self).find_one(filter).await
    }
}

/// In-memory User collection for tests/dev.
///
/// Enforces [`USER_INDEXES`] like a real collection would. Documents keep
/// insertion order, so `find_one` returns the oldest match.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    docs: RwLock<Vec<(DocumentId, User)>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every document (test helper).
    pub fn documents(&self) -> Vec<User> {
        match self.docs.read() {
            Ok(docs) => docs.iter().map(|(_, u)| u.clone()).collect(),
            Err(_) => vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("lock poisoned".to_string())
}

fn duplicate(index: &UniqueIndex) -> StoreError {
    StoreError::DuplicateKey {
        index: index.name.to_string(),
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn insert(&self, user: User) -> Result<DocumentId, StoreError> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;

        for index in &USER_INDEXES {
            if let Some(value) = user.get(index.field) {
                if docs.iter().any(|(_, d)| d.get(index.field) == Some(value)) {
                    return Err(duplicate(index));
                }
            }
        }

        let id = DocumentId::new();
        docs.push((id, user));
        Ok(id)
    }

    async fn delete_many(&self, filter: &FieldMap) -> Result<u64, StoreError> {
        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        let before = docs.len();
        docs.retain(|(_, d)| !filter.matches(d));
        Ok((before - docs.len()) as u64)
    }

    async fn update_many(
        &self,
        filter: &FieldMap,
        update: &FieldMap,
    ) -> Result<UpdateResult, StoreError> {
        if update.is_empty() {
            return Err(StoreError::InvalidUpdate("update document is empty".to_string()));
        }

        let mut docs = self.docs.write().map_err(|_| poisoned())?;
        let matched: Vec<usize> = docs
            .iter()
            .enumerate()
            .filter(|(_, (_, d))| filter.matches(d))
            .map(|(i, _)| i)
            .collect();

        // All-or-nothing: check every index before touching a document.
        for index in &USER_INDEXES {
            if let Some(value) = update.get(index.field) {
                let untouched_holders = docs
                    .iter()
                    .enumerate()
                    .filter(|(i, (_, d))| !matched.contains(i) && d.get(index.field) == Some(value))
                    .count();
                if untouched_holders + matched.len() > 1 {
                    return Err(duplicate(index));
                }
            }
        }

        let mut modified = 0;
        for i in &matched {
            if update.apply_to(&mut docs[*i].1) {
                modified += 1;
            }
        }

        Ok(UpdateResult {
            matched: matched.len() as u64,
            modified,
        })
    }

    async fn find_one(&self, filter: &FieldMap) -> Result<Option<User>, StoreError> {
        let docs = self.docs.read().map_err(|_| poisoned())?;
        Ok(docs.iter().find(|(_, d)| filter.matches(d)).map(|(_, d)| d.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, name: &str) -> User {
        User {
            user_id: Some(id.to_string()),
            user_name: Some(name.to_string()),
            first_name: Some("A".to_string()),
            last_name: Some("B".to_string()),
            ..User::default()
        }
    }

    fn by_id(id: &str) -> FieldMap {
        FieldMap::new().with(UserField::UserId, id)
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_user_id() {
        let store = InMemoryUserStore::new();
        store.insert(user("u1", "n1")).await.unwrap();

        let err = store.insert(user("u1", "n2")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { ref index } if index == "userID_index"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_user_name() {
        let store = InMemoryUserStore::new();
        store.insert(user("u1", "n1")).await.unwrap();

        let err = store.insert(user("u2", "n1")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { ref index } if index == "userName_index"));
    }

    #[tokio::test]
    async fn absent_index_values_do_not_collide() {
        let store = InMemoryUserStore::new();
        store.insert(User::default()).await.unwrap();
        store.insert(User::default()).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn update_many_patches_every_match() {
        let store = InMemoryUserStore::new();
        store.insert(user("u1", "n1")).await.unwrap();
        store.insert(user("u2", "n2")).await.unwrap();

        let res = store
            .update_many(&FieldMap::new(), &FieldMap::new().with(UserField::Role, "member"))
            .await
            .unwrap();

        assert_eq!(res, UpdateResult { matched: 2, modified: 2 });
        assert!(store.documents().iter().all(|u| u.role.as_deref() == Some("member")));
    }

    #[tokio::test]
    async fn update_counts_unchanged_documents_as_matched_only() {
        let store = InMemoryUserStore::new();
        store.insert(user("u1", "n1")).await.unwrap();

        let res = store
            .update_many(&by_id("u1"), &FieldMap::new().with(UserField::FirstName, "A"))
            .await
            .unwrap();
        assert_eq!(res, UpdateResult { matched: 1, modified: 0 });
    }

    #[tokio::test]
    async fn update_that_would_duplicate_an_index_is_rejected_whole() {
        let store = InMemoryUserStore::new();
        store.insert(user("u1", "n1")).await.unwrap();
        store.insert(user("u2", "n2")).await.unwrap();

        let err = store
            .update_many(&by_id("u2"), &FieldMap::new().with(UserField::UserName, "n1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));

        let u2 = store.find_one(&by_id("u2")).await.unwrap().unwrap();
        assert_eq!(u2.user_name.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn empty_update_is_invalid() {
        let store = InMemoryUserStore::new();
        let err = store.update_many(&FieldMap::new(), &FieldMap::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidUpdate(_)));
    }

    #[tokio::test]
    async fn delete_many_reports_count_and_tolerates_zero() {
        let store = InMemoryUserStore::new();
        store.insert(user("u1", "n1")).await.unwrap();

        assert_eq!(store.delete_many(&by_id("nope")).await.unwrap(), 0);
        assert_eq!(store.delete_many(&by_id("u1")).await.unwrap(), 1);
        assert!(store.find_one(&by_id("u1")).await.unwrap().is_none());
    }
}
