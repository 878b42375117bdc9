//! Postgres-backed User collection.
//!
//! Each collection is a table of JSONB documents:
//!
//! ```text
//! <collection> (id UUID PRIMARY KEY, doc JSONB NOT NULL, updated_at TIMESTAMPTZ)
//! ```
//!
//! Matching uses JSONB containment (`doc @> filter`), so an empty filter
//! matches every row. Patches merge with `doc || patch`. Uniqueness of
//! `userID` / `userName` is enforced by unique expression indexes created in
//! [`PostgresUserStore::ensure_collection`].

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{info, instrument};

use readmodel_core::{DocumentId, FieldMap, User};

use super::user_store::{StoreError, USER_INDEXES, UpdateResult, UserStore};

const UNIQUE_VIOLATION: &str = "23505";

pub struct PostgresUserStore {
    pool: PgPool,
    collection: String,
}

/// Collection names are interpolated into SQL, so only plain identifiers pass.
fn validate_collection(name: &str) -> Result<(), StoreError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !valid_start
        || name.len() > 48
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidCollection(name.to_string()));
    }
    Ok(())
}

fn index_name(collection: &str, index: &str) -> String {
    format!("{}_{}", collection, index).to_lowercase()
}

impl PostgresUserStore {
    pub fn new(pool: PgPool, collection: impl Into<String>) -> Result<Self, StoreError> {
        let collection = collection.into();
        validate_collection(&collection)?;
        Ok(Self { pool, collection })
    }

    /// Open a pool against `database_url` and bind it to `collection`.
    pub async fn connect(
        database_url: &str,
        collection: impl Into<String>,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Self::new(pool, collection)
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Create the collection table and its unique indexes (idempotent).
    #[instrument(skip(self), fields(collection = %self.collection), err)]
    pub async fn ensure_collection(&self) -> Result<(), StoreError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                doc JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            table = self.collection
        );
        sqlx::query(&create_table)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        for index in &USER_INDEXES {
            let create_index = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {name} ON {table} ((doc->>'{field}'))",
                name = index_name(&self.collection, index.name),
                table = self.collection,
                field = index.field.as_str(),
            );
            sqlx::query(&create_index)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        }

        info!(collection = %self.collection, "read model collection ready");
        Ok(())
    }
}

/// Map a unique violation back to the logical index name.
fn map_sqlx_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
            let constraint = db.constraint().unwrap_or_default().to_lowercase();
            let index = USER_INDEXES
                .iter()
                .find(|i| constraint.ends_with(&i.name.to_lowercase()))
                .map(|i| i.name.to_string())
                .unwrap_or(constraint);
            return StoreError::DuplicateKey { index };
        }
    }
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl UserStore for PostgresUserStore {
    async fn insert(&self, user: User) -> Result<DocumentId, StoreError> {
        let id = DocumentId::new();
        let sql = format!("INSERT INTO {} (id, doc) VALUES ($1, $2)", self.collection);

        sqlx::query(&sql)
            .bind(*id.as_uuid())
            .bind(Json(&user))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(id)
    }

    async fn delete_many(&self, filter: &FieldMap) -> Result<u64, StoreError> {
        let sql = format!("DELETE FROM {} WHERE doc @> $1", self.collection);

        let res = sqlx::query(&sql)
            .bind(Json(filter.to_json()))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(res.rows_affected())
    }

    async fn update_many(
        &self,
        filter: &FieldMap,
        update: &FieldMap,
    ) -> Result<UpdateResult, StoreError> {
        if update.is_empty() {
            return Err(StoreError::InvalidUpdate("update document is empty".to_string()));
        }

        let sql = format!(
            r#"
            WITH matched AS (
                SELECT id, doc FROM {table} WHERE doc @> $1 FOR UPDATE
            ),
            updated AS (
                UPDATE {table} t
                SET doc = t.doc || $2, updated_at = NOW()
                FROM matched
                WHERE t.id = matched.id AND NOT matched.doc @> $2
                RETURNING t.id
            )
            SELECT
                (SELECT COUNT(*) FROM matched) AS matched,
                (SELECT COUNT(*) FROM updated) AS modified
            "#,
            table = self.collection
        );

        let row = sqlx::query(&sql)
            .bind(Json(filter.to_json()))
            .bind(Json(update.to_json()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let matched: i64 = row.try_get("matched").map_err(map_sqlx_error)?;
        let modified: i64 = row.try_get("modified").map_err(map_sqlx_error)?;

        Ok(UpdateResult {
            matched: matched.max(0) as u64,
            modified: modified.max(0) as u64,
        })
    }

    async fn find_one(&self, filter: &FieldMap) -> Result<Option<User>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE doc @> $1 ORDER BY id LIMIT 1",
            self.collection
        );

        let row = sqlx::query(&sql)
            .bind(Json(filter.to_json()))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        match row {
            Some(row) => {
                let Json(user): Json<User> = row
                    .try_get("doc")
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }
}
