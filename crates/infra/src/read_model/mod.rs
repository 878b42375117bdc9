//! Read model storage: the User collection seam and its implementations.

pub mod postgres;
pub mod user_store;

pub use postgres::PostgresUserStore;
pub use user_store::{
    InMemoryUserStore, StoreError, USER_INDEXES, UniqueIndex, UpdateResult, UserStore,
};
