//! `readmodel-core`: the projected User entity and the mutation parameters
//! that events carry.
//!
//! This crate contains **pure model** types (no IO, no async).

pub mod error;
pub mod field;
pub mod id;
pub mod mutation;
pub mod user;

pub use error::{ModelError, ModelResult};
pub use field::{FieldMap, UserField};
pub use id::{CorrelationId, DocumentId, EventId};
pub use mutation::UpdateParams;
pub use user::{AGGREGATE_ID, User};
