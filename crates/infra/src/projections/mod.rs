//! Projection implementations (read model builders).
//!
//! Projections consume events and keep a queryable read model current.
//! They are:
//! - **Rebuildable**: the collection can be dropped and re-projected from the stream
//! - **At-least-once tolerant**: a redelivered event never corrupts the read model
//!   (a redelivered registration surfaces a duplicate-key error instead)

pub mod users;

pub use users::{ProjectionError, UsersProjection, UsersProjectionBuilder};
