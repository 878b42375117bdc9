//! Infrastructure layer: document stores, transports, config, the projection
//! and the supervisor that drives it.

pub mod config;
pub mod event_bus;
pub mod projections;
pub mod read_model;
pub mod workers;
