//! Long-running workers that drive handlers from a transport.

pub mod projection_worker;

pub use projection_worker::{
    ProjectionSupervisor, SupervisorConfig, SupervisorExit, SupervisorStats,
};
