//! Broker-backed transports.
//!
//! The transport seam itself lives in `readmodel-events`; this module
//! provides infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsConfig, RedisStreamsError, RedisStreamsTransport};
