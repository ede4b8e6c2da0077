//! transq-redis
//!
//! Redis-backed implementations of the transq ports:
//! - `RedisBroker`: reliable queue on Redis lists (`Broker` / `Channel`)
//! - `RedisTaskStore`: Task Records as versioned hashes (`TaskStore`)

pub mod broker;
pub mod keys;
pub mod store;

pub use self::broker::RedisBroker;
pub use self::store::RedisTaskStore;
