//! Queue transport connection handling.
//!
//! `ConnectionManager` wraps a `Broker` and keeps one live `Channel`
//! available to publishers and consumers, reconnecting in the background
//! according to a `ReconnectPolicy`.

pub mod manager;
pub mod policy;

pub use self::manager::{ConnectionManager, ConnectionState};
pub use self::policy::ReconnectPolicy;
