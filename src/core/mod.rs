pub mod address;
pub mod connection;
pub mod connection_pool;
pub mod discovery;
pub mod metrics;
pub mod resp;
pub mod sentinel_listener;
pub mod sentinel_pool;

// Re-export the public surface
pub use address::{AddressError, HostAndPort};
pub use connection::{ConnectionError, RedisConnection};
pub use connection_pool::{
    ConnectionPoolBuilder, ConnectionSettings, Credentials, ExhaustionPolicy,
    RedisConnectionManager, RedisPool,
};
pub use metrics::{AtomicPoolMetrics, MetricsSnapshot};
pub use sentinel_listener::{FailoverHandler, ListenerBackoff, SwitchMasterEvent};
pub use sentinel_pool::{PooledResource, SentinelPool, SentinelPoolBuilder, SentinelPoolError};
