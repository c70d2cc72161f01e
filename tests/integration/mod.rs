//! Integration test helpers and utilities
//!
//! This module provides the test infrastructure for integration testing:
//! - Mock Redis masters with AUTH, SELECT, CLIENT and MULTI support
//! - Mock Sentinels that answer master queries and publish failovers
//! - Polling helpers for asynchronous assertions


// Re-export commonly used helpers
pub use helpers::{
    mock_redis::{MockRedis, MockRedisBuilder},
    mock_sentinel::{MockSentinel, MockSentinelBuilder},
    pool_builder, wait_until, MASTER_NAME,
};
