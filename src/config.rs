//! Plain configuration structs. No external config-file format is read
//! here — callers assemble these as struct literals or through
//! `CacheClientBuilder`.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ConnectionPoolConfig {
    pub initial_pool_size: usize,
    pub max_pool_size: usize,
    pub mark_down_period: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        ConnectionPoolConfig {
            initial_pool_size: 1,
            max_pool_size: 10,
            mark_down_period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub raise_on_server_error: bool,
    pub touch_ttl_to_consider_write_failure: i64,
    pub track_write_failures: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            raise_on_server_error: true,
            touch_ttl_to_consider_write_failure: 0,
            track_write_failures: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RecachePolicy {
    pub ttl: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct LeasePolicy {
    pub ttl: i64,
    pub miss_retries: u32,
    pub miss_retry_wait: Duration,
    pub wait_backoff_factor: f64,
    pub miss_max_retry_wait: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        LeasePolicy {
            ttl: 10,
            miss_retries: 3,
            miss_retry_wait: Duration::from_secs(1),
            wait_backoff_factor: 1.2,
            miss_max_retry_wait: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StalePolicy {
    pub mark_stale_on_deletion_ttl: i64,
    pub mark_stale_on_cas_mismatch: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct GutterConfig {
    pub gutter_ttl: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct EphemeralConfig {
    pub max_ttl: i64,
}
