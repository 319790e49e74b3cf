//! Auxiliary wrappers layered on the public client surface. None of these
//! touch sockets or pools directly — they only call through `CacheClient`'s
//! own `get`/`set`/`delete` methods.

pub mod client_wrapper;
pub mod hot_cache;
pub mod migrating;

pub use client_wrapper::{CacheClientTrait, ClientWrapper};
pub use hot_cache::ProbabilisticHotCache;
pub use migrating::{MigratingCacheClient, MigrationMode};
