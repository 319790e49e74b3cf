//! Dual-write/dual-read client for migrating key traffic between two
//! memcached fleets.

use std::sync::Arc;

use crate::error::Result;
use crate::extras::client_wrapper::CacheClientTrait;
use crate::key::Key;
use crate::serializer::CacheValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationMode {
    WriteOnlyOrigin,
    WriteOnlyDestination,
    WriteBothReadOrigin,
    WriteBothReadDestination,
    WriteBothReadBoth,
}

impl MigrationMode {
    fn writes_both(self) -> bool {
        matches!(
            self,
            MigrationMode::WriteBothReadOrigin | MigrationMode::WriteBothReadDestination | MigrationMode::WriteBothReadBoth
        )
    }
}

/// Wraps an `origin` and a `destination` client under one [`MigrationMode`].
/// A destination-side write failure during a dual write is logged and
/// swallowed — only the origin write's outcome is returned — since the
/// point of a migration is that origin remains authoritative until cutover.
pub struct MigratingCacheClient {
    origin: Arc<dyn CacheClientTrait>,
    destination: Arc<dyn CacheClientTrait>,
    mode: MigrationMode,
}

impl MigratingCacheClient {
    pub fn new(origin: Arc<dyn CacheClientTrait>, destination: Arc<dyn CacheClientTrait>, mode: MigrationMode) -> Self {
        MigratingCacheClient {
            origin,
            destination,
            mode,
        }
    }

    pub fn set(&self, key: &Key, value: &CacheValue, ttl: i64) -> Result<bool> {
        if self.mode.writes_both() {
            let origin_result = self.origin.set(key, value, ttl, false, None, None, None);
            if let Err(e) = self.destination.set(key, value, ttl, false, None, None, None) {
                log::warn!("destination write failed during migration for key {}: {}", key, e);
            }
            return origin_result;
        }
        match self.mode {
            MigrationMode::WriteOnlyOrigin => self.origin.set(key, value, ttl, false, None, None, None),
            _ => self.destination.set(key, value, ttl, false, None, None, None),
        }
    }

    pub fn delete(&self, key: &Key) -> Result<bool> {
        if self.mode.writes_both() {
            let origin_result = self.origin.delete(key, None, false, None);
            if let Err(e) = self.destination.delete(key, None, false, None) {
                log::warn!("destination delete failed during migration for key {}: {}", key, e);
            }
            return origin_result;
        }
        match self.mode {
            MigrationMode::WriteOnlyOrigin => self.origin.delete(key, None, false, None),
            _ => self.destination.delete(key, None, false, None),
        }
    }

    pub fn invalidate(&self, key: &Key) -> Result<bool> {
        if self.mode.writes_both() {
            let origin_result = self.origin.invalidate(key, None, false, None);
            if let Err(e) = self.destination.invalidate(key, None, false, None) {
                log::warn!("destination invalidate failed during migration for key {}: {}", key, e);
            }
            return origin_result;
        }
        match self.mode {
            MigrationMode::WriteOnlyOrigin => self.origin.invalidate(key, None, false, None),
            _ => self.destination.invalidate(key, None, false, None),
        }
    }

    /// `WriteBothReadBoth` reads origin first; on an origin miss it falls
    /// back to destination and, on a destination hit, best-effort warms
    /// origin with the value before returning it.
    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        match self.mode {
            MigrationMode::WriteOnlyOrigin | MigrationMode::WriteBothReadOrigin => self.origin.get(key, None, None),
            MigrationMode::WriteOnlyDestination | MigrationMode::WriteBothReadDestination => {
                self.destination.get(key, None, None)
            }
            MigrationMode::WriteBothReadBoth => {
                if let Some(value) = self.origin.get(key, None, None)? {
                    return Ok(Some(value));
                }
                let destination_value = self.destination.get(key, None, None)?;
                if let Some(value) = &destination_value {
                    let cache_value = CacheValue::Bytes(value);
                    if let Err(e) = self.origin.refill(key, &cache_value, 0, false) {
                        log::warn!("origin warm-through failed for key {}: {}", key, e);
                    }
                }
                Ok(destination_value)
            }
        }
    }
}
