//! Thin façade over [`CacheClient`] so application code can depend on a
//! `dyn` trait object instead of the concrete router/executor stack, and so
//! call sites that always use the same lease/recache/stale policy don't have
//! to repeat it.

use std::sync::Arc;

use crate::client::CacheClient;
use crate::config::{LeasePolicy, RecachePolicy, StalePolicy};
use crate::error::Result;
use crate::flags::SetMode;
use crate::key::Key;
use crate::serializer::CacheValue;

/// The subset of `CacheClient` that is object-safe (no generic type
/// parameters), so callers can hold `Arc<dyn CacheClientTrait>`.
pub trait CacheClientTrait: Send + Sync {
    fn set(
        &self,
        key: &Key,
        value: &CacheValue,
        ttl: i64,
        no_reply: bool,
        cas_token: Option<u64>,
        stale_policy: Option<StalePolicy>,
        set_mode: Option<SetMode>,
    ) -> Result<bool>;

    fn refill(&self, key: &Key, value: &CacheValue, ttl: i64, no_reply: bool) -> Result<bool>;

    fn delete(
        &self,
        key: &Key,
        cas_token: Option<u64>,
        no_reply: bool,
        stale_policy: Option<StalePolicy>,
    ) -> Result<bool>;

    fn invalidate(
        &self,
        key: &Key,
        cas_token: Option<u64>,
        no_reply: bool,
        stale_policy: Option<StalePolicy>,
    ) -> Result<bool>;

    fn get(&self, key: &Key, touch_ttl: Option<i64>, recache_policy: Option<RecachePolicy>) -> Result<Option<Vec<u8>>>;

    fn get_cas(
        &self,
        key: &Key,
        touch_ttl: Option<i64>,
        recache_policy: Option<RecachePolicy>,
    ) -> Result<(Option<Vec<u8>>, Option<u64>)>;

    fn get_or_lease(
        &self,
        key: &Key,
        lease_policy: &LeasePolicy,
        touch_ttl: Option<i64>,
        recache_policy: Option<RecachePolicy>,
    ) -> Result<(Option<Vec<u8>>, Option<u64>)>;
}

impl CacheClientTrait for CacheClient {
    fn set(
        &self,
        key: &Key,
        value: &CacheValue,
        ttl: i64,
        no_reply: bool,
        cas_token: Option<u64>,
        stale_policy: Option<StalePolicy>,
        set_mode: Option<SetMode>,
    ) -> Result<bool> {
        CacheClient::set(self, key, value, ttl, no_reply, cas_token, stale_policy, set_mode)
    }

    fn refill(&self, key: &Key, value: &CacheValue, ttl: i64, no_reply: bool) -> Result<bool> {
        CacheClient::refill(self, key, value, ttl, no_reply)
    }

    fn delete(
        &self,
        key: &Key,
        cas_token: Option<u64>,
        no_reply: bool,
        stale_policy: Option<StalePolicy>,
    ) -> Result<bool> {
        CacheClient::delete(self, key, cas_token, no_reply, stale_policy)
    }

    fn invalidate(
        &self,
        key: &Key,
        cas_token: Option<u64>,
        no_reply: bool,
        stale_policy: Option<StalePolicy>,
    ) -> Result<bool> {
        CacheClient::invalidate(self, key, cas_token, no_reply, stale_policy)
    }

    fn get(&self, key: &Key, touch_ttl: Option<i64>, recache_policy: Option<RecachePolicy>) -> Result<Option<Vec<u8>>> {
        CacheClient::get(self, key, touch_ttl, recache_policy)
    }

    fn get_cas(
        &self,
        key: &Key,
        touch_ttl: Option<i64>,
        recache_policy: Option<RecachePolicy>,
    ) -> Result<(Option<Vec<u8>>, Option<u64>)> {
        CacheClient::get_cas(self, key, touch_ttl, recache_policy)
    }

    fn get_or_lease(
        &self,
        key: &Key,
        lease_policy: &LeasePolicy,
        touch_ttl: Option<i64>,
        recache_policy: Option<RecachePolicy>,
    ) -> Result<(Option<Vec<u8>>, Option<u64>)> {
        CacheClient::get_or_lease(self, key, lease_policy, touch_ttl, recache_policy)
    }
}

/// Fixes a default `LeasePolicy`/`RecachePolicy`/`StalePolicy` over an inner
/// client so call sites don't repeat them.
pub struct ClientWrapper {
    inner: Arc<dyn CacheClientTrait>,
    lease_policy: LeasePolicy,
    recache_policy: RecachePolicy,
    stale_policy: StalePolicy,
}

impl ClientWrapper {
    pub fn new(inner: Arc<dyn CacheClientTrait>, lease_policy: LeasePolicy, recache_policy: RecachePolicy, stale_policy: StalePolicy) -> Self {
        ClientWrapper {
            inner,
            lease_policy,
            recache_policy,
            stale_policy,
        }
    }

    pub fn set(&self, key: &Key, value: &CacheValue, ttl: i64) -> Result<bool> {
        self.inner.set(key, value, ttl, false, None, Some(self.stale_policy), None)
    }

    pub fn set_with_mode(&self, key: &Key, value: &CacheValue, ttl: i64, mode: SetMode) -> Result<bool> {
        self.inner.set(key, value, ttl, false, None, Some(self.stale_policy), Some(mode))
    }

    pub fn delete(&self, key: &Key) -> Result<bool> {
        self.inner.delete(key, None, false, Some(self.stale_policy))
    }

    pub fn invalidate(&self, key: &Key) -> Result<bool> {
        self.inner.invalidate(key, None, false, Some(self.stale_policy))
    }

    pub fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        self.inner.get(key, None, Some(self.recache_policy))
    }

    pub fn get_or_lease(&self, key: &Key) -> Result<(Option<Vec<u8>>, Option<u64>)> {
        self.inner
            .get_or_lease(key, &self.lease_policy, None, Some(self.recache_policy))
    }
}
