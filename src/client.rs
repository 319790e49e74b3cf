//! The concrete client and its high-level operations, plus the
//! [`CacheClientBuilder`] that assembles one from a server list. Methods take
//! flat arguments with `Option<T>` for whatever the wire form treats as
//! optional, dispatched through the meta-protocol command façade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConnectionPoolConfig, EphemeralConfig, ExecutorConfig, GutterConfig, LeasePolicy, RecachePolicy, StalePolicy};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::flags::{ArithMode, Op, RequestFlags, Response, SetMode};
use crate::key::{Key, ServerAddress};
use crate::meta::{MetaCommands, ReadResponse, RouterAccess, WriteResponse};
use crate::metrics::{MetricsCollector, NoopMetrics};
use crate::pool::{ConnectionPool, TcpSocketFactory};
use crate::provider::{HashRingProvider, HostProvider, PoolProvider};
use crate::router::{DefaultRouter, EphemeralRouter, GutterRouter, Router};
use crate::serializer::{CacheValue, MixedSerializer, Serializer};
use crate::socket::SocketOptions;
use crate::write_failure::{WriteFailureHandler, WriteFailureTracker};

/// The blocking memcached client: one embedded [`Executor`] plus whichever
/// [`Router`] policy (default, ephemeral, gutter) the builder assembled.
pub struct CacheClient {
    executor: Executor,
    router: Arc<dyn Router>,
    write_failures: Arc<WriteFailureTracker>,
}

impl RouterAccess for CacheClient {
    fn executor(&self) -> &Executor {
        &self.executor
    }
    fn router(&self) -> &dyn Router {
        self.router.as_ref()
    }
}

impl CacheClient {
    pub fn subscribe_write_failures(&self, handler: WriteFailureHandler) {
        self.write_failures.subscribe(handler);
    }

    /// `ms`. Returns `true` iff the store succeeded.
    pub fn set(
        &self,
        key: &Key,
        value: &CacheValue,
        ttl: i64,
        no_reply: bool,
        cas_token: Option<u64>,
        stale_policy: Option<StalePolicy>,
        set_mode: Option<SetMode>,
    ) -> Result<bool> {
        let mut flags = RequestFlags::new().with_cache_ttl(ttl).with_no_reply(no_reply);
        if let Some(cas) = cas_token {
            flags = flags.with_cas_token(cas);
        }
        if let Some(mode) = set_mode {
            flags = flags.with_set_mode(mode);
        }
        if stale_policy.map(|p| p.mark_stale_on_cas_mismatch).unwrap_or(false) {
            flags = flags.with_mark_stale();
        }
        match self.meta_set(key, value, flags)? {
            WriteResponse::Stored(_) => Ok(true),
            WriteResponse::NotStored | WriteResponse::Conflict(_) => Ok(false),
        }
    }

    /// `ms` with `mode=ADD`, write-failure tracking off: a cache-miss refill
    /// from the system of record must not poison the write-failure log.
    pub fn refill(&self, key: &Key, value: &CacheValue, ttl: i64, no_reply: bool) -> Result<bool> {
        let flags = RequestFlags::new()
            .with_cache_ttl(ttl)
            .with_no_reply(no_reply)
            .with_set_mode(SetMode::Add);
        let response = self.router.exec_with_overrides(
            &self.executor,
            Op::Ms,
            key,
            Some(value),
            flags,
            None,
            Some(false),
        )?;
        Ok(matches!(response, Response::Success(_)))
    }

    /// `md`. Returns `true` iff the delete succeeded (or, for `invalidate`,
    /// the key was already absent).
    pub fn delete(
        &self,
        key: &Key,
        cas_token: Option<u64>,
        no_reply: bool,
        stale_policy: Option<StalePolicy>,
    ) -> Result<bool> {
        let mut flags = RequestFlags::new().with_no_reply(no_reply);
        if let Some(cas) = cas_token {
            flags = flags.with_cas_token(cas);
        }
        if let Some(policy) = stale_policy {
            if policy.mark_stale_on_deletion_ttl > 0 {
                flags = flags.with_mark_stale().with_cache_ttl(policy.mark_stale_on_deletion_ttl);
            }
        }
        match self.meta_delete(key, flags)? {
            WriteResponse::Stored(_) => Ok(true),
            WriteResponse::NotStored | WriteResponse::Conflict(_) => Ok(false),
        }
    }

    pub fn invalidate(
        &self,
        key: &Key,
        cas_token: Option<u64>,
        no_reply: bool,
        stale_policy: Option<StalePolicy>,
    ) -> Result<bool> {
        let mut flags = RequestFlags::new().with_no_reply(no_reply);
        if let Some(cas) = cas_token {
            flags = flags.with_cas_token(cas);
        }
        if let Some(policy) = stale_policy {
            if policy.mark_stale_on_deletion_ttl > 0 {
                flags = flags.with_mark_stale().with_cache_ttl(policy.mark_stale_on_deletion_ttl);
            }
        }
        match self.meta_delete(key, flags)? {
            WriteResponse::Stored(_) | WriteResponse::NotStored => Ok(true),
            WriteResponse::Conflict(_) => Ok(false),
        }
    }

    /// `mg T<ttl>` with no value-returning flags; succeeds iff the server
    /// returns `Success`.
    pub fn touch(&self, key: &Key, ttl: i64, no_reply: bool) -> Result<bool> {
        let flags = RequestFlags::new().with_cache_ttl(ttl).with_no_reply(no_reply);
        match self.meta_get(key, flags)? {
            ReadResponse::Stored(_) => Ok(true),
            ReadResponse::Miss | ReadResponse::Value { .. } => Ok(false),
        }
    }

    fn get_flags(&self, touch_ttl: Option<i64>, recache_policy: Option<RecachePolicy>, want_cas: bool) -> RequestFlags {
        let mut flags = RequestFlags::default_get();
        if want_cas {
            flags = flags.with_cas();
        }
        if let Some(ttl) = touch_ttl {
            flags = flags.with_cache_ttl(ttl);
        }
        if let Some(policy) = recache_policy {
            flags = flags.with_recache_ttl(policy.ttl);
        }
        flags
    }

    /// A `Value` response where the caller won the recache race is mimicked
    /// as a miss (the caller must write through instead of reading stale
    /// data), while still surfacing the `cas_token` for that write.
    fn demote_win_to_miss(response: ReadResponse) -> (Option<Vec<u8>>, Option<u64>) {
        match response {
            ReadResponse::Miss | ReadResponse::Stored(_) => (None, None),
            ReadResponse::Value { data, flags } => {
                if flags.win {
                    (None, flags.cas_token)
                } else {
                    (Some(data), flags.cas_token)
                }
            }
        }
    }

    pub fn get(&self, key: &Key, touch_ttl: Option<i64>, recache_policy: Option<RecachePolicy>) -> Result<Option<Vec<u8>>> {
        let flags = self.get_flags(touch_ttl, recache_policy, false);
        let response = self.meta_get(key, flags)?;
        Ok(Self::demote_win_to_miss(response).0)
    }

    pub fn get_cas(
        &self,
        key: &Key,
        touch_ttl: Option<i64>,
        recache_policy: Option<RecachePolicy>,
    ) -> Result<(Option<Vec<u8>>, Option<u64>)> {
        let flags = self.get_flags(touch_ttl, recache_policy, true);
        let response = self.meta_get(key, flags)?;
        Ok(Self::demote_win_to_miss(response))
    }

    /// `mg N<ttl>` in a bounded retry loop: on losing the lease race, sleeps
    /// with exponential backoff (capped at `miss_max_retry_wait`) before
    /// asking again.
    pub fn get_or_lease(
        &self,
        key: &Key,
        lease_policy: &LeasePolicy,
        touch_ttl: Option<i64>,
        recache_policy: Option<RecachePolicy>,
    ) -> Result<(Option<Vec<u8>>, Option<u64>)> {
        if lease_policy.miss_retries == 0 {
            return Err(Error::Usage("lease_policy.miss_retries must be > 0".to_string()));
        }
        let mut flags = self
            .get_flags(touch_ttl, recache_policy, true)
            .with_vivify_on_miss_ttl(lease_policy.ttl);
        flags.want_value = true;

        let mut wait = lease_policy.miss_retry_wait;
        for attempt in 1..=lease_policy.miss_retries {
            let response = self.meta_get(key, flags.clone())?;
            match response {
                ReadResponse::Value { data, flags: rf } => {
                    if rf.win {
                        return Ok((None, rf.cas_token));
                    }
                    if data.is_empty() && !rf.win {
                        if attempt == lease_policy.miss_retries {
                            return Ok((None, rf.cas_token));
                        }
                        std::thread::sleep(wait);
                        let scaled = wait.as_secs_f64() * lease_policy.wait_backoff_factor;
                        wait = Duration::from_secs_f64(scaled).min(lease_policy.miss_max_retry_wait);
                        continue;
                    }
                    return Ok((Some(data), rf.cas_token));
                }
                ReadResponse::Miss | ReadResponse::Stored(_) => {
                    return Err(Error::Protocol(
                        "get_or_lease: vivify-on-miss guarantees a Value response".to_string(),
                    ));
                }
            }
        }
        unreachable!("loop always returns by the last attempt")
    }

    /// One `mg` per key, pipelined per pool via the router's multi-key path.
    pub fn multi_get(
        &self,
        keys: &[Key],
        touch_ttl: Option<i64>,
        recache_policy: Option<RecachePolicy>,
    ) -> Result<HashMap<Key, Option<Vec<u8>>>> {
        let flags = self.get_flags(touch_ttl, recache_policy, false);
        let items: Vec<_> = keys.iter().map(|k| (k.clone(), None, flags.clone())).collect();
        let results = self
            .router
            .exec_multi(&self.executor, Op::Mg, items);

        let mut out = HashMap::with_capacity(keys.len());
        for (key, result) in keys.iter().zip(results) {
            let response = result?;
            let read = match response {
                Response::Miss => ReadResponse::Miss,
                Response::Success(f) => ReadResponse::Stored(f),
                Response::Value { data, flags, .. } => ReadResponse::Value {
                    data: data.unwrap_or_default(),
                    flags,
                },
                other => {
                    return Err(Error::UnexpectedResponse {
                        expected: "Miss|Success|Value",
                        got: other.kind_name().to_string(),
                    })
                }
            };
            out.insert(key.clone(), Self::demote_win_to_miss(read).0);
        }
        Ok(out)
    }

    fn delta_impl(
        &self,
        key: &Key,
        delta: i64,
        initial: Option<(u64, i64)>,
        and_get: bool,
    ) -> Result<(ReadResponse, Option<i64>)> {
        let mut flags = RequestFlags::new().with_delta(delta.unsigned_abs());
        flags = flags.with_arith_mode(if delta < 0 { ArithMode::Decrement } else { ArithMode::Increment });
        if let Some((initial_value, initial_ttl)) = initial {
            flags = flags.with_initial_value(initial_value).with_vivify_on_miss_ttl(initial_ttl);
        }
        if and_get {
            flags.want_value = true;
        }
        let response = self.meta_arithmetic(key, flags)?;
        let post_value = if and_get {
            match &response {
                ReadResponse::Value { data, .. } => {
                    let text = std::str::from_utf8(data)
                        .map_err(|_| Error::Protocol("arithmetic response body is not utf8".to_string()))?;
                    Some(
                        text.trim()
                            .parse::<i64>()
                            .map_err(|_| Error::Protocol(format!("unparseable counter body {:?}", text)))?,
                    )
                }
                _ => return Err(Error::Protocol("*_and_get expected a Value response".to_string())),
            }
        } else {
            None
        };
        Ok((response, post_value))
    }

    pub fn delta(&self, key: &Key, delta: i64) -> Result<bool> {
        match self.delta_impl(key, delta, None, false)?.0 {
            ReadResponse::Stored(_) => Ok(true),
            ReadResponse::Miss => Ok(false),
            ReadResponse::Value { .. } => Ok(true),
        }
    }

    pub fn delta_initialize(&self, key: &Key, delta: i64, initial_value: u64, initial_ttl: i64) -> Result<bool> {
        match self.delta_impl(key, delta, Some((initial_value, initial_ttl)), false)?.0 {
            ReadResponse::Stored(_) | ReadResponse::Value { .. } => Ok(true),
            ReadResponse::Miss => Ok(false),
        }
    }

    pub fn delta_and_get(&self, key: &Key, delta: i64) -> Result<Option<i64>> {
        let (response, post) = self.delta_impl(key, delta, None, true)?;
        if matches!(response, ReadResponse::Miss) {
            return Ok(None);
        }
        Ok(post)
    }

    pub fn delta_initialize_and_get(
        &self,
        key: &Key,
        delta: i64,
        initial_value: u64,
        initial_ttl: i64,
    ) -> Result<Option<i64>> {
        let (response, post) = self.delta_impl(key, delta, Some((initial_value, initial_ttl)), true)?;
        if matches!(response, ReadResponse::Miss) {
            return Ok(None);
        }
        Ok(post)
    }

    /// Decodes a hit through the configured serializer into `T`; mismatched
    /// encodings return `Ok(None)` unless `strict`.
    pub fn get_typed<T, F>(&self, key: &Key, decode: F, strict: bool) -> Result<Option<T>>
    where
        F: FnOnce(crate::serializer::DecodedValue) -> Option<T>,
    {
        let bytes = match self.get(key, None, None)? {
            Some(b) => b,
            None => return Ok(None),
        };
        match decode(crate::serializer::DecodedValue::Bytes(bytes)) {
            Some(value) => Ok(Some(value)),
            None if strict => Err(Error::Serialization("typed decode mismatch".to_string())),
            None => Ok(None),
        }
    }

    pub fn get_cas_typed<T, F>(
        &self,
        key: &Key,
        decode: F,
        strict: bool,
    ) -> Result<(Option<T>, Option<u64>)>
    where
        F: FnOnce(crate::serializer::DecodedValue) -> Option<T>,
    {
        let (bytes, cas) = self.get_cas(key, None, None)?;
        let bytes = match bytes {
            Some(b) => b,
            None => return Ok((None, cas)),
        };
        match decode(crate::serializer::DecodedValue::Bytes(bytes)) {
            Some(value) => Ok((Some(value), cas)),
            None if strict => Err(Error::Serialization("typed decode mismatch".to_string())),
            None => Ok((None, cas)),
        }
    }
}

/// Assembles a [`CacheClient`] from a server list plus the policy structs in
/// `config.rs`.
pub struct CacheClientBuilder {
    servers: Vec<ServerAddress>,
    gutter_servers: Option<Vec<ServerAddress>>,
    pool_config: ConnectionPoolConfig,
    socket_options: SocketOptions,
    executor_config: ExecutorConfig,
    ephemeral: Option<EphemeralConfig>,
    gutter: Option<GutterConfig>,
    serializer: Arc<dyn Serializer>,
    metrics: Arc<dyn MetricsCollector>,
}

impl CacheClientBuilder {
    pub fn new(servers: Vec<ServerAddress>) -> Self {
        CacheClientBuilder {
            servers,
            gutter_servers: None,
            pool_config: ConnectionPoolConfig::default(),
            socket_options: SocketOptions::default(),
            executor_config: ExecutorConfig::default(),
            ephemeral: None,
            gutter: None,
            serializer: Arc::new(MixedSerializer::default()),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_pool_config(mut self, config: ConnectionPoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    pub fn with_socket_options(mut self, options: SocketOptions) -> Self {
        self.socket_options = options;
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    pub fn with_ephemeral(mut self, config: EphemeralConfig) -> Self {
        self.ephemeral = Some(config);
        self
    }

    pub fn with_gutter(mut self, gutter_servers: Vec<ServerAddress>, config: GutterConfig) -> Self {
        self.gutter_servers = Some(gutter_servers);
        self.gutter = Some(config);
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    fn build_provider(&self, servers: &[ServerAddress]) -> Arc<dyn PoolProvider> {
        let pools: Vec<(String, Arc<ConnectionPool>)> = servers
            .iter()
            .map(|addr| {
                let factory = Arc::new(TcpSocketFactory {
                    server_id: addr.ring_id(),
                    address: addr.socket_addr_string(),
                    version: addr.version,
                    options: self.socket_options,
                });
                let pool = Arc::new(ConnectionPool::new_with_metrics(
                    addr.ring_id(),
                    factory,
                    self.pool_config.initial_pool_size,
                    self.pool_config.max_pool_size,
                    self.pool_config.mark_down_period,
                    self.metrics.clone(),
                ));
                (addr.ring_id(), pool)
            })
            .collect();

        if pools.len() == 1 {
            Arc::new(HostProvider::new(pools.into_iter().next().unwrap().1))
        } else {
            Arc::new(HashRingProvider::new(pools))
        }
    }

    pub fn build(self) -> CacheClient {
        let write_failures = Arc::new(WriteFailureTracker::new_with_metrics(self.metrics.clone()));
        let executor = Executor::new(self.executor_config, self.serializer.clone(), write_failures.clone());

        let primary_provider = self.build_provider(&self.servers);

        let router: Arc<dyn Router> = if let (Some(gutter_servers), Some(gutter_config)) =
            (&self.gutter_servers, &self.gutter)
        {
            let gutter_provider = self.build_provider(gutter_servers);
            Arc::new(GutterRouter::new(primary_provider, gutter_provider, gutter_config.gutter_ttl))
        } else if let Some(ephemeral) = &self.ephemeral {
            Arc::new(EphemeralRouter::new(primary_provider, ephemeral.max_ttl))
        } else {
            Arc::new(DefaultRouter::new(primary_provider))
        };

        CacheClient {
            executor,
            router,
            write_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_a_client_against_an_unreachable_address() {
        // Eager-fill swallows connect errors (see pool.rs), so building
        // succeeds even against an address nothing listens on; only a later
        // `get`/`set` call surfaces the failure.
        let client = CacheClientBuilder::new(vec![ServerAddress::new("127.0.0.1", 1)]).build();
        let key = Key::new("foo").unwrap();
        let err = client.get(&key, None, None).unwrap_err();
        assert!(matches!(err, Error::Server { .. }));
    }

    #[test]
    fn get_or_lease_rejects_zero_retries() {
        let client = CacheClientBuilder::new(vec![ServerAddress::new("127.0.0.1", 1)]).build();
        let key = Key::new("foo").unwrap();
        let policy = LeasePolicy {
            miss_retries: 0,
            ..LeasePolicy::default()
        };
        let err = client.get_or_lease(&key, &policy, None, None).unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
