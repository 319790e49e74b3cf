//! Default / ephemeral / gutter routing policies.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::executor::Executor;
use crate::flags::{Op, RequestFlags, Response};
use crate::key::Key;
use crate::provider::PoolProvider;
use crate::serializer::CacheValue;

pub type MultiItem<'a> = (Key, Option<CacheValue<'a>>, RequestFlags);

pub trait Router: Send + Sync {
    fn exec(
        &self,
        executor: &Executor,
        op: Op,
        key: &Key,
        value: Option<&CacheValue>,
        flags: RequestFlags,
    ) -> Result<Response> {
        self.exec_with_overrides(executor, op, key, value, flags, None, None)
    }

    /// Same as [`exec`](Router::exec), but lets a caller override the
    /// executor's `raise_on_server_error`/`track_write_failures` for this
    /// one command (used by `refill`, which must not poison the
    /// write-failure tracker). Gutter routing ignores these — its fail-over
    /// policy fixes both values by design.
    fn exec_with_overrides(
        &self,
        executor: &Executor,
        op: Op,
        key: &Key,
        value: Option<&CacheValue>,
        flags: RequestFlags,
        raise_on_server_error: Option<bool>,
        track_write_failures: Option<bool>,
    ) -> Result<Response>;

    fn exec_multi(&self, executor: &Executor, op: Op, items: Vec<MultiItem>) -> Vec<Result<Response>>;
}

/// Groups `items` by destination pool, preserving original indices so results
/// can be reassembled in the caller's order.
fn partition_by_pool<'a>(
    provider: &dyn PoolProvider,
    items: Vec<MultiItem<'a>>,
) -> Vec<(Arc<crate::pool::ConnectionPool>, Vec<(usize, MultiItem<'a>)>)> {
    let mut groups: Vec<(Arc<crate::pool::ConnectionPool>, Vec<(usize, MultiItem<'a>)>)> = Vec::new();
    let mut index_by_server: HashMap<String, usize> = HashMap::new();

    for (i, item) in items.into_iter().enumerate() {
        let pool = provider.get_pool(item.0.routing_text());
        let group_index = *index_by_server
            .entry(pool.server_id.clone())
            .or_insert_with(|| {
                groups.push((pool.clone(), Vec::new()));
                groups.len() - 1
            });
        groups[group_index].1.push((i, item));
    }
    groups
}

fn reassemble(total: usize, groups: Vec<Vec<(usize, Result<Response>)>>) -> Vec<Result<Response>> {
    let mut out: Vec<Option<Result<Response>>> = (0..total).map(|_| None).collect();
    for group in groups {
        for (i, r) in group {
            out[i] = Some(r);
        }
    }
    out.into_iter()
        .map(|r| r.expect("every index must be filled by exactly one pool group"))
        .collect()
}

/// Delegates straight to the configured [`PoolProvider`].
pub struct DefaultRouter {
    pub provider: Arc<dyn PoolProvider>,
}

impl DefaultRouter {
    pub fn new(provider: Arc<dyn PoolProvider>) -> Self {
        DefaultRouter { provider }
    }
}

impl Router for DefaultRouter {
    fn exec_with_overrides(
        &self,
        executor: &Executor,
        op: Op,
        key: &Key,
        value: Option<&CacheValue>,
        flags: RequestFlags,
        raise_on_server_error: Option<bool>,
        track_write_failures: Option<bool>,
    ) -> Result<Response> {
        let pool = self.provider.get_pool(key.routing_text());
        executor.exec_on_pool(&pool, op, key, value, flags, raise_on_server_error, track_write_failures)
    }

    fn exec_multi(&self, executor: &Executor, op: Op, items: Vec<MultiItem>) -> Vec<Result<Response>> {
        let total = items.len();
        let groups = partition_by_pool(self.provider.as_ref(), items);
        let mut results = Vec::with_capacity(groups.len());
        for (pool, indexed) in groups {
            let (indices, batch): (Vec<usize>, Vec<MultiItem>) = indexed.into_iter().unzip();
            let batch_results = executor.exec_multi_on_pool(&pool, op, &batch, None, None);
            results.push(indices.into_iter().zip(batch_results).collect());
        }
        reassemble(total, results)
    }
}

/// Caps TTL flags to `max_ttl` before delegating to a [`DefaultRouter`].
pub struct EphemeralRouter {
    pub inner: DefaultRouter,
    pub max_ttl: i64,
}

impl EphemeralRouter {
    pub fn new(provider: Arc<dyn PoolProvider>, max_ttl: i64) -> Self {
        EphemeralRouter {
            inner: DefaultRouter::new(provider),
            max_ttl,
        }
    }
}

impl Router for EphemeralRouter {
    fn exec_with_overrides(
        &self,
        executor: &Executor,
        op: Op,
        key: &Key,
        value: Option<&CacheValue>,
        flags: RequestFlags,
        raise_on_server_error: Option<bool>,
        track_write_failures: Option<bool>,
    ) -> Result<Response> {
        self.inner.exec_with_overrides(
            executor,
            op,
            key,
            value,
            flags.capped_to(self.max_ttl),
            raise_on_server_error,
            track_write_failures,
        )
    }

    fn exec_multi(&self, executor: &Executor, op: Op, items: Vec<MultiItem>) -> Vec<Result<Response>> {
        let capped = items
            .into_iter()
            .map(|(k, v, f)| (k, v, f.capped_to(self.max_ttl)))
            .collect();
        self.inner.exec_multi(executor, op, capped)
    }
}

/// Fails over to a secondary fleet on primary server errors, with TTLs
/// capped to `gutter_ttl` and write-failure tracking suppressed on the
/// gutter path (gutter state self-expires).
pub struct GutterRouter {
    pub primary: Arc<dyn PoolProvider>,
    pub gutter: Arc<dyn PoolProvider>,
    pub gutter_ttl: i64,
}

impl GutterRouter {
    pub fn new(primary: Arc<dyn PoolProvider>, gutter: Arc<dyn PoolProvider>, gutter_ttl: i64) -> Self {
        GutterRouter {
            primary,
            gutter,
            gutter_ttl,
        }
    }
}

impl Router for GutterRouter {
    /// Ignores `raise_on_server_error`/`track_write_failures`: the gutter
    /// fail-over policy fixes both at each stage regardless of caller intent.
    fn exec_with_overrides(
        &self,
        executor: &Executor,
        op: Op,
        key: &Key,
        value: Option<&CacheValue>,
        flags: RequestFlags,
        _raise_on_server_error: Option<bool>,
        _track_write_failures: Option<bool>,
    ) -> Result<Response> {
        let primary_pool = self.primary.get_pool(key.routing_text());
        match executor.exec_on_pool(&primary_pool, op, key, value, flags.clone(), Some(true), None) {
            Ok(response) => Ok(response),
            Err(e) => {
                log::warn!("primary pool {} failed, falling over to gutter: {}", primary_pool.server_id, e);
                let gutter_pool = self.gutter.get_pool(key.routing_text());
                let capped = flags.capped_to(self.gutter_ttl);
                executor.exec_on_pool(&gutter_pool, op, key, value, capped, None, Some(false))
            }
        }
    }

    fn exec_multi(&self, executor: &Executor, op: Op, items: Vec<MultiItem>) -> Vec<Result<Response>> {
        let total = items.len();
        let primary_groups = partition_by_pool(self.primary.as_ref(), items);

        let mut final_results: Vec<Vec<(usize, Result<Response>)>> = Vec::new();
        let mut failed: Vec<(usize, MultiItem)> = Vec::new();

        for (pool, indexed) in primary_groups {
            let (indices, batch): (Vec<usize>, Vec<MultiItem>) = indexed.into_iter().unzip();
            let batch_results = executor.exec_multi_on_pool(&pool, op, &batch, Some(true), None);
            if batch_results.iter().any(Result::is_err) {
                failed.extend(indices.into_iter().zip(batch));
            } else {
                final_results.push(indices.into_iter().zip(batch_results).collect());
            }
        }

        if !failed.is_empty() {
            let capped: Vec<(usize, MultiItem)> = failed
                .into_iter()
                .map(|(idx, (k, v, f))| (idx, (k, v, f.capped_to(self.gutter_ttl))))
                .collect();
            let (indices, items): (Vec<usize>, Vec<MultiItem>) = capped.into_iter().unzip();
            // `partition_by_pool` numbers each item by its position in
            // `items`; map that back to the original caller-facing index
            // via `indices` before merging into `final_results`.
            let gutter_groups = partition_by_pool(self.gutter.as_ref(), items);
            for (pool, indexed) in gutter_groups {
                let (local_indices, local_batch): (Vec<usize>, Vec<MultiItem>) = indexed.into_iter().unzip();
                let original_indices: Vec<usize> = local_indices.into_iter().map(|i| indices[i]).collect();
                let batch_results = executor.exec_multi_on_pool(&pool, op, &local_batch, None, Some(false));
                final_results.push(original_indices.into_iter().zip(batch_results).collect());
            }
        }

        reassemble(total, final_results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::pool::{ConnectionPool, SocketFactory};
    use crate::serializer::MixedSerializer;
    use crate::write_failure::WriteFailureTracker;
    use std::time::Duration;

    struct AlwaysFailFactory;
    impl SocketFactory for AlwaysFailFactory {
        fn connect(&self) -> Result<crate::socket::FramedSocket> {
            Err(crate::error::Error::Server {
                server_id: "down".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "down"),
            })
        }
    }

    fn executor() -> Executor {
        Executor::new(
            ExecutorConfig::default(),
            Arc::new(MixedSerializer::default()),
            Arc::new(WriteFailureTracker::new()),
        )
    }

    #[test]
    fn ephemeral_router_caps_ttl_before_dispatch() {
        let flags = RequestFlags::new().with_cache_ttl(1000);
        let capped = flags.capped_to(60);
        assert_eq!(capped.cache_ttl, Some(60));
    }

    #[test]
    fn gutter_router_falls_over_when_primary_is_down() {
        use crate::provider::HostProvider;

        let primary_pool = Arc::new(ConnectionPool::new(
            "primary",
            Arc::new(AlwaysFailFactory),
            0,
            1,
            Duration::from_secs(60),
        ));
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let mut stream = stream;
                use std::io::{Read, Write};
                let mut buf = [0u8; 256];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(b"HD\r\n");
            }
        });
        struct LoopbackFactory {
            addr: String,
        }
        impl SocketFactory for LoopbackFactory {
            fn connect(&self) -> Result<crate::socket::FramedSocket> {
                crate::socket::FramedSocket::connect_tcp(
                    "gutter",
                    &self.addr,
                    crate::key::ServerVersion::Stable,
                    crate::socket::SocketOptions::default(),
                )
            }
        }
        let gutter_pool = Arc::new(ConnectionPool::new(
            "gutter",
            Arc::new(LoopbackFactory { addr }),
            1,
            1,
            Duration::from_secs(60),
        ));

        let router = GutterRouter::new(
            Arc::new(HostProvider::new(primary_pool)),
            Arc::new(HostProvider::new(gutter_pool)),
            60,
        );
        let exec = executor();
        let key = Key::new("foo").unwrap();
        let flags = RequestFlags::new().with_cache_ttl(1000).with_client_flag(0);
        let response = router
            .exec(&exec, Op::Ms, &key, Some(&CacheValue::Int(1)), flags)
            .unwrap();
        assert!(matches!(response, Response::Success(_)));
    }
}
