//! Maps a key to the connection pool that owns it. `HashRingProvider` builds
//! a consistent-hash continuum over virtual nodes per server, using an
//! MD5-class digest truncated to a `u32` for ring placement.

use std::sync::Arc;

use md5::{Digest, Md5};

use crate::pool::ConnectionPool;

/// Virtual nodes placed on the ring per server. Exact compatibility with
/// another client's distribution is not required here.
const POINTS_PER_SERVER: usize = 160;

/// Maps a routing key to the pool that owns it.
pub trait PoolProvider: Send + Sync {
    fn get_pool(&self, routing_text: &str) -> Arc<ConnectionPool>;
    /// All pools this provider can route to, for fan-out operations like
    /// multi-key partitioning that need the full set up front.
    fn pools(&self) -> Vec<Arc<ConnectionPool>>;
}

/// Single-server identity routing.
pub struct HostProvider {
    pool: Arc<ConnectionPool>,
}

impl HostProvider {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        HostProvider { pool }
    }
}

impl PoolProvider for HostProvider {
    fn get_pool(&self, _routing_text: &str) -> Arc<ConnectionPool> {
        self.pool.clone()
    }

    fn pools(&self) -> Vec<Arc<ConnectionPool>> {
        vec![self.pool.clone()]
    }
}

fn md5_u32(label: &str) -> u32 {
    let digest = Md5::digest(label.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

struct Entry {
    value: u32,
    pool_index: usize,
}

/// Consistent-hash ring over a fixed set of servers. Deterministic given the
/// *sorted* set of server ids, independent of construction order.
pub struct HashRingProvider {
    pools: Vec<Arc<ConnectionPool>>,
    continuum: Vec<Entry>,
}

impl HashRingProvider {
    pub fn new(mut pools: Vec<(String, Arc<ConnectionPool>)>) -> Self {
        pools.sort_by(|a, b| a.0.cmp(&b.0));
        let pools: Vec<Arc<ConnectionPool>> = pools.into_iter().map(|(_, p)| p).collect();

        let mut continuum = Vec::with_capacity(pools.len() * POINTS_PER_SERVER);
        for (pool_index, pool) in pools.iter().enumerate() {
            for vnode in 0..POINTS_PER_SERVER {
                let label = format!("{}-{}", pool.server_id, vnode);
                continuum.push(Entry {
                    value: md5_u32(&label),
                    pool_index,
                });
            }
        }
        continuum.sort_by_key(|e| e.value);

        HashRingProvider { pools, continuum }
    }

    fn pool_index_for(&self, routing_text: &str) -> usize {
        let hash = md5_u32(routing_text);
        match self.continuum.binary_search_by_key(&hash, |e| e.value) {
            Ok(i) => self.continuum[i].pool_index,
            Err(i) if i < self.continuum.len() => self.continuum[i].pool_index,
            Err(_) => self.continuum[0].pool_index,
        }
    }
}

impl PoolProvider for HashRingProvider {
    fn get_pool(&self, routing_text: &str) -> Arc<ConnectionPool> {
        self.pools[self.pool_index_for(routing_text)].clone()
    }

    fn pools(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{ConnectionPool, SocketFactory};
    use std::time::Duration;

    struct DummyFactory;
    impl SocketFactory for DummyFactory {
        fn connect(&self) -> crate::error::Result<crate::socket::FramedSocket> {
            Err(crate::error::Error::Server {
                server_id: "dummy".into(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "unused in routing tests"),
            })
        }
    }

    fn pool(id: &str) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            id,
            Arc::new(DummyFactory),
            0,
            1,
            Duration::from_secs(60),
        ))
    }

    #[test]
    fn routing_is_deterministic_regardless_of_construction_order() {
        let forward = HashRingProvider::new(vec![
            ("a".into(), pool("a")),
            ("b".into(), pool("b")),
            ("c".into(), pool("c")),
        ]);
        let reverse = HashRingProvider::new(vec![
            ("c".into(), pool("c")),
            ("b".into(), pool("b")),
            ("a".into(), pool("a")),
        ]);
        for key in ["foo", "bar", "baz-quux"] {
            assert_eq!(
                forward.get_pool(key).server_id,
                reverse.get_pool(key).server_id
            );
        }
    }

    #[test]
    fn routing_depends_only_on_routing_text() {
        let ring = HashRingProvider::new(vec![("a".into(), pool("a")), ("b".into(), pool("b"))]);
        let first = ring.get_pool("same-key").server_id.clone();
        let second = ring.get_pool("same-key").server_id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn host_provider_always_returns_its_one_pool() {
        let provider = HostProvider::new(pool("solo"));
        assert_eq!(provider.get_pool("anything").server_id, "solo");
        assert_eq!(provider.get_pool("else").server_id, "solo");
    }
}
