//! Per-server connection pool: a bounded thread-safe queue of sockets, since
//! many threads borrow from the same pool instead of one task owning one
//! connection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::key::ServerVersion;
use crate::metrics::{MetricsCollector, NoopMetrics};
use crate::socket::{FramedSocket, SocketOptions};

/// Snapshot of a pool's lifetime counters. Every field is a monotonic count
/// except `available`/`active`, which are instantaneous.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolCounters {
    pub available: u64,
    pub active: u64,
    pub established: u64,
    pub total_created: u64,
    pub total_errors: u64,
    pub destroyed: u64,
}

/// Builds a new connection to one server. Implementations own TLS, unix
/// sockets, auth, or anything else outside this crate's core.
pub trait SocketFactory: Send + Sync {
    fn connect(&self) -> Result<FramedSocket>;
}

/// The default factory: a plain TCP connection to `host:port`, negotiating
/// the server's meta-protocol success code via `version`.
pub struct TcpSocketFactory {
    pub server_id: String,
    pub address: String,
    pub version: ServerVersion,
    pub options: SocketOptions,
}

impl SocketFactory for TcpSocketFactory {
    fn connect(&self) -> Result<FramedSocket> {
        FramedSocket::connect_tcp(self.server_id.clone(), &self.address, self.version, self.options)
    }
}

struct MarkDown {
    until: Mutex<Option<Instant>>,
}

impl MarkDown {
    fn new() -> Self {
        MarkDown {
            until: Mutex::new(None),
        }
    }

    fn is_down(&self) -> Option<Instant> {
        let guard = self.until.lock().unwrap();
        match *guard {
            Some(t) if Instant::now() < t => Some(t),
            _ => None,
        }
    }

    fn mark(&self, period: Duration) {
        let mut guard = self.until.lock().unwrap();
        *guard = Some(Instant::now() + period);
    }

    fn clear(&self) {
        let mut guard = self.until.lock().unwrap();
        *guard = None;
    }
}

/// Bounded pool of live sockets to one server.
pub struct ConnectionPool {
    pub server_id: String,
    factory: Arc<dyn SocketFactory>,
    available: (Sender<FramedSocket>, Receiver<FramedSocket>),
    max_size: usize,
    mark_down_period: Duration,
    mark_down: MarkDown,
    active: AtomicU64,
    established: AtomicU64,
    total_created: AtomicU64,
    total_errors: AtomicU64,
    destroyed: AtomicU64,
    metrics: Arc<dyn MetricsCollector>,
}

impl ConnectionPool {
    pub fn new(
        server_id: impl Into<String>,
        factory: Arc<dyn SocketFactory>,
        initial_size: usize,
        max_size: usize,
        mark_down_period: Duration,
    ) -> Self {
        Self::new_with_metrics(server_id, factory, initial_size, max_size, mark_down_period, Arc::new(NoopMetrics))
    }

    pub fn new_with_metrics(
        server_id: impl Into<String>,
        factory: Arc<dyn SocketFactory>,
        initial_size: usize,
        max_size: usize,
        mark_down_period: Duration,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        let server_id = server_id.into();
        let pool = ConnectionPool {
            server_id: server_id.clone(),
            factory,
            available: bounded(max_size.max(1)),
            max_size,
            mark_down_period,
            mark_down: MarkDown::new(),
            active: AtomicU64::new(0),
            established: AtomicU64::new(0),
            total_created: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            metrics,
        };
        pool.eager_fill(initial_size);
        pool
    }

    fn labels(&self) -> std::collections::HashMap<String, String> {
        let mut labels = std::collections::HashMap::with_capacity(1);
        labels.insert("server_id".to_string(), self.server_id.clone());
        labels
    }

    fn eager_fill(&self, initial_size: usize) {
        for _ in 0..initial_size.min(self.max_size) {
            match self.create() {
                Ok(socket) => {
                    // Eager-fill errors are swallowed; a best-effort send
                    // into a freshly bounded channel can't fail here.
                    let _ = self.available.0.try_send(socket);
                }
                Err(_) => {
                    log::debug!(
                        "eager fill connect failed for server {}; pool starts empty",
                        self.server_id
                    );
                }
            }
        }
    }

    fn create(&self) -> Result<FramedSocket> {
        if let Some(retry_at) = self.mark_down.is_down() {
            return Err(Error::ServerMarkedDown {
                server_id: self.server_id.clone(),
                retry_at,
            });
        }
        match self.factory.connect() {
            Ok(socket) => {
                self.mark_down.clear();
                self.total_created.fetch_add(1, Ordering::Relaxed);
                self.established.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment_counter("pool_connect_success", 1, &self.labels());
                Ok(socket)
            }
            Err(e) => {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                self.mark_down.mark(self.mark_down_period);
                self.metrics.increment_counter("pool_connect_error", 1, &self.labels());
                log::warn!(
                    "server {} marked down for {:?}: {}",
                    self.server_id,
                    self.mark_down_period,
                    e
                );
                Err(e)
            }
        }
    }

    /// Returns an available socket, creating one on the fly subject to
    /// mark-down, and counts it as active.
    pub fn pop_connection(&self) -> Result<FramedSocket> {
        let socket = match self.available.1.try_recv() {
            Ok(socket) => socket,
            Err(_) => self.create()?,
        };
        self.active.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_gauge("pool_active", self.active.load(Ordering::Relaxed) as f64, &self.labels());
        Ok(socket)
    }

    /// Returns a socket to the pool, or discards it (and its slot in
    /// `active`) if it errored or the pool is already full.
    pub fn release_connection(&self, socket: FramedSocket, error: bool) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.metrics.set_gauge("pool_active", self.active.load(Ordering::Relaxed) as f64, &self.labels());
        if error {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment_counter("pool_connection_destroyed", 1, &self.labels());
            return;
        }
        if self.available.0.try_send(socket).is_err() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            self.metrics.increment_counter("pool_connection_destroyed", 1, &self.labels());
        }
    }

    pub fn get_counters(&self) -> PoolCounters {
        PoolCounters {
            available: self.available.1.len() as u64,
            active: self.active.load(Ordering::Relaxed),
            established: self.established.load(Ordering::Relaxed),
            total_created: self.total_created.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            destroyed: self.destroyed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct FailingFactory {
        calls: AtomicUsize,
    }

    impl SocketFactory for FailingFactory {
        fn connect(&self) -> Result<FramedSocket> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(Error::Server {
                server_id: "test".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            })
        }
    }

    #[test]
    fn eager_fill_swallows_connect_errors() {
        let factory = Arc::new(FailingFactory {
            calls: AtomicUsize::new(0),
        });
        let pool = ConnectionPool::new(
            "test",
            factory.clone(),
            3,
            5,
            Duration::from_millis(10),
        );
        assert_eq!(factory.calls.load(Ordering::Relaxed), 1); // marked down after first failure
        assert_eq!(pool.get_counters().available, 0);
    }

    #[test]
    fn mark_down_blocks_until_window_expires() {
        let factory = Arc::new(FailingFactory {
            calls: AtomicUsize::new(0),
        });
        let pool = ConnectionPool::new("test", factory.clone(), 0, 5, Duration::from_millis(30));
        let err = pool.pop_connection().unwrap_err();
        assert!(matches!(err, Error::Server { .. }));
        let err = pool.pop_connection().unwrap_err();
        assert!(matches!(err, Error::ServerMarkedDown { .. }));
        assert_eq!(factory.calls.load(Ordering::Relaxed), 1);
        std::thread::sleep(Duration::from_millis(40));
        let _ = pool.pop_connection();
        assert_eq!(factory.calls.load(Ordering::Relaxed), 2);
    }

    struct LoopbackFactory {
        address: String,
    }

    impl SocketFactory for LoopbackFactory {
        fn connect(&self) -> Result<FramedSocket> {
            FramedSocket::connect_tcp(
                "loopback",
                &self.address,
                ServerVersion::Stable,
                crate::socket::SocketOptions::default(),
            )
        }
    }

    #[test]
    fn release_with_error_discards_and_counts_destroyed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            while let Ok((stream, _)) = listener.accept() {
                std::mem::forget(stream);
            }
        });
        let factory = Arc::new(LoopbackFactory { address });
        let pool = ConnectionPool::new("test", factory, 1, 2, Duration::from_secs(60));
        assert_eq!(pool.get_counters().available, 1);

        let socket = pool.pop_connection().unwrap();
        assert_eq!(pool.get_counters().active, 1);
        pool.release_connection(socket, true);
        assert_eq!(pool.get_counters().active, 0);
        assert_eq!(pool.get_counters().destroyed, 1);
    }
}
