//! A blocking memcached client speaking the meta text protocol
//! (`mg`/`ms`/`md`/`ma`), with connection pooling, consistent-hash routing,
//! and gutter/ephemeral failover policies layered on top.
//!
//! The core is deliberately synchronous: callers that need concurrency get
//! it by running multiple threads against a shared [`CacheClient`], the same
//! way the pool itself is shared.

#![deny(warnings)]

mod key;
pub use key::{Key, ServerAddress, ServerVersion};

mod flags;
pub use flags::{ArithMode, Op, RequestFlags, Response, ResponseFlags, SetMode};

mod error;
pub use error::{Error, Result};

mod parser;
pub use parser::{is_noop, parse_header, ParsedHeader};

mod socket;
pub use socket::{FramedSocket, SocketOptions, ValueBytes, DEFAULT_BUFFER_SIZE};

mod pool;
pub use pool::{ConnectionPool, PoolCounters, SocketFactory, TcpSocketFactory};

mod provider;
pub use provider::{HashRingProvider, HostProvider, PoolProvider};

mod executor;
pub use executor::Executor;

mod router;
pub use router::{DefaultRouter, EphemeralRouter, GutterRouter, MultiItem, Router};

mod meta;
pub use meta::{MetaCommands, ReadResponse, RouterAccess, WriteResponse};

mod serializer;
pub use serializer::{CacheValue, DecodedValue, MixedSerializer, Serializer};

mod write_failure;
pub use write_failure::{WriteFailureHandler, WriteFailureTracker};

mod metrics;
pub use metrics::{MetricsCollector, NoopMetrics};

mod config;
pub use config::{ConnectionPoolConfig, EphemeralConfig, ExecutorConfig, GutterConfig, LeasePolicy, RecachePolicy, StalePolicy};

mod client;
pub use client::{CacheClient, CacheClientBuilder};

pub mod extras;
pub use extras::{CacheClientTrait, ClientWrapper, MigratingCacheClient, MigrationMode, ProbabilisticHotCache};
