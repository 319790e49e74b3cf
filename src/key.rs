use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use blake2::{
    digest::{consts::U18, Digest},
    Blake2b,
};

use crate::error::{Error, Result};

type Blake2b18 = Blake2b<U18>;

const MAX_LITERAL_KEY_LEN: usize = 250;

/// A cache key. Equality and hashing only ever consider `(key, routing_key)`,
/// matching the pool-lookup contract: callers may attach a `domain` purely
/// for serializer routing without perturbing which server a key lands on.
#[derive(Debug, Clone)]
pub struct Key {
    key: String,
    routing_key: Option<String>,
    is_unicode: bool,
    domain: Option<String>,
    disable_compression: bool,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.routing_key == other.routing_key
    }
}
impl Eq for Key {}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.routing_key.hash(state);
    }
}

impl Key {
    pub fn new(key: impl Into<String>) -> Result<Self> {
        Self::build(key.into(), None, false, None, false)
    }

    pub fn unicode(key: impl Into<String>) -> Result<Self> {
        Self::build(key.into(), None, true, None, false)
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Result<Self> {
        let rk = routing_key.into();
        if !self.is_unicode && rk.as_bytes().contains(&b' ') {
            return Err(Error::Usage(format!(
                "routing key {:?} contains a space",
                rk
            )));
        }
        self.routing_key = Some(rk);
        Ok(self)
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_compression_disabled(mut self) -> Self {
        self.disable_compression = true;
        self
    }

    fn build(
        key: String,
        routing_key: Option<String>,
        is_unicode: bool,
        domain: Option<String>,
        disable_compression: bool,
    ) -> Result<Self> {
        if !is_unicode && key.as_bytes().contains(&b' ') {
            return Err(Error::Usage(format!("key {:?} contains a space", key)));
        }
        Ok(Key {
            key,
            routing_key,
            is_unicode,
            domain,
            disable_compression,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn routing_key(&self) -> Option<&str> {
        self.routing_key.as_deref()
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn disable_compression(&self) -> bool {
        self.disable_compression
    }

    /// The text used to look up a server in the pool provider: the routing
    /// key when present, else the key itself.
    pub fn routing_text(&self) -> &str {
        self.routing_key.as_deref().unwrap_or(&self.key)
    }

    /// Wire form of this key plus whether the `b` (binary) request flag must
    /// be set. Literal ascii keys under the length limit with no space pass
    /// through untouched; everything else is replaced by the base64 of an
    /// 18-byte BLAKE2b digest.
    pub fn wire_form(&self) -> (String, bool) {
        if !self.is_unicode && self.key.len() <= MAX_LITERAL_KEY_LEN {
            (self.key.clone(), false)
        } else {
            let mut hasher = Blake2b18::new();
            hasher.update(self.key.as_bytes());
            let digest = hasher.finalize();
            (STANDARD_NO_PAD.encode(digest), true)
        }
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// The meta-protocol dialect a server speaks, negotiated per `ServerAddress`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVersion {
    Stable,
    Aws166,
}

/// The address and identity of one memcached server in the fleet.
#[derive(Debug, Clone)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub server_id: Option<String>,
    pub version: ServerVersion,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddress {
            host: host.into(),
            port,
            server_id: None,
            version: ServerVersion::Stable,
        }
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_version(mut self, version: ServerVersion) -> Self {
        self.version = version;
        self
    }

    /// The ordering key used by the hash ring: `server_id` if present, else
    /// `host:port` (IPv6 hosts bracketed).
    pub fn ring_id(&self) -> String {
        match &self.server_id {
            Some(id) => id.clone(),
            None => {
                if self.host.contains(':') {
                    format!("[{}]:{}", self.host, self.port)
                } else {
                    format!("{}:{}", self.host, self.port)
                }
            }
        }
    }

    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_keys_pass_through() {
        let key = Key::new("foo").unwrap();
        let (wire, binary) = key.wire_form();
        assert_eq!(wire, "foo");
        assert!(!binary);
    }

    #[test]
    fn keys_with_space_are_rejected() {
        let err = Key::new("foo bar").unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }

    #[test]
    fn unicode_keys_are_hashed_and_binary_flagged() {
        let key = Key::unicode("úníçod⍷").unwrap();
        let (wire, binary) = key.wire_form();
        assert!(binary);
        assert!(!wire.contains(' '));
        assert!(!wire.is_empty());
    }

    #[test]
    fn routing_key_overrides_routing_text() {
        let key = Key::new("foo")
            .unwrap()
            .with_routing_key("shard-a")
            .unwrap();
        assert_eq!(key.routing_text(), "shard-a");
    }

    #[test]
    fn equality_ignores_domain_and_compression_flag() {
        let a = Key::new("foo").unwrap().with_domain("d1");
        let b = Key::new("foo").unwrap().with_compression_disabled();
        assert_eq!(a, b);
    }

    #[test]
    fn ring_id_prefers_server_id() {
        let addr = ServerAddress::new("10.0.0.1", 11211).with_server_id("cache-1");
        assert_eq!(addr.ring_id(), "cache-1");
        let addr2 = ServerAddress::new("10.0.0.1", 11211);
        assert_eq!(addr2.ring_id(), "10.0.0.1:11211");
    }

    #[test]
    fn ring_id_brackets_ipv6_hosts() {
        let addr = ServerAddress::new("::1", 11211);
        assert_eq!(addr.ring_id(), "[::1]:11211");
    }
}
