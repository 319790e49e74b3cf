use std::{fmt, io, time::Instant};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Malformed/unexpected header, truncated value body, socket closed mid-parse.
    Protocol(String),
    /// The pool refused to connect within its mark-down window.
    ServerMarkedDown {
        server_id: String,
        retry_at: Instant,
    },
    /// Any socket/IO error during send/recv on a borrowed connection.
    Server { server_id: String, source: io::Error },
    /// The serializer failed to encode or decode a value.
    Serialization(String),
    /// A precondition was violated without any I/O taking place.
    Usage(String),
    /// The response was protocol-valid but not one the command accepts.
    UnexpectedResponse { expected: &'static str, got: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::ServerMarkedDown { server_id, .. } => {
                write!(f, "server {} is marked down", server_id)
            }
            Self::Server { server_id, source } => {
                write!(f, "server {} error: {}", server_id, source)
            }
            Self::Serialization(msg) => write!(f, "serialization error: {}", msg),
            Self::Usage(msg) => write!(f, "usage error: {}", msg),
            Self::UnexpectedResponse { expected, got } => {
                write!(f, "expected {} response, got {}", expected, got)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // Only reachable where no server id is known yet (e.g. socket factory
        // construction before a pool exists to attribute the error to).
        Error::Server {
            server_id: String::new(),
            source: e,
        }
    }
}
