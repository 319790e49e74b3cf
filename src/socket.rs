//! The buffered, framed protocol socket. Owns exactly one fixed-capacity
//! buffer and exactly one connection; never shared between threads while
//! borrowed from the pool. Blocking `std::net`/`std::os::unix::net` I/O
//! only, no async runtime.

use std::io::{Read, Write};
use std::net::TcpStream;
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::flags::Response;
use crate::key::ServerVersion;
use crate::parser::{self, ParsedHeader};

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_timeouts(&self, connect_timeout: Option<Duration>, recv_timeout: Option<Duration>) -> std::io::Result<()> {
        let _ = connect_timeout; // applied at connect() time by the caller, not here
        match self {
            Stream::Tcp(s) => {
                s.set_read_timeout(recv_timeout)?;
                s.set_write_timeout(recv_timeout)?;
            }
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.set_read_timeout(recv_timeout)?;
                s.set_write_timeout(recv_timeout)?;
            }
        }
        Ok(())
    }

    fn set_nodelay(&self, nodelay: bool) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.set_nodelay(nodelay),
            #[cfg(unix)]
            Stream::Unix(_) => Ok(()),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// Connection-establishment options applied by a [`crate::pool::SocketFactory`].
#[derive(Debug, Clone, Copy)]
pub struct SocketOptions {
    pub connect_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
    pub no_delay: bool,
    pub buffer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        SocketOptions {
            connect_timeout: Some(Duration::from_secs(1)),
            recv_timeout: Some(Duration::from_secs(1)),
            no_delay: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Borrowed payload bytes from a `VA` response: either a slice still owned by
/// the socket's internal buffer, or a freshly allocated copy when the value
/// didn't fit contiguously. Callers must consume this before the next socket
/// operation.
pub enum ValueBytes<'a> {
    Borrowed(&'a [u8]),
    Owned(Vec<u8>),
}

impl<'a> std::ops::Deref for ValueBytes<'a> {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        match self {
            ValueBytes::Borrowed(b) => b,
            ValueBytes::Owned(v) => v,
        }
    }
}

/// One live meta-protocol connection: a socket plus its framing buffer.
pub struct FramedSocket {
    stream: Stream,
    pub server_id: String,
    pub version: ServerVersion,
    buf: Vec<u8>,
    pos: usize,
    read: usize,
    noop_expected: usize,
}

impl FramedSocket {
    pub(crate) fn connect_tcp(
        server_id: impl Into<String>,
        addr: &str,
        version: ServerVersion,
        opts: SocketOptions,
    ) -> Result<Self> {
        use std::net::ToSocketAddrs;
        let server_id = server_id.into();
        let mut addrs = addr.to_socket_addrs().map_err(|e| Error::Server {
            server_id: server_id.clone(),
            source: e,
        })?;
        let sock_addr = addrs.next().ok_or_else(|| Error::Server {
            server_id: server_id.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
        })?;
        let tcp = match opts.connect_timeout {
            Some(t) => TcpStream::connect_timeout(&sock_addr, t),
            None => TcpStream::connect(sock_addr),
        }
        .map_err(|e| Error::Server {
            server_id: server_id.clone(),
            source: e,
        })?;
        let stream = Stream::Tcp(tcp);
        stream
            .set_nodelay(opts.no_delay)
            .and_then(|_| stream.set_timeouts(opts.connect_timeout, opts.recv_timeout))
            .map_err(|e| Error::Server {
                server_id: server_id.clone(),
                source: e,
            })?;
        Ok(FramedSocket {
            stream,
            server_id,
            version,
            buf: vec![0u8; opts.buffer_size],
            pos: 0,
            read: 0,
            noop_expected: 0,
        })
    }

    fn io_err(&self, e: std::io::Error) -> Error {
        Error::Server {
            server_id: self.server_id.clone(),
            source: e,
        }
    }

    /// Sends `bytes`; if `with_noop`, appends the `mn\r\n` barrier and records
    /// one pending no-op acknowledgment to drain on the next receive.
    pub fn sendall(&mut self, bytes: &[u8], with_noop: bool) -> Result<()> {
        self.stream.write_all(bytes).map_err(|e| self.io_err(e))?;
        if with_noop {
            self.stream
                .write_all(b"mn\r\n")
                .map_err(|e| self.io_err(e))?;
            self.noop_expected += 1;
        }
        self.stream.flush().map_err(|e| self.io_err(e))?;
        Ok(())
    }

    /// Reads bytes from the socket into the buffer's free tail.
    fn fill(&mut self) -> Result<()> {
        if self.read >= self.buf.len() {
            return Err(Error::Protocol(
                "response header exceeds buffer capacity".to_string(),
            ));
        }
        let n = self
            .stream
            .read(&mut self.buf[self.read..])
            .map_err(|e| self.io_err(e))?;
        if n == 0 {
            return Err(self.io_err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            )));
        }
        self.read += n;
        Ok(())
    }

    /// Finds the next CRLF-terminated line in `[pos, read)`, reading more
    /// bytes as needed; returns the line (without CRLF) and advances `pos`
    /// past it.
    fn next_line(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(rel) = find_crlf(&self.buf[self.pos..self.read]) {
                let line = self.buf[self.pos..self.pos + rel].to_vec();
                self.pos += rel + 2;
                self.compact_if_needed();
                return Ok(line);
            }
            self.fill()?;
        }
    }

    fn compact_if_needed(&mut self) {
        let cap = self.buf.len();
        if self.pos > (cap * 3) / 4 {
            self.buf.copy_within(self.pos..self.read, 0);
            self.read -= self.pos;
            self.pos = 0;
        } else if self.pos == self.read {
            self.pos = 0;
            self.read = 0;
        }
    }

    /// Receives exactly one response header, transparently draining any
    /// pending no-op barrier acknowledgments first.
    pub fn recv_response(&mut self) -> Result<Response> {
        while self.noop_expected > 0 {
            let line = self.next_line()?;
            if parser::is_noop(&line) {
                self.noop_expected -= 1;
            }
            // Non-MN lines while draining (e.g. a late error) are discarded;
            // the barrier's only job is to let us skip past no-reply writes.
        }
        let line = self.next_line()?;
        let ParsedHeader { response, .. } =
            parser::parse_header(&line, self.version).map_err(Error::Protocol)?;
        Ok(response)
    }

    /// Reads the `size`-byte value body (plus trailing CRLF) following a `VA`
    /// header, returning a borrowed slice when the data is already buffered.
    pub fn get_value(&mut self, size: u32) -> Result<ValueBytes<'_>> {
        let size = size as usize;
        let needed = size + 2;

        if self.read - self.pos >= needed {
            let start = self.pos;
            self.check_crlf(start + size)?;
            self.pos += needed;
            self.compact_if_needed();
            return Ok(ValueBytes::Borrowed(&self.buf[start..start + size]));
        }

        let mut owned = Vec::with_capacity(needed);
        owned.extend_from_slice(&self.buf[self.pos..self.read]);
        self.pos = self.read;
        self.compact_if_needed();

        while owned.len() < needed {
            let mut chunk = vec![0u8; needed - owned.len()];
            let n = self.stream.read(&mut chunk).map_err(|e| self.io_err(e))?;
            if n == 0 {
                return Err(self.io_err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-value",
                )));
            }
            owned.extend_from_slice(&chunk[..n]);
        }

        if &owned[size..size + 2] != b"\r\n" {
            return Err(Error::Protocol("value body missing trailing CRLF".to_string()));
        }
        owned.truncate(size);
        Ok(ValueBytes::Owned(owned))
    }

    fn check_crlf(&self, crlf_start: usize) -> Result<()> {
        if &self.buf[crlf_start..crlf_start + 2] != b"\r\n" {
            return Err(Error::Protocol("value body missing trailing CRLF".to_string()));
        }
        Ok(())
    }

    /// Invariant check usable from tests and debug assertions: `0 <= pos <= read <= capacity`.
    pub fn buffer_invariant_holds(&self) -> bool {
        self.pos <= self.read && self.read <= self.buf.len()
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
