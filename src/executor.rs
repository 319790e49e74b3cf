//! Translates one typed command into wire bytes, sends it, interprets the
//! response, and classifies failures, covering the full `mg`/`ms`/`md`/`ma`
//! surface over the blocking [`ConnectionPool`].

use std::sync::Arc;

use crate::config::ExecutorConfig;
use crate::error::{Error, Result};
use crate::flags::{Op, RequestFlags, Response};
use crate::key::{Key, ServerVersion};
use crate::pool::ConnectionPool;
use crate::serializer::{CacheValue, Serializer};
use crate::write_failure::WriteFailureTracker;

pub struct Executor {
    pub config: ExecutorConfig,
    pub serializer: Arc<dyn Serializer>,
    pub write_failures: Arc<WriteFailureTracker>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        serializer: Arc<dyn Serializer>,
        write_failures: Arc<WriteFailureTracker>,
    ) -> Self {
        Executor {
            config,
            serializer,
            write_failures,
        }
    }

    fn is_write(&self, op: Op, flags: &RequestFlags) -> bool {
        match op {
            Op::Ms | Op::Md => true,
            Op::Mg => matches!(flags.cache_ttl, Some(ttl) if ttl > 0 && ttl <= self.config.touch_ttl_to_consider_write_failure),
            Op::Ma => false,
        }
    }

    fn fallback_for(op: Op) -> Response {
        match op {
            Op::Mg | Op::Ma => Response::Miss,
            Op::Ms | Op::Md => Response::NotStored,
        }
    }

    fn build_command(
        &self,
        op: Op,
        key: &Key,
        payload: Option<&[u8]>,
        mut flags: RequestFlags,
        version: ServerVersion,
    ) -> (String, Option<Vec<u8>>) {
        let (wire_key, binary) = key.wire_form();
        flags.binary_key = binary;

        let mut line = format!("{} {}", op.as_str(), wire_key);
        if let Some(bytes) = payload {
            line.push(' ');
            match version {
                ServerVersion::Aws166 => {
                    line.push('S');
                    line.push_str(&bytes.len().to_string());
                }
                ServerVersion::Stable => line.push_str(&bytes.len().to_string()),
            }
        }
        let tokens = flags.render_tokens(op);
        if !tokens.is_empty() {
            line.push(' ');
            line.push_str(&tokens);
        }
        line.push_str("\r\n");
        (line, payload.map(|p| p.to_vec()))
    }

    /// Executes one command on a borrowed connection from `pool`.
    ///
    /// `raise_on_server_error`/`track_write_failures` may be overridden per
    /// call (gutter/ephemeral routers and `refill` rely on this); `None`
    /// falls back to the executor's own configuration.
    pub fn exec_on_pool(
        &self,
        pool: &ConnectionPool,
        op: Op,
        key: &Key,
        value: Option<&CacheValue>,
        flags: RequestFlags,
        raise_on_server_error: Option<bool>,
        track_write_failures: Option<bool>,
    ) -> Result<Response> {
        let raise_on_server_error = raise_on_server_error.unwrap_or(self.config.raise_on_server_error);
        let track_write_failures = track_write_failures.unwrap_or(self.config.track_write_failures);

        let encoded = match value {
            Some(v) => {
                let (bytes, encoding_id) = self
                    .serializer
                    .serialize(key, v)
                    .map_err(|e| Error::Serialization(e.to_string()))?;
                Some((bytes, encoding_id))
            }
            None => None,
        };

        let mut flags = flags;
        if let Some((_, encoding_id)) = &encoded {
            flags = flags.with_client_flag(*encoding_id);
        }

        let mut socket = pool.pop_connection()?;
        let (cmd_line, payload) = self.build_command(
            op,
            key,
            encoded.as_ref().map(|(b, _)| b.as_slice()),
            flags.clone(),
            socket.version,
        );

        let with_noop = op != Op::Mg && flags.no_reply;
        let outcome = self.send_and_receive(&mut socket, &cmd_line, payload.as_deref(), with_noop, op);

        match outcome {
            Ok(response) => {
                pool.release_connection(socket, false);
                Ok(self.interpret(response, flags.client_flag))
            }
            Err(e) => {
                pool.release_connection(socket, true);
                if track_write_failures && self.is_write(op, &flags) {
                    self.write_failures.notify(key);
                }
                if raise_on_server_error {
                    Err(e)
                } else {
                    log::warn!("server error on {} for key {}: {}", op.as_str(), key, e);
                    Ok(Self::fallback_for(op))
                }
            }
        }
    }

    fn send_and_receive(
        &self,
        socket: &mut crate::socket::FramedSocket,
        cmd_line: &str,
        payload: Option<&[u8]>,
        with_noop: bool,
        op: Op,
    ) -> Result<Response> {
        match payload {
            Some(bytes) => {
                socket.sendall(cmd_line.as_bytes(), false)?;
                socket.sendall(bytes, false)?;
                socket.sendall(b"\r\n", with_noop)?;
            }
            None => {
                socket.sendall(cmd_line.as_bytes(), with_noop)?;
            }
        }

        if with_noop {
            // The barrier already guarantees the write landed; synthesize
            // success without reading (the MN is drained lazily on the next
            // receive for this connection).
            return Ok(Response::Success(Default::default()));
        }

        let response = socket.recv_response()?;
        if let Response::Value { size, flags, .. } = &response {
            let bytes = socket.get_value(*size)?;
            let _ = op;
            return Ok(Response::Value {
                size: *size,
                data: Some(bytes.to_vec()),
                flags: flags.clone(),
            });
        }
        Ok(response)
    }

    /// On unserialize failure, a `Value` is demoted to `Miss` and the
    /// failure is logged rather than surfaced.
    fn interpret(&self, response: Response, _client_flag_hint: Option<u32>) -> Response {
        if let Response::Value { flags, data: Some(bytes), size } = &response {
            if let Some(encoding_id) = flags.client_flag {
                if let Err(e) = self.serializer.unserialize(bytes, encoding_id) {
                    log::warn!("unserialize failed, demoting to Miss: {}", e);
                    return Response::Miss;
                }
            }
            return Response::Value {
                size: *size,
                data: Some(bytes.clone()),
                flags: flags.clone(),
            };
        }
        response
    }

    /// Pipelines a batch of commands on one borrowed connection: all sends
    /// first, then all receives in send order. On any failure, every item in
    /// the batch gets the fallback response (or the batch-wide error) and
    /// write-failure fires for every item that was a write.
    pub fn exec_multi_on_pool(
        &self,
        pool: &ConnectionPool,
        op: Op,
        items: &[(Key, Option<CacheValue>, RequestFlags)],
        raise_on_server_error: Option<bool>,
        track_write_failures: Option<bool>,
    ) -> Vec<Result<Response>> {
        let raise_on_server_error = raise_on_server_error.unwrap_or(self.config.raise_on_server_error);
        let track_write_failures = track_write_failures.unwrap_or(self.config.track_write_failures);

        let mut socket = match pool.pop_connection() {
            Ok(s) => s,
            Err(e) => return items.iter().map(|_| Err(clone_err(&e))).collect(),
        };

        let mut prepared = Vec::with_capacity(items.len());
        for (key, value, flags) in items {
            let encoded = match value {
                Some(v) => match self.serializer.serialize(key, v) {
                    Ok(enc) => Some(enc),
                    Err(e) => {
                        pool.release_connection(socket, false);
                        return items
                            .iter()
                            .map(|_| Err(Error::Serialization(e.to_string())))
                            .collect();
                    }
                },
                None => None,
            };
            let mut item_flags = flags.clone();
            if let Some((_, id)) = &encoded {
                item_flags = item_flags.with_client_flag(*id);
            }
            let (cmd, payload) = self.build_command(
                op,
                key,
                encoded.as_ref().map(|(b, _)| b.as_slice()),
                item_flags.clone(),
                socket.version,
            );
            prepared.push((cmd, payload, item_flags));
        }

        let failed = (|| -> Result<()> {
            for (cmd, payload, flags) in &prepared {
                let with_noop = op != Op::Mg && flags.no_reply;
                match payload {
                    Some(bytes) => {
                        socket.sendall(cmd.as_bytes(), false)?;
                        socket.sendall(bytes, false)?;
                        socket.sendall(b"\r\n", with_noop)?;
                    }
                    None => socket.sendall(cmd.as_bytes(), with_noop)?,
                }
            }
            Ok(())
        })();

        if let Err(e) = failed {
            pool.release_connection(socket, true);
            self.fire_write_failures_for_batch(items, op, track_write_failures);
            return items
                .iter()
                .map(|_| {
                    if raise_on_server_error {
                        Err(clone_err(&e))
                    } else {
                        Ok(Self::fallback_for(op))
                    }
                })
                .collect();
        }

        let mut results = Vec::with_capacity(items.len());
        let mut hit_error = false;
        for (_, _, flags) in &prepared {
            if hit_error {
                results.push(if raise_on_server_error {
                    Err(Error::Protocol("batch aborted by prior error".to_string()))
                } else {
                    Ok(Self::fallback_for(op))
                });
                continue;
            }
            let with_noop = op != Op::Mg && flags.no_reply;
            if with_noop {
                results.push(Ok(Response::Success(Default::default())));
                continue;
            }
            match socket.recv_response() {
                Ok(Response::Value { size, flags, .. }) => match socket.get_value(size) {
                    Ok(bytes) => results.push(Ok(self.interpret(
                        Response::Value {
                            size,
                            data: Some(bytes.to_vec()),
                            flags,
                        },
                        None,
                    ))),
                    Err(e) => {
                        hit_error = true;
                        results.push(if raise_on_server_error {
                            Err(e)
                        } else {
                            Ok(Self::fallback_for(op))
                        });
                    }
                },
                Ok(other) => results.push(Ok(other)),
                Err(e) => {
                    hit_error = true;
                    results.push(if raise_on_server_error {
                        Err(e)
                    } else {
                        Ok(Self::fallback_for(op))
                    });
                }
            }
        }

        pool.release_connection(socket, hit_error);
        if hit_error {
            self.fire_write_failures_for_batch(items, op, track_write_failures);
        }
        results
    }

    fn fire_write_failures_for_batch(
        &self,
        items: &[(Key, Option<CacheValue>, RequestFlags)],
        op: Op,
        track_write_failures: bool,
    ) {
        if !track_write_failures {
            return;
        }
        for (key, _, flags) in items {
            if self.is_write(op, flags) {
                self.write_failures.notify(key);
            }
        }
    }
}

fn clone_err(e: &Error) -> Error {
    match e {
        Error::Protocol(m) => Error::Protocol(m.clone()),
        Error::ServerMarkedDown { server_id, retry_at } => Error::ServerMarkedDown {
            server_id: server_id.clone(),
            retry_at: *retry_at,
        },
        Error::Server { server_id, source } => Error::Server {
            server_id: server_id.clone(),
            source: std::io::Error::new(source.kind(), source.to_string()),
        },
        Error::Serialization(m) => Error::Serialization(m.clone()),
        Error::Usage(m) => Error::Usage(m.clone()),
        Error::UnexpectedResponse { expected, got } => Error::UnexpectedResponse {
            expected,
            got: got.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Op;
    use crate::key::Key;

    fn executor() -> Executor {
        Executor::new(
            ExecutorConfig::default(),
            Arc::new(crate::serializer::MixedSerializer::default()),
            Arc::new(WriteFailureTracker::new()),
        )
    }

    #[test]
    fn build_command_renders_set_wire_form() {
        let exec = executor();
        let key = Key::new("foo").unwrap();
        let flags = RequestFlags::new().with_cache_ttl(300).with_client_flag(0);
        let (line, payload) = exec.build_command(Op::Ms, &key, Some(b"bar"), flags, ServerVersion::Stable);
        assert_eq!(line, "ms foo 3 T300 F0\r\n");
        assert_eq!(payload.unwrap(), b"bar");
    }

    #[test]
    fn build_command_renders_get_without_payload() {
        let exec = executor();
        let key = Key::new("foo").unwrap();
        let (line, payload) = exec.build_command(
            Op::Mg,
            &key,
            None,
            RequestFlags::default_get(),
            ServerVersion::Stable,
        );
        assert_eq!(line, "mg foo h f l t v\r\n");
        assert!(payload.is_none());
    }

    #[test]
    fn build_command_renders_aws166_size_prefix() {
        let exec = executor();
        let key = Key::new("foo").unwrap();
        let flags = RequestFlags::new().with_cache_ttl(300);
        let (line, _) = exec.build_command(Op::Ms, &key, Some(b"bar"), flags, ServerVersion::Aws166);
        assert_eq!(line, "ms foo S3 T300\r\n");
    }

    #[test]
    fn is_write_treats_ms_md_as_writes_always() {
        let exec = executor();
        assert!(exec.is_write(Op::Ms, &RequestFlags::new()));
        assert!(exec.is_write(Op::Md, &RequestFlags::new()));
    }

    #[test]
    fn is_write_treats_touching_mg_as_write_within_threshold() {
        let mut exec = executor();
        exec.config.touch_ttl_to_consider_write_failure = 100;
        assert!(exec.is_write(Op::Mg, &RequestFlags::new().with_cache_ttl(50)));
        assert!(!exec.is_write(Op::Mg, &RequestFlags::new().with_cache_ttl(200)));
        assert!(!exec.is_write(Op::Mg, &RequestFlags::new()));
    }
}
