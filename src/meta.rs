//! Typed wrappers over the raw [`Response`] enum, one per command family,
//! covering the full `mg`/`ms`/`md`/`ma` surface.

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::flags::{Op, RequestFlags, Response, ResponseFlags};
use crate::key::Key;
use crate::router::Router;
use crate::serializer::CacheValue;

/// What a `mg`/`ma` call can come back as.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResponse {
    Miss,
    /// A touch-only `mg`, or a value-less `ma` (no `v` flag requested).
    Stored(ResponseFlags),
    Value { data: Vec<u8>, flags: ResponseFlags },
}

/// What a `ms`/`md` call can come back as.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResponse {
    Stored(ResponseFlags),
    NotStored,
    Conflict(ResponseFlags),
}

/// One command per wire verb, each validating that the response variant the
/// server actually returned is one that verb can produce.
pub trait MetaCommands {
    fn meta_get(&self, key: &Key, flags: RequestFlags) -> Result<ReadResponse>;
    fn meta_set(&self, key: &Key, value: &CacheValue, flags: RequestFlags) -> Result<WriteResponse>;
    fn meta_delete(&self, key: &Key, flags: RequestFlags) -> Result<WriteResponse>;
    fn meta_arithmetic(&self, key: &Key, flags: RequestFlags) -> Result<ReadResponse>;
}

/// Exposes the executor/router pair a concrete client dispatches through.
/// `MetaCommands` is implemented once, for any type carrying this access,
/// rather than duplicated per client type.
pub trait RouterAccess {
    fn executor(&self) -> &Executor;
    fn router(&self) -> &dyn Router;
}

fn unexpected(expected: &'static str, response: &Response) -> Error {
    Error::UnexpectedResponse {
        expected,
        got: response.kind_name().to_string(),
    }
}

impl<T: RouterAccess> MetaCommands for T {
    fn meta_get(&self, key: &Key, flags: RequestFlags) -> Result<ReadResponse> {
        let response = self.router().exec(self.executor(), Op::Mg, key, None, flags)?;
        match response {
            Response::Miss => Ok(ReadResponse::Miss),
            Response::Success(f) => Ok(ReadResponse::Stored(f)),
            Response::Value { data, flags, .. } => Ok(ReadResponse::Value {
                data: data.unwrap_or_default(),
                flags,
            }),
            other @ (Response::NotStored | Response::Conflict(_)) => {
                Err(unexpected("Miss|Success|Value", &other))
            }
        }
    }

    fn meta_set(&self, key: &Key, value: &CacheValue, flags: RequestFlags) -> Result<WriteResponse> {
        let response = self
            .router()
            .exec(self.executor(), Op::Ms, key, Some(value), flags)?;
        match response {
            Response::Success(f) => Ok(WriteResponse::Stored(f)),
            Response::NotStored => Ok(WriteResponse::NotStored),
            Response::Conflict(f) => Ok(WriteResponse::Conflict(f)),
            other @ (Response::Miss | Response::Value { .. }) => {
                Err(unexpected("Success|NotStored|Conflict", &other))
            }
        }
    }

    fn meta_delete(&self, key: &Key, flags: RequestFlags) -> Result<WriteResponse> {
        let response = self.router().exec(self.executor(), Op::Md, key, None, flags)?;
        match response {
            Response::Success(f) => Ok(WriteResponse::Stored(f)),
            Response::NotStored => Ok(WriteResponse::NotStored),
            Response::Conflict(f) => Ok(WriteResponse::Conflict(f)),
            other @ (Response::Miss | Response::Value { .. }) => {
                Err(unexpected("Success|NotStored|Conflict", &other))
            }
        }
    }

    fn meta_arithmetic(&self, key: &Key, flags: RequestFlags) -> Result<ReadResponse> {
        let response = self.router().exec(self.executor(), Op::Ma, key, None, flags)?;
        match response {
            Response::Miss => Ok(ReadResponse::Miss),
            Response::Success(f) => Ok(ReadResponse::Stored(f)),
            Response::Value { data, flags, .. } => Ok(ReadResponse::Value {
                data: data.unwrap_or_default(),
                flags,
            }),
            other @ (Response::NotStored | Response::Conflict(_)) => {
                Err(unexpected("Miss|Success|Value", &other))
            }
        }
    }
}
