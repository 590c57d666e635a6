use std::io;

use super::types::{ErrorObject, Id};

/// Error code carried by the error object of a timed-out request
pub const TIMEOUT_CODE: i64 = -32000;
/// Error code carried by the error object of a request drained by `close`
pub const CONNECTION_CLOSED_CODE: i64 = -32001;

/// Shape violation found while coercing an inbound value into a message
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoerceError {
    #[error("message must be an object")]
    NotAnObject,

    #[error("unexpected field in message: {0}")]
    UnexpectedField(String),

    #[error("invalid jsonrpc version")]
    InvalidVersion,

    #[error("invalid id type")]
    InvalidIdType,

    #[error("method must be a string")]
    InvalidMethodType,

    #[error("params must be an array or object")]
    InvalidParams,

    #[error("error without id")]
    ErrorWithoutId,

    #[error("result without id")]
    ResultWithoutId,

    #[error("no method in notification")]
    NoMethodInNotification,

    #[error("both result and error in response")]
    BothResultAndError,

    #[error("no result in response")]
    NoResultInResponse,

    #[error("response must have an id")]
    ResponseWithoutId,

    #[error("params in response")]
    ParamsInResponse,

    #[error("request must have a non-null id")]
    RequestWithNullId,

    #[error("result in request")]
    ResultInRequest,

    #[error("error in request")]
    ErrorInRequest,

    #[error("error must be an object")]
    ErrorNotAnObject,

    #[error("error code must be an integer")]
    ErrorCodeNotInteger,

    #[error("error message must be a string")]
    ErrorMessageNotString,
}

/// Failure returned by `Engine::received_message`
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Invalid(#[from] CoerceError),

    #[error("response for non-pending id {0}")]
    NonPendingId(Id),
}

/// The request never got an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportFailure {
    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    ConnectionClosed,
    Remote,
}

/// Outcome of `Engine::request` other than a successful result
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(#[from] TransportFailure),

    #[error("remote error {0}")]
    Remote(ErrorObject),
}

impl RequestError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RequestError::Transport(TransportFailure::Timeout) => FailureKind::Timeout,
            RequestError::Transport(TransportFailure::ConnectionClosed) => {
                FailureKind::ConnectionClosed
            }
            RequestError::Remote(_) => FailureKind::Remote,
        }
    }

    /// Transport failures rendered in the same shape as a remote error
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            RequestError::Transport(failure) => {
                let code = match failure {
                    TransportFailure::Timeout => TIMEOUT_CODE,
                    TransportFailure::ConnectionClosed => CONNECTION_CLOSED_CODE,
                };
                ErrorObject::custom(code, failure.to_string(), None)
            }
            RequestError::Remote(error) => error.clone(),
        }
    }
}

/// A codec rejected a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CodecError(pub String);

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Failure of a typed client call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(TransportFailure),

    #[error("remote error {0}")]
    Remote(ErrorObject),

    #[error("failed to decode result: {0}")]
    DecodeResult(CodecError),

    #[error("failed to encode params: {0}")]
    EncodeParams(CodecError),

    #[error("method not registered: {0}")]
    UnknownMethod(String),
}

impl CallError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Transport(TransportFailure::Timeout))
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, CallError::Transport(TransportFailure::ConnectionClosed))
    }
}

impl From<RequestError> for CallError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Transport(failure) => CallError::Transport(failure),
            RequestError::Remote(error) => CallError::Remote(error),
        }
    }
}

impl From<TransportFailure> for CallError {
    fn from(failure: TransportFailure) -> Self {
        CallError::Transport(failure)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("method registered twice: {0}")]
    DuplicateMethod(String),

    #[error("no handler for method: {0}")]
    MissingHandler(String),

    #[error("handler given for a method of another registry: {0}")]
    ForeignMethod(String),
}

/// Reason a framed connection stopped
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("rejected inbound message: {0}")]
    Rejected(#[from] ReceiveError),
}
