//! Error codes, the wire error object, and the crate-wide error type.

use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Reserved server error range start (-32099).
pub const SERVER_ERROR_START: i64 = -32099;

/// Reserved server error range end (-32000).
pub const SERVER_ERROR_END: i64 = -32000;

/// Pre-defined JSON-RPC 2.0 error codes, plus the LSP extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Parse error (-32700)
    ParseError,
    /// Invalid Request (-32600)
    InvalidRequest,
    /// Method not found (-32601)
    MethodNotFound,
    /// Invalid params (-32602)
    InvalidParams,
    /// Internal error (-32603)
    InternalError,
    /// Server overloaded (-32000)
    ServerOverloaded,
    /// Unknown error (-32001), used for all non-coded errors
    UnknownError,
    /// Server not initialized (-32002)
    ServerNotInitialized,
    /// Request cancelled (-32800), defined by the Language Server Protocol
    RequestCancelled,
    /// Content modified (-32801), defined by the Language Server Protocol
    ContentModified,
    /// Other codes in the reserved server range [-32099, -32000]
    ServerError(i64),
    /// Application-specific code outside the reserved ranges
    ApplicationError(i64),
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::ServerOverloaded => -32000,
            ErrorCode::UnknownError => -32001,
            ErrorCode::ServerNotInitialized => -32002,
            ErrorCode::RequestCancelled => -32800,
            ErrorCode::ContentModified => -32801,
            ErrorCode::ServerError(code) => code,
            ErrorCode::ApplicationError(code) => code,
        }
    }

    /// Classify a numeric code.
    pub fn from_code(code: i64) -> Self {
        match code {
            -32700 => ErrorCode::ParseError,
            -32600 => ErrorCode::InvalidRequest,
            -32601 => ErrorCode::MethodNotFound,
            -32602 => ErrorCode::InvalidParams,
            -32603 => ErrorCode::InternalError,
            -32000 => ErrorCode::ServerOverloaded,
            -32001 => ErrorCode::UnknownError,
            -32002 => ErrorCode::ServerNotInitialized,
            -32800 => ErrorCode::RequestCancelled,
            -32801 => ErrorCode::ContentModified,
            code if (SERVER_ERROR_START..=SERVER_ERROR_END).contains(&code) => {
                ErrorCode::ServerError(code)
            }
            code => ErrorCode::ApplicationError(code),
        }
    }

    /// Default wire message for the code.
    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerOverloaded => "Server overloaded",
            ErrorCode::UnknownError => "Unknown error",
            ErrorCode::ServerNotInitialized => "Server not initialized",
            ErrorCode::RequestCancelled => "Request cancelled",
            ErrorCode::ContentModified => "Content modified",
            ErrorCode::ServerError(_) => "Server error",
            ErrorCode::ApplicationError(_) => "Application error",
        }
    }
}

/// A structured JSON-RPC error, the `error` member of a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error type indicator.
    pub code: i64,

    /// Short error description.
    pub message: String,

    /// Additional error information (optional).
    #[serde(
        default,
        deserialize_with = "crate::message::raw_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub data: Option<Box<RawValue>>,
}

impl ErrorObject {
    /// Create an error with the code's default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code: code.code(),
            message: code.message().to_string(),
            data: None,
        }
    }

    /// Create an error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    /// Create an error from raw parts.
    pub fn custom(code: i64, message: impl Into<String>, data: Option<Box<RawValue>>) -> Self {
        Self {
            code,
            message: message.into(),
            data,
        }
    }

    /// Classified form of the numeric code.
    pub fn error_code(&self) -> ErrorCode {
        ErrorCode::from_code(self.code)
    }
}

impl PartialEq for ErrorObject {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.message == other.message
            && raw_eq(self.data.as_deref(), other.data.as_deref())
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RPC error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorObject {}

/// Compare two optional raw JSON blobs by their text.
pub(crate) fn raw_eq(a: Option<&RawValue>, b: Option<&RawValue>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.get() == b.get(),
        _ => false,
    }
}

/// Errors produced by the connection engine, framings and transports.
///
/// The variants double as the sentinel vocabulary between handlers and the
/// engine: a handler returns [`Error::NotHandled`] to fall through to the
/// next stage, or [`Error::AsyncResponse`] to defer its reply to a later
/// [`Connection::respond`](crate::conn::Connection::respond).
///
/// The type is `Clone` so a single connection failure can be delivered to
/// every pending outbound call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Underlying stream failure.
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Malformed JSON arrived on the stream.
    #[error("parse error: {0}")]
    Parse(String),

    /// The `jsonrpc` tag was missing or not exactly "2.0".
    #[error("invalid JSON-RPC version: {0}")]
    Version(String),

    /// The envelope was not a call, notification or response.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No handler accepted the method.
    #[error("method {0:?} not found")]
    MethodNotFound(String),

    /// The params blob did not decode as the expected shape.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// A local invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),

    /// The peer refused the message because it is overloaded.
    #[error("server overloaded")]
    ServerOverloaded,

    /// A structured error response from the peer, or a structured error a
    /// handler wants on the wire with its code preserved.
    #[error("{0}")]
    Response(ErrorObject),

    /// Serving timed out waiting for new connections.
    #[error("timed out waiting for new connections")]
    IdleTimeout,

    /// Sentinel: the handler did not handle the message.
    #[error("request not handled")]
    NotHandled,

    /// Sentinel: the handler will produce its response asynchronously.
    #[error("asynchronous response")]
    AsyncResponse,

    /// The handling context was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The connection (or listener) has shut down.
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Convert a handler-returned error into its wire form.
    ///
    /// Structured errors keep their code; coded variants map onto the
    /// standard codes; anything else is wrapped with code 0 and its
    /// display string, mirroring how plain errors cross the wire.
    pub fn to_error_object(&self) -> ErrorObject {
        let code = match self {
            Error::Response(object) => return object.clone(),
            Error::Parse(_) => ErrorCode::ParseError.code(),
            Error::Version(_) | Error::InvalidRequest(_) => ErrorCode::InvalidRequest.code(),
            Error::MethodNotFound(_) => ErrorCode::MethodNotFound.code(),
            Error::InvalidParams(_) => ErrorCode::InvalidParams.code(),
            Error::Internal(_) => ErrorCode::InternalError.code(),
            Error::ServerOverloaded => ErrorCode::ServerOverloaded.code(),
            Error::Cancelled => ErrorCode::RequestCancelled.code(),
            _ => 0,
        };
        ErrorObject::custom(code, self.to_string(), None)
    }

    /// Report whether the error occurs normally while closing a connection.
    ///
    /// Used to suppress expected failures during shutdown: a clean
    /// end-of-stream, a closed or broken pipe, or a reset socket.
    pub fn is_closing(&self) -> bool {
        match self {
            Error::Closed => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::value::to_raw_value;

    #[test]
    fn test_code_values() {
        assert_eq!(ErrorCode::ParseError.code(), -32700);
        assert_eq!(ErrorCode::InvalidRequest.code(), -32600);
        assert_eq!(ErrorCode::MethodNotFound.code(), -32601);
        assert_eq!(ErrorCode::InvalidParams.code(), -32602);
        assert_eq!(ErrorCode::InternalError.code(), -32603);
        assert_eq!(ErrorCode::ServerOverloaded.code(), -32000);
        assert_eq!(ErrorCode::UnknownError.code(), -32001);
        assert_eq!(ErrorCode::ServerNotInitialized.code(), -32002);
        assert_eq!(ErrorCode::RequestCancelled.code(), -32800);
        assert_eq!(ErrorCode::ContentModified.code(), -32801);
    }

    #[test]
    fn test_code_round_trip() {
        let codes = [
            ErrorCode::ParseError,
            ErrorCode::InvalidRequest,
            ErrorCode::MethodNotFound,
            ErrorCode::InvalidParams,
            ErrorCode::InternalError,
            ErrorCode::ServerOverloaded,
            ErrorCode::UnknownError,
            ErrorCode::ServerNotInitialized,
            ErrorCode::RequestCancelled,
            ErrorCode::ContentModified,
            ErrorCode::ServerError(-32050),
            ErrorCode::ApplicationError(1000),
        ];
        for code in codes {
            assert_eq!(ErrorCode::from_code(code.code()), code);
        }
    }

    #[test]
    fn test_named_codes_win_over_server_range() {
        // -32000..-32002 sit inside the reserved range but have names.
        assert_eq!(ErrorCode::from_code(-32000), ErrorCode::ServerOverloaded);
        assert_eq!(ErrorCode::from_code(-32001), ErrorCode::UnknownError);
        assert_eq!(ErrorCode::from_code(-32050), ErrorCode::ServerError(-32050));
        assert_eq!(
            ErrorCode::from_code(-32100),
            ErrorCode::ApplicationError(-32100)
        );
    }

    #[test]
    fn test_error_object_serialization() {
        let object = ErrorObject::new(ErrorCode::MethodNotFound);
        let json = serde_json::to_string(&object).unwrap();
        assert_eq!(json, r#"{"code":-32601,"message":"Method not found"}"#);

        let object = ErrorObject::custom(
            -32001,
            "boom",
            Some(to_raw_value(&serde_json::json!({"detail": 1})).unwrap()),
        );
        let json = serde_json::to_string(&object).unwrap();
        assert_eq!(
            json,
            r#"{"code":-32001,"message":"boom","data":{"detail":1}}"#
        );

        let parsed: ErrorObject = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, object);
    }

    #[test]
    fn test_to_error_object_preserves_structured_code() {
        let inner = ErrorObject::with_message(ErrorCode::ContentModified, "stale");
        let object = Error::Response(inner.clone()).to_error_object();
        assert_eq!(object, inner);
    }

    #[test]
    fn test_to_error_object_wraps_plain_errors_with_code_zero() {
        let err = Error::Io(Arc::new(io::Error::new(io::ErrorKind::Other, "boom")));
        let object = err.to_error_object();
        assert_eq!(object.code, 0);
        assert_eq!(object.message, "IO error: boom");
    }

    #[test]
    fn test_to_error_object_maps_sentinels() {
        assert_eq!(
            Error::MethodNotFound("peek".to_string())
                .to_error_object()
                .code,
            -32601
        );
        assert_eq!(Error::Cancelled.to_error_object().code, -32800);
        assert_eq!(
            Error::InvalidParams("bad".to_string()).to_error_object().code,
            -32602
        );
    }

    #[test]
    fn test_is_closing() {
        assert!(Error::Closed.is_closing());
        assert!(Error::Io(Arc::new(io::Error::from(io::ErrorKind::BrokenPipe))).is_closing());
        assert!(Error::Io(Arc::new(io::Error::from(io::ErrorKind::ConnectionReset))).is_closing());
        assert!(!Error::Io(Arc::new(io::Error::from(io::ErrorKind::UnexpectedEof))).is_closing());
        assert!(!Error::IdleTimeout.is_closing());
        assert!(!Error::Parse("garbage".to_string()).is_closing());
    }
}
