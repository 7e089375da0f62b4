//! Error taxonomy for the HTTP layer.
//!
//! # Categories
//! - `ConfigurationError`: rejected while building options, before any connection exists
//! - `NegotiationError`: protocol selection failed; always terminal for the connection
//! - `CodecError`: malformed HTTP/1.1 framing or exceeded decoder limits
//! - `HttpError`: everything a request, stream or connection can end with
//!
//! # Design Decisions
//! - Negotiation errors surface through the connection observer only
//! - Codec and body errors surface to the request they belong to
//! - Resource exhaustion is a codec error, classified by `CodecError::is_resource_exhaustion`

use std::io;

use thiserror::Error;

/// Boxed error used at the handler and body boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Malformed or contradictory server configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// Negative compression thresholds are only reachable through `compression(false)`.
    #[error("minimum compression response size must not be negative, got {0}")]
    NegativeCompressionThreshold(i64),

    /// A decoder limit was configured as zero.
    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },

    /// Listen address could not be parsed.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// HTTP/2 setting outside the range allowed by RFC 9113.
    #[error("{field} is out of range: {value}")]
    Http2SettingOutOfRange { field: &'static str, value: u32 },
}

/// Protocol selection failed for a connection.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// ALPN selected something that is neither `h2` nor `http/1.1`.
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),

    /// The `HTTP2-Settings` header of an h2c upgrade could not be decoded.
    #[error("malformed HTTP2-Settings header: {0}")]
    MalformedSettings(String),

    /// The client did not send a valid HTTP/2 connection preface after `101`.
    #[error("invalid HTTP/2 connection preface")]
    InvalidPreface,

    /// The HTTP/2 connection handshake failed.
    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(#[source] h2::Error),
}

/// Malformed HTTP/1.1 framing.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("request line is larger than {limit} bytes")]
    InitialLineTooLong { limit: usize },

    #[error("request header section is larger than {limit} bytes")]
    HeaderTooLarge { limit: usize },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid chunk framing")]
    InvalidChunk,

    #[error("connection closed before the message completed")]
    IncompleteMessage,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// Whether a configured size limit was exceeded.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            CodecError::InitialLineTooLong { .. } | CodecError::HeaderTooLarge { .. }
        )
    }

    /// Status code of the minimal response written before closing.
    pub fn status(&self) -> http::StatusCode {
        match self {
            CodecError::InitialLineTooLong { .. } => http::StatusCode::URI_TOO_LONG,
            CodecError::HeaderTooLarge { .. } => {
                http::StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            _ => http::StatusCode::BAD_REQUEST,
        }
    }
}

/// Terminal condition of a request, stream or connection.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("HTTP/2 error: {0}")]
    H2(#[from] h2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    #[error("response body failed: {0}")]
    Body(#[source] BoxError),

    #[error("response already sent")]
    AlreadySent,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request cancelled")]
    Cancelled,

    /// The peer reset an HTTP/2 stream before its response completed.
    #[error("stream reset by peer: {0}")]
    StreamReset(h2::Reason),
}

impl HttpError {
    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HttpError::Codec(e) if e.is_resource_exhaustion() => "resource_exhaustion",
            HttpError::Codec(_) => "codec",
            HttpError::Negotiation(_) => "negotiation",
            HttpError::H2(_) => "h2",
            HttpError::Io(_) => "io",
            HttpError::Handler(_) => "handler",
            HttpError::Body(_) => "body",
            HttpError::AlreadySent => "already_sent",
            HttpError::ConnectionClosed => "connection_closed",
            HttpError::Cancelled => "cancelled",
            HttpError::StreamReset(_) => "stream_reset",
        }
    }
}
