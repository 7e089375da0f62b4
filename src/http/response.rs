//! The response half of the reactive request/response pair.
//!
//! # Responsibilities
//! - Collect status and headers before the response is committed
//! - Accept a full or streaming body
//! - Signal completion (or failure) of the write back to the caller
//!
//! # Design Decisions
//! - `send` consumes the response: a response is written at most once
//! - Framing (content-length vs chunked vs HTTP/2 DATA) is decided by the
//!   protocol writer, never by the handler

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use crate::http::bridge::BridgeShared;
use crate::http::error::{BoxError, HttpError};
use crate::http::request::RequestHead;

/// Status line and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }

    /// Statuses that never carry a body.
    pub fn forbids_body(&self) -> bool {
        self.status.is_informational()
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED
    }
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

/// Response payload.
pub enum ResponseBody {
    Empty,
    Full(Bytes),
    Stream(BoxStream<'static, Result<Bytes, BoxError>>),
}

impl ResponseBody {
    pub fn empty() -> Self {
        ResponseBody::Empty
    }

    /// Stream the body chunk by chunk.
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        ResponseBody::Stream(stream.map(|chunk| chunk.map_err(Into::into)).boxed())
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        match self {
            ResponseBody::Empty => true,
            ResponseBody::Full(bytes) => bytes.is_empty(),
            ResponseBody::Stream(_) => false,
        }
    }

    /// Exact length when known up front.
    pub fn exact_len(&self) -> Option<u64> {
        match self {
            ResponseBody::Empty => Some(0),
            ResponseBody::Full(bytes) => Some(bytes.len() as u64),
            ResponseBody::Stream(_) => None,
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseBody::Empty => f.write_str("Empty"),
            ResponseBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            ResponseBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl From<Bytes> for ResponseBody {
    fn from(bytes: Bytes) -> Self {
        ResponseBody::Full(bytes)
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(bytes: Vec<u8>) -> Self {
        ResponseBody::Full(bytes.into())
    }
}

impl From<String> for ResponseBody {
    fn from(text: String) -> Self {
        ResponseBody::Full(text.into())
    }
}

impl From<&'static str> for ResponseBody {
    fn from(text: &'static str) -> Self {
        ResponseBody::Full(Bytes::from_static(text.as_bytes()))
    }
}

/// A response sink handed to application handlers.
///
/// If a handler finishes without calling [`send`](Self::send), an empty
/// response with the current status is written on its behalf.
pub struct HttpServerResponse {
    head: ResponseHead,
    shared: Arc<BridgeShared>,
}

impl HttpServerResponse {
    pub(crate) fn new(shared: Arc<BridgeShared>) -> Self {
        Self {
            head: ResponseHead::default(),
            shared,
        }
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.head.status = status;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.head.status
    }

    /// Append a header.
    pub fn header(&mut self, name: HeaderName, value: HeaderValue) -> &mut Self {
        self.head.headers.append(name, value);
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.head.headers
    }

    /// The request this response answers.
    pub fn request(&self) -> &RequestHead {
        self.shared.request()
    }

    /// Whether a response has already been committed for this exchange.
    pub fn is_sent(&self) -> bool {
        self.shared.is_sent()
    }

    /// Write the response and wait until it is flushed to the transport.
    pub async fn send(mut self, body: impl Into<ResponseBody>) -> Result<(), HttpError> {
        let head = std::mem::take(&mut self.head);
        self.shared.send(head, body.into()).await
    }

    /// Write status and headers only.
    pub async fn send_headers(self) -> Result<(), HttpError> {
        self.send(ResponseBody::Empty).await
    }
}

impl Drop for HttpServerResponse {
    fn drop(&mut self) {
        if !self.shared.is_sent() {
            self.shared.stash_head(std::mem::take(&mut self.head));
        }
    }
}

impl std::fmt::Debug for HttpServerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerResponse")
            .field("head", &self.head)
            .field("sent", &self.is_sent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_lengths() {
        assert_eq!(ResponseBody::empty().exact_len(), Some(0));
        assert_eq!(ResponseBody::from("abc").exact_len(), Some(3));
        let streamed = ResponseBody::stream(futures_util::stream::iter(vec![Ok::<_, BoxError>(
            Bytes::from_static(b"x"),
        )]));
        assert_eq!(streamed.exact_len(), None);
        assert!(!streamed.is_empty());
        assert!(ResponseBody::from(String::new()).is_empty());
    }

    #[test]
    fn bodiless_statuses() {
        assert!(ResponseHead::new(StatusCode::NO_CONTENT).forbids_body());
        assert!(ResponseHead::new(StatusCode::NOT_MODIFIED).forbids_body());
        assert!(ResponseHead::new(StatusCode::SWITCHING_PROTOCOLS).forbids_body());
        assert!(!ResponseHead::new(StatusCode::OK).forbids_body());
    }
}
