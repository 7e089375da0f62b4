//! The request half of the reactive request/response pair.
//!
//! # Responsibilities
//! - Expose method, URI, version and headers identically for HTTP/1.1 and HTTP/2
//! - Expose the body as a lazily produced sequence of chunks
//! - Resolve host, scheme and remote address (forwarded-header aware)
//!
//! # Design Decisions
//! - The head is shared (`Arc`) with the response side so compression
//!   predicates can look at the request after the handler took the body
//! - HTTP/1.1 bodies arrive over a bounded channel fed by the connection
//!   reader; a full channel stops the reader (backpressure)
//! - HTTP/2 bodies read straight from the stream and release flow-control
//!   capacity as chunks are consumed

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::{header, Extensions, HeaderMap, Method, Uri, Version};
use tokio::sync::mpsc;

use crate::http::error::HttpError;
use crate::http::forwarded::ForwardedInfo;
use crate::net::connection::ConnectionInfo;

/// Request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri, version: Version, headers: HeaderMap) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
        }
    }

    /// Whether the connection may carry another request after this one.
    pub fn is_keep_alive(&self) -> bool {
        match self.version {
            Version::HTTP_10 => header_has_token(&self.headers, header::CONNECTION, "keep-alive"),
            Version::HTTP_11 => !header_has_token(&self.headers, header::CONNECTION, "close"),
            _ => true,
        }
    }
}

/// Case-insensitive search for `token` in a comma separated header list.
pub(crate) fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

pub(crate) type BodySender = mpsc::Sender<Result<Bytes, HttpError>>;

/// Lazily produced request body.
pub struct RequestBody {
    inner: BodyInner,
}

enum BodyInner {
    Empty,
    Channel(mpsc::Receiver<Result<Bytes, HttpError>>),
    H2(h2::RecvStream),
}

impl RequestBody {
    pub fn empty() -> Self {
        Self {
            inner: BodyInner::Empty,
        }
    }

    pub(crate) fn channel(capacity: usize) -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            tx,
            Self {
                inner: BodyInner::Channel(rx),
            },
        )
    }

    pub(crate) fn h2(recv: h2::RecvStream) -> Self {
        if recv.is_end_stream() {
            return Self::empty();
        }
        Self {
            inner: BodyInner::H2(recv),
        }
    }

    /// Whether the body is known to be empty without polling.
    pub fn is_end_stream(&self) -> bool {
        match &self.inner {
            BodyInner::Empty => true,
            BodyInner::Channel(_) => false,
            BodyInner::H2(recv) => recv.is_end_stream(),
        }
    }

    /// Collect the whole body into one buffer.
    pub async fn aggregate(mut self) -> Result<Bytes, HttpError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for RequestBody {
    type Item = Result<Bytes, HttpError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().inner {
            BodyInner::Empty => Poll::Ready(None),
            BodyInner::Channel(rx) => rx.poll_recv(cx),
            BodyInner::H2(recv) => match ready!(recv.poll_data(cx)) {
                Some(Ok(data)) => {
                    let _ = recv.flow_control().release_capacity(data.len());
                    Poll::Ready(Some(Ok(data)))
                }
                Some(Err(e)) => Poll::Ready(Some(Err(HttpError::H2(e)))),
                None => Poll::Ready(None),
            },
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.inner {
            BodyInner::Empty => "empty",
            BodyInner::Channel(_) => "http1",
            BodyInner::H2(_) => "h2",
        };
        f.debug_struct("RequestBody").field("kind", &kind).finish()
    }
}

/// A request as seen by application handlers.
#[derive(Debug)]
pub struct HttpServerRequest {
    head: Arc<RequestHead>,
    body: RequestBody,
    connection: Arc<ConnectionInfo>,
    forwarded: Option<ForwardedInfo>,
    extensions: Extensions,
}

impl HttpServerRequest {
    pub(crate) fn new(
        head: Arc<RequestHead>,
        body: RequestBody,
        connection: Arc<ConnectionInfo>,
        forwarded: Option<ForwardedInfo>,
    ) -> Self {
        Self {
            head,
            body,
            connection,
            forwarded,
            extensions: Extensions::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn uri(&self) -> &Uri {
        &self.head.uri
    }

    pub fn path(&self) -> &str {
        self.head.uri.path()
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn is_keep_alive(&self) -> bool {
        self.head.is_keep_alive()
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// HTTP/2 stream carrying this request, if any.
    pub fn stream_id(&self) -> Option<u32> {
        self.connection.stream_id()
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    /// Take the body, leaving an empty one behind.
    pub fn take_body(&mut self) -> RequestBody {
        std::mem::replace(&mut self.body, RequestBody::empty())
    }

    pub fn into_body(self) -> RequestBody {
        self.body
    }

    /// Forwarded information, present only when forwarded handling is enabled
    /// and the request carried forwarding headers.
    pub fn forwarded(&self) -> Option<&ForwardedInfo> {
        self.forwarded.as_ref()
    }

    /// Host the client addressed.
    pub fn host_address(&self) -> Option<&str> {
        if let Some(host) = self.forwarded.as_ref().and_then(|f| f.host.as_deref()) {
            return Some(host);
        }
        self.head
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| self.head.uri.authority().map(|a| a.as_str()))
    }

    /// `http` or `https`, as the client sees it.
    pub fn scheme(&self) -> &str {
        if let Some(proto) = self.forwarded.as_ref().and_then(|f| f.proto.as_deref()) {
            return proto;
        }
        if self.connection.is_secure() {
            "https"
        } else {
            "http"
        }
    }

    /// Client address, forwarded-aware.
    pub fn remote_address(&self) -> String {
        self.forwarded
            .as_ref()
            .and_then(|f| f.remote.clone())
            .unwrap_or_else(|| self.connection.remote_addr().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn head(version: Version, connection: Option<&'static str>) -> RequestHead {
        let mut headers = HeaderMap::new();
        if let Some(value) = connection {
            headers.insert(header::CONNECTION, HeaderValue::from_static(value));
        }
        RequestHead::new(Method::GET, Uri::from_static("/"), version, headers)
    }

    #[test]
    fn keep_alive_rules() {
        assert!(head(Version::HTTP_11, None).is_keep_alive());
        assert!(!head(Version::HTTP_11, Some("Close")).is_keep_alive());
        assert!(!head(Version::HTTP_10, None).is_keep_alive());
        assert!(head(Version::HTTP_10, Some("keep-alive")).is_keep_alive());
        assert!(head(Version::HTTP_2, Some("close")).is_keep_alive());
    }

    #[test]
    fn token_search_spans_lists() {
        let mut headers = HeaderMap::new();
        headers.append(header::CONNECTION, HeaderValue::from_static("Upgrade, HTTP2-Settings"));
        assert!(header_has_token(&headers, header::CONNECTION, "http2-settings"));
        assert!(header_has_token(&headers, header::CONNECTION, "upgrade"));
        assert!(!header_has_token(&headers, header::CONNECTION, "close"));
    }

    #[tokio::test]
    async fn channel_body_aggregates_in_order() {
        let (tx, body) = RequestBody::channel(4);
        tx.send(Ok(Bytes::from_static(b"hello "))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"world"))).await.unwrap();
        drop(tx);
        assert_eq!(body.aggregate().await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn channel_body_surfaces_errors() {
        let (tx, body) = RequestBody::channel(1);
        tx.send(Err(HttpError::ConnectionClosed)).await.unwrap();
        drop(tx);
        assert!(matches!(body.aggregate().await, Err(HttpError::ConnectionClosed)));
    }
}
