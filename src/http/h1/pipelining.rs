//! Ordered response writing for pipelined HTTP/1.1 requests.
//!
//! # Responsibilities
//! - Keep one queue slot per request, in arrival order
//! - Write each response only after every earlier response is fully written
//! - Decide framing and persistence for each response
//!
//! # Design Decisions
//! - Handlers may finish in any order; the writer awaits the slot at the
//!   head of the queue, so later responses wait in their oneshot channels
//! - A slot dropped without a response gets a 500 and the connection closes

use futures_util::{SinkExt, StreamExt};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderValue, Method, StatusCode, Version};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedWrite;

use crate::http::bridge::{ResponseMessage, ResponseSlot};
use crate::http::compression;
use crate::http::error::HttpError;
use crate::http::h1::codec::{Framing, Http1Encoder, ResponseFrame};
use crate::http::request::{header_has_token, RequestHead};
use crate::http::response::{ResponseBody, ResponseHead};

/// Queue slot for one request.
pub(crate) struct PendingResponse {
    method: Method,
    version: Version,
    keep_alive: bool,
    accept_encoding: Option<HeaderValue>,
    response: oneshot::Receiver<ResponseMessage>,
}

impl PendingResponse {
    pub(crate) fn new(request: &RequestHead) -> (Self, ResponseSlot) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            method: request.method.clone(),
            version: request.version,
            keep_alive: request.is_keep_alive(),
            accept_encoding: request.headers.get(http::header::ACCEPT_ENCODING).cloned(),
            response: rx,
        };
        (pending, tx)
    }

    /// Slot pre-filled with a bodiless error response that closes the connection.
    pub(crate) fn error(status: StatusCode) -> Self {
        let (tx, rx) = oneshot::channel();
        let mut head = ResponseHead::new(status);
        head.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        // The receiver is alive, send cannot fail.
        let _ = tx.send(ResponseMessage {
            head,
            body: ResponseBody::Empty,
            completion: None,
            reporter: None,
        });
        Self {
            method: Method::GET,
            version: Version::HTTP_11,
            keep_alive: false,
            accept_encoding: None,
            response: rx,
        }
    }
}

/// Writes responses in request order.
pub(crate) struct PipeliningHandler<W> {
    writer: FramedWrite<W, Http1Encoder>,
    queue: mpsc::UnboundedReceiver<PendingResponse>,
    compress_always: bool,
}

impl<W> PipeliningHandler<W>
where
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(
        writer: FramedWrite<W, Http1Encoder>,
        queue: mpsc::UnboundedReceiver<PendingResponse>,
        compress_always: bool,
    ) -> Self {
        Self {
            writer,
            queue,
            compress_always,
        }
    }

    /// Drain the queue until it closes or a response ends the connection.
    pub(crate) async fn run(mut self) -> FramedWrite<W, Http1Encoder> {
        while let Some(mut pending) = self.queue.recv().await {
            let message = match (&mut pending.response).await {
                Ok(message) => message,
                Err(_) => {
                    tracing::debug!("Exchange dropped without a response, closing connection");
                    pending.keep_alive = false;
                    let head = ResponseHead::new(StatusCode::INTERNAL_SERVER_ERROR);
                    if let Err(e) = self.write(&pending, head, ResponseBody::Empty).await {
                        tracing::debug!(error = %e, "Failed to write fallback response");
                    }
                    break;
                }
            };

            let ResponseMessage {
                mut head,
                mut body,
                completion,
                reporter,
            } = message;
            if self.compress_always {
                let coding = compression::select_coding(
                    &pending.method,
                    pending.accept_encoding.as_ref(),
                    &head,
                    &body,
                );
                if let Some(coding) = coding {
                    body = compression::encode(coding, &mut head, body);
                }
            }

            let result = self.write(&pending, head, body).await;
            let keep_open = matches!(result, Ok(true));
            if let Some(reporter) = reporter {
                reporter.written(result.as_ref().map(|_| ()));
            }
            if let Some(done) = completion {
                let _ = done.send(result.map(|_| ()));
            }
            if !keep_open {
                break;
            }
        }
        self.writer
    }

    /// Write one response. Returns whether the connection stays open.
    async fn write(
        &mut self,
        pending: &PendingResponse,
        mut head: ResponseHead,
        body: ResponseBody,
    ) -> Result<bool, HttpError> {
        let head_only = pending.method == Method::HEAD || head.forbids_body();
        let mut keep_alive =
            pending.keep_alive && !header_has_token(&head.headers, CONNECTION, "close");

        let framing = if head_only {
            if head.forbids_body() {
                head.headers.remove(CONTENT_LENGTH);
                head.headers.remove(TRANSFER_ENCODING);
            } else if !head.headers.contains_key(CONTENT_LENGTH) {
                if let Some(len) = body.exact_len() {
                    head.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
                }
            }
            Framing::None
        } else if let Some(len) = body.exact_len() {
            head.headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
            Framing::Length
        } else if head.headers.contains_key(CONTENT_LENGTH) {
            Framing::Length
        } else if pending.version == Version::HTTP_11 {
            head.headers.remove(TRANSFER_ENCODING);
            Framing::Chunked
        } else {
            keep_alive = false;
            Framing::CloseDelimited
        };

        if !keep_alive {
            head.headers.insert(CONNECTION, HeaderValue::from_static("close"));
        } else if pending.version == Version::HTTP_10 {
            head.headers
                .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        }

        self.writer
            .feed(ResponseFrame::Head {
                head,
                version: pending.version,
                framing,
            })
            .await?;

        if !head_only {
            match body {
                ResponseBody::Empty => {}
                ResponseBody::Full(bytes) => self.writer.feed(ResponseFrame::Data(bytes)).await?,
                ResponseBody::Stream(mut stream) => {
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk.map_err(HttpError::Body)?;
                        self.writer.send(ResponseFrame::Data(chunk)).await?;
                    }
                }
            }
            self.writer.feed(ResponseFrame::End).await?;
        }
        self.writer.flush().await?;
        Ok(keep_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::bridge::dispatch;
    use crate::http::error::BoxError;
    use bytes::Bytes;
    use http::{HeaderMap, Uri};
    use tokio::io::AsyncReadExt;

    fn request(method: Method, version: Version) -> RequestHead {
        RequestHead::new(method, Uri::from_static("/"), version, HeaderMap::new())
    }

    async fn written(output: tokio::io::DuplexStream) -> String {
        let mut output = output;
        let mut text = String::new();
        output.read_to_string(&mut text).await.unwrap();
        text
    }

    #[tokio::test]
    async fn responses_follow_request_order() {
        let (server, client) = tokio::io::duplex(4096);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let handler = PipeliningHandler::new(FramedWrite::new(server, Http1Encoder::default()), queue_rx, false);

        let (first, first_slot) = PendingResponse::new(&request(Method::GET, Version::HTTP_11));
        let (second, second_slot) = PendingResponse::new(&request(Method::GET, Version::HTTP_11));
        queue_tx.send(first).unwrap();
        queue_tx.send(second).unwrap();
        drop(queue_tx);

        let writer = tokio::spawn(handler.run());
        // The second handler finishes first.
        let late = tokio::spawn(dispatch(second_slot, ResponseHead::default(), ResponseBody::from("second"), None));
        tokio::task::yield_now().await;
        dispatch(first_slot, ResponseHead::default(), ResponseBody::from("first"), None)
            .await
            .unwrap();
        late.await.unwrap().unwrap();
        drop(writer.await.unwrap());

        let text = written(client).await;
        let first_at = text.find("first").unwrap();
        let second_at = text.find("second").unwrap();
        assert!(first_at < second_at);
    }

    #[tokio::test]
    async fn streamed_body_uses_chunked_framing() {
        let (server, client) = tokio::io::duplex(4096);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let handler = PipeliningHandler::new(FramedWrite::new(server, Http1Encoder::default()), queue_rx, false);
        let (pending, slot) = PendingResponse::new(&request(Method::GET, Version::HTTP_11));
        queue_tx.send(pending).unwrap();
        drop(queue_tx);

        let writer = tokio::spawn(handler.run());
        let body = ResponseBody::stream(futures_util::stream::iter(vec![
            Ok::<_, BoxError>(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]));
        dispatch(slot, ResponseHead::default(), body, None).await.unwrap();
        drop(writer.await.unwrap());

        let text = written(client).await;
        assert!(text.contains("transfer-encoding: chunked"));
        assert!(text.ends_with("2\r\nab\r\n2\r\ncd\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn head_request_gets_no_body() {
        let (server, client) = tokio::io::duplex(4096);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let handler = PipeliningHandler::new(FramedWrite::new(server, Http1Encoder::default()), queue_rx, false);
        let (pending, slot) = PendingResponse::new(&request(Method::HEAD, Version::HTTP_11));
        queue_tx.send(pending).unwrap();
        drop(queue_tx);

        let writer = tokio::spawn(handler.run());
        dispatch(slot, ResponseHead::default(), ResponseBody::from("hidden"), None)
            .await
            .unwrap();
        drop(writer.await.unwrap());

        let text = written(client).await;
        assert!(text.contains("content-length: 6"));
        assert!(!text.contains("hidden"));
    }

    #[tokio::test]
    async fn http10_without_length_closes_connection() {
        let (server, client) = tokio::io::duplex(4096);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let handler = PipeliningHandler::new(FramedWrite::new(server, Http1Encoder::default()), queue_rx, false);
        let mut head = request(Method::GET, Version::HTTP_10);
        head.headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        let (pending, slot) = PendingResponse::new(&head);
        let (next, _next_slot) = PendingResponse::new(&head);
        queue_tx.send(pending).unwrap();
        queue_tx.send(next).unwrap();

        let writer = tokio::spawn(handler.run());
        let body = ResponseBody::stream(futures_util::stream::iter(vec![Ok::<_, BoxError>(
            Bytes::from_static(b"tail"),
        )]));
        dispatch(slot, ResponseHead::default(), body, None).await.unwrap();
        // The writer stops after the close-delimited response even though
        // another slot is queued.
        drop(writer.await.unwrap());

        let text = written(client).await;
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("connection: close"));
        assert!(text.ends_with("\r\n\r\ntail"));
    }

    #[tokio::test]
    async fn error_slot_closes_connection() {
        let (server, client) = tokio::io::duplex(4096);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let handler = PipeliningHandler::new(FramedWrite::new(server, Http1Encoder::default()), queue_rx, false);
        queue_tx.send(PendingResponse::error(StatusCode::URI_TOO_LONG)).unwrap();

        drop(handler.run().await);
        let text = written(client).await;
        assert!(text.starts_with("HTTP/1.1 414 URI Too Long\r\n"));
        assert!(text.contains("content-length: 0"));
    }
}
