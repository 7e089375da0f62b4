//! Per-stream pipeline for HTTP/2.
//!
//! Every accepted stream gets its own bridge and handler task. Streams
//! share the parent connection's observer and configuration but no
//! mutable state, so one stream failing or resetting leaves its siblings
//! alone. A reset stream drops its handler and reports the reset once.

use std::future::poll_fn;

use bytes::Bytes;
use futures_util::StreamExt;
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::header::{self, HeaderValue};
use http::{Method, Version};
use tokio::sync::oneshot;

use crate::http::bridge::{self, ResponseMessage, SetupHook};
use crate::http::error::HttpError;
use crate::http::request::{RequestBody, RequestHead};
use crate::http::response::{ResponseBody, ResponseHead};
use crate::pipeline::ConnectionContext;

/// Installs the stream codec and the reactive bridge on each new stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamPipelineInitializer;

impl StreamPipelineInitializer {
    /// Stages installed on every stream.
    pub fn handler_names(&self) -> [&'static str; 2] {
        ["h2_stream_codec", "reactive_bridge"]
    }

    /// Run one stream to completion.
    ///
    /// Streams never receive the connection's setup hook. The handler and the
    /// stream writer run side by side; a reset from the peer ends both and
    /// settles the exchange as `StreamReset`.
    pub(crate) async fn init_stream(
        self,
        request: http::Request<RecvStream>,
        mut respond: SendResponse<Bytes>,
        ctx: ConnectionContext,
    ) {
        let (head, body) = decode_request(request);
        let method = head.method.clone();
        tracing::debug!(
            connection_id = %ctx.info.id(),
            stream_id = ?ctx.info.stream_id(),
            handlers = ?self.handler_names(),
            method = %method,
            "Initialized HTTP/2 stream pipeline"
        );
        let (slot, committed) = oneshot::channel();
        let operations = bridge::attach(&ctx, head, body, slot, &SetupHook::empty());
        let reporter = operations.reporter();

        let exchange = operations.run(ctx.handler.clone());
        let writer = write_committed(&mut respond, &method, committed);
        tokio::pin!(exchange);
        tokio::pin!(writer);

        let reset = tokio::select! {
            _ = &mut exchange => writer.await,
            reset = &mut writer => {
                if reset.is_none() {
                    exchange.await;
                }
                reset
            }
        };
        if let Some(reason) = reset {
            tracing::debug!(
                connection_id = %ctx.info.id(),
                stream_id = ?ctx.info.stream_id(),
                reason = ?reason,
                "Stream reset by peer"
            );
            reporter.fail(&HttpError::StreamReset(reason));
        }
    }
}

/// Wait for the committed response and write it, unless the peer resets the
/// stream first. Returns the reset reason in that case.
async fn write_committed(
    respond: &mut SendResponse<Bytes>,
    method: &Method,
    committed: oneshot::Receiver<ResponseMessage>,
) -> Option<Reason> {
    let message = tokio::select! {
        message = committed => message.ok(),
        reset = poll_fn(|cx| respond.poll_reset(cx)) => {
            return reset.ok();
        }
    };
    let ResponseMessage {
        head,
        body,
        completion,
        reporter,
    } = message?;

    let result = write_response(respond, method, head, body).await;
    if let Some(reporter) = reporter {
        reporter.written(result.as_ref().map(|_| ()));
    }
    if let Some(done) = completion {
        let _ = done.send(result);
    }
    None
}

/// Stream frames to request object.
pub(crate) fn decode_request(request: http::Request<RecvStream>) -> (RequestHead, RequestBody) {
    let (parts, recv) = request.into_parts();
    let mut headers = parts.headers;
    if !headers.contains_key(header::HOST) {
        let authority = parts
            .uri
            .authority()
            .and_then(|a| HeaderValue::from_str(a.as_str()).ok());
        if let Some(authority) = authority {
            headers.insert(header::HOST, authority);
        }
    }
    (
        RequestHead::new(parts.method, parts.uri, Version::HTTP_2, headers),
        RequestBody::h2(recv),
    )
}

/// Response object to stream frames.
pub(crate) async fn write_response(
    respond: &mut SendResponse<Bytes>,
    method: &Method,
    mut head: ResponseHead,
    body: ResponseBody,
) -> Result<(), HttpError> {
    for name in [header::CONNECTION, header::TRANSFER_ENCODING, header::UPGRADE] {
        head.headers.remove(name);
    }
    head.headers.remove("keep-alive");
    head.headers.remove("proxy-connection");

    let head_only = method == Method::HEAD || head.forbids_body();
    if !head_only && !head.headers.contains_key(header::CONTENT_LENGTH) {
        if let Some(len) = body.exact_len() {
            head.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
    }

    let mut response = http::Response::new(());
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;

    let end_of_stream = head_only || body.is_empty();
    let mut send = respond.send_response(response, end_of_stream)?;
    if end_of_stream {
        return Ok(());
    }

    match body {
        ResponseBody::Empty => {}
        ResponseBody::Full(bytes) => send_chunk(&mut send, bytes).await?,
        ResponseBody::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(chunk) => send_chunk(&mut send, chunk).await?,
                    Err(error) => {
                        send.send_reset(Reason::INTERNAL_ERROR);
                        return Err(HttpError::Body(error));
                    }
                }
            }
        }
    }
    send.send_data(Bytes::new(), true)?;
    Ok(())
}

/// Send `chunk` as flow control allows.
async fn send_chunk(send: &mut SendStream<Bytes>, mut chunk: Bytes) -> Result<(), HttpError> {
    while !chunk.is_empty() {
        send.reserve_capacity(chunk.len());
        let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
            Some(Ok(n)) => n,
            Some(Err(error)) => return Err(error.into()),
            None => return Err(HttpError::ConnectionClosed),
        };
        if granted == 0 {
            continue;
        }
        let piece = chunk.split_to(granted.min(chunk.len()));
        send.send_data(piece, false)?;
    }
    Ok(())
}
