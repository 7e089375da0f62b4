//! HTTP/1.1 connection driver.
//!
//! # Data Flow
//! ```text
//! read half → FramedRead<Http1Codec> → [upgrade negotiator] → bridge → handler task
//!                                         │                                  │
//!                                         ▼                                  ▼
//!                               queue of PendingResponse ──▶ PipeliningHandler → write half
//! ```
//!
//! # Design Decisions
//! - Reading and writing run concurrently in the connection task; handlers
//!   run in a `JoinSet` owned by the connection, aborted when it goes away
//! - The writer settles each exchange once its response is flushed, so the
//!   observer sees `ResponseCompleted` even when the connection closes next
//! - Request bodies flow through a bounded channel so a slow handler
//!   applies backpressure to the socket
//! - Codec failures queue an error response and stop reading; responses
//!   already in flight are still written

pub(crate) mod codec;
pub(crate) mod pipelining;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::http::bridge::{self, SetupHook};
use crate::http::error::{CodecError, HttpError};
use crate::http::h2::upgrade::SWITCHING_PROTOCOLS;
use crate::http::request::{BodySender, RequestBody};
use crate::pipeline::upgrade::{PreparedUpgrade, UpgradeDecision, UpgradeNegotiator, UpgradeState};
use crate::pipeline::{wait_for_drain, ConnectionContext, NegotiatedProtocol, PipelineConfig};

use self::codec::{Http1Codec, Http1Encoder, RequestFrame};
use self::pipelining::{PendingResponse, PipeliningHandler};

/// Chunks buffered between the socket and a handler reading the body.
const BODY_CHANNEL_CAPACITY: usize = 16;

/// Stages of an HTTP/1.1 connection.
pub struct Http1Chain {
    upgrade: Option<UpgradeNegotiator>,
    compress_always: bool,
    setup: SetupHook,
}

impl Http1Chain {
    /// Cleartext chain: h2c upgrade is possible on the first request.
    pub fn cleartext(config: &PipelineConfig) -> Self {
        Self {
            upgrade: Some(UpgradeNegotiator::h2c(config.http2)),
            compress_always: config.always_compress(),
            setup: config.setup.clone(),
        }
    }

    /// Chain after ALPN selected HTTP/1.1; no upgrade handling.
    pub fn negotiated(config: &PipelineConfig) -> Self {
        Self {
            upgrade: None,
            compress_always: config.always_compress(),
            setup: config.setup.clone(),
        }
    }

    /// Whether the h2c upgrade decision is still open.
    pub fn awaits_upgrade(&self) -> bool {
        self.upgrade
            .as_ref()
            .is_some_and(|negotiator| negotiator.state() == UpgradeState::AwaitingUpgradeDecision)
    }

    /// Installed stages, in order. The upgrade stage is gone once the
    /// decision is made.
    pub fn handler_names(&self) -> Vec<&'static str> {
        let mut names = vec!["http_codec"];
        if self.awaits_upgrade() {
            names.push("h2c_upgrade");
        }
        if self.compress_always {
            names.push("compression");
        }
        names.extend(["http_server_handler", "reactive_bridge"]);
        names
    }
}

/// How an HTTP/1.1 connection ended.
pub(crate) enum Http1Outcome<IO> {
    Closed,
    /// `101 Switching Protocols` was written; the transport now speaks HTTP/2.
    Upgraded {
        io: IO,
        /// Bytes read past the upgrade request.
        leftover: Bytes,
        upgrade: PreparedUpgrade,
    },
}

enum ReadOutcome {
    Closed,
    Failed(HttpError),
    Upgrade(PreparedUpgrade),
}

/// Serve HTTP/1.1 on `io` until it closes or upgrades.
pub(crate) async fn serve<IO>(
    io: IO,
    mut chain: Http1Chain,
    ctx: &ConnectionContext,
) -> Result<Http1Outcome<IO>, HttpError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let settings = ctx.config.decoder;
    let (read_half, write_half) = tokio::io::split(io);
    let mut reader = FramedRead::with_capacity(
        read_half,
        Http1Codec::new(settings),
        settings.initial_buffer_size,
    );
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let pipelining = PipeliningHandler::new(
        FramedWrite::new(write_half, Http1Encoder::default()),
        queue_rx,
        chain.compress_always,
    );
    let mut exchanges = JoinSet::new();

    tracing::debug!(
        connection_id = %ctx.info.id(),
        handlers = ?chain.handler_names(),
        "Configured HTTP/1.1 pipeline"
    );
    if chain.upgrade.is_none() {
        ctx.configured(NegotiatedProtocol::Http11);
    }

    let (outcome, writer) = {
        let reading = read_requests(&mut reader, queue_tx, &mut chain, ctx, &mut exchanges);
        let writing = pipelining.run();
        tokio::pin!(reading);
        tokio::pin!(writing);
        tokio::select! {
            outcome = &mut reading => (outcome, writing.await),
            writer = &mut writing => (ReadOutcome::Closed, writer),
        }
    };
    // Exchanges the writer never reached are cancelled and settle before the
    // connection reports `Closed`.
    exchanges.shutdown().await;

    match outcome {
        ReadOutcome::Upgrade(upgrade) => {
            let mut write_half = writer.into_inner();
            write_half.write_all(SWITCHING_PROTOCOLS).await?;
            write_half.flush().await?;
            let leftover = reader.read_buffer_mut().split().freeze();
            let io = reader.into_inner().unsplit(write_half);
            Ok(Http1Outcome::Upgraded { io, leftover, upgrade })
        }
        ReadOutcome::Closed => {
            let _ = writer.into_inner().shutdown().await;
            Ok(Http1Outcome::Closed)
        }
        ReadOutcome::Failed(error) => {
            let _ = writer.into_inner().shutdown().await;
            Err(error)
        }
    }
}

async fn read_requests<IO>(
    reader: &mut FramedRead<ReadHalf<IO>, Http1Codec>,
    queue: mpsc::UnboundedSender<PendingResponse>,
    chain: &mut Http1Chain,
    ctx: &ConnectionContext,
    exchanges: &mut JoinSet<()>,
) -> ReadOutcome
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut drain = ctx.drain.clone();
    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = wait_for_drain(&mut drain) => {
                tracing::debug!(connection_id = %ctx.info.id(), "Draining, no further requests");
                return ReadOutcome::Closed;
            }
        };

        let (head, has_body) = match frame {
            None => return ReadOutcome::Closed,
            Some(Ok(RequestFrame::Head { head, has_body })) => (head, has_body),
            Some(Ok(_)) => {
                return reject(&queue, CodecError::Malformed("body data outside of a message".into()))
            }
            Some(Err(error)) => return reject(&queue, error),
        };

        if let Some(negotiator) = chain.upgrade.as_mut() {
            match negotiator.on_request(&head, has_body) {
                UpgradeDecision::Upgrade(prepared) => {
                    tracing::debug!(connection_id = %ctx.info.id(), "Accepted h2c upgrade");
                    return ReadOutcome::Upgrade(prepared);
                }
                UpgradeDecision::Http11 { decided_now } => {
                    if decided_now {
                        ctx.configured(NegotiatedProtocol::Http11);
                    }
                }
                UpgradeDecision::Rejected(error) => {
                    return ReadOutcome::Failed(HttpError::Negotiation(error));
                }
            }
        }

        let keep_alive = head.is_keep_alive();
        let (pending, slot) = PendingResponse::new(&head);
        if queue.send(pending).is_err() {
            return ReadOutcome::Closed;
        }

        let (mut body_tx, body) = if has_body {
            let (tx, body) = RequestBody::channel(BODY_CHANNEL_CAPACITY);
            (Some(tx), body)
        } else {
            (None, RequestBody::empty())
        };
        let operations = bridge::attach(ctx, head, body, slot, &chain.setup);
        exchanges.spawn(operations.run(ctx.handler.clone()));

        if has_body {
            loop {
                match reader.next().await {
                    Some(Ok(RequestFrame::Data(chunk))) => {
                        if let Some(tx) = &body_tx {
                            if tx.send(Ok(chunk)).await.is_err() {
                                // Handler dropped the body; discard the rest.
                                body_tx = None;
                            }
                        }
                    }
                    Some(Ok(RequestFrame::End)) => break,
                    Some(Ok(RequestFrame::Head { .. })) => {
                        let error = CodecError::Malformed("request head inside a body".into());
                        return fail_body(body_tx, error).await;
                    }
                    Some(Err(error)) => return fail_body(body_tx, error).await,
                    None => return ReadOutcome::Closed,
                }
            }
        }

        while exchanges.try_join_next().is_some() {}
        if !keep_alive {
            return ReadOutcome::Closed;
        }
    }
}

/// End the connection on a broken request body.
///
/// A handler still reading the body receives the error and answers for it,
/// so the connection only reports it when nobody is listening.
async fn fail_body(body_tx: Option<BodySender>, error: CodecError) -> ReadOutcome {
    tracing::debug!(error = %error, "Request body failed");
    let Some(tx) = body_tx else {
        return ReadOutcome::Failed(error.into());
    };
    match tx.send(Err(error.into())).await {
        Ok(()) => ReadOutcome::Closed,
        Err(mpsc::error::SendError(Err(error))) => ReadOutcome::Failed(error),
        Err(mpsc::error::SendError(Ok(_))) => ReadOutcome::Closed,
    }
}

/// Queue the error response for a codec failure and stop reading.
fn reject(queue: &mpsc::UnboundedSender<PendingResponse>, error: CodecError) -> ReadOutcome {
    tracing::debug!(error = %error, status = %error.status(), "Rejecting request");
    let _ = queue.send(PendingResponse::error(error.status()));
    ReadOutcome::Failed(error.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::RequestHead;
    use crate::pipeline::ConnectionPipeline;
    use http::{HeaderMap, Method, Uri, Version};

    fn plain_get() -> RequestHead {
        RequestHead::new(Method::GET, Uri::from_static("/"), Version::HTTP_11, HeaderMap::new())
    }

    #[test]
    fn cleartext_chain_settles_after_first_request() {
        let config = PipelineConfig::default();
        let mut chain = Http1Chain::cleartext(&config);
        assert!(chain.awaits_upgrade());

        let negotiator = chain.upgrade.as_mut().unwrap();
        assert!(matches!(
            negotiator.on_request(&plain_get(), false),
            UpgradeDecision::Http11 { decided_now: true }
        ));
        assert!(!chain.awaits_upgrade());
        assert!(!chain.handler_names().contains(&"h2c_upgrade"));

        let pipeline = ConnectionPipeline::Http1(chain);
        assert_eq!(pipeline.negotiated(), Some(NegotiatedProtocol::Http11));
    }

    #[test]
    fn negotiated_chain_never_awaits_upgrade() {
        let chain = Http1Chain::negotiated(&PipelineConfig::default());
        assert!(!chain.awaits_upgrade());
        assert_eq!(
            ConnectionPipeline::Http1(chain).negotiated(),
            Some(NegotiatedProtocol::Http11)
        );
    }
}
