//! HTTP/2 connection handling.
//!
//! # Data Flow
//! ```text
//! TLS (ALPN h2) or upgraded cleartext transport
//!     → MultiplexCodec (h2 server connection)
//!     → one task per stream: StreamPipelineInitializer → bridge → handler
//! ```
//!
//! # Design Decisions
//! - Stream tasks live in a `JoinSet` owned by the connection; when the
//!   connection ends every open stream is cancelled and awaited, so each
//!   one reports its terminal state before the connection reports `Closed`
//! - Draining sends GOAWAY and keeps serving streams already opened

pub mod hpack;
pub(crate) mod rewind;
pub mod stream;
pub mod upgrade;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;

use crate::http::error::{HttpError, NegotiationError};
use crate::pipeline::{wait_for_drain, ConnectionContext, Http2Settings};

pub use stream::StreamPipelineInitializer;
pub use upgrade::H2cUpgrade;

/// Frame codec plus multiplexer for one HTTP/2 connection.
#[derive(Debug, Clone)]
pub struct MultiplexCodec {
    settings: Http2Settings,
    initializer: StreamPipelineInitializer,
}

impl MultiplexCodec {
    /// Codec advertising `settings` and running `initializer` per stream.
    pub fn new(settings: Http2Settings, initializer: StreamPipelineInitializer) -> Self {
        Self {
            settings,
            initializer,
        }
    }

    /// Local settings sent in the server preface.
    pub fn settings(&self) -> &Http2Settings {
        &self.settings
    }

    /// Stage names, the multiplexer followed by the per-stream stages.
    pub fn handler_names(&self) -> Vec<&'static str> {
        let mut names = vec!["h2_multiplex"];
        names.extend(self.initializer.handler_names());
        names
    }

    /// Serve HTTP/2 on `io` until the peer goes away.
    pub(crate) async fn serve<IO>(self, io: IO, ctx: &ConnectionContext) -> Result<(), HttpError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut builder = h2::server::Builder::new();
        builder
            .initial_window_size(self.settings.initial_window_size)
            .max_concurrent_streams(self.settings.max_concurrent_streams)
            .max_frame_size(self.settings.max_frame_size)
            .max_header_list_size(header_list_limit(ctx.config.decoder.max_header_size));

        let mut connection = builder
            .handshake::<_, Bytes>(io)
            .await
            .map_err(NegotiationError::Handshake)?;
        tracing::debug!(connection_id = %ctx.info.id(), "HTTP/2 connection established");

        let mut streams = JoinSet::new();
        let result = self
            .accept_streams(&mut connection, &mut streams, ctx)
            .await;
        // Open streams are cancelled with the connection and settle before it closes.
        streams.shutdown().await;
        result
    }

    async fn accept_streams<IO>(
        &self,
        connection: &mut h2::server::Connection<IO, Bytes>,
        streams: &mut JoinSet<()>,
        ctx: &ConnectionContext,
    ) -> Result<(), HttpError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut drain = ctx.drain.clone();
        let mut draining = false;
        loop {
            tokio::select! {
                accepted = connection.accept() => match accepted {
                    Some(Ok((request, respond))) => {
                        let stream_ctx = ctx.for_stream(respond.stream_id().as_u32());
                        streams.spawn(self.initializer.init_stream(request, respond, stream_ctx));
                    }
                    Some(Err(error)) if error.is_go_away() && error.reason() == Some(h2::Reason::NO_ERROR) => break,
                    Some(Err(error)) => return Err(error.into()),
                    None => break,
                },
                _ = wait_for_drain(&mut drain), if !draining => {
                    tracing::debug!(connection_id = %ctx.info.id(), "Draining, sending GOAWAY");
                    draining = true;
                    connection.graceful_shutdown();
                }
            }
            while streams.try_join_next().is_some() {}
        }
        Ok(())
    }
}

/// HTTP/2 advertises the header list limit as a u32; larger limits saturate.
fn header_list_limit(max_header_size: usize) -> u32 {
    u32::try_from(max_header_size).unwrap_or(u32::MAX)
}
