//! Builds and drives the pipeline of each accepted connection.
//!
//! # Responsibilities
//! - Choose the initial chain: ALPN negotiation for TLS, HTTP/1.1 with h2c
//!   upgrade for cleartext
//! - Run the chain, following the one-way transition to HTTP/2 if it happens
//! - Report Established, Configured and Closed, plus at most one
//!   connection-level error, to the observer

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::http::error::HttpError;
use crate::http::h1::{self, Http1Chain, Http1Outcome};
use crate::http::handler::HttpHandler;
use crate::net::connection::{ConnectionInfo, ConnectionObserver, ConnectionState};
use crate::net::tls::TlsSession;
use crate::observability::metrics;
use crate::pipeline::{
    AlpnNegotiator, ConnectionContext, ConnectionPipeline, NegotiatedProtocol, PipelineConfig,
};

/// A transport ready to be served, TLS already completed if present.
pub struct AcceptedConnection<IO> {
    io: IO,
    info: ConnectionInfo,
    tls: Option<TlsSession>,
}

impl<IO> AcceptedConnection<IO> {
    /// Cleartext connection; the HTTP/1.1 chain may upgrade it to h2c.
    pub fn plain(io: IO, info: ConnectionInfo) -> Self {
        Self { io, info, tls: None }
    }

    /// Connection whose TLS handshake produced `session`.
    pub fn secure(io: IO, info: ConnectionInfo, session: TlsSession) -> Self {
        Self {
            io,
            info,
            tls: Some(session),
        }
    }
}

/// Assembles the connection pipeline from shared configuration.
#[derive(Clone)]
pub struct PipelineAssembler {
    config: Arc<PipelineConfig>,
    handler: Arc<dyn HttpHandler>,
    observer: Arc<dyn ConnectionObserver>,
    drain: watch::Receiver<bool>,
}

impl PipelineAssembler {
    /// Assembler for connections served by `handler`, reporting to `observer`.
    pub fn new(
        config: Arc<PipelineConfig>,
        handler: Arc<dyn HttpHandler>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        // Without a tracker the sender is dropped and draining never starts.
        let (_, drain) = watch::channel(false);
        Self {
            config,
            handler,
            observer,
            drain,
        }
    }

    /// Stop reading new requests once `drain` turns true.
    pub fn with_drain(mut self, drain: watch::Receiver<bool>) -> Self {
        self.drain = drain;
        self
    }

    /// Frozen configuration shared by every connection.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Initial chain for a connection.
    pub fn assemble(&self, tls: Option<&TlsSession>) -> ConnectionPipeline {
        match tls {
            Some(_) => ConnectionPipeline::AwaitingAlpn(AlpnNegotiator::new(Arc::clone(&self.config))),
            None => ConnectionPipeline::Http1(Http1Chain::cleartext(&self.config)),
        }
    }

    /// Serve a connection until it closes.
    pub async fn serve_connection<IO>(&self, connection: AcceptedConnection<IO>)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let AcceptedConnection { io, info, tls } = connection;
        let ctx = ConnectionContext {
            info: Arc::new(info),
            config: Arc::clone(&self.config),
            observer: Arc::clone(&self.observer),
            handler: Arc::clone(&self.handler),
            drain: self.drain.clone(),
        };
        metrics::record_connection(ctx.info.is_secure());
        ctx.observer
            .on_state_change(&ctx.info, ConnectionState::Established);

        let pipeline = self.assemble(tls.as_ref());
        tracing::debug!(
            connection_id = %ctx.info.id(),
            remote_addr = %ctx.info.remote_addr(),
            handlers = ?pipeline.handler_names(),
            "Connection pipeline assembled"
        );

        let alpn = tls.as_ref().and_then(TlsSession::alpn_protocol);
        if let Err(error) = drive(pipeline, io, alpn, &ctx).await {
            tracing::debug!(
                connection_id = %ctx.info.id(),
                error = %error,
                "Connection failed"
            );
            metrics::record_error(&error);
            ctx.observer.on_error(&ctx.info, &error);
        }

        tracing::debug!(connection_id = %ctx.info.id(), "Connection closed");
        ctx.observer.on_state_change(&ctx.info, ConnectionState::Closed);
    }
}

async fn drive<IO>(
    mut pipeline: ConnectionPipeline,
    io: IO,
    alpn: Option<&[u8]>,
    ctx: &ConnectionContext,
) -> Result<(), HttpError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match pipeline {
            ConnectionPipeline::AwaitingAlpn(negotiator) => {
                pipeline = negotiator.configure(alpn)?;
            }
            ConnectionPipeline::Http2(codec) => {
                ctx.configured(NegotiatedProtocol::H2);
                return codec.serve(io, ctx).await;
            }
            ConnectionPipeline::Http1(chain) => {
                return match h1::serve(io, chain, ctx).await? {
                    Http1Outcome::Closed => Ok(()),
                    Http1Outcome::Upgraded { io, leftover, upgrade } => {
                        ctx.configured(NegotiatedProtocol::H2);
                        let io = upgrade.request.prepare_io(io, leftover).await?;
                        upgrade.codec.serve(io, ctx).await
                    }
                };
            }
        }
    }
}
