//! Connection pipeline construction and protocol negotiation.
//!
//! # Data Flow
//! ```text
//! accepted connection
//!     → assembler.rs (TLS or cleartext?)
//!         TLS       → alpn.rs    (h2 | http/1.1 | fatal)
//!         cleartext → HTTP/1.1 chain + upgrade.rs (h2c upgrade on first request)
//!     → HTTP/1.1: codec → pipelining → reactive bridge
//!     → HTTP/2:   multiplex codec → per-stream initializer → reactive bridge
//! ```
//!
//! # State Machine
//! ```text
//! AwaitingAlpn ──h2──────────────▶ Http2
//!      │ └──http/1.1 / none──────▶ Http1 (no upgrade handler)
//!      └──other──────────────────▶ closed (NegotiationError)
//! Http1 (cleartext) ──first request──▶ Http1 for good
//!                   └──h2c upgrade───▶ Http2 for good
//! ```
//!
//! # Design Decisions
//! - The chain is a tagged variant, never mutated in place
//! - Transitions are one-way; the negotiated protocol never changes afterwards
//! - Per-connection state lives in `ConnectionContext`, owned by the
//!   connection's task; configuration is shared read-only via `Arc`

pub mod alpn;
pub mod assembler;
pub mod upgrade;

use std::sync::Arc;

use tokio::sync::watch;

use crate::http::bridge::SetupHook;
use crate::http::compression::CompressPredicate;
use crate::http::h1::Http1Chain;
use crate::http::h2::MultiplexCodec;
use crate::http::handler::HttpHandler;
use crate::net::connection::{ConnectionInfo, ConnectionObserver, ConnectionState};
use crate::observability::metrics;

pub use alpn::AlpnNegotiator;
pub use assembler::{AcceptedConnection, PipelineAssembler};
pub use upgrade::{H2cUpgradeCodecFactory, UpgradeCodecFactory, UpgradeDecision, UpgradeNegotiator, UpgradeState};

/// Protocol chosen for a connection. Decided once, never changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiatedProtocol {
    Http11,
    H2,
}

impl NegotiatedProtocol {
    /// ALPN protocol identifier.
    pub fn alpn_id(&self) -> &'static [u8] {
        match self {
            NegotiatedProtocol::Http11 => b"http/1.1",
            NegotiatedProtocol::H2 => b"h2",
        }
    }

    /// Protocol for an ALPN identifier; `None` for anything unsupported.
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"http/1.1" => Some(NegotiatedProtocol::Http11),
            b"h2" => Some(NegotiatedProtocol::H2),
            _ => None,
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            NegotiatedProtocol::Http11 => "http/1.1",
            NegotiatedProtocol::H2 => "h2",
        }
    }
}

impl std::fmt::Display for NegotiatedProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP/1.1 decoder limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderSettings {
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_chunk_size: usize,
    pub validate_headers: bool,
    pub initial_buffer_size: usize,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            max_initial_line_length: 4096,
            max_header_size: 8192,
            max_chunk_size: 8192,
            validate_headers: true,
            initial_buffer_size: 128,
        }
    }
}

/// Local HTTP/2 settings advertised by the multiplexing codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http2Settings {
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
}

impl Default for Http2Settings {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
        }
    }
}

/// Immutable per-server configuration shared by every connection.
#[derive(Clone)]
pub struct PipelineConfig {
    pub decoder: DecoderSettings,
    /// `-1` disables compression, `0` compresses everything, `> 0` is a size threshold.
    pub min_compression_size: i64,
    /// Effective predicate, already derived from the threshold and the user predicate.
    pub compress_predicate: Option<CompressPredicate>,
    pub forwarded: bool,
    pub http2: Http2Settings,
    /// Applied to the operations of every HTTP/1.1 request.
    pub setup: SetupHook,
}

impl PipelineConfig {
    /// Whether the unconditional compression stage is installed.
    pub fn always_compress(&self) -> bool {
        self.compress_predicate.is_none() && self.min_compression_size == 0
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            decoder: DecoderSettings::default(),
            min_compression_size: -1,
            compress_predicate: None,
            forwarded: false,
            http2: Http2Settings::default(),
            setup: SetupHook::empty(),
        }
    }
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("decoder", &self.decoder)
            .field("min_compression_size", &self.min_compression_size)
            .field("compress_predicate", &self.compress_predicate.is_some())
            .field("forwarded", &self.forwarded)
            .field("http2", &self.http2)
            .field("setup", &self.setup)
            .finish()
    }
}

/// The handler chain of a connection, as a tagged variant.
pub enum ConnectionPipeline {
    /// TLS connection waiting for the handshake's protocol selection.
    AwaitingAlpn(AlpnNegotiator),
    Http1(Http1Chain),
    Http2(MultiplexCodec),
}

impl ConnectionPipeline {
    /// Names of the installed stages, in order.
    pub fn handler_names(&self) -> Vec<&'static str> {
        match self {
            ConnectionPipeline::AwaitingAlpn(_) => vec!["alpn_negotiation"],
            ConnectionPipeline::Http1(chain) => chain.handler_names(),
            ConnectionPipeline::Http2(codec) => codec.handler_names(),
        }
    }

    /// Protocol, if it is already settled.
    pub fn negotiated(&self) -> Option<NegotiatedProtocol> {
        match self {
            ConnectionPipeline::AwaitingAlpn(_) => None,
            ConnectionPipeline::Http1(chain) if chain.awaits_upgrade() => None,
            ConnectionPipeline::Http1(_) => Some(NegotiatedProtocol::Http11),
            ConnectionPipeline::Http2(_) => Some(NegotiatedProtocol::H2),
        }
    }
}

impl std::fmt::Debug for ConnectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionPipeline")
            .field(&self.handler_names())
            .finish()
    }
}

/// Connection-scoped state passed explicitly to every stage.
#[derive(Clone)]
pub(crate) struct ConnectionContext {
    pub(crate) info: Arc<ConnectionInfo>,
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) observer: Arc<dyn ConnectionObserver>,
    pub(crate) handler: Arc<dyn HttpHandler>,
    pub(crate) drain: watch::Receiver<bool>,
}

impl ConnectionContext {
    /// Context for one HTTP/2 stream: same observer, config and handler.
    pub(crate) fn for_stream(&self, stream_id: u32) -> Self {
        Self {
            info: Arc::new(self.info.for_stream(stream_id)),
            ..self.clone()
        }
    }

    pub(crate) fn configured(&self, protocol: NegotiatedProtocol) {
        tracing::debug!(
            connection_id = %self.info.id(),
            protocol = %protocol,
            "Protocol negotiated"
        );
        metrics::record_negotiated(protocol);
        self.observer
            .on_state_change(&self.info, ConnectionState::Configured(protocol));
    }
}

/// Resolves once draining starts. Never resolves if the tracker is gone.
pub(crate) async fn wait_for_drain(drain: &mut watch::Receiver<bool>) {
    loop {
        if *drain.borrow_and_update() {
            return;
        }
        if drain.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::compression;
    use crate::http::request::RequestHead;
    use crate::http::response::ResponseHead;

    #[test]
    fn alpn_identifiers() {
        assert_eq!(NegotiatedProtocol::from_alpn(b"h2"), Some(NegotiatedProtocol::H2));
        assert_eq!(NegotiatedProtocol::from_alpn(b"http/1.1"), Some(NegotiatedProtocol::Http11));
        assert_eq!(NegotiatedProtocol::from_alpn(b"h2c"), None);
        assert_eq!(NegotiatedProtocol::H2.alpn_id(), b"h2");
    }

    #[test]
    fn always_compress_only_at_zero_without_predicate() {
        let mut config = PipelineConfig::default();
        assert!(!config.always_compress());

        config.min_compression_size = 0;
        assert!(config.always_compress());

        config.compress_predicate = compression::derive(
            0,
            Some(Arc::new(|_: &RequestHead, _: &ResponseHead| true)),
        );
        assert!(!config.always_compress());

        config.min_compression_size = 512;
        config.compress_predicate = compression::derive(512, None);
        assert!(!config.always_compress());
    }

    #[tokio::test]
    async fn drain_wait_resolves_after_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_drain(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }
}
