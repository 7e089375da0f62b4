//! Protocol selection for TLS connections.

use std::sync::Arc;

use crate::http::error::NegotiationError;
use crate::http::h1::Http1Chain;
use crate::http::h2::{MultiplexCodec, StreamPipelineInitializer};
use crate::pipeline::{ConnectionPipeline, NegotiatedProtocol, PipelineConfig};

/// Waits for the TLS handshake, then installs the chain ALPN selected.
pub struct AlpnNegotiator {
    config: Arc<PipelineConfig>,
}

impl AlpnNegotiator {
    /// Negotiator that builds its chains from `config`.
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    /// Map the negotiated protocol to a pipeline.
    ///
    /// A client that offered no ALPN gets HTTP/1.1. Anything other than
    /// `h2` or `http/1.1` is fatal for the connection.
    pub fn configure(self, negotiated: Option<&[u8]>) -> Result<ConnectionPipeline, NegotiationError> {
        let protocol = negotiated.unwrap_or(NegotiatedProtocol::Http11.alpn_id());
        match NegotiatedProtocol::from_alpn(protocol) {
            Some(NegotiatedProtocol::H2) => Ok(ConnectionPipeline::Http2(MultiplexCodec::new(
                self.config.http2,
                StreamPipelineInitializer,
            ))),
            Some(NegotiatedProtocol::Http11) => {
                Ok(ConnectionPipeline::Http1(Http1Chain::negotiated(&self.config)))
            }
            None => Err(NegotiationError::UnknownProtocol(
                String::from_utf8_lossy(protocol).into_owned(),
            )),
        }
    }
}
