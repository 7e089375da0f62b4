//! Protocol upgrade negotiation on cleartext HTTP/1.1 connections.
//!
//! The decision is taken on the first request only. After that the
//! negotiator is inert and the connection stays on whatever protocol it
//! chose.

use std::sync::Arc;

use http::header::{CONNECTION, UPGRADE};

use crate::http::error::NegotiationError;
use crate::http::h2::upgrade::{H2cUpgrade, HTTP2_SETTINGS};
use crate::http::h2::{MultiplexCodec, StreamPipelineInitializer};
use crate::http::request::{header_has_token, RequestHead};
use crate::pipeline::Http2Settings;

/// Protocol token for cleartext HTTP/2.
pub const H2C: &str = "h2c";

/// Produces a codec for an upgrade protocol token, if supported.
pub trait UpgradeCodecFactory: Send + Sync + 'static {
    /// Codec for `protocol`, or `None` to decline it.
    fn new_upgrade_codec(&self, protocol: &str) -> Option<MultiplexCodec>;
}

/// Accepts `h2c` and nothing else.
#[derive(Debug, Clone, Copy)]
pub struct H2cUpgradeCodecFactory {
    settings: Http2Settings,
}

impl H2cUpgradeCodecFactory {
    /// Factory whose codecs use `settings` as local HTTP/2 settings.
    pub fn new(settings: Http2Settings) -> Self {
        Self { settings }
    }
}

impl UpgradeCodecFactory for H2cUpgradeCodecFactory {
    fn new_upgrade_codec(&self, protocol: &str) -> Option<MultiplexCodec> {
        (protocol == H2C).then(|| MultiplexCodec::new(self.settings, StreamPipelineInitializer))
    }
}

/// Where the one-shot upgrade decision stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    /// No request seen yet.
    AwaitingUpgradeDecision,
    /// Settled on HTTP/1.1 for the rest of the connection.
    Http11,
    /// Upgraded; HTTP/2 owns the transport.
    Http2Streams,
}

/// Codec and replay data for an accepted upgrade.
#[derive(Debug)]
pub struct PreparedUpgrade {
    pub(crate) codec: MultiplexCodec,
    pub(crate) request: H2cUpgrade,
}

/// Outcome of inspecting a request.
#[derive(Debug)]
pub enum UpgradeDecision {
    /// Write `101 Switching Protocols` and continue as HTTP/2.
    Upgrade(PreparedUpgrade),
    /// Stay on HTTP/1.1. `decided_now` is set for the request that settled it.
    Http11 { decided_now: bool },
    /// The upgrade request was unusable; the connection must close.
    Rejected(NegotiationError),
}

/// Decides, on the first request, whether a cleartext connection upgrades.
pub struct UpgradeNegotiator {
    factory: Arc<dyn UpgradeCodecFactory>,
    state: UpgradeState,
}

impl UpgradeNegotiator {
    /// Negotiator offering whatever `factory` accepts.
    pub fn new(factory: Arc<dyn UpgradeCodecFactory>) -> Self {
        Self {
            factory,
            state: UpgradeState::AwaitingUpgradeDecision,
        }
    }

    /// Negotiator accepting `h2c` only.
    pub fn h2c(settings: Http2Settings) -> Self {
        Self::new(Arc::new(H2cUpgradeCodecFactory::new(settings)))
    }

    /// Current decision state.
    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Inspect a request. Only the first call can upgrade; later calls
    /// always answer `Http11 { decided_now: false }`.
    pub fn on_request(&mut self, head: &RequestHead, has_body: bool) -> UpgradeDecision {
        if self.state != UpgradeState::AwaitingUpgradeDecision {
            return UpgradeDecision::Http11 { decided_now: false };
        }
        self.state = UpgradeState::Http11;
        match self.try_upgrade(head, has_body) {
            Ok(Some(prepared)) => {
                self.state = UpgradeState::Http2Streams;
                UpgradeDecision::Upgrade(prepared)
            }
            Ok(None) => UpgradeDecision::Http11 { decided_now: true },
            Err(error) => UpgradeDecision::Rejected(error),
        }
    }

    fn try_upgrade(
        &self,
        head: &RequestHead,
        has_body: bool,
    ) -> Result<Option<PreparedUpgrade>, NegotiationError> {
        let Some(offered) = head.headers.get(UPGRADE).and_then(|v| v.to_str().ok()) else {
            return Ok(None);
        };
        let codec = offered
            .split(',')
            .map(str::trim)
            .find_map(|protocol| self.factory.new_upgrade_codec(protocol));
        let Some(codec) = codec else {
            tracing::debug!(offered, "No supported upgrade protocol");
            return Ok(None);
        };

        if !header_has_token(&head.headers, CONNECTION, "upgrade")
            || !header_has_token(&head.headers, CONNECTION, HTTP2_SETTINGS)
        {
            tracing::debug!("Upgrade request without matching Connection tokens");
            return Ok(None);
        }
        let mut values = head.headers.get_all(HTTP2_SETTINGS).iter();
        let (Some(settings), None) = (values.next(), values.next()) else {
            tracing::debug!("Upgrade request needs exactly one HTTP2-Settings header");
            return Ok(None);
        };
        if has_body {
            tracing::debug!("Ignoring upgrade on a request with a body");
            return Ok(None);
        }

        Ok(H2cUpgrade::from_request(head, settings)?
            .map(|request| PreparedUpgrade { codec, request }))
    }
}

impl std::fmt::Debug for UpgradeNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeNegotiator")
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method, Uri, Version};

    fn request(pairs: &[(&'static str, &'static str)]) -> RequestHead {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(value));
        }
        RequestHead::new(Method::GET, Uri::from_static("/"), Version::HTTP_11, headers)
    }

    fn upgrade_request() -> RequestHead {
        request(&[
            ("host", "localhost"),
            ("connection", "Upgrade, HTTP2-Settings"),
            ("upgrade", "h2c"),
            ("http2-settings", "AAMAAABkAARAAAAAAAIAAAAA"),
        ])
    }

    #[test]
    fn factory_only_knows_h2c() {
        let factory = H2cUpgradeCodecFactory::new(Http2Settings::default());
        assert!(factory.new_upgrade_codec("h2c").is_some());
        assert!(factory.new_upgrade_codec("websocket").is_none());
        assert!(factory.new_upgrade_codec("h2").is_none());
    }

    #[test]
    fn plain_request_settles_on_http11() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        let decision = negotiator.on_request(&request(&[("host", "localhost")]), false);
        assert!(matches!(decision, UpgradeDecision::Http11 { decided_now: true }));
        assert_eq!(negotiator.state(), UpgradeState::Http11);
    }

    #[test]
    fn upgrade_on_first_request() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        let decision = negotiator.on_request(&upgrade_request(), false);
        assert!(matches!(decision, UpgradeDecision::Upgrade(_)));
        assert_eq!(negotiator.state(), UpgradeState::Http2Streams);
    }

    #[test]
    fn upgrade_after_first_request_is_ignored() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        negotiator.on_request(&request(&[]), false);
        let decision = negotiator.on_request(&upgrade_request(), false);
        assert!(matches!(decision, UpgradeDecision::Http11 { decided_now: false }));
    }

    #[test]
    fn first_supported_token_wins() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        let head = request(&[
            ("connection", "upgrade, http2-settings"),
            ("upgrade", "websocket, h2c"),
            ("http2-settings", ""),
        ]);
        assert!(matches!(negotiator.on_request(&head, false), UpgradeDecision::Upgrade(_)));
    }

    #[test]
    fn upgrade_with_body_stays_http11() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        let decision = negotiator.on_request(&upgrade_request(), true);
        assert!(matches!(decision, UpgradeDecision::Http11 { decided_now: true }));
    }

    #[test]
    fn missing_connection_token_stays_http11() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        let head = request(&[
            ("connection", "upgrade"),
            ("upgrade", "h2c"),
            ("http2-settings", "AAMAAABk"),
        ]);
        assert!(matches!(negotiator.on_request(&head, false), UpgradeDecision::Http11 { .. }));
    }

    #[test]
    fn duplicate_settings_headers_stay_http11() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        let head = request(&[
            ("connection", "upgrade, http2-settings"),
            ("upgrade", "h2c"),
            ("http2-settings", "AAMAAABk"),
            ("http2-settings", "AAMAAABk"),
        ]);
        assert!(matches!(negotiator.on_request(&head, false), UpgradeDecision::Http11 { .. }));
    }

    #[test]
    fn malformed_settings_reject_the_connection() {
        let mut negotiator = UpgradeNegotiator::h2c(Http2Settings::default());
        let head = request(&[
            ("connection", "upgrade, http2-settings"),
            ("upgrade", "h2c"),
            ("http2-settings", "%%%"),
        ]);
        assert!(matches!(
            negotiator.on_request(&head, false),
            UpgradeDecision::Rejected(NegotiationError::MalformedSettings(_))
        ));
    }
}
