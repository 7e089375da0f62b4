//! Fluent server options.
//!
//! # Responsibilities
//! - Collect listen address, decoder limits, compression, HTTP/2 settings,
//!   forwarded handling, TLS and the setup hook
//! - Reject contradictory values eagerly, before anything is bound
//! - Produce the immutable `PipelineConfig` every connection shares
//!
//! # Compression
//! ```text
//! compression(false)         → -1  never (unless a predicate says otherwise)
//! compression(true)          →  0  always
//! compression_threshold(n)   →  n  when content-length >= n
//! compression_threshold(<0)  →  ConfigurationError
//! ```

use std::fmt;
use std::sync::Arc;

use tokio_rustls::TlsAcceptor;

use crate::config::ServerConfig;
use crate::http::bridge::{ReactiveOperations, SetupHook};
use crate::http::compression::{self, CompressPredicate};
use crate::http::error::ConfigurationError;
use crate::http::request::RequestHead;
use crate::http::response::ResponseHead;
use crate::pipeline::{DecoderSettings, Http2Settings, PipelineConfig};

const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Builder for everything a server needs before it binds.
#[derive(Clone)]
pub struct HttpServerOptions {
    host: String,
    port: u16,
    decoder: DecoderSettings,
    min_compression_size: i64,
    compress_predicate: Option<CompressPredicate>,
    forwarded: bool,
    http2: Http2Settings,
    tls: Option<TlsAcceptor>,
    max_connections: usize,
    setup: SetupHook,
}

impl Default for HttpServerOptions {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            decoder: DecoderSettings::default(),
            min_compression_size: -1,
            compress_predicate: None,
            forwarded: false,
            http2: Http2Settings::default(),
            tls: None,
            max_connections: 10_000,
            setup: SetupHook::empty(),
        }
    }
}

impl HttpServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options from a loaded configuration file. TLS is attached separately.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ConfigurationError> {
        let (host, port) = split_host_port(&config.listener.bind_address)?;
        let decoder = &config.decoder;
        let mut options = Self::new()
            .listen(host, port)
            .max_initial_line_length(decoder.max_initial_line_length)
            .max_header_size(decoder.max_header_size)
            .max_chunk_size(decoder.max_chunk_size)
            .validate_headers(decoder.validate_headers)
            .initial_buffer_size(decoder.initial_buffer_size)
            .forwarded(config.forwarded)
            .http2(Http2Settings {
                max_concurrent_streams: config.http2.max_concurrent_streams,
                initial_window_size: config.http2.initial_window_size,
                max_frame_size: config.http2.max_frame_size,
            })
            .max_connections(config.listener.max_connections);

        if config.compression.enabled {
            options = match config.compression.min_response_size {
                Some(size) => options.compression_threshold(size)?,
                None => options.compression(true),
            };
        }
        Ok(options)
    }

    pub fn listen(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Enable compression of every eligible response, or disable it.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.min_compression_size = if enabled { 0 } else { -1 };
        self
    }

    /// Compress responses whose declared length is at least `min_size` bytes.
    pub fn compression_threshold(mut self, min_size: i64) -> Result<Self, ConfigurationError> {
        if min_size < 0 {
            return Err(ConfigurationError::NegativeCompressionThreshold(min_size));
        }
        self.min_compression_size = min_size;
        Ok(self)
    }

    /// Additional per-response condition for compression.
    pub fn compress_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestHead, &ResponseHead) -> bool + Send + Sync + 'static,
    {
        self.compress_predicate = Some(Arc::new(predicate));
        self
    }

    pub fn max_initial_line_length(mut self, value: usize) -> Self {
        self.decoder.max_initial_line_length = value;
        self
    }

    pub fn max_header_size(mut self, value: usize) -> Self {
        self.decoder.max_header_size = value;
        self
    }

    pub fn max_chunk_size(mut self, value: usize) -> Self {
        self.decoder.max_chunk_size = value;
        self
    }

    pub fn validate_headers(mut self, value: bool) -> Self {
        self.decoder.validate_headers = value;
        self
    }

    pub fn initial_buffer_size(mut self, value: usize) -> Self {
        self.decoder.initial_buffer_size = value;
        self
    }

    /// Resolve remote address, host and scheme from proxy headers.
    pub fn forwarded(mut self, enabled: bool) -> Self {
        self.forwarded = enabled;
        self
    }

    pub fn http2(mut self, settings: Http2Settings) -> Self {
        self.http2 = settings;
        self
    }

    /// Serve TLS. ALPN then decides between HTTP/1.1 and HTTP/2.
    pub fn tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn max_connections(mut self, value: usize) -> Self {
        self.max_connections = value;
        self
    }

    /// Run `hook` on every HTTP/1.1 exchange before the handler sees it.
    pub fn on_setup<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut ReactiveOperations) + Send + Sync + 'static,
    {
        self.setup = SetupHook::new(hook);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn min_compression_size(&self) -> i64 {
        self.min_compression_size
    }

    pub fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn connection_limit(&self) -> usize {
        self.max_connections
    }

    /// Validate and freeze into the configuration shared by all connections.
    pub fn build(&self) -> Result<PipelineConfig, ConfigurationError> {
        if self.min_compression_size < -1 {
            return Err(ConfigurationError::NegativeCompressionThreshold(
                self.min_compression_size,
            ));
        }
        for (field, value) in [
            ("max_initial_line_length", self.decoder.max_initial_line_length),
            ("max_header_size", self.decoder.max_header_size),
            ("max_chunk_size", self.decoder.max_chunk_size),
            ("initial_buffer_size", self.decoder.initial_buffer_size),
            ("max_connections", self.max_connections),
        ] {
            if value == 0 {
                return Err(ConfigurationError::ZeroLimit { field });
            }
        }
        if self.http2.max_concurrent_streams == 0 {
            return Err(ConfigurationError::Http2SettingOutOfRange {
                field: "max_concurrent_streams",
                value: 0,
            });
        }
        if self.http2.initial_window_size > MAX_WINDOW_SIZE {
            return Err(ConfigurationError::Http2SettingOutOfRange {
                field: "initial_window_size",
                value: self.http2.initial_window_size,
            });
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.http2.max_frame_size) {
            return Err(ConfigurationError::Http2SettingOutOfRange {
                field: "max_frame_size",
                value: self.http2.max_frame_size,
            });
        }

        Ok(PipelineConfig {
            decoder: self.decoder,
            min_compression_size: self.min_compression_size,
            compress_predicate: compression::derive(
                self.min_compression_size,
                self.compress_predicate.clone(),
            ),
            forwarded: self.forwarded,
            http2: self.http2,
            setup: self.setup.clone(),
        })
    }

    /// One line for startup logs.
    pub fn as_simple_string(&self) -> String {
        let mut s = format!("listening on {}:{}", self.host, self.port);
        if self.min_compression_size == 0 {
            s.push_str(", gzip");
        } else if self.min_compression_size > 0 {
            s.push_str(&format!(", gzip over {} bytes", self.min_compression_size));
        }
        s
    }

    /// Every option as `key=value` pairs.
    pub fn as_detailed_string(&self) -> String {
        format!(
            "address={}:{}, secure={}, max_connections={}, max_initial_line_length={}, \
             max_header_size={}, max_chunk_size={}, validate_headers={}, initial_buffer_size={}, \
             max_concurrent_streams={}, forwarded={}, compress_predicate={}, \
             min_compression_response_size={}",
            self.host,
            self.port,
            self.tls.is_some(),
            self.max_connections,
            self.decoder.max_initial_line_length,
            self.decoder.max_header_size,
            self.decoder.max_chunk_size,
            self.decoder.validate_headers,
            self.decoder.initial_buffer_size,
            self.http2.max_concurrent_streams,
            self.forwarded,
            self.compress_predicate.is_some(),
            self.min_compression_size,
        )
    }
}

impl fmt::Display for HttpServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HttpServerOptions{{{}}}", self.as_detailed_string())
    }
}

impl fmt::Debug for HttpServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// `"host:port"`, including bracketed IPv6 hosts.
fn split_host_port(address: &str) -> Result<(String, u16), ConfigurationError> {
    let invalid = || ConfigurationError::InvalidAddress(address.to_string());
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_threshold_is_rejected() {
        let err = HttpServerOptions::new().compression_threshold(-1).unwrap_err();
        assert_eq!(err, ConfigurationError::NegativeCompressionThreshold(-1));
        assert!(err
            .to_string()
            .starts_with("minimum compression response size must not be negative"));
    }

    #[test]
    fn zero_and_positive_thresholds_are_kept() {
        let zero = HttpServerOptions::new().compression_threshold(0).unwrap();
        assert_eq!(zero.min_compression_size(), 0);
        let ten = HttpServerOptions::new().compression_threshold(10).unwrap();
        assert_eq!(ten.min_compression_size(), 10);
    }

    #[test]
    fn simple_string() {
        let opt = HttpServerOptions::new();
        assert_eq!(opt.as_simple_string(), "listening on 0.0.0.0:0");

        let opt = opt.listen("foo", 123);
        assert_eq!(opt.as_simple_string(), "listening on foo:123");

        let opt = opt.compression(true);
        assert_eq!(opt.as_simple_string(), "listening on foo:123, gzip");

        let opt = opt.compression_threshold(534).unwrap();
        assert_eq!(opt.as_simple_string(), "listening on foo:123, gzip over 534 bytes");
    }

    #[test]
    fn detailed_string() {
        let opt = HttpServerOptions::new();
        let s = opt.as_detailed_string();
        assert!(s.starts_with("address=0.0.0.0:0"));
        assert!(s.ends_with(", min_compression_response_size=-1"));

        let opt = opt.listen("foo", 123).compression(true);
        let s = opt.as_detailed_string();
        assert!(s.starts_with("address=foo:123"));
        assert!(s.ends_with(", min_compression_response_size=0"));

        let opt = opt.compression_threshold(534).unwrap();
        assert!(opt.as_detailed_string().ends_with(", min_compression_response_size=534"));
    }

    #[test]
    fn display_wraps_detailed_string() {
        let opt = HttpServerOptions::new()
            .listen("example.com", 123)
            .compression_threshold(534)
            .unwrap();
        let s = opt.to_string();
        assert!(s.starts_with("HttpServerOptions{address=example.com:123"));
        assert!(s.ends_with(", min_compression_response_size=534}"));
    }

    #[test]
    fn build_applies_always_compress_rule() {
        let config = HttpServerOptions::new().compression(true).build().unwrap();
        assert!(config.always_compress());
        assert!(config.compress_predicate.is_none());

        let config = HttpServerOptions::new().build().unwrap();
        assert!(!config.always_compress());
        assert!(config.compress_predicate.is_none());

        let config = HttpServerOptions::new()
            .compression_threshold(100)
            .unwrap()
            .build()
            .unwrap();
        assert!(!config.always_compress());
        assert!(config.compress_predicate.is_some());

        let config = HttpServerOptions::new()
            .compression(true)
            .compress_predicate(|_, _| false)
            .build()
            .unwrap();
        assert!(!config.always_compress());
        assert!(config.compress_predicate.is_some());
    }

    #[test]
    fn build_rejects_zero_limits() {
        let err = HttpServerOptions::new().max_header_size(0).build().unwrap_err();
        assert_eq!(err, ConfigurationError::ZeroLimit { field: "max_header_size" });
    }

    #[test]
    fn build_rejects_bad_frame_size() {
        let err = HttpServerOptions::new()
            .http2(Http2Settings {
                max_frame_size: 1024,
                ..Http2Settings::default()
            })
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::Http2SettingOutOfRange { field: "max_frame_size", .. }
        ));
    }

    #[test]
    fn from_config_maps_sections() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "127.0.0.1:8081".into();
        config.compression.enabled = true;
        config.compression.min_response_size = Some(2048);
        config.decoder.max_chunk_size = 512;
        config.forwarded = true;

        let options = HttpServerOptions::from_config(&config).unwrap();
        assert_eq!(options.host(), "127.0.0.1");
        assert_eq!(options.port(), 8081);
        assert_eq!(options.min_compression_size(), 2048);
        let pipeline = options.build().unwrap();
        assert_eq!(pipeline.decoder.max_chunk_size, 512);
        assert!(pipeline.forwarded);
    }

    #[test]
    fn from_config_rejects_negative_threshold() {
        let mut config = ServerConfig::default();
        config.compression.enabled = true;
        config.compression.min_response_size = Some(-3);
        assert_eq!(
            HttpServerOptions::from_config(&config).unwrap_err(),
            ConfigurationError::NegativeCompressionThreshold(-3)
        );
    }

    #[test]
    fn split_host_port_handles_ipv6() {
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1".to_string(), 80));
        assert!(split_host_port("nohost").is_err());
        assert!(split_host_port(":80").is_err());
    }
}
