//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, HTTP/2 sizes within protocol bounds)
//! - Check addresses parse and TLS sections are usable
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ServerConfig;

const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be greater than zero"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::new("listener.tls.cert_path", "must not be empty"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::new("listener.tls.key_path", "must not be empty"));
        }
        if tls.alpn_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            errors.push(ValidationError::new(
                "listener.tls.alpn_protocols",
                "protocol identifiers must be 1 to 255 bytes",
            ));
        }
    }

    let decoder = &config.decoder;
    for (field, value) in [
        ("decoder.max_initial_line_length", decoder.max_initial_line_length),
        ("decoder.max_header_size", decoder.max_header_size),
        ("decoder.max_chunk_size", decoder.max_chunk_size),
        ("decoder.initial_buffer_size", decoder.initial_buffer_size),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if let Some(size) = config.compression.min_response_size {
        if size < 0 {
            errors.push(ValidationError::new(
                "compression.min_response_size",
                format!("must not be negative, got {}", size),
            ));
        }
    }

    let http2 = &config.http2;
    if http2.max_concurrent_streams == 0 {
        errors.push(ValidationError::new("http2.max_concurrent_streams", "must be greater than zero"));
    }
    if http2.initial_window_size > MAX_WINDOW_SIZE {
        errors.push(ValidationError::new(
            "http2.initial_window_size",
            format!("must be at most {}", MAX_WINDOW_SIZE),
        ));
    }
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&http2.max_frame_size) {
        errors.push(ValidationError::new(
            "http2.max_frame_size",
            format!("must be between {} and {}", MIN_FRAME_SIZE, MAX_FRAME_SIZE),
        ));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
