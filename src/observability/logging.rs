//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Configure log level at runtime (`RUST_LOG` wins over the config file)
//! - Provide an observer that logs connection lifecycle events
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - JSON format for production, pretty format for development

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, ObservabilityConfig};
use crate::http::error::HttpError;
use crate::net::connection::{ConnectionInfo, ConnectionObserver, ConnectionState};

/// Install the global subscriber. Fails if one is already set.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    }
}

/// Observer that turns lifecycle notifications into log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl ConnectionObserver for LoggingObserver {
    fn on_state_change(&self, connection: &ConnectionInfo, state: ConnectionState) {
        match state {
            ConnectionState::Established => tracing::debug!(
                connection_id = %connection.id(),
                remote_addr = %connection.remote_addr(),
                secure = connection.is_secure(),
                "Connection established"
            ),
            ConnectionState::Configured(protocol) => tracing::debug!(
                connection_id = %connection.id(),
                protocol = %protocol,
                "Connection configured"
            ),
            ConnectionState::RequestReceived | ConnectionState::ResponseCompleted => tracing::trace!(
                connection_id = %connection.id(),
                stream_id = ?connection.stream_id(),
                state = ?state,
                "Exchange progressed"
            ),
            ConnectionState::Closed => tracing::debug!(
                connection_id = %connection.id(),
                "Connection closed"
            ),
        }
    }

    fn on_error(&self, connection: &ConnectionInfo, error: &HttpError) {
        tracing::warn!(
            connection_id = %connection.id(),
            stream_id = ?connection.stream_id(),
            remote_addr = %connection.remote_addr(),
            kind = error.kind(),
            error = %error,
            "Connection error"
        );
    }
}
