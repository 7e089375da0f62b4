//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define server metrics (connections, negotiated protocols, requests, errors)
//! - Expose a Prometheus-compatible scrape endpoint
//!
//! # Metrics
//! - `http_connections_total` (counter): accepted connections by `secure`
//! - `http_protocol_negotiated_total` (counter): connections by `protocol`
//! - `http_requests_total` (counter): requests and streams by `protocol`
//! - `http_errors_total` (counter): terminal errors by `kind`
//! - `http_active_connections` (gauge): current connection count
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, which keeps tests exporter-free

use std::net::SocketAddr;

use http::Version;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::http::error::HttpError;
use crate::pipeline::NegotiatedProtocol;

/// Install the Prometheus recorder and its HTTP listener on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    metrics::describe_counter!("http_connections_total", "Accepted connections");
    metrics::describe_counter!("http_protocol_negotiated_total", "Connections by negotiated protocol");
    metrics::describe_counter!("http_requests_total", "Requests and HTTP/2 streams received");
    metrics::describe_counter!("http_errors_total", "Terminal errors reported to observers");
    metrics::describe_gauge!("http_active_connections", "Currently open connections");
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_connection(secure: bool) {
    metrics::counter!("http_connections_total", "secure" => if secure { "true" } else { "false" })
        .increment(1);
}

pub fn record_negotiated(protocol: NegotiatedProtocol) {
    metrics::counter!("http_protocol_negotiated_total", "protocol" => protocol.as_str()).increment(1);
}

pub fn record_request(version: Version) {
    let protocol = if version == Version::HTTP_2 { "h2" } else { "http/1.1" };
    metrics::counter!("http_requests_total", "protocol" => protocol).increment(1);
}

pub fn record_error(error: &HttpError) {
    metrics::counter!("http_errors_total", "kind" => error.kind()).increment(1);
}
