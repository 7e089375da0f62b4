//! Reactive HTTP server binary.
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!  TCP / TLS ────▶│ listener ─▶ assembler ─┬─▶ HTTP/1.1 codec ─▶ pipelining│
//!                 │                        │        └─ h2c upgrade ─┐     │
//!                 │                        └─▶ HTTP/2 multiplex ◀───┘     │
//!                 │                                 │ per stream          │
//!                 │                                 ▼                     │
//!                 │                         reactive bridge ─▶ handler    │
//!                 └──────────────────────────────────────────────────────┘
//! ```
//!
//! Serves an echo handler: the response body is the request body, with the
//! method, path and protocol version reported in headers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use clap::Parser;
use http::header::{CONTENT_TYPE, HeaderName};
use http::HeaderValue;

use reactive_http_server::config::{load_config, ServerConfig};
use reactive_http_server::http::BoxError;
use reactive_http_server::lifecycle::shutdown_signal;
use reactive_http_server::net::load_tls_acceptor;
use reactive_http_server::observability::{init_logging, metrics};
use reactive_http_server::{HttpServer, HttpServerOptions, HttpServerRequest, HttpServerResponse};

#[derive(Parser)]
#[command(name = "reactive-http-server")]
#[command(about = "HTTP/1.1 and HTTP/2 echo server", long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listener bind address.
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
    }

    init_logging(&config.observability)?;
    tracing::info!("reactive-http-server v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        let addr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr)?;
    }

    let mut options = HttpServerOptions::from_config(&config)?;
    if let Some(tls) = &config.listener.tls {
        let acceptor = load_tls_acceptor(
            Path::new(&tls.cert_path),
            Path::new(&tls.key_path),
            &tls.alpn_protocols,
        )?;
        options = options.tls(acceptor);
    }
    tracing::info!(options = %options, "Configuration loaded");

    let server = HttpServer::new(options).bind(echo).await?;
    tracing::info!(address = %server.local_addr(), "Listening for connections");

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, draining connections");
    let drained = server
        .dispose(Duration::from_secs(config.shutdown.drain_timeout_secs))
        .await;

    tracing::info!(drained, "Shutdown complete");
    Ok(())
}

async fn echo(mut request: HttpServerRequest, mut response: HttpServerResponse) -> Result<(), BoxError> {
    let body: Bytes = request.take_body().aggregate().await?;

    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-echo-method"),
        HeaderValue::from_str(request.method().as_str())?,
    );
    headers.insert(
        HeaderName::from_static("x-echo-path"),
        HeaderValue::from_str(request.path())?,
    );
    headers.insert(
        HeaderName::from_static("x-echo-version"),
        HeaderValue::from_str(&format!("{:?}", request.version()))?,
    );
    if let Some(content_type) = request.headers().get(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, content_type.clone());
    }

    response.send(body).await?;
    Ok(())
}
