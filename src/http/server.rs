//! Server bind orchestration.
//!
//! # Responsibilities
//! - Freeze `HttpServerOptions` into the shared `PipelineConfig`
//! - Bind the bounded listener on the acceptor runtime
//! - Run the accept loop; hand each connection (after TLS, if configured)
//!   to the pipeline assembler on the worker runtime
//! - Stop accepting and drain connections on dispose
//!
//! # Data Flow
//! ```text
//! HttpServer::new(options).observe(obs).run_on(resources).bind(handler)
//!     → Listener::bind (select runtime)
//!     → accept loop ──▶ [TLS handshake] ──▶ PipelineAssembler::serve_connection (worker runtime)
//!     → DisposableServer { local_addr, dispose }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::http::error::ConfigurationError;
use crate::http::handler::HttpHandler;
use crate::http::options::HttpServerOptions;
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionGuard, ConnectionInfo, ConnectionObserver, ConnectionTracker};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::tls::TlsSession;
use crate::observability::LoggingObserver;
use crate::pipeline::{AcceptedConnection, PipelineAssembler};

/// Back-off after a failed `accept` so a persistent error does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Failure to bring a server up.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} did not resolve to any address")]
    NoAddress(String),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("no tokio runtime available to run the server on")]
    NoRuntime,

    #[error("bind task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Runtimes the server runs on.
///
/// `select` runs the accept loop, `worker` runs connections. Both may be
/// the same runtime.
#[derive(Debug, Clone)]
pub struct LoopResources {
    select: Handle,
    worker: Handle,
}

impl LoopResources {
    pub fn new(select: Handle, worker: Handle) -> Self {
        Self { select, worker }
    }

    /// Accept and serve on the runtime of the caller.
    pub fn current() -> Result<Self, ServerError> {
        let handle = Handle::try_current().map_err(|_| ServerError::NoRuntime)?;
        Ok(Self {
            select: handle.clone(),
            worker: handle,
        })
    }

    pub fn select(&self) -> &Handle {
        &self.select
    }

    pub fn worker(&self) -> &Handle {
        &self.worker
    }
}

/// An HTTP server waiting to be bound.
pub struct HttpServer {
    options: HttpServerOptions,
    observer: Arc<dyn ConnectionObserver>,
    resources: Option<LoopResources>,
}

impl HttpServer {
    pub fn new(options: HttpServerOptions) -> Self {
        Self {
            options,
            observer: Arc::new(LoggingObserver),
            resources: None,
        }
    }

    /// Replace the default logging observer.
    pub fn observe<O: ConnectionObserver>(mut self, observer: O) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    /// Run on explicit runtimes instead of the caller's.
    pub fn run_on(mut self, resources: LoopResources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn options(&self) -> &HttpServerOptions {
        &self.options
    }

    /// Bind the listener and start accepting connections.
    pub async fn bind<H: HttpHandler>(self, handler: H) -> Result<DisposableServer, ServerError> {
        let config = Arc::new(self.options.build()?);
        let resources = match self.resources {
            Some(resources) => resources,
            None => LoopResources::current()?,
        };

        let address = format!("{}:{}", self.options.host(), self.options.port());
        let addr = resolve(self.options.host(), self.options.port(), &address).await?;
        let max_connections = self.options.connection_limit();
        let listener = resources
            .select
            .spawn(Listener::bind(addr, max_connections))
            .await??;
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        let tracker = ConnectionTracker::new();
        let shutdown = Shutdown::new();
        let assembler = PipelineAssembler::new(config, Arc::new(handler), self.observer)
            .with_drain(tracker.drain_receiver());

        tracing::info!(
            address = %local_addr,
            secure = self.options.tls_acceptor().is_some(),
            options = %self.options.as_simple_string(),
            "HTTP server started"
        );

        let accept_loop = AcceptLoop {
            listener,
            assembler,
            tls: self.options.tls_acceptor().cloned(),
            tracker: tracker.clone(),
            worker: resources.worker.clone(),
        };
        let mut stop = shutdown.subscribe();
        let accept_task = resources.select.spawn(async move {
            tokio::select! {
                _ = stop.recv() => {}
                _ = accept_loop.run() => {}
            }
            tracing::info!(address = %local_addr, "Stopped accepting connections");
        });

        Ok(DisposableServer {
            local_addr,
            shutdown,
            tracker,
            accept_task,
        })
    }
}

async fn resolve(host: &str, port: u16, address: &str) -> Result<SocketAddr, ServerError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| ServerError::Resolve {
            address: address.to_string(),
            source,
        })?;
    addrs
        .next()
        .ok_or_else(|| ServerError::NoAddress(address.to_string()))
}

struct AcceptLoop {
    listener: Listener,
    assembler: PipelineAssembler,
    tls: Option<TlsAcceptor>,
    tracker: ConnectionTracker,
    worker: Handle,
}

impl AcceptLoop {
    async fn run(self) {
        let local_addr = match self.listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "Listener has no local address");
                return;
            }
        };

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr, permit)) => {
                    let guard = self.tracker.track();
                    let assembler = self.assembler.clone();
                    let tls = self.tls.clone();
                    self.worker.spawn(serve_stream(
                        stream, peer_addr, local_addr, assembler, tls, permit, guard,
                    ));
                }
                Err(ListenerError::Closed) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}

async fn serve_stream(
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    assembler: PipelineAssembler,
    tls: Option<TlsAcceptor>,
    _permit: ConnectionPermit,
    guard: ConnectionGuard,
) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
    }
    let info = ConnectionInfo::new(guard.id(), peer_addr, local_addr, tls.is_some());

    match tls {
        None => {
            assembler
                .serve_connection(AcceptedConnection::plain(stream, info))
                .await
        }
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => {
                let session = TlsSession::from_connection(tls_stream.get_ref().1);
                assembler
                    .serve_connection(AcceptedConnection::secure(tls_stream, info, session))
                    .await
            }
            Err(e) => {
                tracing::debug!(
                    connection_id = %info.id(),
                    remote_addr = %peer_addr,
                    error = %e,
                    "TLS handshake failed"
                );
            }
        },
    }
}

/// A running server.
///
/// Dropping it leaves the server running; call [`DisposableServer::dispose`]
/// to stop it.
#[derive(Debug)]
pub struct DisposableServer {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    accept_task: JoinHandle<()>,
}

impl DisposableServer {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Stop accepting, ask open connections to finish, and wait up to
    /// `timeout` for them. Returns `false` if some were still open.
    pub async fn dispose(self, timeout: Duration) -> bool {
        self.shutdown.trigger();
        if let Err(e) = self.accept_task.await {
            tracing::warn!(error = %e, "Accept loop ended abnormally");
        }

        self.tracker.begin_draining();
        let drained = self.tracker.wait_for_drain(timeout).await;
        if drained {
            tracing::info!(address = %self.local_addr, "Server disposed");
        } else {
            tracing::warn!(
                address = %self.local_addr,
                remaining = self.tracker.active_count(),
                "Drain timeout elapsed with connections still open"
            );
        }
        drained
    }
}
