//! Reactive HTTP server: connection pipeline and protocol negotiation.
//!
//! Every accepted connection is assembled into either an HTTP/1.1 chain
//! (codec, pipelining, optional compression) or an HTTP/2 multiplexing
//! codec, chosen by TLS ALPN or a cleartext `h2c` upgrade. Both end in the
//! same reactive request/response pair handed to application handlers.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod pipeline;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::schema::ServerConfig;
pub use http::{
    DisposableServer, HttpHandler, HttpServer, HttpServerOptions, HttpServerRequest,
    HttpServerResponse, LoopResources,
};
pub use lifecycle::Shutdown;
pub use pipeline::{NegotiatedProtocol, PipelineConfig};
