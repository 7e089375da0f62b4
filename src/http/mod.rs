//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (bind, accept, TLS)
//!     → pipeline assembler (protocol decision)
//!     → h1/ (codec, pipelining) or h2/ (multiplexing, per-stream initializer)
//!     → bridge.rs (one ReactiveOperations per request or stream)
//!     → handler.rs (application code)
//!     → response.rs (+ compression.rs) → wire
//! ```

pub mod bridge;
pub mod compression;
pub mod error;
pub mod forwarded;
pub mod h1;
pub mod h2;
pub mod handler;
pub mod options;
pub mod request;
pub mod response;
pub mod server;

pub use bridge::{ReactiveOperations, SetupHook};
pub use error::{BoxError, CodecError, ConfigurationError, HttpError, NegotiationError};
pub use handler::HttpHandler;
pub use options::HttpServerOptions;
pub use request::{HttpServerRequest, RequestBody, RequestHead};
pub use response::{HttpServerResponse, ResponseBody, ResponseHead};
pub use server::{DisposableServer, HttpServer, LoopResources, ServerError};
