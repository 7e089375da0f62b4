//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → tls.rs (optional TLS handshake, ALPN result)
//!     → connection.rs (identity, observer, drain tracking)
//!     → Hand off to the pipeline assembler
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - TLS is optional; its presence is what selects the ALPN pipeline

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{
    ConnectionId, ConnectionInfo, ConnectionObserver, ConnectionState, ConnectionTracker, NoopObserver,
};
pub use listener::Listener;
pub use tls::{load_tls_acceptor, TlsError, TlsSession};
