//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connections, pipelines and bridges produce:
//!     → logging.rs (structured log events, LoggingObserver)
//!     → metrics.rs (counters, gauges)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Connection id flows through every log event of a connection
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LoggingObserver};
