//! Transparent POP3 proxy with external mail transformation
//!
//! Sits between mail clients and an origin POP3 server, observing
//! every command and reply. Retrieved messages can be piped through a
//! configurable filter program before they reach the client, and a
//! separate authenticated management channel reconfigures the proxy
//! and reports metrics at runtime.
//!
//! ## Structure
//!
//! - [`proxy`] -- the per-connection engine: acceptor, nine-state
//!   session machine, and the filter subprocess pipeline
//! - [`protocol`] -- incremental POP3 request/response parsers and the
//!   multi-line terminator scanner
//! - [`management`] -- the reconfiguration channel
//! - [`config`] / [`metrics`] -- process-wide shared state

pub mod buffer;
pub mod config;
pub mod error;
pub mod management;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod proxy;

pub use config::{Config, MediaType, MediaTypeSet, SharedConfig};
pub use error::{Error, Result};
pub use management::ManagementServer;
pub use metrics::{Metrics, MetricsSnapshot};
pub use proxy::ProxyServer;
