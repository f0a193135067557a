//! Agent side of the command audit pipeline.
//!
//! Audited terminals run bash with [`wrapper`]'s hook as rcfile. The hook
//! talks to the loopback [`relay`], which forwards to the dashboard through
//! [`client::AuditClient`].

pub mod client;
pub mod relay;
pub mod wrapper;

pub use client::{AuditClient, ClientError};
pub use relay::AuditRelay;
