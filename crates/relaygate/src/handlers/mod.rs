//! HTTP request handlers.

mod health;
pub mod v1;

pub use health::{healthz, livez, readyz, version};

/// Service name reported by the health and status endpoints.
pub const SERVICE_NAME: &str = "relaygate";
