//! Common utilities shared by the orchestrator and the CLI

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{ClusterError, Error, ErrorKind, Result};

/// Strip the URL scheme (`http://`, `https://`, ...) from an endpoint
///
/// Proxies log backend addresses without a scheme.
pub fn strip_scheme(endpoint: &str) -> &str {
    match endpoint.find("://") {
        Some(idx) => &endpoint[idx + 3..],
        None => endpoint,
    }
}
