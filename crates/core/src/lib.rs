//! Core replimesh module
//!
//! This module provides the types shared by every replimesh crate:
//! peer and content identifiers, peer records, configuration and
//! logging setup.

pub mod config;
pub mod types;

// Re-export key components
pub use config::{ConfigError, ConfigResult, CoordinatorConfig};
pub use multiaddr::Multiaddr;
pub use types::{ContentId, PeerId, PeerRecord};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize tracing for replimesh
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this more than
/// once is harmless; only the first subscriber is installed.
pub fn init_tracing(default_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
