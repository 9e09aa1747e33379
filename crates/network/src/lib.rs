//! Network coordination layer for replimesh
//!
//! This crate drives the DHT on behalf of the open databases:
//! - Deduplicated peer and provider searches
//! - Racing peer resolution over the connection table and the DHT
//! - Per-database peer tracking
//! - Periodic connection and announce passes

use thiserror::Error;

use replimesh_core::{ContentId, PeerId};

/// Network error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Every resolution source settled without a match
    #[error("Unable to resolve peer {0}")]
    PeerUnresolvable(PeerId),

    /// Provider lookup failed
    #[error("Finding peers for {target} failed: {reason}")]
    DiscoveryFailed {
        /// Database or content the lookup was for
        target: String,
        /// Transport error message
        reason: String,
    },

    /// Direct and relayed dial both failed
    #[error("Dialing peer {peer} failed: {reason}")]
    DialFailed {
        /// Peer that could not be reached
        peer: PeerId,
        /// Last error seen
        reason: String,
    },

    /// Publishing a root as providable failed
    #[error("Announcing {root} failed: {reason}")]
    AnnounceFailed {
        /// Root that was not announced
        root: ContentId,
        /// Transport error message
        reason: String,
    },

    /// A required dependency was not supplied
    #[error("Missing configuration: {0}")]
    MissingConfiguration(String),

    /// Peer does not appear in the live connection table
    #[error("Peer not connected: {0}")]
    PeerNotConnected(PeerId),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The task driving a search went away before settling
    #[error("Search abandoned: {0}")]
    SearchAbandoned(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<replimesh_core::ConfigError> for NetworkError {
    fn from(err: replimesh_core::ConfigError) -> Self {
        NetworkError::ConfigError(err.to_string())
    }
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;

/// Public modules
pub mod announce;
pub mod connect;
pub mod directory;
pub mod discovery;
pub mod manager;
pub mod mock;
pub mod peekable;
pub mod resolver;
pub mod search;
pub mod transport;

/// Re-exports
pub use crate::announce::{spawn_announce_loop, AnnounceReport, Announcer};
pub use crate::connect::{spawn_connect_loop, ConnectOutcome, ConnectReport, ConnectionOrchestrator};
pub use crate::directory::{DatabasePeerSet, PeerDirectory};
pub use crate::discovery::{ProviderDiscovery, TrackedDatabase};
pub use crate::manager::{DatabaseCatalog, PeerManager};
pub use crate::peekable::{first_success, IntoPeekable, Peekable, Settlement};
pub use crate::resolver::PeerResolver;
pub use crate::search::{SearchDetails, SearchHandle, SearchOptions, SearchRegistry, SearchStart};
pub use crate::transport::{DhtTransport, DialTarget, ProviderStream};
