//! DHT transport interface
//!
//! The coordination layer never talks to the network directly. Everything it
//! needs from the DHT and the swarm goes through [`DhtTransport`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use replimesh_core::{ContentId, PeerId, PeerRecord};

use crate::NetworkResult;

/// Stream of providers produced by a streaming provider lookup
pub type ProviderStream = BoxStream<'static, NetworkResult<PeerRecord>>;

/// How to reach a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    /// Dial one of the peer's known addresses
    Direct(PeerRecord),
    /// Dial through a circuit relay
    Relayed(PeerId),
}

impl DialTarget {
    /// Peer this target points at
    pub fn peer(&self) -> &PeerId {
        match self {
            DialTarget::Direct(record) => &record.id,
            DialTarget::Relayed(peer) => peer,
        }
    }
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Direct(record) => write!(f, "{}", record),
            DialTarget::Relayed(peer) => write!(f, "/p2p-circuit/p2p/{}", peer.canonical()),
        }
    }
}

/// DHT and swarm operations consumed by the coordinator
#[async_trait]
pub trait DhtTransport: Send + Sync + 'static {
    /// Advertise that the local node can serve `root`
    async fn provide(&self, root: &ContentId) -> NetworkResult<()>;

    /// Find peers that advertised `root`
    async fn find_providers(&self, root: &ContentId, timeout: Duration) -> NetworkResult<Vec<PeerRecord>>;

    /// Find providers as they are reported by the DHT.
    ///
    /// The default implementation wraps [`DhtTransport::find_providers`].
    async fn find_providers_stream(&self, root: &ContentId, timeout: Duration) -> NetworkResult<ProviderStream> {
        let providers = self.find_providers(root, timeout).await?;
        Ok(stream::iter(providers.into_iter().map(Ok)).boxed())
    }

    /// Look up the addresses of a peer
    async fn find_peer(&self, peer: &PeerId) -> NetworkResult<PeerRecord>;

    /// Peers we currently hold a connection to
    async fn connections(&self) -> NetworkResult<Vec<PeerRecord>>;

    /// Open a connection
    async fn connect(&self, target: DialTarget) -> NetworkResult<()>;

    /// Liveness probe for a connected peer
    async fn ping(&self, peer: &PeerId) -> NetworkResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relayed_target_uses_canonical_id() {
        let target = DialTarget::Relayed(PeerId::new("/ip4/10.0.0.1/tcp/4001/p2p/QmPeer"));
        assert_eq!(target.to_string(), "/p2p-circuit/p2p/QmPeer");
        assert_eq!(target.peer().as_str(), "/ip4/10.0.0.1/tcp/4001/p2p/QmPeer");
    }
}
